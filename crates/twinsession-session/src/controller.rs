//! The control task
//!
//! [`SessionController`] owns the dispatcher, and with it the registry, the
//! lock manager and the UI table. It walks the session through its states,
//! serves inbound commands while handshake calls run on background tasks,
//! and tears everything down on the way out.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use twinsession_control::{
    ControlMessage, DispatchHandle, Dispatcher, ServiceDescriptor, SessionSignal, ShutdownCause,
};
use twinsession_proto::{LockCapability, ServiceId};
use twinsession_transport::{RelayTransport, Transport, TransportResult};

use crate::bootstrap::{BootstrapError, Handshake, ProjectRequest, SessionState};
use crate::config::SessionConfig;
use crate::exit::{SessionExit, EXIT_COORDINATOR_LOST, EXIT_STARTUP_FAILED};
use crate::health::HealthMonitor;

const CONTROL_CHANNEL_CAPACITY: usize = 256;

/// Opens the relay channel granted by the coordinator
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(
        &self,
        relay_url: &str,
        timeout: Duration,
        own_url: &str,
    ) -> TransportResult<Arc<dyn Transport>>;
}

/// Relay over WebSocket
#[derive(Debug, Default)]
pub struct WebSocketRelayConnector;

#[async_trait]
impl RelayConnector for WebSocketRelayConnector {
    async fn connect(
        &self,
        relay_url: &str,
        timeout: Duration,
        own_url: &str,
    ) -> TransportResult<Arc<dyn Transport>> {
        let relay = RelayTransport::connect(relay_url, timeout)
            .await?
            .with_own_url(own_url);
        Ok(Arc::new(relay))
    }
}

/// Session bookkeeping once the coordinator accepted us
struct JoinedSession {
    coordinator: String,
    session_id: String,
    own_id: ServiceId,
    relay: Option<Arc<dyn Transport>>,
}

struct HealthTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SessionController {
    config: Arc<SessionConfig>,
    handshake: Handshake,
    relay_connector: Arc<dyn RelayConnector>,
    dispatcher: Dispatcher,
    handle: DispatchHandle,
    receiver: mpsc::Receiver<ControlMessage>,
    state: watch::Sender<SessionState>,
    close: CancellationToken,
    session: Option<JoinedSession>,
    health: Option<HealthTask>,
}

impl SessionController {
    /// `transport` carries the handshake and, without a relay, all session traffic
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        let config = Arc::new(config);
        let handshake = Handshake::new(transport, config.clone(), config.service_url().to_string());
        let (handle, receiver) = DispatchHandle::channel(CONTROL_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            config,
            handshake,
            relay_connector: Arc::new(WebSocketRelayConnector),
            dispatcher,
            handle,
            receiver,
            state,
            close: CancellationToken::new(),
            session: None,
            health: None,
        }
    }

    pub fn with_relay_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.relay_connector = connector;
        self
    }

    /// Handle for inbound listeners and background workers
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Cancelling this token closes the session
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Open `request`, serve the session and tear it down
    pub async fn run(mut self, request: ProjectRequest) -> SessionExit {
        let exit = match self.open_project(&request).await {
            Ok(()) => self.serve().await,
            Err(exit) => exit,
        };

        match &exit {
            SessionExit::Abandoned { reason } => {
                warn!(session_id = %request.session_id(), reason = %reason, "Session abandoned");
            }
            SessionExit::Fatal { code, reason } => {
                error!(session_id = %request.session_id(), code, reason = %reason, "Session failed");
                self.teardown(&exit).await;
            }
            SessionExit::Closed(cause) => {
                info!(session_id = %request.session_id(), cause = ?cause, "Session closing");
                self.teardown(&exit).await;
            }
        }
        exit
    }

    /// Run the handshake up to `Visible`, or `Active` when no peer is pending
    pub async fn open_project(&mut self, request: &ProjectRequest) -> Result<(), SessionExit> {
        let session_id = request.session_id();
        info!(session_id = %session_id, "Opening project");

        self.set_state(SessionState::RequestingCoordinator);
        let coordinator = match self.handshake.request_coordinator(request).await {
            Ok(coordinator) => coordinator,
            Err(e) => return Err(self.bootstrap_failed(e)),
        };

        self.set_state(SessionState::CreatingSession);
        let grant = match self.handshake.create_session(&coordinator, request).await {
            Ok(grant) => grant,
            Err(e) => return Err(self.bootstrap_failed(e)),
        };

        let own_id = grant.service_id;
        self.dispatcher.context_mut().set_own_id(own_id);
        self.session = Some(JoinedSession {
            coordinator: coordinator.clone(),
            session_id: session_id.clone(),
            own_id,
            relay: None,
        });

        // UI stays locked until every peer finished its setup
        if let Err(e) = self
            .dispatcher
            .context_mut()
            .lock(own_id, LockCapability::ALL)
        {
            return Err(SessionExit::fatal(
                EXIT_STARTUP_FAILED,
                format!("cannot lock the UI: {}", e),
            ));
        }

        if let Some(relay_url) = grant.relay_url {
            let relay = self
                .relay_connector
                .connect(&relay_url, self.config.default_timeout, self.config.service_url())
                .await
                .map_err(BootstrapError::Relay);
            let relay = match relay {
                Ok(relay) => relay,
                Err(e) => return Err(self.bootstrap_failed(e)),
            };
            info!(relay_url = %relay_url, transport = relay.kind(), "Relay channel open");
            self.handshake = self.handshake.clone().with_transport(relay.clone());
            if let Some(session) = self.session.as_mut() {
                session.relay = Some(relay);
            }
        }

        self.set_state(SessionState::AwaitingServiceStartup);
        let poll = {
            let handshake = self.handshake.clone();
            let coordinator = coordinator.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { handshake.await_startup(&coordinator, &session_id).await })
        };
        if let Err(e) = self.serve_until(poll).await? {
            return Err(self.bootstrap_failed(e));
        }

        let show = {
            let handshake = self.handshake.clone();
            let coordinator = coordinator.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                handshake
                    .show_service(&coordinator, own_id, &session_id)
                    .await
            })
        };
        let services = match self.serve_until(show).await? {
            Ok(services) => services,
            Err(e) => return Err(self.bootstrap_failed(e)),
        };

        for info in services {
            if info.service_id == own_id {
                continue;
            }
            let id = info.service_id;
            if let Err(e) = self
                .dispatcher
                .context_mut()
                .register_service(ServiceDescriptor::from(info))
            {
                // Already announced through ServiceConnected
                debug!(service_id = %id, error = %e, "Skipping listed service");
            }
        }
        self.dispatcher.context_mut().drain_signals();

        self.set_state(SessionState::Visible);
        self.check_barrier();
        Ok(())
    }

    /// Serve commands until a shutdown cause arrives
    pub async fn serve(&mut self) -> SessionExit {
        let close = self.close.clone();
        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    // The controller holds a sender, so the channel never closes
                    let Some(message) = message else {
                        return SessionExit::from_cause(ShutdownCause::Close);
                    };
                    if let Some(cause) = self.handle_message(message) {
                        return SessionExit::from_cause(cause);
                    }
                }
                _ = close.cancelled() => {
                    return SessionExit::from_cause(ShutdownCause::Close);
                }
            }
        }
    }

    /// Keep serving commands while a handshake task runs
    async fn serve_until<T>(&mut self, mut task: JoinHandle<T>) -> Result<T, SessionExit> {
        let close = self.close.clone();
        loop {
            tokio::select! {
                result = &mut task => {
                    return result.map_err(|e| {
                        SessionExit::fatal(EXIT_STARTUP_FAILED, format!("handshake task failed: {}", e))
                    });
                }
                message = self.receiver.recv() => {
                    let Some(message) = message else { continue };
                    if let Some(cause) = self.handle_message(message) {
                        task.abort();
                        return Err(SessionExit::from_cause(cause));
                    }
                }
                _ = close.cancelled() => {
                    task.abort();
                    return Err(SessionExit::from_cause(ShutdownCause::Close));
                }
            }
        }
    }

    /// Apply one message; the reply is sent after its effects are settled
    fn handle_message(&mut self, message: ControlMessage) -> Option<ShutdownCause> {
        let mut signals = Vec::new();
        let mut reply = None;
        match message {
            ControlMessage::Dispatch {
                envelope,
                mode,
                reply: sender,
            } => {
                let body = self.dispatcher.dispatch(&envelope, mode);
                reply = Some((sender, body));
            }
            ControlMessage::Signal(signal) => signals.push(signal),
        }
        signals.extend(self.dispatcher.context_mut().drain_signals());

        let mut shutdown = None;
        for signal in signals {
            match signal {
                SessionSignal::ServiceJoined(id) => debug!(service_id = %id, "Service joined"),
                SessionSignal::ServiceLeft(id) => info!(service_id = %id, "Service left"),
                SessionSignal::SetupCompleted(id) => debug!(service_id = %id, "Service ready"),
                SessionSignal::ShutdownRequested(cause) => {
                    shutdown.get_or_insert(cause);
                }
            }
        }
        if shutdown.is_none() {
            self.check_barrier();
        }

        if let Some((sender, body)) = reply {
            let _ = sender.send(body);
        }
        shutdown
    }

    /// Leave `Visible` once every registered peer reported setup completed
    fn check_barrier(&mut self) {
        if self.state() != SessionState::Visible {
            return;
        }
        let waiting: Vec<ServiceId> = self
            .dispatcher
            .context()
            .registry()
            .list()
            .iter()
            .filter(|service| !service.ready)
            .map(|service| service.id)
            .collect();
        if !waiting.is_empty() {
            debug!(waiting = ?waiting, "Waiting for service setup");
            return;
        }

        let Some(session) = self.session.as_ref() else {
            return;
        };
        let own_id = session.own_id;
        let coordinator = session.coordinator.clone();

        self.dispatcher
            .context_mut()
            .unlock(own_id, LockCapability::ALL);
        self.set_state(SessionState::Active);

        let monitor = HealthMonitor::new(self.handshake.transport().clone(), coordinator, &self.config);
        let cancel = monitor.cancel_token();
        let task = monitor.spawn(self.handle.clone());
        self.health = Some(HealthTask { cancel, task });
    }

    fn bootstrap_failed(&mut self, error: BootstrapError) -> SessionExit {
        match error.exit_code() {
            Some(code) => SessionExit::fatal(code, error.to_string()),
            None => {
                self.set_state(SessionState::Idle);
                SessionExit::Abandoned {
                    reason: error.to_string(),
                }
            }
        }
    }

    /// Best-effort goodbye, then drop every service and the relay
    async fn teardown(&mut self, exit: &SessionExit) {
        self.set_state(SessionState::ShuttingDown);

        if let Some(health) = self.health.take() {
            health.cancel.cancel();
            health.task.abort();
        }

        if let Some(session) = self.session.take() {
            let coordinator_lost = exit.code() == EXIT_COORDINATOR_LOST;
            if !coordinator_lost {
                self.handshake
                    .shutdown_session(&session.coordinator, session.own_id, &session.session_id)
                    .await;
            }

            for id in self.dispatcher.context().registry().ids() {
                self.dispatcher.unregister_service(id);
            }
            // Our locks, UI elements and bindings go the same way
            self.dispatcher.unregister_service(session.own_id);

            if let Some(relay) = session.relay {
                relay.close().await;
                debug!("Relay channel closed");
            }
        }

        self.dispatcher.context_mut().drain_signals();
        self.set_state(SessionState::Closed);
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Session state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinsession_control::SessionContext;
    use twinsession_proto::{ActionEnvelope, Command, DispatchMode};
    use twinsession_transport::testing::ScriptedTransport;

    const OWN: ServiceId = ServiceId(42);

    fn coordinator(services: &'static str) -> ScriptedTransport {
        ScriptedTransport::new(move |_, target, envelope: &ActionEnvelope| {
            let reply = match (target, envelope.action.as_str()) {
                ("directory:1", "CreateSession") => "coordinator:7000",
                (_, "CreateSession") => r#"{"service_id": 42}"#,
                (_, "CheckStartupCompleted") => "true",
                (_, "ServiceShow") => services,
                (_, "Ping") => "Ping",
                _ => "",
            };
            Ok(reply.to_string())
        })
    }

    fn controller(transport: &ScriptedTransport) -> SessionController {
        let config = SessionConfig {
            directory_url: "directory:1".to_string(),
            ..SessionConfig::default()
        };
        SessionController::new(
            config,
            Arc::new(transport.clone()),
            Dispatcher::new(SessionContext::default()),
        )
    }

    fn setup_completed(id: u64) -> ActionEnvelope {
        Command::ServiceSetupCompleted {
            service_id: ServiceId(id),
        }
        .to_envelope()
        .unwrap()
    }

    const TWO_PEERS: &str = r#"{"services": [
        {"service_id": 1, "service_name": "model", "service_type": "Model", "service_url": "a:1"},
        {"service_id": 2, "service_name": "script", "service_type": "ScriptExec", "service_url": "b:2"}
    ]}"#;

    #[tokio::test]
    async fn test_ui_locked_while_visible() {
        let transport = coordinator(TWO_PEERS);
        let mut controller = controller(&transport);
        controller
            .open_project(&ProjectRequest::new("bridge", "main"))
            .await
            .unwrap();

        assert_eq!(controller.state(), SessionState::Visible);
        let context = controller.dispatcher().context();
        assert_eq!(context.own_id(), Some(OWN));
        assert_eq!(context.registry().len(), 2);
        assert!(context.locks().held_by(OWN).contains(LockCapability::ALL));
    }

    #[tokio::test]
    async fn test_barrier_releases_ui_lock() {
        let transport = coordinator(TWO_PEERS);
        let mut controller = controller(&transport);
        controller
            .open_project(&ProjectRequest::new("bridge", "main"))
            .await
            .unwrap();

        let (reply, _) = tokio::sync::oneshot::channel();
        controller.handle_message(ControlMessage::Dispatch {
            envelope: setup_completed(1),
            mode: DispatchMode::Execute,
            reply,
        });
        assert_eq!(controller.state(), SessionState::Visible);

        let (reply, _) = tokio::sync::oneshot::channel();
        controller.handle_message(ControlMessage::Dispatch {
            envelope: setup_completed(2),
            mode: DispatchMode::Execute,
            reply,
        });
        assert_eq!(controller.state(), SessionState::Active);
        assert!(controller.dispatcher().context().locks().held_by(OWN).is_empty());
    }

    #[tokio::test]
    async fn test_no_peers_goes_straight_to_active() {
        let transport = coordinator(r#"{"services": []}"#);
        let mut controller = controller(&transport);
        controller
            .open_project(&ProjectRequest::new("bridge", "main"))
            .await
            .unwrap();
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_peer_leaving_unblocks_barrier() {
        let transport = coordinator(TWO_PEERS);
        let mut controller = controller(&transport);
        controller
            .open_project(&ProjectRequest::new("bridge", "main"))
            .await
            .unwrap();

        let (reply, _) = tokio::sync::oneshot::channel();
        controller.handle_message(ControlMessage::Dispatch {
            envelope: setup_completed(1),
            mode: DispatchMode::Execute,
            reply,
        });
        let disconnected = Command::ServiceDisconnected {
            service_id: ServiceId(2),
        }
        .to_envelope()
        .unwrap();
        let (reply, _) = tokio::sync::oneshot::channel();
        controller.handle_message(ControlMessage::Dispatch {
            envelope: disconnected,
            mode: DispatchMode::Execute,
            reply,
        });

        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_shutdown_signal_is_reported() {
        let transport = coordinator(TWO_PEERS);
        let mut controller = controller(&transport);
        let cause = controller.handle_message(ControlMessage::Signal(
            SessionSignal::ShutdownRequested(ShutdownCause::CoordinatorLost),
        ));
        assert_eq!(cause, Some(ShutdownCause::CoordinatorLost));
    }

    #[tokio::test]
    async fn test_own_disconnect_keeps_ui_locked() {
        let transport = coordinator(TWO_PEERS);
        let mut controller = controller(&transport);
        controller
            .open_project(&ProjectRequest::new("bridge", "main"))
            .await
            .unwrap();

        let disconnected = Command::ServiceDisconnected { service_id: OWN }
            .to_envelope()
            .unwrap();
        let (reply, answer) = tokio::sync::oneshot::channel();
        controller.handle_message(ControlMessage::Dispatch {
            envelope: disconnected,
            mode: DispatchMode::Execute,
            reply,
        });

        let body = answer.await.unwrap();
        assert!(twinsession_proto::Response::parse(&body).is_error_flagged());
        assert_eq!(controller.state(), SessionState::Visible);
        let locks = controller.dispatcher().context().locks();
        assert!(locks.held_by(OWN).contains(LockCapability::ALL));
    }

    #[tokio::test]
    async fn test_teardown_releases_own_locks_elements_and_bindings() {
        let transport = coordinator(TWO_PEERS);
        let mut controller = controller(&transport);
        controller
            .open_project(&ProjectRequest::new("bridge", "main"))
            .await
            .unwrap();

        let dispatcher = controller.dispatcher_mut();
        dispatcher.bind_for(OWN, "Ui:Refresh", LockCapability::empty(), |_| {
            Ok(String::new())
        });
        dispatcher
            .context_mut()
            .ui_element_created(OWN, twinsession_control::ElementId(1), LockCapability::VIEW_WRITE)
            .unwrap();
        dispatcher
            .context_mut()
            .lock(OWN, LockCapability::PROPERTIES)
            .unwrap();

        controller
            .teardown(&SessionExit::Closed(ShutdownCause::Requested))
            .await;

        assert_eq!(controller.state(), SessionState::Closed);
        let dispatcher = controller.dispatcher();
        assert!(!dispatcher.is_bound("Ui:Refresh"));
        assert!(dispatcher.context().locks().owners().is_empty());
        assert!(dispatcher.context().locks().elements_of(OWN).is_empty());
        assert!(dispatcher.context().registry().is_empty());
    }
}
