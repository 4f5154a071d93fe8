//! Session handshake
//!
//! The outbound half of opening a project: find the coordinator through the
//! directory, create the session, wait for the other services to start and
//! announce ourselves. [`SessionController`](crate::SessionController) drives
//! these steps and owns the resulting state.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use twinsession_proto::{
    Command, DispatchMode, Response, ServiceId, ServiceInfo, RETURN_VALUE_FALSE,
    RETURN_VALUE_TRUE,
};
use twinsession_transport::{Transport, TransportError};

use crate::config::SessionConfig;
use crate::exit::{EXIT_DIRECTORY_UNREACHABLE, EXIT_STARTUP_FAILED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestingCoordinator,
    CreatingSession,
    AwaitingServiceStartup,
    /// Shown to peers, UI still locked until every peer finished its setup
    Visible,
    Active,
    ShuttingDown,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Project and collection to open a session for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRequest {
    pub project: String,
    pub collection: String,
}

impl ProjectRequest {
    pub fn new(project: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            collection: collection.into(),
        }
    }

    pub fn session_id(&self) -> String {
        format!("{}:{}", self.project, self.collection)
    }
}

/// Coordinator answer to `CreateSession`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionGrant {
    pub service_id: ServiceId,
    #[serde(default)]
    pub relay_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceList {
    #[serde(default)]
    services: Vec<ServiceInfo>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Directory service unreachable: {0}")]
    DirectoryUnreachable(#[source] TransportError),

    #[error("Directory refused the session: {0}")]
    DirectoryRefused(String),

    #[error("Session creation failed: {0}")]
    SessionRejected(String),

    #[error("Relay setup failed: {0}")]
    Relay(#[source] TransportError),

    #[error("Startup check failed: {0}")]
    StartupCheck(String),

    #[error("Services did not finish starting within {0:?}")]
    StartupTimeout(Duration),

    #[error("ServiceShow failed: {0}")]
    Show(String),
}

impl BootstrapError {
    /// Exit code for fatal errors; `None` means the attempt can be retried
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BootstrapError::DirectoryUnreachable(_) => Some(EXIT_DIRECTORY_UNREACHABLE),
            BootstrapError::DirectoryRefused(_) | BootstrapError::SessionRejected(_) => None,
            BootstrapError::Relay(_)
            | BootstrapError::StartupCheck(_)
            | BootstrapError::StartupTimeout(_)
            | BootstrapError::Show(_) => Some(EXIT_STARTUP_FAILED),
        }
    }
}

/// Handshake calls against the directory and the coordinator
#[derive(Clone)]
pub struct Handshake {
    transport: Arc<dyn Transport>,
    config: Arc<SessionConfig>,
    own_url: String,
}

impl Handshake {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<SessionConfig>, own_url: String) -> Self {
        Self {
            transport,
            config,
            own_url,
        }
    }

    /// Route later calls through another transport
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Ask the directory which coordinator serves `request`
    pub async fn request_coordinator(
        &self,
        request: &ProjectRequest,
    ) -> Result<String, BootstrapError> {
        let command = Command::CreateSession {
            session_id: request.session_id(),
            project: Some(request.project.clone()),
            collection: Some(request.collection.clone()),
            user: self.config.user.clone(),
            service_name: None,
            service_type: None,
            service_url: None,
            credentials: None,
            start_relay: false,
        };

        let body = self
            .transport
            .send_command(
                DispatchMode::ExecuteOneWayTls,
                &self.config.directory_url,
                &command,
            )
            .await
            .map_err(BootstrapError::DirectoryUnreachable)?;

        let coordinator = Response::parse(&body)
            .into_payload()
            .map_err(|e| BootstrapError::DirectoryRefused(e.to_string()))?;
        let coordinator = coordinator.trim();
        if coordinator.is_empty() {
            return Err(BootstrapError::DirectoryRefused(
                "no coordinator URL in response".to_string(),
            ));
        }

        info!(
            session_id = %request.session_id(),
            coordinator = %coordinator,
            "Coordinator assigned"
        );
        Ok(coordinator.to_string())
    }

    /// Register this process with the coordinator
    pub async fn create_session(
        &self,
        coordinator: &str,
        request: &ProjectRequest,
    ) -> Result<SessionGrant, BootstrapError> {
        let command = Command::CreateSession {
            session_id: request.session_id(),
            project: Some(request.project.clone()),
            collection: Some(request.collection.clone()),
            user: self.config.user.clone(),
            service_name: Some(self.config.service_name.clone()),
            service_type: Some(self.config.service_type.clone()),
            service_url: Some(self.own_url.clone()),
            credentials: self.config.credentials(),
            start_relay: self.config.relay_required,
        };

        let body = self
            .transport
            .send_command(DispatchMode::ExecuteOneWayTls, coordinator, &command)
            .await
            .map_err(|e| BootstrapError::SessionRejected(e.to_string()))?;
        let payload = Response::parse(&body)
            .into_payload()
            .map_err(|e| BootstrapError::SessionRejected(e.to_string()))?;
        let grant: SessionGrant = serde_json::from_str(&payload)
            .map_err(|e| BootstrapError::SessionRejected(format!("invalid grant: {}", e)))?;

        if self.config.relay_required && grant.relay_url.is_none() {
            return Err(BootstrapError::SessionRejected(
                "relay requested but no relay URL granted".to_string(),
            ));
        }

        info!(
            service_id = %grant.service_id,
            relay = grant.relay_url.is_some(),
            "Session created"
        );
        Ok(grant)
    }

    /// Poll `CheckStartupCompleted` until the coordinator answers `true`
    ///
    /// Polls are spaced by the configured interval and the whole wait is
    /// bounded by `startup_max_wait`. Returns the number of polls made.
    pub async fn await_startup(
        &self,
        coordinator: &str,
        session_id: &str,
    ) -> Result<u32, BootstrapError> {
        let command = Command::CheckStartupCompleted {
            session_id: session_id.to_string(),
        };
        let interval = self.config.startup_poll_interval;
        let max_wait = self.config.startup_max_wait();
        let started = Instant::now();
        let mut polls = 0u32;

        loop {
            polls += 1;
            let body = self
                .transport
                .send_command(DispatchMode::Execute, coordinator, &command)
                .await
                .map_err(|e| BootstrapError::StartupCheck(e.to_string()))?;
            let answer = Response::parse(&body)
                .into_payload()
                .map_err(|e| BootstrapError::StartupCheck(e.to_string()))?;

            match answer.as_str() {
                RETURN_VALUE_TRUE => {
                    info!(polls, "All session services started");
                    return Ok(polls);
                }
                RETURN_VALUE_FALSE => {
                    debug!(polls, "Session services still starting");
                }
                other => {
                    return Err(BootstrapError::StartupCheck(format!(
                        "unexpected answer {:?}",
                        other
                    )));
                }
            }

            if started.elapsed() + interval > max_wait {
                return Err(BootstrapError::StartupTimeout(max_wait));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Announce this service; the coordinator answers with the running peers
    pub async fn show_service(
        &self,
        coordinator: &str,
        own_id: ServiceId,
        session_id: &str,
    ) -> Result<Vec<ServiceInfo>, BootstrapError> {
        let command = Command::ServiceShow {
            service_id: own_id,
            session_id: session_id.to_string(),
        };
        let body = self
            .transport
            .send_command(DispatchMode::Execute, coordinator, &command)
            .await
            .map_err(|e| BootstrapError::Show(e.to_string()))?;
        let payload = Response::parse(&body)
            .into_payload()
            .map_err(|e| BootstrapError::Show(e.to_string()))?;
        let list: ServiceList = serde_json::from_str(&payload)
            .map_err(|e| BootstrapError::Show(format!("invalid service list: {}", e)))?;
        Ok(list.services)
    }

    /// Tell the coordinator we are leaving; failures are only logged
    pub async fn shutdown_session(&self, coordinator: &str, own_id: ServiceId, session_id: &str) {
        let command = Command::ShutdownSession {
            service_id: own_id,
            session_id: session_id.to_string(),
        };
        match self
            .transport
            .send_command(DispatchMode::Execute, coordinator, &command)
            .await
        {
            Ok(_) => debug!(service_id = %own_id, "ShutdownSession delivered"),
            Err(e) => warn!(service_id = %own_id, error = %e, "ShutdownSession not delivered"),
        }
    }
}
