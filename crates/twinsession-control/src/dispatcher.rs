//! Action dispatcher
//!
//! Typed session commands are handled by an exhaustive match. Any other
//! action name, and the targets of `ExecuteAction` / `ExecuteFunction`, go
//! through a string-keyed table of bindings. A failing or panicking
//! handler never escapes: it becomes a `Failed` return message.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use twinsession_proto::{
    ActionEnvelope, Command, DispatchMode, LockCapability, ProtocolError, ReturnMessage, ServiceId,
};

use crate::context::{SessionContext, ShutdownCause};
use crate::locks::LockError;
use crate::registry::{RegistryError, ServiceDescriptor};

/// Error returned by business-logic handlers
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(error: ProtocolError) -> Self {
        Self(error.to_string())
    }
}

pub type HandlerResult = Result<String, HandlerError>;

type Handler = Arc<dyn Fn(&ActionEnvelope) -> HandlerResult + Send + Sync>;

#[derive(Clone)]
struct Binding {
    handler: Handler,
    owner: Option<ServiceId>,
    requires: LockCapability,
}

/// Dispatch errors, all reported to the sender as `Failed`
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("{0} is served by the coordinator")]
    CoordinatorOnly(&'static str),

    #[error("{action} may not target this process ({service_id})")]
    OwnService {
        action: &'static str,
        service_id: ServiceId,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Dispatcher owned by the control task, together with the session context
pub struct Dispatcher {
    context: SessionContext,
    bindings: HashMap<String, Binding>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.bindings.keys().collect();
        names.sort();
        f.debug_struct("Dispatcher")
            .field("context", &self.context)
            .field("bindings", &names)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            bindings: HashMap::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    /// Bind a process-wide handler; returns true if it replaced one
    pub fn bind<F>(&mut self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&ActionEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(name.into(), Arc::new(handler), None, LockCapability::empty())
    }

    /// Bind a handler owned by `owner`
    ///
    /// `requires` is held for `owner` while the handler runs. The binding is
    /// dropped when `owner` leaves the session.
    pub fn bind_for<F>(
        &mut self,
        owner: ServiceId,
        name: impl Into<String>,
        requires: LockCapability,
        handler: F,
    ) -> bool
    where
        F: Fn(&ActionEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(name.into(), Arc::new(handler), Some(owner), requires)
    }

    fn insert(
        &mut self,
        name: String,
        handler: Handler,
        owner: Option<ServiceId>,
        requires: LockCapability,
    ) -> bool {
        if Command::is_known(&name) {
            warn!(action = %name, "Binding named like a session command, only reachable through ExecuteAction");
        }
        debug!(action = %name, owner = ?owner, "Bound action");
        self.bindings
            .insert(
                name,
                Binding {
                    handler,
                    owner,
                    requires,
                },
            )
            .is_some()
    }

    pub fn unbind(&mut self, name: &str) -> bool {
        self.bindings.remove(name).is_some()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Remove a service with its locks, UI elements and owned bindings
    pub fn unregister_service(&mut self, id: ServiceId) -> Option<ServiceDescriptor> {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.owner != Some(id));
        let dropped = before - self.bindings.len();
        if dropped > 0 {
            debug!(service_id = %id, bindings = dropped, "Dropped service bindings");
        }
        self.context.unregister_service(id)
    }

    /// Dispatch one envelope and produce the response body
    ///
    /// Queue mode answers with an acknowledgement only.
    pub fn dispatch(&mut self, envelope: &ActionEnvelope, mode: DispatchMode) -> String {
        match self.try_dispatch(envelope, mode) {
            Ok(_) if mode == DispatchMode::Queue => ReturnMessage::ok("").to_json(),
            Ok(body) => body,
            Err(e) => {
                warn!(action = %envelope.action, mode = %mode, error = %e, "Dispatch failed");
                ReturnMessage::failed(e.to_string()).to_json()
            }
        }
    }

    pub fn try_dispatch(
        &mut self,
        envelope: &ActionEnvelope,
        mode: DispatchMode,
    ) -> Result<String, DispatchError> {
        debug!(action = %envelope.action, mode = %mode, "Dispatching");
        catch_unwind(AssertUnwindSafe(|| self.execute(envelope, mode)))
            .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic.as_ref()))))
    }

    /// Apply sub-commands in one suspended-refresh window
    ///
    /// Each sub-command fails on its own; the body is the JSON array of the
    /// individual replies.
    pub fn dispatch_batch(
        &mut self,
        commands: &[ActionEnvelope],
        mode: DispatchMode,
    ) -> Result<String, DispatchError> {
        self.context.suspend_refresh();
        let replies: Vec<String> = commands
            .iter()
            .map(|command| self.dispatch(command, mode))
            .collect();
        self.context.resume_refresh();

        Ok(serde_json::to_string(&replies).map_err(ProtocolError::from)?)
    }

    fn execute(
        &mut self,
        envelope: &ActionEnvelope,
        mode: DispatchMode,
    ) -> Result<String, DispatchError> {
        match Command::from_envelope(envelope)? {
            Some(command) => self.handle_command(command, envelope, mode),
            None => self.run_binding(&envelope.action, envelope),
        }
    }

    fn handle_command(
        &mut self,
        command: Command,
        envelope: &ActionEnvelope,
        mode: DispatchMode,
    ) -> Result<String, DispatchError> {
        match command {
            Command::Ping => Ok(envelope.action.clone()),
            Command::CreateSession { .. }
            | Command::CheckStartupCompleted { .. }
            | Command::ServiceShow { .. } => Err(DispatchError::CoordinatorOnly(command.action_name())),
            Command::ServiceConnected {
                service_id,
                service_name,
                service_type,
                service_url,
            } => {
                let descriptor =
                    ServiceDescriptor::new(service_id, service_name, service_type, service_url);
                self.context.register_service(descriptor)?;
                Ok(acknowledge())
            }
            Command::ServiceDisconnected { service_id } => {
                // Our own state is only released at teardown
                if self.context.own_id() == Some(service_id) {
                    return Err(DispatchError::OwnService {
                        action: "ServiceDisconnected",
                        service_id,
                    });
                }
                self.unregister_service(service_id);
                Ok(acknowledge())
            }
            Command::ServiceSetupCompleted { service_id } => {
                self.context.setup_completed(service_id);
                Ok(acknowledge())
            }
            Command::ShutdownSession { service_id, .. } => {
                info!(service_id = %service_id, "Session closed by participant");
                self.context
                    .request_shutdown(ShutdownCause::SessionClosed(service_id));
                Ok(acknowledge())
            }
            Command::Shutdown => {
                self.context.request_shutdown(ShutdownCause::Requested);
                Ok(acknowledge())
            }
            Command::EmergencyShutdown { reason } => {
                warn!(reason = ?reason, "Emergency shutdown requested");
                self.context
                    .request_shutdown(ShutdownCause::Emergency(reason));
                Ok(acknowledge())
            }
            Command::ConnectionLost => {
                warn!("Relay reported the connection as lost");
                self.context.request_shutdown(ShutdownCause::ConnectionLost);
                Ok(acknowledge())
            }
            Command::ExecuteAction { name } | Command::ExecuteFunction { name } => {
                self.run_binding(&name, envelope)
            }
            Command::Lock {
                service_id,
                capabilities,
            } => {
                self.context.lock(service_id, capabilities)?;
                Ok(acknowledge())
            }
            Command::Unlock {
                service_id,
                capabilities,
            } => {
                // `ALL` on our id is the startup UI lock, released by the controller
                if self.context.own_id() == Some(service_id)
                    && capabilities.contains(LockCapability::ALL)
                {
                    return Err(DispatchError::OwnService {
                        action: "Unlock",
                        service_id,
                    });
                }
                self.context.unlock(service_id, capabilities);
                Ok(acknowledge())
            }
            Command::Compound { commands } => self.dispatch_batch(&commands, mode),
        }
    }

    fn run_binding(
        &mut self,
        name: &str,
        envelope: &ActionEnvelope,
    ) -> Result<String, DispatchError> {
        let binding = self
            .bindings
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownAction(name.to_string()))?;

        let holder = binding.owner.or(self.context.own_id());
        let _guard = match holder {
            Some(holder) if !binding.requires.is_empty() => {
                Some(self.context.lock_scoped(holder, binding.requires)?)
            }
            _ => None,
        };

        Ok((binding.handler)(envelope)?)
    }
}

fn acknowledge() -> String {
    ReturnMessage::ok("").to_json()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
