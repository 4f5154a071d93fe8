//! Session context owned by the control task
//!
//! Holds the registry, the lock manager and the UI affordance sink, and
//! keeps them consistent: a service leaves the registry, its locks and its
//! UI elements in one step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use twinsession_proto::{LockCapability, ServiceId};

use crate::locks::{ElementChange, ElementId, LockError, LockManager};
use crate::registry::{RegistryError, ServiceDescriptor, ServiceRegistry};

/// Setup-completed notifications remembered for services not yet registered
const MAX_EARLY_READY: usize = 64;

/// External UI collaborator receiving enabled-state transitions
pub trait AffordanceSink: Send {
    fn apply(&mut self, changes: &[ElementChange]);
}

/// Sink that only logs
#[derive(Debug, Default)]
pub struct LogSink;

impl AffordanceSink for LogSink {
    fn apply(&mut self, changes: &[ElementChange]) {
        for change in changes {
            debug!(element = %change.element, enabled = change.enabled, "UI element state");
        }
    }
}

/// Sink that records every flush, for inspection
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    flushes: Arc<Mutex<Vec<Vec<ElementChange>>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushes(&self) -> Vec<Vec<ElementChange>> {
        self.flushes
            .lock()
            .map(|flushes| flushes.clone())
            .unwrap_or_default()
    }
}

impl AffordanceSink for RecordingSink {
    fn apply(&mut self, changes: &[ElementChange]) {
        if let Ok(mut flushes) = self.flushes.lock() {
            flushes.push(changes.to_vec());
        }
    }
}

/// Why the session is being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Local close request
    Close,
    /// `Shutdown` received
    Requested,
    /// `ShutdownSession` received from a participant
    SessionClosed(ServiceId),
    /// `EmergencyShutdown` received
    Emergency(Option<String>),
    /// The relay reported the connection as lost
    ConnectionLost,
    /// The health monitor declared the coordinator dead
    CoordinatorLost,
}

/// Facts the bootstrapper has to react to, raised while handling commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    ServiceJoined(ServiceId),
    ServiceLeft(ServiceId),
    SetupCompleted(ServiceId),
    ShutdownRequested(ShutdownCause),
}

pub struct SessionContext {
    own_id: Option<ServiceId>,
    registry: ServiceRegistry,
    locks: LockManager,
    sink: Box<dyn AffordanceSink>,
    refresh_suspended: u32,
    /// Enabled state of changed elements as of the start of the window
    pending: BTreeMap<ElementId, bool>,
    early_ready: BTreeSet<ServiceId>,
    signals: Vec<SessionSignal>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("own_id", &self.own_id)
            .field("services", &self.registry.len())
            .field("refresh_suspended", &self.refresh_suspended)
            .finish()
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(Box::new(LogSink))
    }
}

impl SessionContext {
    pub fn new(sink: Box<dyn AffordanceSink>) -> Self {
        Self {
            own_id: None,
            registry: ServiceRegistry::new(),
            locks: LockManager::new(),
            sink,
            refresh_suspended: 0,
            pending: BTreeMap::new(),
            early_ready: BTreeSet::new(),
            signals: Vec::new(),
        }
    }

    /// Id the coordinator assigned to this process
    pub fn own_id(&self) -> Option<ServiceId> {
        self.own_id
    }

    pub fn set_own_id(&mut self, id: ServiceId) {
        self.own_id = Some(id);
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// This process or a registered service
    pub fn is_participant(&self, id: ServiceId) -> bool {
        self.own_id == Some(id) || self.registry.contains(id)
    }

    /// Register a peer and raise `ServiceJoined`
    ///
    /// A setup-completed notification that arrived before the peer was
    /// known is applied right away.
    pub fn register_service(
        &mut self,
        descriptor: ServiceDescriptor,
    ) -> Result<ServiceId, RegistryError> {
        let id = self.registry.register(descriptor)?;
        self.signals.push(SessionSignal::ServiceJoined(id));

        if self.early_ready.remove(&id) {
            self.registry.mark_ready(id);
            self.signals.push(SessionSignal::SetupCompleted(id));
        }
        Ok(id)
    }

    /// Drop a service together with its locks and UI elements
    ///
    /// Idempotent. Command bindings owned by the service are removed by the
    /// dispatcher, which is the only caller.
    pub(crate) fn unregister_service(&mut self, id: ServiceId) -> Option<ServiceDescriptor> {
        let removed = self.registry.unregister(id);
        let changes = self.locks.clean_service(id);
        self.early_ready.remove(&id);
        self.publish(changes);

        if removed.is_some() {
            self.signals.push(SessionSignal::ServiceLeft(id));
        }
        removed
    }

    /// Record that `id` finished its setup
    pub fn setup_completed(&mut self, id: ServiceId) {
        if self.registry.mark_ready(id) {
            info!(service_id = %id, "Service setup completed");
            self.signals.push(SessionSignal::SetupCompleted(id));
        } else if self.own_id == Some(id) {
            debug!(service_id = %id, "Ignoring setup completed for this process");
        } else if self.early_ready.len() >= MAX_EARLY_READY && !self.early_ready.contains(&id) {
            warn!(service_id = %id, "Too many early setup notifications, dropping");
        } else {
            debug!(service_id = %id, "Setup completed before registration");
            self.early_ready.insert(id);
        }
    }

    pub fn request_shutdown(&mut self, cause: ShutdownCause) {
        self.signals.push(SessionSignal::ShutdownRequested(cause));
    }

    /// Take the signals raised since the last call
    pub fn drain_signals(&mut self) -> Vec<SessionSignal> {
        std::mem::take(&mut self.signals)
    }

    pub fn lock(
        &mut self,
        owner: ServiceId,
        capabilities: LockCapability,
    ) -> Result<(), LockError> {
        if !self.is_participant(owner) {
            return Err(LockError::UnknownOwner(owner));
        }
        let changes = self.locks.lock(owner, capabilities)?;
        self.publish(changes);
        Ok(())
    }

    pub fn unlock(&mut self, owner: ServiceId, capabilities: LockCapability) {
        let changes = self.locks.unlock(owner, capabilities);
        self.publish(changes);
    }

    /// Hold `capabilities` for `owner` until the guard is dropped
    ///
    /// Only what `owner` did not already hold is released on drop.
    pub fn lock_scoped(
        &mut self,
        owner: ServiceId,
        capabilities: LockCapability,
    ) -> Result<LockGuard<'_>, LockError> {
        let added = capabilities.difference(self.locks.held_by(owner));
        self.lock(owner, added)?;
        Ok(LockGuard {
            context: self,
            owner,
            added,
        })
    }

    pub fn ui_element_created(
        &mut self,
        owner: ServiceId,
        element: ElementId,
        required: LockCapability,
    ) -> Result<(), LockError> {
        if !self.is_participant(owner) {
            return Err(LockError::UnknownOwner(owner));
        }
        let changes = self.locks.ui_element_created(owner, element, required)?;
        self.publish(changes);
        Ok(())
    }

    pub fn ui_element_destroyed(&mut self, element: ElementId) -> bool {
        self.pending.remove(&element);
        self.locks.ui_element_destroyed(element)
    }

    pub fn disable(&mut self, element: ElementId) -> Result<(), LockError> {
        let changes = self.locks.disable(element)?;
        self.publish(changes);
        Ok(())
    }

    pub fn enable(&mut self, element: ElementId, reset: bool) -> Result<(), LockError> {
        let changes = self.locks.enable(element, reset)?;
        self.publish(changes);
        Ok(())
    }

    /// Stop forwarding affordance changes until the matching resume
    ///
    /// Windows nest; changes are coalesced per element.
    pub fn suspend_refresh(&mut self) {
        self.refresh_suspended += 1;
    }

    /// Close one suspension window and flush once the outermost closes
    pub fn resume_refresh(&mut self) {
        self.refresh_suspended = self.refresh_suspended.saturating_sub(1);
        if self.refresh_suspended > 0 || self.pending.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        let changes: Vec<ElementChange> = pending
            .into_iter()
            .filter_map(|(element, before)| {
                self.locks
                    .is_enabled(element)
                    .filter(|now| *now != before)
                    .map(|enabled| ElementChange { element, enabled })
            })
            .collect();
        if !changes.is_empty() {
            self.sink.apply(&changes);
        }
    }

    pub fn is_refresh_suspended(&self) -> bool {
        self.refresh_suspended > 0
    }

    fn publish(&mut self, changes: Vec<ElementChange>) {
        if changes.is_empty() {
            return;
        }
        if self.refresh_suspended > 0 {
            // Keep the state from before the window opened
            for change in changes {
                self.pending.entry(change.element).or_insert(!change.enabled);
            }
        } else {
            self.sink.apply(&changes);
        }
    }
}

/// Scoped lock acquisition, released on drop
pub struct LockGuard<'a> {
    context: &'a mut SessionContext,
    owner: ServiceId,
    added: LockCapability,
}

impl LockGuard<'_> {
    pub fn owner(&self) -> ServiceId {
        self.owner
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.added.is_empty() {
            self.context.unlock(self.owner, self.added);
        }
    }
}
