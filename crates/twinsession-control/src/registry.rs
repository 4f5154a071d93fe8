//! Service registry for tracking connected session participants
//!
//! The registry is owned by the control task. Services are keyed by their
//! coordinator-issued id, and a `(name, type)` pair identifies at most one
//! live service at any time.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use twinsession_proto::{ServiceId, ServiceInfo};

/// A connected session participant
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    /// Coordinator-issued id, unique while connected
    pub id: ServiceId,
    pub name: String,
    pub service_type: String,
    /// Address the service accepts commands on (e.g., "10.0.0.4:8001")
    pub url: String,
    /// Set once the service reported its setup as completed
    pub ready: bool,
    pub connected_at: DateTime<Utc>,
}

impl ServiceDescriptor {
    pub fn new(
        id: ServiceId,
        name: impl Into<String>,
        service_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            service_type: service_type.into(),
            url: url.into(),
            ready: false,
            connected_at: Utc::now(),
        }
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            service_id: self.id,
            service_name: self.name.clone(),
            service_type: self.service_type.clone(),
            service_url: self.url.clone(),
        }
    }
}

impl From<ServiceInfo> for ServiceDescriptor {
    fn from(info: ServiceInfo) -> Self {
        Self::new(
            info.service_id,
            info.service_name,
            info.service_type,
            info.service_url,
        )
    }
}

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Service {name} ({service_type}) is already registered")]
    DuplicateName { name: String, service_type: String },

    #[error("Service id {0} is already in use")]
    DuplicateId(ServiceId),

    #[error("Service {0} not found")]
    NotFound(ServiceId),

    #[error("Service {name} ({service_type}) not found")]
    NameNotFound { name: String, service_type: String },
}

/// Registry of the services taking part in the session
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceId, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service
    ///
    /// # Errors
    ///
    /// `DuplicateName` if a service with the same `(name, type)` is live,
    /// `DuplicateId` if the id is already claimed.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<ServiceId, RegistryError> {
        if self.services.contains_key(&descriptor.id) {
            tracing::warn!(service_id = %descriptor.id, "Service id already registered");
            return Err(RegistryError::DuplicateId(descriptor.id));
        }

        if self
            .find_by_name_type(&descriptor.name, &descriptor.service_type)
            .is_ok()
        {
            tracing::warn!(
                service_name = %descriptor.name,
                service_type = %descriptor.service_type,
                "Service name already registered"
            );
            return Err(RegistryError::DuplicateName {
                name: descriptor.name,
                service_type: descriptor.service_type,
            });
        }

        tracing::info!(
            service_id = %descriptor.id,
            service_name = %descriptor.name,
            service_type = %descriptor.service_type,
            url = %descriptor.url,
            "Registered service"
        );

        let id = descriptor.id;
        self.services.insert(id, descriptor);
        Ok(id)
    }

    /// Remove a service; unknown ids are ignored
    ///
    /// Only the session context calls this, so lock and binding cleanup
    /// always happen in the same step.
    pub(crate) fn unregister(&mut self, id: ServiceId) -> Option<ServiceDescriptor> {
        let removed = self.services.remove(&id);
        match &removed {
            Some(descriptor) => tracing::info!(
                service_id = %id,
                service_name = %descriptor.name,
                "Unregistered service"
            ),
            None => tracing::debug!(service_id = %id, "Service already unregistered"),
        }
        removed
    }

    pub fn find(&self, id: ServiceId) -> Result<&ServiceDescriptor, RegistryError> {
        self.services.get(&id).ok_or(RegistryError::NotFound(id))
    }

    pub fn find_by_name_type(
        &self,
        name: &str,
        service_type: &str,
    ) -> Result<&ServiceDescriptor, RegistryError> {
        self.services
            .values()
            .find(|s| s.name == name && s.service_type == service_type)
            .ok_or_else(|| RegistryError::NameNotFound {
                name: name.to_string(),
                service_type: service_type.to_string(),
            })
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.services.contains_key(&id)
    }

    /// Flag a service as done with its setup; returns false if unknown
    pub fn mark_ready(&mut self, id: ServiceId) -> bool {
        match self.services.get_mut(&id) {
            Some(descriptor) => {
                descriptor.ready = true;
                true
            }
            None => false,
        }
    }

    /// All services, ordered by id
    pub fn list(&self) -> Vec<ServiceDescriptor> {
        self.services.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
