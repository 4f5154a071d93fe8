//! Lock manager
//!
//! Tracks which owner holds which [`LockCapability`] flags and which UI
//! affordances depend on them. Locking is advisory: it gates affordances
//! and command admission, it does not guard memory.
//!
//! An element is enabled when all of the following hold:
//!
//! - its explicit disable counter is zero
//! - its owner holds none of the element's required capabilities
//! - no owner holds [`LockCapability::ALL`]
//!
//! Every mutation returns the elements whose enabled state flipped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use twinsession_proto::{LockCapability, ServiceId};

/// Identifier of a UI affordance (button, menu entry, tool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An enabled-state transition of one UI element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementChange {
    pub element: ElementId,
    pub enabled: bool,
}

/// Lock manager errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("{requested} conflicts with {held} held by service {holder}")]
    Conflict {
        requested: LockCapability,
        holder: ServiceId,
        held: LockCapability,
    },

    #[error("UI element {0} is already registered")]
    DuplicateElement(ElementId),

    #[error("UI element {0} not found")]
    UnknownElement(ElementId),

    #[error("Service {0} is not part of the session")]
    UnknownOwner(ServiceId),
}

#[derive(Debug, Clone)]
struct UiElement {
    owner: ServiceId,
    required: LockCapability,
    disabled: u32,
    enabled: bool,
}

#[derive(Debug, Default)]
pub struct LockManager {
    held: HashMap<ServiceId, LockCapability>,
    elements: BTreeMap<ElementId, UiElement>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `capabilities` to what `owner` holds
    ///
    /// Fails without applying anything when an exclusive flag of
    /// `capabilities` is held by another owner.
    pub fn lock(
        &mut self,
        owner: ServiceId,
        capabilities: LockCapability,
    ) -> Result<Vec<ElementChange>, LockError> {
        if let Some((holder, held)) = self.conflicting_holder(owner, capabilities) {
            warn!(
                service_id = %owner,
                requested = %capabilities,
                holder = %holder,
                "Lock conflict"
            );
            return Err(LockError::Conflict {
                requested: capabilities,
                holder,
                held,
            });
        }

        if capabilities.is_empty() {
            return Ok(Vec::new());
        }

        let held = self.held.entry(owner).or_default();
        *held |= capabilities;
        debug!(service_id = %owner, held = %*held, "Locked");

        Ok(self.refresh())
    }

    /// Release `capabilities` held by `owner`; `ALL` releases everything
    pub fn unlock(&mut self, owner: ServiceId, capabilities: LockCapability) -> Vec<ElementChange> {
        let Some(held) = self.held.get_mut(&owner) else {
            return Vec::new();
        };

        if capabilities.contains(LockCapability::ALL) {
            *held = LockCapability::empty();
        } else {
            held.remove(capabilities);
        }

        debug!(service_id = %owner, held = %*held, "Unlocked");
        if held.is_empty() {
            self.held.remove(&owner);
        }

        self.refresh()
    }

    /// Would `owner` be granted `capabilities` right now
    pub fn can_lock(&self, owner: ServiceId, capabilities: LockCapability) -> bool {
        self.conflicting_holder(owner, capabilities).is_none()
    }

    fn conflicting_holder(
        &self,
        owner: ServiceId,
        capabilities: LockCapability,
    ) -> Option<(ServiceId, LockCapability)> {
        let exclusive = capabilities.exclusive();
        if exclusive.is_empty() {
            return None;
        }

        self.held
            .iter()
            .find(|(holder, held)| **holder != owner && held.intersects(exclusive))
            .map(|(holder, held)| (*holder, *held))
    }

    /// Register an affordance of `owner`
    ///
    /// The returned change carries the element's initial state.
    pub fn ui_element_created(
        &mut self,
        owner: ServiceId,
        element: ElementId,
        required: LockCapability,
    ) -> Result<Vec<ElementChange>, LockError> {
        if self.elements.contains_key(&element) {
            return Err(LockError::DuplicateElement(element));
        }

        let mut state = UiElement {
            owner,
            required,
            disabled: 0,
            enabled: true,
        };
        state.enabled = self.compute_enabled(&state);
        let enabled = state.enabled;
        self.elements.insert(element, state);

        debug!(service_id = %owner, element = %element, required = %required, "UI element registered");
        Ok(vec![ElementChange { element, enabled }])
    }

    /// Forget an affordance; returns false if it was unknown
    pub fn ui_element_destroyed(&mut self, element: ElementId) -> bool {
        self.elements.remove(&element).is_some()
    }

    /// Explicitly grey out an element, independent of locks
    pub fn disable(&mut self, element: ElementId) -> Result<Vec<ElementChange>, LockError> {
        let state = self
            .elements
            .get_mut(&element)
            .ok_or(LockError::UnknownElement(element))?;
        state.disabled += 1;
        Ok(self.refresh())
    }

    /// Undo one `disable`, or all of them with `reset`
    pub fn enable(
        &mut self,
        element: ElementId,
        reset: bool,
    ) -> Result<Vec<ElementChange>, LockError> {
        let state = self
            .elements
            .get_mut(&element)
            .ok_or(LockError::UnknownElement(element))?;
        state.disabled = if reset {
            0
        } else {
            state.disabled.saturating_sub(1)
        };
        Ok(self.refresh())
    }

    pub fn is_enabled(&self, element: ElementId) -> Option<bool> {
        self.elements.get(&element).map(|state| state.enabled)
    }

    /// Release every lock and drop every element of `owner`
    ///
    /// Always succeeds and is idempotent.
    pub fn clean_service(&mut self, owner: ServiceId) -> Vec<ElementChange> {
        let released = self.held.remove(&owner).unwrap_or_default();
        let before = self.elements.len();
        self.elements.retain(|_, state| state.owner != owner);
        let removed = before - self.elements.len();

        if !released.is_empty() || removed > 0 {
            info!(
                service_id = %owner,
                released = %released,
                elements = removed,
                "Cleaned service locks"
            );
        }

        self.refresh()
    }

    /// Everything `owner` currently holds
    pub fn held_by(&self, owner: ServiceId) -> LockCapability {
        self.held.get(&owner).copied().unwrap_or_default()
    }

    /// Owners holding any of `capabilities`, ordered by id
    pub fn holders(&self, capabilities: LockCapability) -> Vec<ServiceId> {
        let mut holders: Vec<ServiceId> = self
            .held
            .iter()
            .filter(|(_, held)| held.intersects(capabilities))
            .map(|(owner, _)| *owner)
            .collect();
        holders.sort();
        holders
    }

    /// Number of owners holding `capability`
    pub fn lock_level(&self, capability: LockCapability) -> usize {
        self.held
            .values()
            .filter(|held| held.intersects(capability))
            .count()
    }

    pub fn elements_of(&self, owner: ServiceId) -> Vec<ElementId> {
        self.elements
            .iter()
            .filter(|(_, state)| state.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Owners that hold something or own an element
    pub fn owners(&self) -> Vec<ServiceId> {
        let mut owners: Vec<ServiceId> = self
            .held
            .keys()
            .copied()
            .chain(self.elements.values().map(|state| state.owner))
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }

    fn compute_enabled(&self, state: &UiElement) -> bool {
        state.disabled == 0
            && !self.held_by(state.owner).intersects(state.required)
            && self.lock_level(LockCapability::ALL) == 0
    }

    fn refresh(&mut self) -> Vec<ElementChange> {
        let all_locked = self.lock_level(LockCapability::ALL) > 0;
        let mut changes = Vec::new();

        for (id, state) in self.elements.iter_mut() {
            let owner_held = self.held.get(&state.owner).copied().unwrap_or_default();
            let enabled =
                state.disabled == 0 && !owner_held.intersects(state.required) && !all_locked;
            if enabled != state.enabled {
                state.enabled = enabled;
                changes.push(ElementChange {
                    element: *id,
                    enabled,
                });
            }
        }

        changes
    }
}
