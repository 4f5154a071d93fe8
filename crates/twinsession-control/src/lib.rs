//! Session control plane
//!
//! Everything here is owned by one control task: the service registry, the
//! lock manager, the UI affordance table and the action dispatcher. Other
//! tasks reach it through a [`DispatchHandle`].

pub mod context;
pub mod dispatcher;
pub mod gate;
pub mod locks;
pub mod registry;

pub use context::{
    AffordanceSink, LockGuard, LogSink, RecordingSink, SessionContext, SessionSignal,
    ShutdownCause,
};
pub use dispatcher::{DispatchError, Dispatcher, HandlerError, HandlerResult};
pub use gate::{ControlMessage, DispatchHandle, HandleError};
pub use locks::{ElementChange, ElementId, LockError, LockManager};
pub use registry::{RegistryError, ServiceDescriptor, ServiceRegistry};
