//! Session lifecycle
//!
//! Opens a project session against the directory and coordinator, keeps it
//! alive with the health monitor and closes it again. The control task is
//! [`SessionController`]; peers reach it through the [`inbound`] listener.

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod exit;
pub mod health;
pub mod inbound;

pub use bootstrap::{BootstrapError, Handshake, ProjectRequest, SessionGrant, SessionState};
pub use config::{ConfigError, SessionConfig, TlsConfig};
pub use controller::{RelayConnector, SessionController, WebSocketRelayConnector};
pub use exit::{
    SessionExit, EXIT_ABANDONED, EXIT_CLEAN, EXIT_COORDINATOR_LOST, EXIT_DIRECTORY_UNREACHABLE,
    EXIT_EMERGENCY_SHUTDOWN, EXIT_STARTUP_FAILED,
};
pub use health::{CoordinatorLost, HealthMonitor, PingOutcome};
