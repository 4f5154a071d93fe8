//! Transport gateway for session participants
//!
//! Every outbound command goes through a [`Transport`]. Two implementations
//! exist and one of them is picked at bootstrap:
//!
//! - [`DirectTransport`]: one HTTPS `POST` per call
//! - [`RelayTransport`]: one persistent duplex channel per session, requests
//!   framed as `<mode>\n<url>\n<payload>`
//!
//! Both bound every call by the configured default timeout.

pub mod direct;
pub mod relay;
pub mod testing;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use twinsession_proto::{ActionEnvelope, Command, DispatchMode, ProtocolError};

pub use direct::{DirectTransport, TlsSettings};
pub use relay::{RelayChannel, RelayTransport, WebSocketChannel};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {target} refused: {reason}")]
    ConnectionRefused { target: String, reason: String },

    #[error("{target} answered with HTTP status {status}")]
    Http { target: String, status: u16 },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Relay channel closed")]
    Closed,

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Outbound command delivery
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` to `target` and return the raw response body
    async fn send(
        &self,
        mode: DispatchMode,
        target: &str,
        envelope: &ActionEnvelope,
    ) -> TransportResult<String>;

    /// Short name used in log fields
    fn kind(&self) -> &'static str;

    /// Release the underlying connection, if any
    async fn close(&self) {}

    async fn send_command(
        &self,
        mode: DispatchMode,
        target: &str,
        command: &Command,
    ) -> TransportResult<String> {
        let envelope = command.to_envelope()?;
        self.send(mode, target, &envelope).await
    }
}

/// True when `target` names this process itself
pub(crate) fn is_own_target(own_url: Option<&str>, target: &str) -> bool {
    own_url.is_some_and(|own| own == target)
}
