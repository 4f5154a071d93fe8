//! In-memory transport doubles for tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use twinsession_proto::{ActionEnvelope, DispatchMode};

use crate::{RelayChannel, Transport, TransportError, TransportResult};

/// One call observed by a [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub mode: DispatchMode,
    pub target: String,
    pub envelope: ActionEnvelope,
}

type Responder =
    dyn Fn(DispatchMode, &str, &ActionEnvelope) -> TransportResult<String> + Send + Sync;

/// Transport whose replies come from a closure
///
/// Every call is recorded so tests can assert on what was sent.
#[derive(Clone)]
pub struct ScriptedTransport {
    responder: Arc<Responder>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(DispatchMode, &str, &ActionEnvelope) -> TransportResult<String> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Number of calls carrying `action`
    pub fn count(&self, action: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.envelope.action == action)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        mode: DispatchMode,
        target: &str,
        envelope: &ActionEnvelope,
    ) -> TransportResult<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                mode,
                target: target.to_string(),
                envelope: envelope.clone(),
            });
        }
        (self.responder)(mode, target, envelope)
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

/// Relay channel backed by in-process queues
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

/// The relay side of a [`MemoryChannel`]
pub struct MemoryPeer {
    frames: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<String>,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryPeer) {
        let (outbound, frames) = mpsc::unbounded_channel();
        let (replies, inbound) = mpsc::unbounded_channel();
        (
            MemoryChannel { outbound, inbound },
            MemoryPeer { frames, replies },
        )
    }
}

impl MemoryPeer {
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn reply(&self, text: impl Into<String>) {
        let _ = self.replies.send(text.into());
    }
}

#[async_trait]
impl RelayChannel for MemoryChannel {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv_text(&mut self) -> TransportResult<Option<String>> {
        Ok(self.inbound.recv().await)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.inbound.close();
        Ok(())
    }
}
