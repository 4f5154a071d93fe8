//! Entry point for tasks other than the control task
//!
//! Transport listeners, the startup poller and the health monitor never
//! touch session state. They send a [`ControlMessage`] to the control task
//! and wait for its reply on a oneshot channel.
//!
//! Queue-mode submissions take the process-wide FIFO gate first and keep it
//! until their handler has finished, so queued side effects are applied in
//! gate order and never interleave. Execute-mode submissions skip the gate.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use twinsession_proto::{ActionEnvelope, Command, DispatchMode, ProtocolError};

use crate::context::SessionSignal;

/// Work handed to the control task
#[derive(Debug)]
pub enum ControlMessage {
    Dispatch {
        envelope: ActionEnvelope,
        mode: DispatchMode,
        reply: oneshot::Sender<String>,
    },
    /// A background worker observed something the session must react to
    Signal(SessionSignal),
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Control task stopped")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<ControlMessage>,
    queue_gate: Arc<Mutex<()>>,
}

impl DispatchHandle {
    /// Create a handle and the receiving end the control task reads from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                queue_gate: Arc::new(Mutex::new(())),
            },
            receiver,
        )
    }

    /// Submit one envelope and wait for the response body
    pub async fn submit(
        &self,
        envelope: ActionEnvelope,
        mode: DispatchMode,
    ) -> Result<String, HandleError> {
        if mode == DispatchMode::Queue {
            let _turn = self.queue_gate.lock().await;
            return self.round_trip(envelope, mode).await;
        }
        self.round_trip(envelope, mode).await
    }

    /// Apply several envelopes as one compound command under one gate turn
    pub async fn submit_batch(&self, commands: Vec<ActionEnvelope>) -> Result<String, HandleError> {
        let envelope = Command::Compound { commands }.to_envelope()?;
        let _turn = self.queue_gate.lock().await;
        self.round_trip(envelope, DispatchMode::Execute).await
    }

    pub async fn signal(&self, signal: SessionSignal) -> Result<(), HandleError> {
        self.sender
            .send(ControlMessage::Signal(signal))
            .await
            .map_err(|_| HandleError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn round_trip(
        &self,
        envelope: ActionEnvelope,
        mode: DispatchMode,
    ) -> Result<String, HandleError> {
        let (reply, response) = oneshot::channel();
        debug!(action = %envelope.action, mode = %mode, "Submitting to control task");
        self.sender
            .send(ControlMessage::Dispatch {
                envelope,
                mode,
                reply,
            })
            .await
            .map_err(|_| HandleError::Closed)?;
        response.await.map_err(|_| HandleError::Closed)
    }
}
