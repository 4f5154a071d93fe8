//! Coordinator liveness check
//!
//! While the session is active a background task pings the coordinator
//! every `health_check_interval_seconds`. A run of consecutive failures
//! declares the coordinator dead; the monitor then reports it once and stops.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use twinsession_control::{DispatchHandle, SessionSignal, ShutdownCause};
use twinsession_proto::{Command, DispatchMode, Response};
use twinsession_transport::Transport;

use crate::config::SessionConfig;

const TICK: Duration = Duration::from_secs(1);

/// Result of a single ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    Alive,
    NoReply(String),
    ErrorReply(String),
    Unexpected(String),
}

impl PingOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, PingOutcome::Alive)
    }
}

/// Emitted once when the failure threshold is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorLost {
    pub failures: u32,
    pub last: PingOutcome,
}

pub struct HealthMonitor {
    transport: Arc<dyn Transport>,
    coordinator: String,
    interval: Duration,
    max_failures: u32,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(transport: Arc<dyn Transport>, coordinator: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            transport,
            coordinator: coordinator.into(),
            interval: config.health_check_interval,
            max_failures: config.health_check_max_failures.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the monitor at its next tick
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn ping(&self) -> PingOutcome {
        let body = match self
            .transport
            .send_command(DispatchMode::ExecuteOneWayTls, &self.coordinator, &Command::Ping)
            .await
        {
            Ok(body) => body,
            Err(e) => return PingOutcome::NoReply(e.to_string()),
        };

        let response = Response::parse(&body);
        if response.is_error_flagged() {
            return PingOutcome::ErrorReply(body);
        }
        match response.into_payload() {
            Ok(payload) if payload == Command::Ping.action_name() => PingOutcome::Alive,
            Ok(payload) => PingOutcome::Unexpected(payload),
            Err(e) => PingOutcome::ErrorReply(e.to_string()),
        }
    }

    /// Ping until cancelled or until the coordinator is declared dead
    ///
    /// Returns `None` when cancelled.
    pub async fn run(self) -> Option<CoordinatorLost> {
        let mut failures = 0u32;
        loop {
            if !self.sleep_interval().await {
                debug!("Health monitor cancelled");
                return None;
            }

            let outcome = self.ping().await;
            if outcome.is_alive() {
                if failures > 0 {
                    debug!(failures, "Coordinator answering again");
                }
                failures = 0;
                continue;
            }

            failures += 1;
            warn!(
                coordinator = %self.coordinator,
                failures,
                max_failures = self.max_failures,
                outcome = ?outcome,
                "Coordinator health check failed"
            );
            if failures >= self.max_failures {
                error!(coordinator = %self.coordinator, failures, "Coordinator declared dead");
                return Some(CoordinatorLost {
                    failures,
                    last: outcome,
                });
            }
        }
    }

    /// Run in the background and report death to the control task
    pub fn spawn(self, handle: DispatchHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.run().await.is_some() {
                let signal = SessionSignal::ShutdownRequested(ShutdownCause::CoordinatorLost);
                if handle.signal(signal).await.is_err() {
                    debug!("Control task already stopped");
                }
            }
        })
    }

    /// Sleep one interval in one-second ticks; false when cancelled
    async fn sleep_interval(&self) -> bool {
        let mut remaining = self.interval;
        while !remaining.is_zero() {
            let step = remaining.min(TICK);
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(step) => {}
            }
            remaining -= step;
        }
        !self.cancel.is_cancelled()
    }
}
