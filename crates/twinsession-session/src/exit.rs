//! How a session run ends

use std::fmt;

use twinsession_control::ShutdownCause;

pub const EXIT_CLEAN: i32 = 0;
/// The session attempt was abandoned and the process is back to idle
pub const EXIT_ABANDONED: i32 = 1;
pub const EXIT_DIRECTORY_UNREACHABLE: i32 = 2;
pub const EXIT_STARTUP_FAILED: i32 = 3;
pub const EXIT_COORDINATOR_LOST: i32 = 4;
pub const EXIT_EMERGENCY_SHUTDOWN: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Orderly shutdown
    Closed(ShutdownCause),
    /// Session creation was refused; nothing was torn down
    Abandoned { reason: String },
    /// Unrecoverable; the process should exit with `code`
    Fatal { code: i32, reason: String },
}

impl SessionExit {
    pub fn fatal(code: i32, reason: impl Into<String>) -> Self {
        SessionExit::Fatal {
            code,
            reason: reason.into(),
        }
    }

    /// Map a teardown cause to its exit
    ///
    /// Losing the coordinator or a peer-requested emergency stop are fatal,
    /// every other cause is a clean close.
    pub fn from_cause(cause: ShutdownCause) -> Self {
        match cause {
            ShutdownCause::CoordinatorLost => {
                Self::fatal(EXIT_COORDINATOR_LOST, "coordinator stopped answering pings")
            }
            ShutdownCause::ConnectionLost => {
                Self::fatal(EXIT_COORDINATOR_LOST, "relay connection lost")
            }
            ShutdownCause::Emergency(reason) => Self::fatal(
                EXIT_EMERGENCY_SHUTDOWN,
                reason.unwrap_or_else(|| "emergency shutdown requested".to_string()),
            ),
            cause => SessionExit::Closed(cause),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            SessionExit::Closed(_) => EXIT_CLEAN,
            SessionExit::Abandoned { .. } => EXIT_ABANDONED,
            SessionExit::Fatal { code, .. } => *code,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionExit::Fatal { .. })
    }
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionExit::Closed(cause) => write!(f, "session closed ({:?})", cause),
            SessionExit::Abandoned { reason } => write!(f, "session abandoned: {}", reason),
            SessionExit::Fatal { code, reason } => write!(f, "fatal error {}: {}", code, reason),
        }
    }
}
