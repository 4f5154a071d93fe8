//! Session Protocol Definitions
//!
//! This crate defines the wire model shared by every participant of a project
//! session: the flat action envelope, dispatch modes, return messages, the
//! closed command set, lock capabilities and the relay frame format.

pub mod capability;
pub mod codec;
pub mod command;
pub mod messages;

pub use capability::LockCapability;
pub use codec::RelayFrame;
pub use command::{Command, Credentials};
pub use messages::*;

/// Name of the mandatory member carrying the action name
pub const ACTION_MEMBER: &str = "action";

/// Literal returned by boolean queries such as `CheckStartupCompleted`
pub const RETURN_VALUE_TRUE: &str = "true";

/// Literal returned by boolean queries such as `CheckStartupCompleted`
pub const RETURN_VALUE_FALSE: &str = "false";

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Document is not a JSON object")]
    NotAnObject,

    #[error("Missing mandatory member: {0}")]
    MissingMember(String),

    #[error("Member {member} has unexpected type (expected {expected})")]
    InvalidMember {
        member: String,
        expected: &'static str,
    },

    #[error("Unknown lock capability: {0}")]
    UnknownCapability(String),

    #[error("Malformed relay frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}
