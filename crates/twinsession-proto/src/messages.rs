//! Protocol message types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{ProtocolError, ACTION_MEMBER};

/// Coordinator-issued service identifier
///
/// The only locking key of a session: no two live descriptors may claim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ServiceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// How a command is delivered to its target
///
/// The mode travels out of band (URL path or relay frame header), never
/// inside the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchMode {
    /// Blocking request/response
    Execute,
    /// Ordered fire-and-continue, the response is an acknowledgement only
    Queue,
    /// Pre-session authenticated call (directory lookup, login, health check)
    ExecuteOneWayTls,
}

impl DispatchMode {
    /// Endpoint path and relay header for this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Execute => "execute",
            DispatchMode::Queue => "queue",
            DispatchMode::ExecuteOneWayTls => "execute-one-way-tls",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "execute" => Some(DispatchMode::Execute),
            "queue" => Some(DispatchMode::Queue),
            "execute-one-way-tls" => Some(DispatchMode::ExecuteOneWayTls),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat, self-describing command document
///
/// Serialized as a single JSON object: the mandatory `action` member plus
/// free-form parameter members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub action: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ActionEnvelope {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter member
    ///
    /// The `action` member is reserved and cannot be overwritten through
    /// parameters.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key == ACTION_MEMBER {
            tracing::warn!(action = %self.action, "Ignoring parameter named like the action member");
            return;
        }
        self.params.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ProtocolError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidMember {
                member: key.to_string(),
                expected: "string",
            })
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, ProtocolError> {
        self.require(key)?
            .as_u64()
            .ok_or_else(|| ProtocolError::InvalidMember {
                member: key.to_string(),
                expected: "unsigned integer",
            })
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ProtocolError> {
        self.require(key)?
            .as_bool()
            .ok_or_else(|| ProtocolError::InvalidMember {
                member: key.to_string(),
                expected: "boolean",
            })
    }

    fn require(&self, key: &str) -> Result<&Value, ProtocolError> {
        self.params
            .get(key)
            .ok_or_else(|| ProtocolError::MissingMember(key.to_string()))
    }

    pub fn to_json(&self) -> String {
        // A string-keyed map of JSON values always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let action = match map.remove(ACTION_MEMBER) {
            Some(Value::String(action)) => action,
            Some(_) => {
                return Err(ProtocolError::InvalidMember {
                    member: ACTION_MEMBER.to_string(),
                    expected: "string",
                })
            }
            None => return Err(ProtocolError::MissingMember(ACTION_MEMBER.to_string())),
        };

        Ok(Self {
            action,
            params: map,
        })
    }
}

/// Status tag of a structured response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnStatus {
    Ok,
    Warning,
    Failed,
}

/// Tagged `{status, what}` response document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnMessage {
    pub status: ReturnStatus,
    #[serde(default)]
    pub what: String,
}

impl ReturnMessage {
    pub fn ok(what: impl Into<String>) -> Self {
        Self {
            status: ReturnStatus::Ok,
            what: what.into(),
        }
    }

    pub fn warning(what: impl Into<String>) -> Self {
        Self {
            status: ReturnStatus::Warning,
            what: what.into(),
        }
    }

    pub fn failed(what: impl Into<String>) -> Self {
        Self {
            status: ReturnStatus::Failed,
            what: what.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReturnStatus::Ok
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A response body as received from a participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Raw string reply (`"true"`, a URL, an echoed action name, a JSON document...)
    Bare(String),
    /// Structured `{status, what}` reply
    Tagged(ReturnMessage),
}

impl Response {
    /// Classify a raw response body
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<ReturnMessage>(body) {
            Ok(message) => Response::Tagged(message),
            Err(_) => Response::Bare(body.to_string()),
        }
    }

    /// True for `Failed` and `Warning` tagged replies
    pub fn is_error_flagged(&self) -> bool {
        matches!(
            self,
            Response::Tagged(ReturnMessage {
                status: ReturnStatus::Failed | ReturnStatus::Warning,
                ..
            })
        )
    }

    /// Payload text: the bare string or the `what` of an `Ok` reply
    ///
    /// Error-flagged replies become `UnexpectedResponse`.
    pub fn into_payload(self) -> Result<String, ProtocolError> {
        match self {
            Response::Bare(body) => Ok(body),
            Response::Tagged(message) if message.is_ok() => Ok(message.what),
            Response::Tagged(message) => Err(ProtocolError::UnexpectedResponse(format!(
                "{:?}: {}",
                message.status, message.what
            ))),
        }
    }
}

/// Wire description of a running session participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: ServiceId,
    pub service_name: String,
    pub service_type: String,
    pub service_url: String,
}
