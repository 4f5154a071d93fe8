//! Closed set of session commands
//!
//! Every action name the session core produces or consumes is a variant of
//! [`Command`], so handling them is checked for exhaustiveness at compile
//! time. Action names outside this set are open-ended passthrough actions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::capability::LockCapability;
use crate::messages::{ActionEnvelope, ServiceId};
use crate::{ProtocolError, ACTION_MEMBER};

/// User credentials forwarded to the coordinator on session creation
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Command {
    /// Ask the directory for a coordinator, or the coordinator for a session
    CreateSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<Credentials>,
        #[serde(default)]
        start_relay: bool,
    },
    /// Poll whether every session service finished starting (`"true"`/`"false"`)
    CheckStartupCompleted { session_id: String },
    /// Announce that this service is visible; answers the running services
    ServiceShow {
        service_id: ServiceId,
        session_id: String,
    },
    ServiceConnected {
        service_id: ServiceId,
        service_name: String,
        service_type: String,
        service_url: String,
    },
    ServiceDisconnected { service_id: ServiceId },
    /// Rendezvous signal: the sender finished its own setup
    ServiceSetupCompleted { service_id: ServiceId },
    /// Health check; the reply echoes the action name
    Ping,
    ShutdownSession {
        service_id: ServiceId,
        session_id: String,
    },
    Shutdown,
    EmergencyShutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ConnectionLost,
    /// Generic passthrough to business logic keyed by `name`
    ExecuteAction { name: String },
    /// Generic passthrough to business logic keyed by `name`
    ExecuteFunction { name: String },
    Lock {
        service_id: ServiceId,
        capabilities: LockCapability,
    },
    Unlock {
        service_id: ServiceId,
        capabilities: LockCapability,
    },
    /// Batch of sub-commands applied under one lock acquisition
    Compound { commands: Vec<ActionEnvelope> },
}

impl Command {
    pub const ACTION_NAMES: [&'static str; 16] = [
        "CreateSession",
        "CheckStartupCompleted",
        "ServiceShow",
        "ServiceConnected",
        "ServiceDisconnected",
        "ServiceSetupCompleted",
        "Ping",
        "ShutdownSession",
        "Shutdown",
        "EmergencyShutdown",
        "ConnectionLost",
        "ExecuteAction",
        "ExecuteFunction",
        "Lock",
        "Unlock",
        "Compound",
    ];

    pub fn action_name(&self) -> &'static str {
        match self {
            Command::CreateSession { .. } => "CreateSession",
            Command::CheckStartupCompleted { .. } => "CheckStartupCompleted",
            Command::ServiceShow { .. } => "ServiceShow",
            Command::ServiceConnected { .. } => "ServiceConnected",
            Command::ServiceDisconnected { .. } => "ServiceDisconnected",
            Command::ServiceSetupCompleted { .. } => "ServiceSetupCompleted",
            Command::Ping => "Ping",
            Command::ShutdownSession { .. } => "ShutdownSession",
            Command::Shutdown => "Shutdown",
            Command::EmergencyShutdown { .. } => "EmergencyShutdown",
            Command::ConnectionLost => "ConnectionLost",
            Command::ExecuteAction { .. } => "ExecuteAction",
            Command::ExecuteFunction { .. } => "ExecuteFunction",
            Command::Lock { .. } => "Lock",
            Command::Unlock { .. } => "Unlock",
            Command::Compound { .. } => "Compound",
        }
    }

    pub fn is_known(action: &str) -> bool {
        Self::ACTION_NAMES.contains(&action)
    }

    /// Parse the typed command carried by an envelope
    ///
    /// Returns `Ok(None)` for open-ended action names and a protocol error
    /// when a known action carries malformed parameters.
    pub fn from_envelope(envelope: &ActionEnvelope) -> Result<Option<Self>, ProtocolError> {
        if !Self::is_known(&envelope.action) {
            return Ok(None);
        }

        let mut map = envelope.params.clone();
        map.insert(
            ACTION_MEMBER.to_string(),
            Value::String(envelope.action.clone()),
        );
        let command = serde_json::from_value(Value::Object(map))?;
        Ok(Some(command))
    }

    pub fn to_envelope(&self) -> Result<ActionEnvelope, ProtocolError> {
        let value = serde_json::to_value(self)?;
        ActionEnvelope::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_command_is_bare_action() {
        let envelope = Command::Ping.to_envelope().unwrap();
        assert_eq!(envelope.action, "Ping");
        assert!(envelope.params.is_empty());
        assert_eq!(envelope.to_json(), r#"{"action":"Ping"}"#);
    }

    #[test]
    fn test_lock_command_wire_shape() {
        let command = Command::Lock {
            service_id: ServiceId(3),
            capabilities: LockCapability::MODEL_WRITE | LockCapability::VIEW_WRITE,
        };
        let envelope = command.to_envelope().unwrap();
        assert_eq!(envelope.get_u64("service_id").unwrap(), 3);
        assert_eq!(
            envelope.get("capabilities").unwrap(),
            &json!(["ModelWrite", "ViewWrite"])
        );

        let parsed = Command::from_envelope(&envelope).unwrap().unwrap();
        assert_eq!(parsed, command);
    }

    #[test]
    fn test_unknown_action_is_passthrough() {
        let envelope = ActionEnvelope::new("Model:SelectionChanged").with_param("id", 1);
        assert_eq!(Command::from_envelope(&envelope).unwrap(), None);
    }

    #[test]
    fn test_known_action_with_bad_params_is_protocol_error() {
        let envelope = ActionEnvelope::new("ServiceDisconnected").with_param("service_id", "x");
        assert!(Command::from_envelope(&envelope).is_err());
    }

    #[test]
    fn test_extra_params_are_tolerated() {
        let envelope = ActionEnvelope::new("ExecuteAction")
            .with_param("name", "Import")
            .with_param("model_id", 12);
        let command = Command::from_envelope(&envelope).unwrap().unwrap();
        assert_eq!(
            command,
            Command::ExecuteAction {
                name: "Import".to_string()
            }
        );
    }

    #[test]
    fn test_compound_nests_envelopes() {
        let command = Command::Compound {
            commands: vec![
                ActionEnvelope::new("Ping"),
                ActionEnvelope::new("Custom").with_param("x", 1),
            ],
        };
        let envelope = command.to_envelope().unwrap();
        let parsed = Command::from_envelope(&envelope).unwrap().unwrap();
        assert_eq!(parsed, command);
    }

    #[test]
    fn test_action_names_match_variants() {
        let commands = [
            Command::Ping,
            Command::Shutdown,
            Command::ConnectionLost,
            Command::EmergencyShutdown { reason: None },
            Command::ServiceSetupCompleted {
                service_id: ServiceId(1),
            },
        ];
        for command in commands {
            let envelope = command.to_envelope().unwrap();
            assert_eq!(envelope.action, command.action_name());
            assert!(Command::is_known(command.action_name()));
        }
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            user: "alice".to_string(),
            password: "secret".to_string(),
        };
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }
}
