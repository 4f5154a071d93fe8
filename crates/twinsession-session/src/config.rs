//! Session configuration
//!
//! Loaded from a YAML file; every field has a default so a file only needs
//! to name what differs. The binary overlays command line arguments on top.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use twinsession_proto::Credentials;
use twinsession_transport::TlsSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Certificate paths for mutual TLS
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on every transport call
    #[serde(
        rename = "default_timeout_secs",
        default = "default_timeout",
        with = "duration_secs"
    )]
    pub default_timeout: Duration,

    #[serde(
        rename = "health_check_interval_seconds",
        default = "default_health_check_interval",
        with = "duration_secs"
    )]
    pub health_check_interval: Duration,

    #[serde(
        rename = "startup_poll_interval_ms",
        default = "default_startup_poll_interval",
        with = "duration_millis"
    )]
    pub startup_poll_interval: Duration,

    /// Startup gives up after this many default timeouts
    #[serde(default = "default_startup_max_wait_multiplier")]
    pub startup_max_wait_multiplier: u32,

    /// Consecutive failed pings before the coordinator is declared dead
    #[serde(default = "default_health_check_max_failures")]
    pub health_check_max_failures: u32,

    #[serde(default)]
    pub directory_url: String,

    /// Ask the coordinator for a relay channel instead of direct HTTPS
    #[serde(default)]
    pub relay_required: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Address the inbound listener binds
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Service URL announced to peers; defaults to `listen_address`
    #[serde(default)]
    pub advertise_address: Option<String>,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_startup_poll_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_startup_max_wait_multiplier() -> u32 {
    10
}

fn default_health_check_max_failures() -> u32 {
    3
}

fn default_service_name() -> String {
    "ui".to_string()
}

fn default_service_type() -> String {
    "UI".to_string()
}

fn default_listen_address() -> String {
    "127.0.0.1:8640".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            health_check_interval: default_health_check_interval(),
            startup_poll_interval: default_startup_poll_interval(),
            startup_max_wait_multiplier: default_startup_max_wait_multiplier(),
            health_check_max_failures: default_health_check_max_failures(),
            directory_url: String::new(),
            relay_required: false,
            service_name: default_service_name(),
            service_type: default_service_type(),
            listen_address: default_listen_address(),
            advertise_address: None,
            tls: TlsConfig::default(),
            user: None,
            password: None,
        }
    }
}

impl SessionConfig {
    /// Load and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate YAML content
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default_timeout_secs must be positive".to_string(),
            ));
        }
        if self.startup_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "startup_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.startup_max_wait_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "startup_max_wait_multiplier must be positive".to_string(),
            ));
        }
        if self.health_check_max_failures == 0 {
            return Err(ConfigError::Invalid(
                "health_check_max_failures must be positive".to_string(),
            ));
        }
        if self.service_name.is_empty() || self.service_type.is_empty() {
            return Err(ConfigError::Invalid(
                "service_name and service_type cannot be empty".to_string(),
            ));
        }
        if self
            .default_timeout
            .checked_mul(self.startup_max_wait_multiplier)
            .is_none()
        {
            return Err(ConfigError::Invalid(
                "default_timeout_secs * startup_max_wait_multiplier overflows".to_string(),
            ));
        }
        let service_url = self.service_url();
        if let Ok(addr) = service_url.parse::<SocketAddr>() {
            if addr.ip().is_unspecified() {
                return Err(ConfigError::Invalid(format!(
                    "{} cannot be announced to peers, set advertise_address",
                    service_url
                )));
            }
        }
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            return Err(ConfigError::Invalid(
                "tls.client_cert and tls.client_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Total time the startup poll may take before giving up
    pub fn startup_max_wait(&self) -> Duration {
        self.default_timeout
            .checked_mul(self.startup_max_wait_multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// URL peers reach our inbound listener on
    pub fn service_url(&self) -> &str {
        self.advertise_address
            .as_deref()
            .unwrap_or(&self.listen_address)
    }

    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            ca_cert: self.tls.ca_cert.clone(),
            client_cert: self.tls.client_cert.clone(),
            client_key: self.tls.client_key.clone(),
        }
    }

    /// Credentials sent with `CreateSession`, when a user is configured
    pub fn credentials(&self) -> Option<Credentials> {
        self.user.as_ref().map(|user| Credentials {
            user: user.clone(),
            password: self.password.clone().unwrap_or_default(),
        })
    }
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as `duration_secs`, in milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
