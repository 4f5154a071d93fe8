//! Direct HTTPS transport

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use twinsession_proto::{ActionEnvelope, DispatchMode};

use crate::{is_own_target, Transport, TransportError, TransportResult};

/// Certificate material for outbound HTTPS
///
/// `ca_cert` alone gives one-way TLS against a private CA. Adding
/// `client_cert` and `client_key` enables mutual TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl TlsSettings {
    pub fn is_mutual(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }
}

/// One HTTPS `POST` per call
#[derive(Debug, Clone)]
pub struct DirectTransport {
    client: reqwest::Client,
    timeout: Duration,
    own_url: Option<String>,
}

impl DirectTransport {
    pub fn new(timeout: Duration, tls: &TlsSettings) -> TransportResult<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);

        if let Some(ca_path) = &tls.ca_cert {
            let pem = read_pem(ca_path)?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TransportError::Tls(format!("{}: {}", ca_path.display(), e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        match (&tls.client_cert, &tls.client_key) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = read_pem(cert_path)?;
                pem.push(b'\n');
                pem.extend(read_pem(key_path)?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| TransportError::Tls(format!("client identity: {}", e)))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(TransportError::Tls(
                    "client_cert and client_key must be given together".to_string(),
                ))
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            own_url: None,
        })
    }

    /// Remember this process's own URL so calls to it are skipped
    pub fn with_own_url(mut self, url: impl Into<String>) -> Self {
        self.own_url = Some(url.into());
        self
    }

    /// Endpoint for `mode` on `target`
    ///
    /// Bare `host:port` targets are reached over HTTPS. Targets that already
    /// carry a scheme are used as given.
    pub fn endpoint(target: &str, mode: DispatchMode) -> String {
        if target.contains("://") {
            format!("{}/{}", target.trim_end_matches('/'), mode.as_str())
        } else {
            format!("https://{}/{}", target, mode.as_str())
        }
    }

    fn classify(&self, target: &str, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::ConnectionRefused {
                target: target.to_string(),
                reason: error.to_string(),
            }
        }
    }
}

fn read_pem(path: &Path) -> TransportResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| TransportError::Tls(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl Transport for DirectTransport {
    async fn send(
        &self,
        mode: DispatchMode,
        target: &str,
        envelope: &ActionEnvelope,
    ) -> TransportResult<String> {
        if is_own_target(self.own_url.as_deref(), target) {
            warn!(action = %envelope.action, target = %target, "Skipping send to own URL");
            return Ok(String::new());
        }

        let url = Self::endpoint(target, mode);
        debug!(action = %envelope.action, url = %url, "Sending command");

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(envelope.to_json())
            .send()
            .await
            .map_err(|e| self.classify(target, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                target: target.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| self.classify(target, e))
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_for_bare_target_is_https() {
        assert_eq!(
            DirectTransport::endpoint("10.0.0.5:8001", DispatchMode::ExecuteOneWayTls),
            "https://10.0.0.5:8001/execute-one-way-tls"
        );
        assert_eq!(
            DirectTransport::endpoint("http://127.0.0.1:9000/", DispatchMode::Queue),
            "http://127.0.0.1:9000/queue"
        );
    }

    #[test]
    fn test_half_client_identity_rejected() {
        let tls = TlsSettings {
            client_cert: Some(PathBuf::from("/nonexistent/client.pem")),
            ..Default::default()
        };
        assert!(!tls.is_mutual());
        let result = DirectTransport::new(Duration::from_secs(1), &tls);
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let tls = TlsSettings {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        let result = DirectTransport::new(Duration::from_secs(1), &tls);
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }

    #[tokio::test]
    async fn test_send_to_own_url_is_skipped() {
        let transport = DirectTransport::new(Duration::from_secs(1), &TlsSettings::default())
            .unwrap()
            .with_own_url("127.0.0.1:1");

        let reply = transport
            .send(
                DispatchMode::Execute,
                "127.0.0.1:1",
                &ActionEnvelope::new("Ping"),
            )
            .await
            .unwrap();
        assert!(reply.is_empty());
    }
}
