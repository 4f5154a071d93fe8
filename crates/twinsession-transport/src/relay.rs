//! Relayed transport over one persistent duplex channel
//!
//! The relay forwards each frame to the HTTPS endpoint named in its header
//! and writes the reply back on the same channel. Replies carry no request
//! id, so exactly one exchange may be in flight. A timed-out exchange leaves
//! a reply owed on the channel; owed replies that have arrived are discarded
//! before the next frame goes out, so a late answer is never handed to a
//! later request. Only an I/O error or a remote close ends the channel.

use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use twinsession_proto::{ActionEnvelope, DispatchMode, RelayFrame};

use crate::{is_own_target, Transport, TransportError, TransportResult};

/// Text duplex channel carrying relay frames
#[async_trait]
pub trait RelayChannel: Send {
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Next text message, `None` once the peer closed the channel
    async fn recv_text(&mut self) -> TransportResult<Option<String>>;

    async fn close(&mut self) -> TransportResult<()>;
}

/// Relay channel over a `wss://` websocket
pub struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketChannel {
    /// Connect to the relay
    ///
    /// A relay address without a scheme is reached with `wss://`.
    pub async fn connect(relay_url: &str) -> TransportResult<Self> {
        let address = if relay_url.contains("://") {
            relay_url.to_string()
        } else {
            format!("wss://{}", relay_url)
        };
        let url = url::Url::parse(&address)
            .map_err(|e| TransportError::Relay(format!("invalid relay url {}: {}", address, e)))?;

        debug!(url = %url, "Connecting to relay");

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Relay(e.to_string()))?;

        info!(url = %url, "Relay connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl RelayChannel for WebSocketChannel {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        trace!("Sending {} bytes via relay", text.len());
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Relay(e.to_string()))
    }

    async fn recv_text(&mut self) -> TransportResult<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| TransportError::Relay(format!("non-UTF-8 reply: {}", e)));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| TransportError::Relay(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Relay closed by remote");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Relay error: {}", e);
                    return Err(TransportError::Relay(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Relay(e.to_string()))
    }
}

/// Open relay channel and the number of replies still owed on it
struct RelaySlot {
    channel: Box<dyn RelayChannel>,
    owed: usize,
}

impl RelaySlot {
    /// Discard owed replies that already arrived
    ///
    /// Returns `Ok(false)` when the remote closed the channel.
    fn drain_owed(&mut self) -> TransportResult<bool> {
        while self.owed > 0 {
            match self.channel.recv_text().now_or_never() {
                Some(Ok(Some(late))) => {
                    self.owed -= 1;
                    debug!(bytes = late.len(), owed = self.owed, "Discarded late relay reply");
                }
                Some(Ok(None)) => return Ok(false),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(true)
    }
}

/// Transport that funnels every request through one relay channel
pub struct RelayTransport {
    channel: Mutex<Option<RelaySlot>>,
    timeout: Duration,
    own_url: Option<String>,
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("timeout", &self.timeout)
            .field("own_url", &self.own_url)
            .finish()
    }
}

impl RelayTransport {
    pub fn new(channel: Box<dyn RelayChannel>, timeout: Duration) -> Self {
        Self {
            channel: Mutex::new(Some(RelaySlot { channel, owed: 0 })),
            timeout,
            own_url: None,
        }
    }

    /// Open the websocket relay channel
    pub async fn connect(relay_url: &str, timeout: Duration) -> TransportResult<Self> {
        let channel = tokio::time::timeout(timeout, WebSocketChannel::connect(relay_url))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        Ok(Self::new(Box::new(channel), timeout))
    }

    pub fn with_own_url(mut self, url: impl Into<String>) -> Self {
        self.own_url = Some(url.into());
        self
    }

    pub async fn is_closed(&self) -> bool {
        self.channel.lock().await.is_none()
    }

    /// Replies of timed-out exchanges not yet discarded
    pub async fn owed_replies(&self) -> usize {
        self.channel.lock().await.as_ref().map_or(0, |slot| slot.owed)
    }
}

#[async_trait]
impl Transport for RelayTransport {
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

        let frame = RelayFrame::new(mode, target, envelope.to_json()).encode()?;

        let mut guard = self.channel.lock().await;
        let Some(slot) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };

        match slot.drain_owed() {
            Ok(true) => {}
            Ok(false) => {
                warn!("Relay channel closed by remote");
                *guard = None;
                return Err(TransportError::Closed);
            }
            Err(e) => {
                warn!(error = %e, "Relay channel failed, closing");
                *guard = None;
                return Err(e);
            }
        }

        debug!(action = %envelope.action, target = %target, mode = %mode, "Relaying command");

        let channel = &mut slot.channel;
        let exchange = async {
            channel.send_text(frame).await?;
            channel.recv_text().await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => {
                warn!("Relay channel closed by remote");
                *guard = None;
                Err(TransportError::Closed)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Relay exchange failed, closing channel");
                *guard = None;
                Err(e)
            }
            Err(_) => {
                slot.owed += 1;
                warn!(
                    action = %envelope.action,
                    owed = slot.owed,
                    "Relay reply timed out"
                );
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    fn kind(&self) -> &'static str {
        "relay"
    }

    async fn close(&self) {
        if let Some(mut slot) = self.channel.lock().await.take() {
            if let Err(e) = slot.channel.close().await {
                debug!(error = %e, "Relay close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;

    #[tokio::test]
    async fn test_frames_request_and_returns_reply() {
        let (channel, mut peer) = MemoryChannel::pair();
        let transport = RelayTransport::new(Box::new(channel), Duration::from_secs(5));

        let relay = tokio::spawn(async move {
            let text = peer.recv_frame().await.unwrap();
            let frame = RelayFrame::decode(&text).unwrap();
            peer.reply("Ping");
            frame
        });

        let reply = transport
            .send(
                DispatchMode::ExecuteOneWayTls,
                "10.0.0.1:8000",
                &ActionEnvelope::new("Ping"),
            )
            .await
            .unwrap();
        assert_eq!(reply, "Ping");

        let frame = relay.await.unwrap();
        assert_eq!(frame.mode, DispatchMode::ExecuteOneWayTls);
        assert_eq!(frame.url, "10.0.0.1:8000");
        assert_eq!(frame.payload, r#"{"action":"Ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_discarded_after_timeout() {
        let (channel, mut peer) = MemoryChannel::pair();
        let transport = RelayTransport::new(Box::new(channel), Duration::from_secs(2));

        let result = transport
            .send(DispatchMode::Execute, "a:1", &ActionEnvelope::new("Ping"))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert!(peer.recv_frame().await.is_some());
        assert_eq!(transport.owed_replies().await, 1);

        // The late answer arrives before the next request goes out
        peer.reply("late");
        let relay = tokio::spawn(async move {
            peer.recv_frame().await.unwrap();
            peer.reply("fresh");
            peer
        });

        let reply = transport
            .send(DispatchMode::Execute, "a:1", &ActionEnvelope::new("Ping"))
            .await
            .unwrap();
        assert_eq!(reply, "fresh");
        assert_eq!(transport.owed_replies().await, 0);
        assert!(!transport.is_closed().await);
        drop(relay.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_frame_keeps_channel_usable() {
        let (channel, mut peer) = MemoryChannel::pair();
        let transport = RelayTransport::new(Box::new(channel), Duration::from_secs(2));

        // The relay swallows the first frame and answers every later one
        let relay = tokio::spawn(async move {
            peer.recv_frame().await.unwrap();
            while peer.recv_frame().await.is_some() {
                peer.reply("Ping");
            }
        });

        let first = transport
            .send(DispatchMode::ExecuteOneWayTls, "c:1", &ActionEnvelope::new("Ping"))
            .await;
        assert!(matches!(first, Err(TransportError::Timeout(_))));

        for _ in 0..3 {
            let reply = transport
                .send(DispatchMode::ExecuteOneWayTls, "c:1", &ActionEnvelope::new("Ping"))
                .await
                .unwrap();
            assert_eq!(reply, "Ping");
        }
        assert!(!transport.is_closed().await);

        transport.close().await;
        relay.abort();
    }

    #[tokio::test]
    async fn test_remote_close_reports_closed() {
        let (channel, peer) = MemoryChannel::pair();
        let transport = RelayTransport::new(Box::new(channel), Duration::from_secs(5));
        drop(peer);

        let result = transport
            .send(DispatchMode::Queue, "a:1", &ActionEnvelope::new("Lock"))
            .await;
        assert!(matches!(
            result,
            Err(TransportError::Closed) | Err(TransportError::Relay(_))
        ));
        assert!(transport.is_closed().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _peer) = MemoryChannel::pair();
        let transport = RelayTransport::new(Box::new(channel), Duration::from_secs(5));
        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed().await);
    }
}
