//! Relay frame codec
//!
//! A relayed request is a single text message: `<mode>\n<url>\n<payload>`.
//! The relay strips the two header lines and forwards the payload without
//! decoding it.

use crate::messages::DispatchMode;
use crate::ProtocolError;

/// One request travelling through the relay channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub mode: DispatchMode,
    pub url: String,
    pub payload: String,
}

impl RelayFrame {
    pub fn new(mode: DispatchMode, url: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            mode,
            url: url.into(),
            payload: payload.into(),
        }
    }

    /// Encode the frame
    ///
    /// The url must fit on one header line.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        if self.url.contains('\n') {
            return Err(ProtocolError::MalformedFrame(
                "url contains a line break".to_string(),
            ));
        }

        let mut out = String::with_capacity(self.url.len() + self.payload.len() + 24);
        out.push_str(self.mode.as_str());
        out.push('\n');
        out.push_str(&self.url);
        out.push('\n');
        out.push_str(&self.payload);
        Ok(out)
    }

    /// Decode a frame; the payload may itself contain line breaks
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut parts = text.splitn(3, '\n');

        let mode = parts
            .next()
            .and_then(DispatchMode::parse)
            .ok_or_else(|| ProtocolError::MalformedFrame("unknown mode header".to_string()))?;
        let url = parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedFrame("missing url header".to_string()))?;
        let payload = parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedFrame("missing payload".to_string()))?;

        Ok(Self {
            mode,
            url: url.to_string(),
            payload: payload.to_string(),
        })
    }
}
