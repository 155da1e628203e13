//! Begin extension carrying per-stream routing hints.
//!
//! Encoded as a list of `kind u8, length u8, value` entries. Unknown kinds are
//! skipped so newer senders stay readable by older receivers.

use super::error::{FrameError, FrameResult};

const KIND_AUTHORITY: u8 = 1;
const KIND_ALPN: u8 = 2;
const KIND_PORT: u8 = 3;

/// Routing hints a binding passes downstream on Begin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyBeginEx {
    /// Server name (SNI hint or negotiated SNI).
    pub authority: Option<String>,
    /// Application protocol (ALPN hint or negotiated ALPN).
    pub alpn: Option<String>,
    /// Destination port.
    pub port: Option<u16>,
}

impl ProxyBeginEx {
    /// Create an empty hint set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the authority hint.
    #[must_use]
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Set the ALPN hint.
    #[must_use]
    pub fn with_alpn(mut self, alpn: impl Into<String>) -> Self {
        self.alpn = Some(alpn.into());
        self
    }

    /// Set the destination port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Whether no hint is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authority.is_none() && self.alpn.is_none() && self.port.is_none()
    }

    /// Encode to bytes suitable for a Begin extension. No hints encode to an
    /// empty extension.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::FieldTooLarge`] if a string hint exceeds 255 bytes.
    pub fn encode(&self) -> FrameResult<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(authority) = &self.authority {
            put_entry(&mut out, KIND_AUTHORITY, "authority", authority.as_bytes())?;
        }
        if let Some(alpn) = &self.alpn {
            put_entry(&mut out, KIND_ALPN, "alpn", alpn.as_bytes())?;
        }
        if let Some(port) = self.port {
            put_entry(&mut out, KIND_PORT, "port", &port.to_le_bytes())?;
        }
        Ok(out)
    }

    /// Decode from a Begin extension.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidExtension`] for truncated entries, non
    /// UTF-8 strings or a port of the wrong width.
    pub fn decode(extension: &[u8]) -> FrameResult<Self> {
        let mut hints = Self::default();
        let mut rest = extension;

        while !rest.is_empty() {
            let [kind, length, tail @ ..] = rest else {
                return Err(invalid("truncated entry header"));
            };
            let length = usize::from(*length);
            if tail.len() < length {
                return Err(invalid("entry runs past extension"));
            }
            let (value, next) = tail.split_at(length);
            match *kind {
                KIND_AUTHORITY => hints.authority = Some(utf8(value)?),
                KIND_ALPN => hints.alpn = Some(utf8(value)?),
                KIND_PORT => {
                    let bytes: [u8; 2] = value
                        .try_into()
                        .map_err(|_| invalid("port must be two bytes"))?;
                    hints.port = Some(u16::from_le_bytes(bytes));
                }
                _ => {}
            }
            rest = next;
        }

        Ok(hints)
    }
}

fn put_entry(out: &mut Vec<u8>, kind: u8, field: &'static str, value: &[u8]) -> FrameResult<()> {
    let length = u8::try_from(value.len()).map_err(|_| FrameError::FieldTooLarge {
        field,
        length: value.len(),
        max: usize::from(u8::MAX),
    })?;
    out.push(kind);
    out.push(length);
    out.extend_from_slice(value);
    Ok(())
}

fn utf8(value: &[u8]) -> FrameResult<String> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|e| invalid(&e.to_string()))
}

fn invalid(message: &str) -> FrameError {
    FrameError::InvalidExtension {
        message: message.to_string(),
    }
}
