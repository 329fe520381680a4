//! Datagram wire envelope
//!
//! Every datagram is UTF-8 JSON with a `type` tag. Audio payloads carry the
//! channel id and a base64 `data` field that decodes to an encrypted frame
//! (`nonce || ciphertext || tag`, see [`crate::crypto`]). Any `type` the
//! receiver does not understand decodes to [`Envelope::Unknown`] and is
//! discarded by the ingress pipeline without error.
//!
//! Wire format:
//! ```text
//! {"type":"audio","channel_id":"<string>","data":"<base64>"}
//! {"type":"KEEP_ALIVE"}
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::voice::MAX_DATAGRAM_SIZE;

// =============================================================================
// Errors
// =============================================================================

/// Errors produced while packing or parsing datagrams
#[derive(Debug, Error)]
pub enum WireError {
    /// Datagram exceeds [`MAX_DATAGRAM_SIZE`]
    #[error("datagram too large: {0} bytes")]
    Oversized(usize),

    /// Payload is not valid UTF-8 JSON or is missing required fields
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The `data` field is not valid base64
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

// =============================================================================
// Envelope
// =============================================================================

/// A single datagram payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// An encrypted audio frame for one channel
    #[serde(rename = "audio")]
    Audio {
        /// Stream identifier, opaque to the engine
        channel_id: String,
        /// Base64 of `nonce || ciphertext || tag`
        data: String,
    },

    /// NAT/firewall mapping refresh; carries no payload
    #[serde(rename = "KEEP_ALIVE")]
    KeepAlive,

    /// Any other `type` value (control traffic handled elsewhere)
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Build an audio envelope from a sealed payload
    pub fn audio(channel_id: impl Into<String>, sealed: &[u8]) -> Self {
        Envelope::Audio {
            channel_id: channel_id.into(),
            data: BASE64.encode(sealed),
        }
    }

    /// Serialize to datagram bytes
    ///
    /// Fails with [`WireError::Oversized`] if the result would not fit in a
    /// single datagram.
    pub fn to_datagram(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(WireError::Oversized(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parse a received datagram
    ///
    /// Oversized datagrams are rejected before parsing; anything that is not
    /// UTF-8 JSON with a `type` tag is a [`WireError::Json`].
    pub fn from_datagram(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(WireError::Oversized(bytes.len()));
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode the base64 `data` field of an audio envelope
    ///
    /// Returns `None` for non-audio envelopes.
    pub fn sealed_payload(&self) -> Option<Result<Vec<u8>, WireError>> {
        match self {
            Envelope::Audio { data, .. } => Some(BASE64.decode(data).map_err(WireError::from)),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
