//! Envelope codec: envelopes to JSON text frames and back.
//!
//! Decoding goes through two stages so the error says what was wrong: first
//! the text must be JSON ([`ProtocolError::InvalidJson`]), then the JSON must
//! be an envelope ([`ProtocolError::InvalidEnvelope`]).

use serde_json::Value;

use crate::envelope::Envelope;
use crate::errors::ProtocolError;

/// Serialize an envelope into a text frame.
///
/// Envelopes only hold strings, enums and an already-parsed JSON payload, so
/// serialization cannot fail for any value of the type.
#[must_use]
pub fn encode(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|e| {
        tracing::error!(error = %e, event_type = %envelope.event_type, "envelope serialization failed");
        String::new()
    })
}

/// Parse a text frame into an envelope.
pub fn decode(frame: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(frame).map_err(|e| ProtocolError::InvalidJson {
        reason: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(ProtocolError::InvalidEnvelope {
            reason: "frame is not a JSON object".into(),
        });
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidEnvelope {
        reason: e.to_string(),
    })
}

/// [`decode`] with a frame size limit in bytes.
pub fn decode_with_limit(frame: &str, limit: usize) -> Result<Envelope, ProtocolError> {
    if frame.len() > limit {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            limit,
        });
    }
    decode(frame)
}
