//! Error taxonomy for the protocol.
//!
//! - [`ProtocolError`]: an inbound frame or payload could not be decoded.
//!   Logged and discarded by the connection; never surfaced to subscribers.
//! - [`FiglinkError`]: what callers of the client API observe. Every variant
//!   is `Clone` so a single failure can be fanned out to many pending requests.

use serde_json::Value;
use thiserror::Error;

use crate::ids::CorrelationId;

/// A received frame (or a payload inside it) could not be decoded.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON frame: {reason}")]
    InvalidJson {
        /// Parser message.
        reason: String,
    },

    /// The frame is JSON but not an envelope (missing or ill-typed fields).
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope {
        /// Which field was missing or wrong.
        reason: String,
    },

    /// The frame exceeds the configured size limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The payload does not match the typed struct it was decoded into.
    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload {
        /// Envelope type the payload came with.
        event_type: String,
        /// Decoder message.
        reason: String,
    },
}

/// Errors observed by users of the client API.
#[derive(Clone, Debug, Error)]
pub enum FiglinkError {
    /// The transport failed to open, or a send was attempted while not open.
    #[error("connection error: {message}")]
    Connection {
        /// What went wrong.
        message: String,
    },

    /// A frame could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A request's deadline elapsed with no matching response.
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Correlation ID of the expired request.
        correlation_id: CorrelationId,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The peer answered the request with an error-typed envelope.
    #[error("remote error [{code}]: {message}")]
    Remote {
        /// Peer-supplied error code.
        code: String,
        /// Peer-supplied message.
        message: String,
        /// Peer-supplied detail.
        details: Option<Value>,
    },

    /// The connection dropped while the request was outstanding.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Why the connection went away.
        reason: String,
    },
}

impl FiglinkError {
    /// Convenience constructor for [`FiglinkError::Connection`].
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Convenience constructor for [`FiglinkError::ConnectionClosed`].
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::ConnectionClosed { .. } => "CONNECTION_CLOSED",
        }
    }

    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::ConnectionClosed { .. }
        )
    }
}
