//! # figlink-core
//!
//! Shared vocabulary of the figlink protocol:
//!
//! - **Branded IDs**: `EventId`, `CorrelationId`, `SessionId`
//! - **Envelope**: `EventType` sum type, `EventMetadata`, `Envelope`, typed payloads
//! - **Codec**: JSON text frame encode/decode with `ProtocolError` on bad input
//! - **Errors**: `FiglinkError` taxonomy surfaced to API callers
//! - **Backoff**: `ReconnectPolicy` (1.5x exponential, bounded attempts)
//! - **Logging**: `tracing-subscriber` bootstrap for binaries

#![deny(unsafe_code)]

pub mod backoff;
pub mod codec;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use backoff::ReconnectPolicy;
pub use envelope::{Envelope, EventMetadata, EventPayload, EventSource, EventType};
pub use errors::{FiglinkError, ProtocolError};
pub use ids::{CorrelationId, EventId, SessionId};
