//! The wire unit exchanged between the two peers.
//!
//! [`Envelope`] = [`EventType`] + [`EventMetadata`] + an opaque JSON payload.
//! The protocol layer never looks inside the payload; business logic can decode
//! it into one of the typed payload structs via [`Envelope::payload_as`].
//!
//! ```json
//! {
//!   "type": "PING",
//!   "metadata": {
//!     "event_id": "…", "correlation_id": "…", "timestamp": "2026-01-01T00:00:00Z",
//!     "source": "CLIENT", "session_id": "…"
//!   },
//!   "payload": { "time": "2026-01-01T00:00:00Z" }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::{CorrelationId, EventId, SessionId};

// ─────────────────────────────────────────────────────────────────────────────
// Event types
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! event_types {
    ($( $(#[$meta:meta])* $variant:ident => $wire:literal, )*) => {
        /// Kind of an envelope.
        ///
        /// A closed set of known kinds plus [`EventType::Custom`] for kinds this
        /// build does not know about. Always build custom kinds through
        /// [`EventType::from_wire`] so that a known wire string never ends up
        /// inside `Custom`.
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        pub enum EventType {
            $( $(#[$meta])* $variant, )*
            /// A kind unknown to this build, kept verbatim.
            Custom(String),
        }

        impl EventType {
            /// Wire representation.
            #[must_use]
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $wire, )*
                    Self::Custom(s) => s,
                }
            }

            /// Parse a wire string. Unknown strings become [`EventType::Custom`].
            #[must_use]
            pub fn from_wire(s: &str) -> Self {
                match s {
                    $( $wire => Self::$variant, )*
                    other => Self::Custom(other.to_owned()),
                }
            }
        }

        /// Every known event type, for exhaustive testing.
        pub const KNOWN_EVENT_TYPES: &[EventType] = &[ $( EventType::$variant, )* ];
    };
}

event_types! {
    // ── System ───────────────────────────────────────────────────────
    /// A peer announces a freshly established session.
    Connect => "CONNECT",
    /// A peer announces an intentional disconnect.
    Disconnect => "DISCONNECT",
    /// Generic error, usually correlated to a failed request.
    Error => "ERROR",
    /// Liveness probe.
    Ping => "PING",
    /// Liveness probe answer.
    Pong => "PONG",

    // ── Node updates ─────────────────────────────────────────────────
    /// Request to update a design node.
    UpdateNodeRequest => "UPDATE_NODE_REQUEST",
    /// Intermediate progress of a node update.
    UpdateNodeProgress => "UPDATE_NODE_PROGRESS",
    /// A node update finished.
    UpdateNodeComplete => "UPDATE_NODE_COMPLETE",
    /// A node update failed.
    UpdateNodeError => "UPDATE_NODE_ERROR",

    // ── Selection ────────────────────────────────────────────────────
    /// The selection changed.
    SelectionChange => "SELECTION_CHANGE",
    /// Several nodes are selected.
    MultiSelection => "MULTI_SELECTION",

    // ── Analysis ─────────────────────────────────────────────────────
    /// Request a design analysis.
    AnalyzeDesign => "ANALYZE_DESIGN",
    /// Result of a design analysis.
    AnalysisResult => "ANALYSIS_RESULT",

    // ── Code generation ──────────────────────────────────────────────
    /// Generate code (legacy single-shot form).
    GenerateCode => "GENERATE_CODE",
    /// Request code generation.
    GenerateCodeRequest => "GENERATE_CODE_REQUEST",
    /// Code generation progress.
    GenerateCodeProgress => "GENERATE_CODE_PROGRESS",
    /// Code generation finished.
    GenerateCodeComplete => "GENERATE_CODE_COMPLETE",
    /// Generated code (legacy single-shot form).
    CodeGenerated => "CODE_GENERATED",

    // ── Responsive layouts and variants ──────────────────────────────
    /// Request a responsive layout.
    GenerateResponsive => "GENERATE_RESPONSIVE",
    /// A responsive layout was generated.
    ResponsiveGenerated => "RESPONSIVE_GENERATED",
    /// Request component variants.
    GenerateVariants => "GENERATE_VARIANTS",
    /// Component variants were generated.
    VariantsGenerated => "VARIANTS_GENERATED",
}

impl EventType {
    /// Error kinds reject the request they are correlated to.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error) || self.as_str().ends_with("_ERROR")
    }

    /// Progress kinds share the request's correlation ID but do not complete it.
    #[must_use]
    pub fn is_progress(&self) -> bool {
        self.as_str().ends_with("_PROGRESS")
    }

    /// Connection-level kinds handled by the protocol itself.
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Disconnect | Self::Ping | Self::Pong
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&s))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Which peer emitted an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// The UI-side agent.
    #[serde(rename = "CLIENT", alias = "client", alias = "plugin", alias = "PLUGIN")]
    Client,
    /// The headless service.
    #[serde(rename = "SERVER", alias = "server")]
    Server,
}

/// Envelope metadata.
///
/// Field names are snake_case on the wire; the legacy camelCase spellings are
/// accepted when decoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique per envelope instance.
    #[serde(alias = "eventId")]
    pub event_id: EventId,
    /// Stable across a request and its response.
    #[serde(alias = "correlationId")]
    pub correlation_id: CorrelationId,
    /// When the envelope was created.
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Emitting peer.
    pub source: EventSource,
    /// Logical connection instance the envelope was sent on.
    #[serde(alias = "sessionId")]
    pub session_id: SessionId,
}

impl EventMetadata {
    /// Fresh metadata with a new event ID and the given correlation ID.
    #[must_use]
    pub fn new(source: EventSource, session_id: SessionId, correlation_id: CorrelationId) -> Self {
        Self {
            event_id: EventId::new(),
            correlation_id,
            timestamp: Utc::now(),
            source,
            session_id,
        }
    }
}

/// ISO-8601 timestamps. Full sub-second precision is kept on encode so an
/// envelope survives a round trip unchanged; timestamps without an offset
/// (as older peers send them) are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub(super) fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| de::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A typed message exchanged between the peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Kind of the envelope. Immutable once created.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Routing and bookkeeping metadata.
    pub metadata: EventMetadata,
    /// Kind-specific data, opaque to the protocol layer.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// New envelope with a fresh correlation ID.
    #[must_use]
    pub fn new(
        event_type: EventType,
        payload: Value,
        source: EventSource,
        session_id: SessionId,
    ) -> Self {
        Self::with_correlation(event_type, payload, source, session_id, CorrelationId::new())
    }

    /// New envelope carrying an explicit correlation ID.
    #[must_use]
    pub fn with_correlation(
        event_type: EventType,
        payload: Value,
        source: EventSource,
        session_id: SessionId,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            event_type,
            metadata: EventMetadata::new(source, session_id, correlation_id),
            payload,
        }
    }

    /// Envelope answering `request`: same correlation and session IDs.
    #[must_use]
    pub fn response_to(
        request: &Envelope,
        event_type: EventType,
        payload: Value,
        source: EventSource,
    ) -> Self {
        Self::with_correlation(
            event_type,
            payload,
            source,
            request.metadata.session_id.clone(),
            request.metadata.correlation_id.clone(),
        )
    }

    /// Shorthand for `metadata.correlation_id`.
    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.metadata.correlation_id
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            event_type: self.event_type.to_string(),
            reason: e.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed payloads
// ─────────────────────────────────────────────────────────────────────────────

/// A payload struct bound to the event type it travels with.
pub trait EventPayload: Serialize + DeserializeOwned {
    /// Event type this payload belongs to.
    const EVENT_TYPE: EventType;

    /// Serialize into an opaque payload value.
    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Payload of [`EventType::Ping`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Send time, echoed back by the peer in the PONG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl EventPayload for PingPayload {
    const EVENT_TYPE: EventType = EventType::Ping;
}

/// Payload of [`EventType::Pong`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Human-readable liveness message.
    pub message: String,
    /// The `time` field of the PING being answered.
    #[serde(default)]
    pub received_at: Option<Value>,
    /// Responder's clock.
    pub server_time: String,
}

impl EventPayload for PongPayload {
    const EVENT_TYPE: EventType = EventType::Pong;
}

/// Payload of [`EventType::Error`] and the `*_ERROR` kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Additional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl EventPayload for ErrorPayload {
    const EVENT_TYPE: EventType = EventType::Error;
}

/// Payload of [`EventType::Connect`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectPayload {
    /// Name of the announcing peer.
    pub client: String,
    /// Crate version of the announcing peer.
    pub version: String,
}

impl EventPayload for ConnectPayload {
    const EVENT_TYPE: EventType = EventType::Connect;
}

/// Payload of [`EventType::Disconnect`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    /// Why the peer is leaving.
    pub reason: String,
}

impl EventPayload for DisconnectPayload {
    const EVENT_TYPE: EventType = EventType::Disconnect;
}

/// Payload of [`EventType::UpdateNodeRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeRequestPayload {
    /// Target node.
    pub node_id: String,
    /// Properties to apply.
    pub properties: Map<String, Value>,
}

impl EventPayload for UpdateNodeRequestPayload {
    const EVENT_TYPE: EventType = EventType::UpdateNodeRequest;
}

/// Payload of [`EventType::UpdateNodeProgress`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeProgressPayload {
    /// Target node.
    pub node_id: String,
    /// Short machine status (`processing`, …).
    pub status: String,
    /// Human-readable message.
    pub message: String,
}

impl EventPayload for UpdateNodeProgressPayload {
    const EVENT_TYPE: EventType = EventType::UpdateNodeProgress;
}

/// Payload of [`EventType::UpdateNodeComplete`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeCompletePayload {
    /// Target node.
    pub node_id: String,
    /// Whether the update was applied.
    pub success: bool,
    /// Properties that were applied.
    pub updated_properties: Map<String, Value>,
}

impl EventPayload for UpdateNodeCompletePayload {
    const EVENT_TYPE: EventType = EventType::UpdateNodeComplete;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn known_types_roundtrip_through_wire_strings() {
        for t in KNOWN_EVENT_TYPES {
            assert_eq!(&EventType::from_wire(t.as_str()), t);
        }
    }

    #[test]
    fn unknown_type_is_custom() {
        let t = EventType::from_wire("EXPORT_TOKENS");
        assert_eq!(t, EventType::Custom("EXPORT_TOKENS".into()));
        assert_eq!(t.as_str(), "EXPORT_TOKENS");
    }

    #[test]
    fn event_type_serializes_as_plain_string() {
        let json = serde_json::to_string(&EventType::UpdateNodeRequest).unwrap();
        assert_eq!(json, "\"UPDATE_NODE_REQUEST\"");
        let back: EventType = serde_json::from_str("\"SELECTION_CHANGE\"").unwrap();
        assert_eq!(back, EventType::SelectionChange);
    }

    #[test]
    fn classification() {
        assert!(EventType::Error.is_error());
        assert!(EventType::UpdateNodeError.is_error());
        assert!(EventType::from_wire("EXPORT_ERROR").is_error());
        assert!(!EventType::Pong.is_error());

        assert!(EventType::UpdateNodeProgress.is_progress());
        assert!(EventType::GenerateCodeProgress.is_progress());
        assert!(!EventType::UpdateNodeComplete.is_progress());

        assert!(EventType::Ping.is_system());
        assert!(!EventType::SelectionChange.is_system());
    }

    #[test]
    fn source_accepts_legacy_spellings() {
        let s: EventSource = serde_json::from_str("\"plugin\"").unwrap();
        assert_eq!(s, EventSource::Client);
        let s: EventSource = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(s, EventSource::Server);
        assert_eq!(serde_json::to_string(&EventSource::Client).unwrap(), "\"CLIENT\"");
    }

    #[test]
    fn metadata_accepts_camel_case_and_naive_timestamps() {
        let raw = json!({
            "eventId": "e1",
            "correlationId": "c1",
            "timestamp": "2025-03-01T12:00:00.250",
            "source": "plugin",
            "sessionId": "s1"
        });
        let meta: EventMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(meta.correlation_id.as_str(), "c1");
        assert_eq!(meta.session_id.as_str(), "s1");
        assert_eq!(meta.timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn metadata_serializes_snake_case() {
        let meta = EventMetadata::new(EventSource::Server, SessionId::from("s"), CorrelationId::from("c"));
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["correlation_id"], "c");
        assert_eq!(v["session_id"], "s");
        assert_eq!(v["source"], "SERVER");
        assert!(v["event_id"].is_string());
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn response_keeps_correlation_and_session() {
        let req = Envelope::new(EventType::Ping, json!({}), EventSource::Client, SessionId::new());
        let resp = Envelope::response_to(&req, EventType::Pong, json!({}), EventSource::Server);
        assert_eq!(resp.correlation_id(), req.correlation_id());
        assert_eq!(resp.metadata.session_id, req.metadata.session_id);
        assert_ne!(resp.metadata.event_id, req.metadata.event_id);
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "PING",
            "metadata": {
                "event_id": "e", "correlation_id": "c",
                "timestamp": "2025-01-01T00:00:00Z", "source": "CLIENT", "session_id": "s"
            }
        }))
        .unwrap();
        assert!(env.payload.is_null());
    }

    #[test]
    fn typed_payload_decodes() {
        let env = Envelope::new(
            EventType::UpdateNodeRequest,
            json!({"nodeId": "1:2", "properties": {"width": 10}}),
            EventSource::Client,
            SessionId::new(),
        );
        let p: UpdateNodeRequestPayload = env.payload_as().unwrap();
        assert_eq!(p.node_id, "1:2");
        assert_eq!(p.properties["width"], 10);
    }

    #[test]
    fn typed_payload_mismatch_is_protocol_error() {
        let env = Envelope::new(EventType::Error, json!({"nope": true}), EventSource::Server, SessionId::new());
        let err = env.payload_as::<ErrorPayload>().unwrap_err();
        assert_matches!(err, ProtocolError::InvalidPayload { ref event_type, .. } if event_type == "ERROR");
    }

    #[test]
    fn payload_traits_bind_event_types() {
        assert_eq!(PingPayload::EVENT_TYPE, EventType::Ping);
        assert_eq!(ErrorPayload::EVENT_TYPE, EventType::Error);
        let v = ErrorPayload { code: "x".into(), message: "y".into(), details: None }.to_value();
        assert_eq!(v, json!({"code": "x", "message": "y"}));
    }
}
