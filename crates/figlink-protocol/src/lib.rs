//! # figlink-protocol
//!
//! Bidirectional, correlation-multiplexed envelope protocol over one duplex
//! connection.
//!
//! - **Connection manager** ([`connection`]): single actor owning the link,
//!   state machine, reconnection with backoff and the session ID
//! - **Correlation registry** ([`registry`]): pending requests, deadlines,
//!   exactly-once completion
//! - **Event dispatcher** ([`dispatcher`]): per-type subscribers and passive
//!   observers, isolated from each other's failures
//! - **Keepalive** ([`keepalive`]): PING/PONG liveness with a miss threshold
//! - **Transports** ([`transport`], [`ws`], [`memory`]): the duplex seam,
//!   a WebSocket implementation and an in-process one for tests
//!
//! ```no_run
//! use std::sync::Arc;
//! use figlink_core::EventType;
//! use figlink_protocol::{ClientConfig, FiglinkClient, WsTransport};
//!
//! # async fn demo() -> Result<(), figlink_core::FiglinkError> {
//! let client = FiglinkClient::spawn(ClientConfig::default(), Arc::new(WsTransport::new()));
//! client.connect("ws://127.0.0.1:8765/ws").await?;
//! let pong = client.send_request(EventType::Ping, serde_json::json!({}), None).await?;
//! println!("{}", pong.event_type);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod keepalive;
pub mod memory;
pub mod registry;
pub mod transport;
pub mod ws;

pub use client::{FiglinkClient, WeakFiglinkClient};
pub use config::ClientConfig;
pub use connection::{ConnectionSnapshot, ConnectionState};
pub use dispatcher::{EventHandler, HandlerError, Subscription, handler_fn};
pub use memory::{MemoryListener, MemoryPeer, MemoryTransport};
pub use registry::{PendingRequests, PendingResponse, Routed};
pub use transport::{
    GOING_AWAY, NORMAL_CLOSE, OutboundFrame, Transport, TransportError, TransportEvent,
    TransportLink,
};
pub use ws::WsTransport;
