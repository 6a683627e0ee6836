//! # figlink-server
//!
//! Headless-service peer of the figlink protocol, served by axum.
//!
//! - `GET /ws`: WebSocket upgrade; each socket gets a server session,
//!   a bounded outbound queue and ping/pong heartbeat
//! - `GET /health`: uptime, counters and one entry per connected peer
//! - `GET /metrics`: Prometheus text, when a recorder is installed
//! - [`processor::EventProcessor`]: per-type async handlers with built-in
//!   `PING`, `UPDATE_NODE_REQUEST` and session bookkeeping
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod processor;
pub mod server;
pub mod websocket;

pub use config::ServerConfig;
pub use processor::{EventContext, EventProcessor, HandlerError, ServerHandler};
pub use server::FiglinkServer;
