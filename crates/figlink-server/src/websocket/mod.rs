//! WebSocket connection state, heartbeat and the per-socket loop.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
