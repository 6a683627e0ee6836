//! Live connection set.

use std::collections::HashMap;
use std::sync::Arc;

use figlink_core::SessionId;
use tokio::sync::RwLock;
use tracing::debug;

use super::connection::ClientConnection;

/// Connected clients indexed by server session ID.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<SessionId, Arc<ClientConnection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Registry admitting at most `max_connections` clients.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Add a connection unless the limit is reached.
    pub async fn try_add(&self, connection: Arc<ClientConnection>) -> bool {
        let mut conns = self.connections.write().await;
        if conns.len() >= self.max_connections {
            return false;
        }
        let _ = conns.insert(connection.id.clone(), connection);
        true
    }

    /// Remove a connection by session ID.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<ClientConnection>> {
        self.connections.write().await.remove(id)
    }

    /// Connection with the given server session ID.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Every live connection, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Queue a close frame on every connection.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let conns = self.connections.read().await;
        debug!(recipients = conns.len(), code, reason, "closing all connections");
        conns.values().filter(|c| c.close(code, reason)).count()
    }
}
