//! Registry of live connections.

use std::sync::Arc;

use dashmap::DashMap;

use super::connection::{Connection, ConnectionId};

/// Shared registry of every open connection, keyed by connection id.
///
/// Uses `DashMap` for shard-level concurrency. Adding or removing twice is
/// harmless; the anomaly is logged and reported through the return value.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection. Returns `false` if it was already present.
    pub fn add(&self, conn: Arc<Connection>) -> bool {
        let id = conn.id;
        if self.connections.insert(id, conn).is_some() {
            tracing::warn!(conn_id = id, "connection registered twice");
            return false;
        }
        true
    }

    /// Unregister a connection. Returns `false` if it wasn't registered.
    pub fn remove(&self, conn_id: ConnectionId) -> bool {
        if self.connections.remove(&conn_id).is_none() {
            tracing::debug!(conn_id, "connection already removed from registry");
            return false;
        }
        true
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&conn_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, conn_id: ConnectionId) -> bool {
        self.connections.contains_key(&conn_id)
    }

    /// Copy of the current connection set, safe to iterate while sends
    /// trigger removals.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
