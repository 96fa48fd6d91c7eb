//! Reusable physical connections, one per destination identity.

use std::collections::HashMap;
use std::sync::Arc;

use rexec_core::{ConnectionId, DestinationKey, TransportKind};
use tracing::debug;

use crate::transport::Transport;

struct PooledConnection {
    connection_id: ConnectionId,
    transport: Arc<dyn Transport>,
    sessions: usize,
}

type PoolKey = (DestinationKey, TransportKind);

/// A connection whose last session went away.
pub struct ReleasedConnection {
    /// Connection to tear down
    pub connection_id: ConnectionId,
    /// Transport that owns it
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ReleasedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasedConnection")
            .field("connection_id", &self.connection_id)
            .field("kind", &self.transport.kind())
            .finish()
    }
}

/// Connection table keyed by (host, port, username).
///
/// Only connections made by the same kind of transport are shared. Each
/// entry counts the sessions on it; the connection is handed back for
/// teardown when the count drops to zero.
#[derive(Default)]
pub struct ConnectionPool {
    entries: HashMap<PoolKey, PooledConnection>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse the connection for `key` made by a `kind` transport.
    pub fn acquire(&mut self, key: &DestinationKey, kind: &TransportKind) -> Option<ConnectionId> {
        let entry = self.entries.get_mut(&(key.clone(), kind.clone()))?;
        entry.sessions += 1;
        debug!(
            "Reusing connection {} for {} ({} sessions)",
            entry.connection_id, key, entry.sessions
        );
        Some(entry.connection_id.clone())
    }

    /// Record a new connection with one session on it.
    ///
    /// Returns the entry it replaced, if any.
    pub fn insert(
        &mut self,
        key: DestinationKey,
        connection_id: ConnectionId,
        transport: Arc<dyn Transport>,
    ) -> Option<ReleasedConnection> {
        let kind = transport.kind();
        self.entries
            .insert(
                (key, kind),
                PooledConnection {
                    connection_id,
                    transport,
                    sessions: 1,
                },
            )
            .map(|old| ReleasedConnection {
                connection_id: old.connection_id,
                transport: old.transport,
            })
    }

    /// Drop one session from `key`; returns the connection once unused.
    pub fn release(&mut self, key: &DestinationKey, kind: &TransportKind) -> Option<ReleasedConnection> {
        let pool_key = (key.clone(), kind.clone());
        let entry = self.entries.get_mut(&pool_key)?;
        entry.sessions = entry.sessions.saturating_sub(1);
        if entry.sessions > 0 {
            return None;
        }
        self.entries.remove(&pool_key).map(|entry| ReleasedConnection {
            connection_id: entry.connection_id,
            transport: entry.transport,
        })
    }

    /// Sessions sharing the `kind` connection for `key`.
    pub fn sessions(&self, key: &DestinationKey, kind: &TransportKind) -> usize {
        self.entries
            .get(&(key.clone(), kind.clone()))
            .map_or(0, |e| e.sessions)
    }

    /// Whether `key` has a `kind` connection.
    pub fn contains(&self, key: &DestinationKey, kind: &TransportKind) -> bool {
        self.entries.contains_key(&(key.clone(), kind.clone()))
    }

    /// Number of physical connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> Vec<ReleasedConnection> {
        self.entries
            .drain()
            .map(|(_, entry)| ReleasedConnection {
                connection_id: entry.connection_id,
                transport: entry.transport,
            })
            .collect()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|((key, kind), e)| (format!("{kind} {key}"), e.sessions)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;

    fn key() -> DestinationKey {
        DestinationKey {
            host: "db1".to_string(),
            port: 22,
            username: "ops".to_string(),
        }
    }

    #[test]
    fn test_reuse_and_release() {
        let mut pool = ConnectionPool::new();
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::default());
        assert!(pool.acquire(&key(), &TransportKind::Local).is_none());

        pool.insert(key(), ConnectionId::new("c1"), transport);
        assert_eq!(
            pool.acquire(&key(), &TransportKind::Local),
            Some(ConnectionId::new("c1"))
        );
        assert_eq!(pool.sessions(&key(), &TransportKind::Local), 2);

        assert!(pool.release(&key(), &TransportKind::Local).is_none());
        let released = pool.release(&key(), &TransportKind::Local).unwrap();
        assert_eq!(released.connection_id, ConnectionId::new("c1"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_incompatible_kind_is_not_reused() {
        let mut pool = ConnectionPool::new();
        pool.insert(key(), ConnectionId::new("c1"), Arc::new(LocalTransport::default()));
        assert!(pool.acquire(&key(), &TransportKind::Bastion).is_none());
        assert!(!pool.contains(&key(), &TransportKind::Bastion));
        assert_eq!(pool.sessions(&key(), &TransportKind::Local), 1);
    }

    #[test]
    fn test_drain() {
        let mut pool = ConnectionPool::new();
        pool.insert(key(), ConnectionId::new("c1"), Arc::new(LocalTransport::default()));
        assert_eq!(pool.drain().len(), 1);
        assert_eq!(pool.len(), 0);
    }
}
