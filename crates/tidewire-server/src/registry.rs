//! Directory of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use parking_lot::RwLock;
use tidewire_core::{MsgId, PacketCodec};
use tracing::{debug, warn};

use crate::connection::{ConnId, Connection};
use crate::errors::{ConnectionError, RegistryError};
use crate::metrics::BROADCAST_DROPS_TOTAL;

/// What a connection needs from its registry: a way to drop itself on stop.
pub trait ConnectionTracker: Send + Sync {
    /// Forget connection `id`. Unknown ids are ignored.
    fn remove_connection(&self, id: ConnId);
}

/// Thread-safe map of connection id to connection.
///
/// Connection callbacks (stop, send) never run while the map lock is held,
/// so a connection stopping itself during [`clear_all`](Self::clear_all)
/// cannot deadlock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
    codec: Arc<PacketCodec>,
}

impl ConnectionRegistry {
    /// An empty registry that encodes broadcasts with the default codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty registry that encodes broadcasts with `codec`.
    pub fn with_codec(codec: Arc<PacketCodec>) -> Self {
        Self {
            connections: RwLock::default(),
            codec,
        }
    }

    /// Register a connection, replacing any entry with the same id.
    pub fn add(&self, conn: Arc<Connection>) {
        let id = conn.id();
        let count = {
            let mut conns = self.connections.write();
            if conns.insert(id, conn).is_some() {
                warn!(conn_id = id, "replaced an existing connection with the same id");
            }
            conns.len()
        };
        debug!(conn_id = id, count, "connection registered");
    }

    /// Register a connection unless `limit` connections are already present.
    pub fn try_add(&self, conn: Arc<Connection>, limit: usize) -> Result<(), RegistryError> {
        let id = conn.id();
        let mut conns = self.connections.write();
        if conns.len() >= limit && !conns.contains_key(&id) {
            return Err(RegistryError::Full(limit));
        }
        let _ = conns.insert(id, conn);
        Ok(())
    }

    /// Unregister a connection, returning it if it was present.
    pub fn remove(&self, id: ConnId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if removed.is_some() {
            debug!(conn_id = id, "connection unregistered");
        }
        removed
    }

    /// Look up a connection.
    pub fn get(&self, id: ConnId) -> Result<Arc<Connection>, RegistryError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Registered ids, ascending.
    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.connections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Point-in-time copy of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Queue a message on every connection without waiting. Connections
    /// whose queues are full miss the message. Returns how many accepted it.
    ///
    /// The message is encoded once; every queue holds the same frame.
    pub fn broadcast(&self, msg_id: MsgId, data: &[u8]) -> usize {
        let frame = match self.codec.pack(msg_id, data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(msg_id, error = %e, "broadcast payload rejected by codec");
                return 0;
            }
        };
        let recipients = self.snapshot();
        let mut delivered = 0;
        for conn in &recipients {
            match conn.try_send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(ConnectionError::QueueFull) => {
                    counter!(BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(conn_id = conn.id(), msg_id, "outbound queue full, dropping broadcast");
                }
                Err(_) => {}
            }
        }
        debug!(msg_id, recipients = recipients.len(), delivered, "broadcast");
        delivered
    }

    /// Stop every connection and empty the registry. Returns how many were
    /// registered.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<Arc<Connection>> = {
            let mut conns = self.connections.write();
            conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.stop();
        }
        debug!(count = drained.len(), "cleared all connections");
        drained.len()
    }
}

impl ConnectionTracker for ConnectionRegistry {
    fn remove_connection(&self, id: ConnId) {
        let _ = self.remove(id);
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::ConnectionHooks;
    use crate::router::Router;
    use crate::test_utils::{CountingHooks, TestPeer, channel_transport, test_connection, test_context};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A connection whose tracker is `registry`, registered there.
    fn registered(
        registry: &Arc<ConnectionRegistry>,
        id: ConnId,
        hooks: Arc<dyn ConnectionHooks>,
        queue_len: usize,
    ) -> (Arc<Connection>, TestPeer) {
        let mut ctx = test_context(
            Router::new(),
            Arc::clone(registry) as Arc<dyn ConnectionTracker>,
            hooks,
        );
        ctx.max_outbound_queue_len = queue_len;
        let (transport, peer) = channel_transport();
        let conn = Connection::new(id, transport, &ctx);
        registry.add(Arc::clone(&conn));
        (conn, peer)
    }

    #[tokio::test]
    async fn add_get_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = test_connection(1);
        registry.add(Arc::clone(&conn));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(1).unwrap(), &conn));

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.get(5).unwrap_err(), RegistryError::NotFound(5));
    }

    #[tokio::test]
    async fn remove_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.remove_connection(77);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn try_add_respects_limit() {
        let registry = ConnectionRegistry::new();
        registry.try_add(test_connection(1).0, 2).unwrap();
        registry.try_add(test_connection(2).0, 2).unwrap();
        assert_eq!(
            registry.try_add(test_connection(3).0, 2),
            Err(RegistryError::Full(2))
        );
        assert_eq!(registry.ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn stop_removes_from_registry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hooks = Arc::new(CountingHooks::default());
        let (conn, _peer) = registered(&registry, 3, hooks, 4);
        conn.start();
        assert_eq!(registry.len(), 1);
        conn.stop();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn clear_all_stops_everything() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hooks = Arc::new(CountingHooks::default());
        let conns: Vec<_> = (1..=5)
            .map(|id| registered(&registry, id, hooks.clone(), 4))
            .collect();
        for (conn, _) in &conns {
            conn.start();
        }

        assert_eq!(registry.clear_all(), 5);
        assert!(registry.is_empty());
        assert!(conns.iter().all(|(c, _)| c.is_closed()));
        assert_eq!(hooks.stopped.load(Ordering::SeqCst), 5);
    }

    /// Stop hook that reaches back into the registry.
    struct ReentrantHooks {
        registry: Arc<ConnectionRegistry>,
        seen_len: AtomicUsize,
    }

    impl ConnectionHooks for ReentrantHooks {
        fn on_stop(&self, conn: &Arc<Connection>) {
            self.seen_len.store(self.registry.len(), Ordering::SeqCst);
            conn.stop();
            self.registry.remove_connection(conn.id());
        }
    }

    #[tokio::test]
    async fn clear_all_tolerates_reentrant_hooks() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hooks = Arc::new(ReentrantHooks {
            registry: Arc::clone(&registry),
            seen_len: AtomicUsize::new(usize::MAX),
        });
        let (conn, _peer) = registered(&registry, 1, hooks.clone(), 4);
        conn.start();

        let cleared = tokio::time::timeout(Duration::from_secs(2), async { registry.clear_all() })
            .await
            .expect("clear_all deadlocked");
        assert_eq!(cleared, 1);
        assert_eq!(hooks.seen_len.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hooks = Arc::new(CountingHooks::default());
        let mut peers = Vec::new();
        for id in 1..=3 {
            let (conn, peer) = registered(&registry, id, hooks.clone(), 4);
            conn.start();
            peers.push(peer);
        }

        assert_eq!(registry.broadcast(9, b"all"), 3);
        for peer in &mut peers {
            let msg = peer.recv_msg().await.unwrap();
            assert_eq!(msg.msg_id(), 9);
            assert_eq!(msg.payload().as_ref(), b"all");
        }
    }

    #[tokio::test]
    async fn broadcast_skips_full_queues() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hooks = Arc::new(CountingHooks::default());
        // Never started, so nothing drains the single-slot queue.
        let (stuck, _stuck_peer) = registered(&registry, 1, hooks.clone(), 1);
        stuck.try_send_msg(1, b"fill").unwrap();
        let (live, mut live_peer) = registered(&registry, 2, hooks, 4);
        live.start();

        assert_eq!(registry.broadcast(2, b"x"), 1);
        assert_eq!(live_peer.recv_msg().await.unwrap().msg_id(), 2);
    }

    #[tokio::test]
    async fn oversized_broadcast_delivers_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hooks = Arc::new(CountingHooks::default());
        let (conn, _peer) = registered(&registry, 1, hooks, 4);
        conn.start();
        let huge = vec![0u8; tidewire_core::packet::DEFAULT_MAX_PAYLOAD_LEN + 1];
        assert_eq!(registry.broadcast(1, &huge), 0);
    }

    #[tokio::test]
    async fn broadcast_encodes_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hooks = Arc::new(CountingHooks::default());
        let mut peers = Vec::new();
        for id in 1..=2 {
            let (conn, peer) = registered(&registry, id, hooks.clone(), 4);
            conn.start();
            peers.push(peer);
        }

        assert_eq!(registry.broadcast(4, b"shared"), 2);
        let first = peers[0].recv_raw().await.unwrap();
        let second = peers[1].recv_raw().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[tokio::test]
    async fn broadcast_uses_registry_codec_limit() {
        let registry = Arc::new(ConnectionRegistry::with_codec(Arc::new(PacketCodec::new(4))));
        let hooks = Arc::new(CountingHooks::default());
        let (conn, mut peer) = registered(&registry, 1, hooks, 4);
        conn.start();
        assert_eq!(registry.broadcast(1, b"too long"), 0);
        assert_eq!(registry.broadcast(1, b"ok"), 1);
        assert_eq!(peer.recv_msg().await.unwrap().payload().as_ref(), b"ok");
    }

    #[tokio::test]
    async fn concurrent_add_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for id in 0..32u64 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (conn, _peer) = test_connection(id);
                registry.add(conn);
                if id % 2 == 0 {
                    let _ = registry.remove(id);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.len(), 16);
    }
}
