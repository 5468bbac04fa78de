//! Per-node live session table
//!
//! Each accepted WebSocket registers a [`SessionHandle`] holding its
//! attributes and an outbound queue. Fanout subscribers deliver by
//! predicate: every session whose attributes match gets the payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::context::SessionAttrs;

/// Outbound half of one live session
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    attrs: SessionAttrs,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SessionHandle {
    /// Session id, unique on this node
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attributes set at connect time
    pub fn attrs(&self) -> &SessionAttrs {
        &self.attrs
    }

    /// Queue a payload for the socket writer
    ///
    /// Returns `false` if the connection is already gone.
    pub fn send(&self, payload: Bytes) -> bool {
        self.tx.send(payload).is_ok()
    }

    /// Whether the connection writer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Table of sessions connected to this node
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a session and return its handle and outbound queue
    pub fn register(
        &self,
        attrs: SessionAttrs,
    ) -> (Arc<SessionHandle>, mpsc::UnboundedReceiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle { id, attrs, tx });

        self.sessions.insert(id, Arc::clone(&handle));
        tracing::debug!(
            session_id = id,
            user_id = handle.attrs.user_id,
            channel_id = ?handle.attrs.channel_id,
            "Session registered"
        );

        (handle, rx)
    }

    /// Remove a session
    pub fn unregister(&self, session_id: u64) {
        if self.sessions.remove(&session_id).is_some() {
            tracing::debug!(session_id = session_id, "Session unregistered");
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions whose attributes satisfy `pred`
    pub fn select<F>(&self, pred: F) -> Vec<Arc<SessionHandle>>
    where
        F: Fn(&SessionAttrs) -> bool,
    {
        self.sessions
            .iter()
            .filter(|entry| pred(&entry.value().attrs))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Send `payload` to every session whose attributes satisfy `pred`
    ///
    /// Sessions whose connection has gone away are dropped from the table.
    /// Returns the number of sessions the payload was queued for.
    pub fn broadcast_filter<F>(&self, payload: &Bytes, pred: F) -> usize
    where
        F: Fn(&SessionAttrs) -> bool,
    {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for handle in self.select(pred) {
            if handle.send(payload.clone()) {
                delivered += 1;
            } else {
                dead.push(handle.id);
            }
        }

        for id in dead {
            self.unregister(id);
        }

        delivered
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_filter_by_channel() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = registry.register(SessionAttrs::chat(1, 10));
        let (_b, mut rx_b) = registry.register(SessionAttrs::chat(1, 11));
        let (_c, mut rx_c) = registry.register(SessionAttrs::chat(2, 12));

        let payload = Bytes::from_static(b"{}");
        let delivered = registry.broadcast_filter(&payload, |attrs| attrs.is_in_channel(1));

        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap(), payload);
        assert_eq!(rx_b.recv().await.unwrap(), payload);
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_sessions_are_pruned() {
        let registry = SessionRegistry::new();
        let (_live, _rx_live) = registry.register(SessionAttrs::chat(1, 10));
        let (dead, rx_dead) = registry.register(SessionAttrs::chat(1, 11));
        drop(rx_dead);
        assert!(dead.is_closed());

        let delivered =
            registry.broadcast_filter(&Bytes::from_static(b"x"), |attrs| attrs.is_in_channel(1));

        assert_eq!(delivered, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_unregister() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = registry.register(SessionAttrs::matching(3));
        let (other, _rx2) = registry.register(SessionAttrs::matching(4));

        assert_ne!(handle.id(), other.id());
        assert_eq!(registry.select(|a| a.is_matching_user(&[3])).len(), 1);

        registry.unregister(handle.id());
        registry.unregister(handle.id());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
