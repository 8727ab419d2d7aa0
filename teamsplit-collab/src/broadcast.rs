//! Fan-out of accepted snapshots to every connected session.
//!
//! One tokio broadcast channel carries `Arc<Snapshot>`; each subscriber gets
//! an independent receiver buffering up to `capacity` snapshots. The store
//! publishes while holding its commit lock, so every receiver observes
//! snapshots in acceptance order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};

use teamsplit_core::SessionId;

use crate::store::Snapshot;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub snapshots_published: u64,
    /// Snapshots skipped by lagging subscribers
    pub snapshots_skipped: u64,
    /// Resyncs handed to lagging subscribers
    pub resyncs: u64,
    pub active_sessions: usize,
}

struct AtomicBroadcastStats {
    snapshots_published: AtomicU64,
    snapshots_skipped: AtomicU64,
    resyncs: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            snapshots_published: AtomicU64::new(0),
            snapshots_skipped: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        }
    }
}

/// A connected session as seen by the fan-out.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session: SessionId,
    pub addr: Option<SocketAddr>,
    pub connected_at: Instant,
}

impl SessionInfo {
    pub fn new(session: SessionId, addr: Option<SocketAddr>) -> Self {
        Self {
            session,
            addr,
            connected_at: Instant::now(),
        }
    }
}

/// Broadcast group for the shared document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Snapshot>>,
    sessions: Arc<RwLock<HashMap<SessionId, SessionInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` snapshots are buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a session. Returns its receiver.
    pub async fn add_session(&self, info: SessionInfo) -> broadcast::Receiver<Arc<Snapshot>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(info.session, info);
        self.sender.subscribe()
    }

    pub async fn remove_session(&self, session: &SessionId) -> Option<SessionInfo> {
        self.sessions.write().await.remove(session)
    }

    /// Send to every current receiver. Returns the receiver count.
    pub fn publish(&self, snapshot: Arc<Snapshot>) -> usize {
        let count = self.sender.send(snapshot).unwrap_or(0);
        self.atomic_stats
            .snapshots_published
            .fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a subscriber lost `skipped` snapshots and was resynced.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .snapshots_skipped
            .fetch_add(skipped, Ordering::Relaxed);
        self.atomic_stats.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn has_session(&self, session: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let sessions = self.sessions.read().await;
        BroadcastStats {
            snapshots_published: self.atomic_stats.snapshots_published.load(Ordering::Relaxed),
            snapshots_skipped: self.atomic_stats.snapshots_skipped.load(Ordering::Relaxed),
            resyncs: self.atomic_stats.resyncs.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver, not tied to a session.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamsplit_core::State;

    fn snap(version: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(version, State::new()))
    }

    #[tokio::test]
    async fn test_session_add_remove() {
        let group = BroadcastGroup::new(16);
        let session = SessionId::new();

        let _rx = group.add_session(SessionInfo::new(session, None)).await;
        assert_eq!(group.session_count().await, 1);
        assert!(group.has_session(&session).await);

        assert!(group.remove_session(&session).await.is_some());
        assert_eq!(group.session_count().await, 0);
        assert!(group.remove_session(&session).await.is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_receiver_in_order() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_session(SessionInfo::new(SessionId::new(), None)).await;
        let mut rx2 = group.subscribe();

        assert_eq!(group.publish(snap(1)), 2);
        assert_eq!(group.publish(snap(2)), 2);

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().version, 1);
            assert_eq!(rx.recv().await.unwrap().version, 2);
        }
    }

    #[tokio::test]
    async fn test_publish_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.publish(snap(1)), 0);
        assert_eq!(group.stats().await.snapshots_published, 1);
    }

    #[tokio::test]
    async fn test_overflow_reports_lag() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for v in 1..=5 {
            group.publish(snap(v));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        group.record_lag(3);

        let stats = group.stats().await;
        assert_eq!(stats.snapshots_published, 5);
        assert_eq!(stats.snapshots_skipped, 3);
        assert_eq!(stats.resyncs, 1);
    }

    #[tokio::test]
    async fn test_capacity() {
        assert_eq!(BroadcastGroup::new(32).capacity(), 32);
        assert_eq!(BroadcastGroup::new(0).capacity(), 1);
    }
}
