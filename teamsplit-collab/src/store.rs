//! Versioned, transactional home of the shared document.
//!
//! ```text
//!  mutate(f)
//!    │ read current (v)      clone state, run f, validate
//!    ▼
//!  ┌────────────────┐ version still v? ┌─────────┐ ok ┌──────────┐
//!  │ draft (v + 1)  │ ───────────────► │ Backend │ ─► │ publish  │
//!  └────────────────┘  no: rerun f     │ commit  │    │ Arc<Snap>│
//!                      (bounded)       └─────────┘    └──────────┘
//!                                        │ err
//!                                        ▼
//!                              StoreUnavailable, nothing visible
//! ```
//!
//! Closures run outside the commit lock and may run more than once, so
//! they must be pure functions of the state they are given.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use teamsplit_core::{EngineError, State};

use crate::broadcast::{BroadcastGroup, SessionInfo};
use crate::storage::{Backend, MemoryBackend, StoreError};

/// A complete, immutable view of the document at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub state: State,
}

impl Snapshot {
    pub fn new(version: u64, state: State) -> Self {
        Self { version, state }
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Attempts before a contended write gives up
    pub max_attempts: u32,
    /// Snapshots buffered per subscriber
    pub broadcast_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            broadcast_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Small buffers for tests.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 16,
            broadcast_capacity: 16,
        }
    }
}

/// Store counters.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub version: u64,
    pub commits: u64,
    pub noops: u64,
    pub conflicts: u64,
    pub backend_failures: u64,
}

#[derive(Default)]
struct AtomicStoreStats {
    commits: AtomicU64,
    noops: AtomicU64,
    conflicts: AtomicU64,
    backend_failures: AtomicU64,
}

/// The shared document.
pub struct SharedStateStore {
    current: RwLock<Arc<Snapshot>>,
    backend: Arc<dyn Backend>,
    broadcast: Arc<BroadcastGroup>,
    config: StoreConfig,
    stats: AtomicStoreStats,
}

impl SharedStateStore {
    /// Open on `backend`, resuming from its last snapshot if any.
    pub fn open(backend: Arc<dyn Backend>, config: StoreConfig) -> Result<Self, StoreError> {
        let initial = match backend.load()? {
            Some(snapshot) => {
                snapshot
                    .state
                    .validate()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                log::info!("Resuming shared state at v{}", snapshot.version);
                snapshot
            }
            None => Snapshot::new(0, State::new()),
        };

        Ok(Self {
            current: RwLock::new(Arc::new(initial)),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            backend,
            config,
            stats: AtomicStoreStats::default(),
        })
    }

    /// Volatile store starting from an empty document.
    pub fn in_memory() -> Self {
        Self::in_memory_with(StoreConfig::default())
    }

    pub fn in_memory_with(config: StoreConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::new(0, State::new()))),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            backend: Arc::new(MemoryBackend::new()),
            config,
            stats: AtomicStoreStats::default(),
        }
    }

    /// Current snapshot.
    pub async fn read(&self) -> Arc<Snapshot> {
        self.current.read().await.clone()
    }

    /// Apply `f` atomically.
    ///
    /// Returns `f`'s output together with the resulting snapshot. A closure
    /// error or an invalid result leaves the document untouched; a closure
    /// that changes nothing returns the current snapshot without a commit.
    pub async fn mutate<T, F>(&self, mut f: F) -> Result<(T, Arc<Snapshot>), EngineError>
    where
        F: FnMut(&mut State) -> Result<T, EngineError>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let base = self.read().await;
            let mut draft = base.state.clone();
            let output = f(&mut draft)?;

            if draft == base.state {
                self.stats.noops.fetch_add(1, Ordering::Relaxed);
                log::debug!("No-op mutation at v{}", base.version);
                return Ok((output, base));
            }
            draft.validate()?;

            let mut current = self.current.write().await;
            if current.version != base.version {
                drop(current);
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                if attempts >= self.config.max_attempts {
                    log::warn!("Write contention: giving up after {attempts} attempts");
                    return Err(EngineError::WriteContention { attempts });
                }
                log::debug!("Version moved past v{}, retrying (attempt {attempts})", base.version);
                tokio::task::yield_now().await;
                continue;
            }

            let next = Arc::new(Snapshot::new(base.version + 1, draft));
            // File backends fsync; keep that off the async workers
            let backend = self.backend.clone();
            let durable = next.clone();
            let committed = tokio::task::spawn_blocking(move || backend.commit(&durable))
                .await
                .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("commit task failed: {e}"))));
            if let Err(e) = committed {
                self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Commit of v{} failed: {e}", next.version);
                return Err(EngineError::StoreUnavailable(e.to_string()));
            }
            *current = next.clone();
            self.stats.commits.fetch_add(1, Ordering::Relaxed);
            self.broadcast.publish(next.clone());
            drop(current);

            return Ok((output, next));
        }
    }

    /// Subscription starting after the current version.
    pub async fn subscribe(&self) -> Subscription {
        let rx = self.broadcast.subscribe();
        self.subscription_from(rx).await
    }

    /// Like [`subscribe`](Self::subscribe), registering `info` with the
    /// broadcast group. The caller removes the session when it ends.
    pub async fn subscribe_session(&self, info: SessionInfo) -> Subscription {
        let rx = self.broadcast.add_session(info).await;
        self.subscription_from(rx).await
    }

    // The receiver exists before the current version is read, so no commit
    // can fall between the two; anything already covered is skipped.
    async fn subscription_from(&self, rx: broadcast::Receiver<Arc<Snapshot>>) -> Subscription {
        let current = self.read().await;
        Subscription {
            rx,
            broadcast: self.broadcast.clone(),
            last_version: current.version,
            latest: current,
        }
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            version: self.read().await.version,
            commits: self.stats.commits.load(Ordering::Relaxed),
            noops: self.stats.noops.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            backend_failures: self.stats.backend_failures.load(Ordering::Relaxed),
        }
    }
}

/// One delivery from a [`Subscription`].
#[derive(Debug, Clone)]
pub enum Update {
    /// Next accepted snapshot
    Snapshot(Arc<Snapshot>),
    /// Subscriber fell behind; `skipped` snapshots were dropped and
    /// `snapshot` is the newest one available.
    Resync { skipped: u64, snapshot: Arc<Snapshot> },
}

impl Update {
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        match self {
            Update::Snapshot(s) | Update::Resync { snapshot: s, .. } => s,
        }
    }
}

/// Ordered stream of accepted snapshots.
///
/// Versions delivered are strictly increasing. A lagging subscriber receives
/// one [`Update::Resync`] carrying the newest buffered snapshot.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<Snapshot>>,
    broadcast: Arc<BroadcastGroup>,
    last_version: u64,
    latest: Arc<Snapshot>,
}

impl Subscription {
    /// Snapshot current when the subscription was made.
    pub fn initial(&self) -> &Arc<Snapshot> {
        &self.latest
    }

    /// Next update, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Update> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => {
                    if snapshot.version <= self.last_version {
                        continue;
                    }
                    self.last_version = snapshot.version;
                    self.latest = snapshot.clone();
                    return Some(Update::Snapshot(snapshot));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let newest = self.drain_to_newest();
                    let snapshot = match newest {
                        Some(s) => s,
                        None => continue,
                    };
                    log::warn!(
                        "Subscriber lagged by {skipped} snapshots, resyncing at v{}",
                        snapshot.version
                    );
                    self.broadcast.record_lag(skipped);
                    self.last_version = snapshot.version;
                    self.latest = snapshot.clone();
                    return Some(Update::Resync { skipped, snapshot });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Consume everything buffered and keep only the newest snapshot.
    fn drain_to_newest(&mut self) -> Option<Arc<Snapshot>> {
        let mut newest: Option<Arc<Snapshot>> = None;
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => newest = Some(snapshot),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        newest.filter(|s| s.version > self.last_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use teamsplit_core::{Participant, Role, Room};

    /// Backend whose commits can be switched off.
    struct SwitchBackend {
        inner: MemoryBackend,
        down: AtomicBool,
    }

    impl SwitchBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                down: AtomicBool::new(false),
            }
        }
    }

    impl Backend for SwitchBackend {
        fn load(&self) -> Result<Option<Snapshot>, StoreError> {
            self.inner.load()
        }

        fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("switched off".into()));
            }
            self.inner.commit(snapshot)
        }
    }

    fn add_room(state: &mut State, id: &str) -> Result<(), EngineError> {
        state.rooms.push(Room::new(id, id, 2));
        Ok(())
    }

    #[tokio::test]
    async fn test_mutate_bumps_version_and_publishes() {
        let store = SharedStateStore::in_memory();
        let mut sub = store.subscribe().await;

        let (_, snap) = store.mutate(|s| add_room(s, "r1")).await.unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(store.read().await.state.rooms.len(), 1);

        match sub.next().await.unwrap() {
            Update::Snapshot(s) => assert_eq!(s.version, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closure_error_aborts() {
        let store = SharedStateStore::in_memory();
        let err = store
            .mutate(|s| -> Result<(), EngineError> {
                s.rooms.push(Room::new("r1", "r1", 2));
                Err(EngineError::InvalidInput("nope".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidInput("nope".into()));
        let snap = store.read().await;
        assert_eq!(snap.version, 0);
        assert!(snap.state.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_result_rejected() {
        let store = SharedStateStore::in_memory();
        let err = store
            .mutate(|s| {
                s.participants.push(Participant::new("p1", "Zero", 0, Role::Mid));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(store.read().await.version, 0);
    }

    #[tokio::test]
    async fn test_noop_commits_nothing() {
        let store = SharedStateStore::in_memory();
        let mut sub = store.subscribe().await;

        let (value, snap) = store.mutate(|_| Ok(7)).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(snap.version, 0);

        let stats = store.stats().await;
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.noops, 1);

        store.mutate(|s| add_room(s, "r1")).await.unwrap();
        // The first delivery is the real commit, not the no-op
        assert_eq!(sub.next().await.unwrap().snapshot().version, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_fails_closed() {
        let backend = Arc::new(SwitchBackend::new());
        let store = SharedStateStore::open(backend.clone(), StoreConfig::for_testing()).unwrap();
        store.mutate(|s| add_room(s, "r1")).await.unwrap();

        backend.down.store(true, Ordering::SeqCst);
        let err = store.mutate(|s| add_room(s, "r2")).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));

        let snap = store.read().await;
        assert_eq!(snap.version, 1);
        assert_eq!(snap.state.rooms.len(), 1);
        assert_eq!(store.stats().await.backend_failures, 1);

        backend.down.store(false, Ordering::SeqCst);
        let (_, snap) = store.mutate(|s| add_room(s, "r2")).await.unwrap();
        assert_eq!(snap.version, 2);
    }

    /// Backend whose commits block the calling thread for a while.
    struct SlowBackend {
        inner: MemoryBackend,
        committing: Arc<AtomicBool>,
    }

    impl Backend for SlowBackend {
        fn load(&self) -> Result<Option<Snapshot>, StoreError> {
            self.inner.load()
        }

        fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
            self.committing.store(true, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(300));
            let result = self.inner.commit(snapshot);
            self.committing.store(false, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn test_slow_commit_leaves_runtime_free() {
        let committing = Arc::new(AtomicBool::new(false));
        let backend = Arc::new(SlowBackend {
            inner: MemoryBackend::new(),
            committing: committing.clone(),
        });
        let store = Arc::new(SharedStateStore::open(backend, StoreConfig::for_testing()).unwrap());

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.mutate(|s| add_room(s, "r1")).await })
        };

        // Single-threaded runtime: this loop only runs while the commit is
        // in flight if the commit is not on the runtime thread
        let mut seen_in_flight = false;
        for _ in 0..200 {
            if committing.load(Ordering::SeqCst) {
                seen_in_flight = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(seen_in_flight);

        let (_, snap) = writer.await.unwrap().unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(store.read().await.state.rooms.len(), 1);
    }

    #[tokio::test]
    async fn test_open_resumes_from_backend() {
        let mut state = State::new();
        state.rooms.push(Room::new("r1", "Arena", 1));
        let backend = Arc::new(MemoryBackend::with_snapshot(Snapshot::new(9, state)));

        let store = SharedStateStore::open(backend, StoreConfig::for_testing()).unwrap();
        let snap = store.read().await;
        assert_eq!(snap.version, 9);
        assert_eq!(snap.state.rooms.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_all_land() {
        let store = Arc::new(SharedStateStore::in_memory());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.mutate(|s| add_room(s, &format!("r{i}"))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let snap = store.read().await;
        assert_eq!(snap.version, 8);
        assert_eq!(snap.state.rooms.len(), 8);
    }

    #[tokio::test]
    async fn test_subscriber_sees_acceptance_order() {
        let store = Arc::new(SharedStateStore::in_memory_with(StoreConfig {
            broadcast_capacity: 64,
            ..StoreConfig::default()
        }));
        let mut sub = store.subscribe().await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.mutate(|s| add_room(s, &format!("r{i}"))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        for expected in 1..=10 {
            assert_eq!(sub.next().await.unwrap().snapshot().version, expected);
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resyncs() {
        let store = SharedStateStore::in_memory_with(StoreConfig {
            broadcast_capacity: 2,
            ..StoreConfig::default()
        });
        let mut sub = store.subscribe().await;
        for i in 0..6 {
            store.mutate(|s| add_room(s, &format!("r{i}"))).await.unwrap();
        }

        match sub.next().await.unwrap() {
            Update::Resync { skipped, snapshot } => {
                assert_eq!(skipped, 4);
                assert_eq!(snapshot.version, 6);
            }
            other => panic!("expected resync, got {other:?}"),
        }
        assert_eq!(store.broadcast().stats().await.resyncs, 1);

        store.mutate(|s| add_room(s, "late")).await.unwrap();
        assert_eq!(sub.next().await.unwrap().snapshot().version, 7);
    }
}
