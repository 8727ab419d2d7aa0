//! Volatile backend: keeps the last committed snapshot in memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{Backend, StoreError};
use crate::store::Snapshot;

/// In-memory backend. Nothing survives the process.
#[derive(Default)]
pub struct MemoryBackend {
    last: Mutex<Option<Snapshot>>,
    commits: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that starts from `snapshot` instead of an empty document.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            last: Mutex::new(Some(snapshot)),
            commits: AtomicU64::new(0),
        }
    }

    /// Number of commits accepted so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Version of the last committed snapshot.
    pub fn last_version(&self) -> Option<u64> {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|s| s.version)
    }
}

impl Backend for MemoryBackend {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(snapshot.clone());
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
