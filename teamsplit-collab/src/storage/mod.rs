//! Durable backing for the shared document.
//!
//! ```text
//! ┌──────────────────┐  commit(snapshot)  ┌────────────────────────────┐
//! │ SharedStateStore │ ─────────────────► │ Backend                    │
//! │ (authoritative)  │                    │  MemoryBackend (volatile)  │
//! └────────┬─────────┘                    │  SnapshotFile  (LZ4 file)  │
//!          │ on open                      └─────────────┬──────────────┘
//!          ▼                                            │ load()
//!   latest snapshot ◄───────────────────────────────────┘
//! ```
//!
//! The store commits every accepted state before publishing it. A backend
//! error aborts the mutation, so nothing a subscriber has seen can be lost
//! on restart.

pub mod file;
pub mod memory;

pub use file::SnapshotFile;
pub use memory::MemoryBackend;

use crate::store::Snapshot;

/// Persistence backend for whole-document snapshots.
pub trait Backend: Send + Sync {
    /// Latest committed snapshot, or `None` for a fresh store.
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Durably record `snapshot`. Must not return before the write is safe.
    ///
    /// Runs on tokio's blocking pool while the store holds its commit lock,
    /// so a slow fsync delays other writers but never the async workers.
    fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
    /// Loaded document breaks an invariant
    Corrupt(String),
    /// Backend refuses writes
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Corrupt snapshot: {e}"),
            StoreError::Unavailable(e) => write!(f, "Backend unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

impl From<StoreError> for teamsplit_core::EngineError {
    fn from(e: StoreError) -> Self {
        teamsplit_core::EngineError::StoreUnavailable(e.to_string())
    }
}
