//! Single-file snapshot backend.
//!
//! Layout on disk:
//! ```text
//! <dir>/state.snap      LZ4( bincode( format, Snapshot ) )   committed
//! <dir>/state.snap.tmp  same encoding, being written          transient
//! ```
//!
//! A commit writes the temp file, flushes it, and renames it over the
//! committed file, so a crash leaves either the old or the new snapshot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{Backend, StoreError};
use crate::store::Snapshot;

/// On-disk encoding revision.
const FORMAT_VERSION: u32 = 1;

const SNAPSHOT_FILE: &str = "state.snap";
const TEMP_SUFFIX: &str = "tmp";

/// Snapshot file configuration.
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Directory holding the snapshot file
    pub dir: PathBuf,
    /// fsync the temp file before renaming (default: true)
    pub sync_writes: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("teamsplit_data"),
            sync_writes: true,
        }
    }
}

impl FileConfig {
    /// Config for tests: no fsync.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_writes: false,
        }
    }
}

/// Durable backend writing one compressed snapshot file.
pub struct SnapshotFile {
    config: FileConfig,
    path: PathBuf,
    /// Serializes writers on the temp file
    write_lock: Mutex<()>,
    bytes_written: AtomicU64,
}

impl SnapshotFile {
    /// Open (creating the directory if needed).
    pub fn open(config: FileConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(SNAPSHOT_FILE);
        log::info!("Snapshot file at {}", path.display());
        Ok(Self {
            config,
            path,
            write_lock: Mutex::new(()),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Open with default settings in `dir`.
    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open(FileConfig {
            dir: dir.into(),
            ..FileConfig::default()
        })
    }

    /// Path of the committed snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compressed bytes written since open.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec((FORMAT_VERSION, snapshot), bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Snapshot, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let ((format, snapshot), _): ((u32, Snapshot), usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        if format != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot format {format}"
            )));
        }
        Ok(snapshot)
    }
}

impl Backend for SnapshotFile {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = Self::decode(&bytes)?;
        snapshot
            .state
            .validate()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        log::info!(
            "Loaded snapshot v{} ({} bytes) from {}",
            snapshot.version,
            bytes.len(),
            self.path.display()
        );
        Ok(Some(snapshot))
    }

    fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let encoded = Self::encode(snapshot)?;
        let tmp = self.path.with_extension(format!("snap.{TEMP_SUFFIX}"));

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            if self.config.sync_writes {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &self.path)?;

        self.bytes_written
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        log::trace!("Committed snapshot v{} ({} bytes)", snapshot.version, encoded.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamsplit_core::{Participant, Role, Room, State};

    fn sample_state() -> State {
        let mut state = State::new();
        state.participants.push(Participant::new("p1", "Ash", 40, Role::Pro).with_email("a@x.io"));
        state.rooms.push(Room::new("r1", "Arena", 3));
        state
    }

    #[test]
    fn test_fresh_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SnapshotFile::open(FileConfig::for_testing(dir.path())).unwrap();
        assert!(backend.load().unwrap().is_none());
    }

    #[test]
    fn test_commit_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SnapshotFile::open(FileConfig::for_testing(dir.path())).unwrap();
            backend.commit(&Snapshot::new(1, State::new())).unwrap();
            backend.commit(&Snapshot::new(2, sample_state())).unwrap();
            assert!(backend.bytes_written() > 0);
        }

        let backend = SnapshotFile::open(FileConfig::for_testing(dir.path())).unwrap();
        let loaded = backend.load().unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.state, sample_state());
        assert!(!dir.path().join("state.snap.tmp").exists());
    }

    #[test]
    fn test_garbage_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SnapshotFile::open(FileConfig::for_testing(dir.path())).unwrap();
        fs::write(backend.path(), b"definitely not a snapshot").unwrap();
        assert!(backend.load().is_err());
    }

    #[test]
    fn test_invalid_document_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SnapshotFile::open(FileConfig::for_testing(dir.path())).unwrap();
        let mut state = sample_state();
        state.rooms[0].team_size = 0;
        backend.commit(&Snapshot::new(1, state)).unwrap();
        assert!(matches!(backend.load(), Err(StoreError::Corrupt(_))));
    }
}
