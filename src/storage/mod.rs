//! Persistent, multi-process sample store.
//!
//! A store is a directory of chunked arrays, one per simulated variable plus
//! a per-row status array. Any number of processes (or threads holding their
//! own handle) may populate the same store concurrently; every mutation is
//! serialized by an exclusive lock file next to the store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ChunkedDiskStore                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ data/<variable> │  │ meta/sim_status │                    │
//! │  │ (ChunkedArray)  │  │ (ChunkedArray)  │                    │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           │                    │                             │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (flock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//!            │
//!            ↓
//!  ChunkStream / ParallelLoader (chunk-shuffled training reads)
//! ```
//!
//! Rows move one way, EMPTY to FILLED. A populating participant takes the
//! lock, picks the first EMPTY rows, writes their data and only then marks
//! them FILLED. Reads of FILLED rows need no lock.

mod chunked;
mod codec;
mod disk_store;
mod file_lock;
mod loader;

pub use chunked::{ArrayMeta, ChunkedArray};
pub use disk_store::{
    index_runs, ChunkedDiskStore, IndexRun, PopulateOptions, PopulateReport, RowStatus, StoreAttrs, STATUS_EMPTY,
    STATUS_FILLED,
};
pub use file_lock::{FileLock, FileLockGuard};
pub use loader::{chunk_partition, ChunkStream, LoaderConfig, ParallelLoader, StreamOptions};

use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::{SimResult, StoreError};

/// Configuration for an on-disk store handle.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to fsync every chunk file before it is renamed into place.
    pub sync_on_write: bool,
    /// Lock file location; `<store>.lock` when `None`.
    pub lock_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            lock_path: None,
        }
    }
}

impl StoreConfig {
    pub fn validate(self) -> SimResult<Self> {
        if let Some(lock_path) = &self.lock_path {
            if lock_path.file_name().is_none() {
                return Err(StoreError::storage(format!(
                    "lock_path must name a file (got {})",
                    lock_path.display()
                ))
                .into());
            }
        }
        Ok(self)
    }
}

/// Open (or prepare) a chunked sample store at the given path.
///
/// # Arguments
/// * `path` - Directory holding the store
/// * `config` - Optional configuration (uses defaults if None)
///
/// # Errors
/// - If the configuration is invalid
/// - If the directory cannot be created
///
/// # Example
/// ```rust,ignore
/// use ratiosim::storage::{open_store, PopulateOptions};
///
/// let store = open_store("./sims.store", None)?;
/// store.init(10_000, 100, &schema)?;
/// store.populate(|n| model.simulate(n, &request, &mut rng), &PopulateOptions::default())?;
/// ```
pub fn open_store(path: impl AsRef<Path>, config: Option<StoreConfig>) -> SimResult<ChunkedDiskStore> {
    let cfg = config.unwrap_or_default().validate()?;
    ChunkedDiskStore::open(path.as_ref(), cfg)
}

/// Maps an I/O failure on `path` into a store error.
pub(crate) fn io_error(action: &str, path: &Path, e: &IoError) -> StoreError {
    if e.kind() == ErrorKind::InvalidData {
        return StoreError::Corrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
    }
    StoreError::storage(format!("failed to {action} {}: {e}", path.display()))
}
