//! Snapshot storage for kiln.
//!
//! This crate owns everything kiln persists under a storage root: the base
//! snapshot tarballs (one per `SnapshotKey`), their JSON sidecar records, the
//! per-run working copies builds operate on, and the lock files that keep two
//! pipelines off the same key. `StoreLayout` maps names to paths and
//! `SnapshotStore` implements the operations.

pub mod integrity;
pub mod layout;
pub mod snapshot;

pub use integrity::{digest_file, verify_snapshot};
pub use layout::{StoreLayout, SNAPSHOT_EXTENSION, STORE_FORMAT_VERSION};
pub use snapshot::{Provenance, SnapshotEntry, SnapshotRecord, SnapshotStore, WorkingCopy};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot not found: {}", .0.display())]
    SnapshotMissing(PathBuf),
    #[error("snapshot record not found for {0}")]
    RecordMissing(String),
    #[error("invalid artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },
    #[error("integrity check failed for {key}: expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}
