use crate::StoreError;
use kiln_schema::SnapshotKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current storage format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
/// Extension of snapshot images, which are sbuild chroot tarballs.
pub const SNAPSHOT_EXTENSION: &str = "tar.gz";
const VERSION_FILE: &str = ".kiln-format";

/// Directory layout under a storage root.
///
/// ```text
/// <root>/<vendor>-<suite>-<arch>.tar.gz    base snapshot
/// <root>/<vendor>-<suite>-<arch>.json      sidecar record
/// <root>/work/<stem>.<pid>.<n>/            ephemeral working copies
/// <root>/.locks/<stem>.lock                per-key pipeline lock
/// <root>/.locks/storage.lock               maintenance lock
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn snapshot_path(&self, key: &SnapshotKey) -> PathBuf {
        self.root
            .join(format!("{}.{SNAPSHOT_EXTENSION}", key.file_stem()))
    }

    #[inline]
    pub fn record_path(&self, key: &SnapshotKey) -> PathBuf {
        self.root.join(format!("{}.json", key.file_stem()))
    }

    #[inline]
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(".locks")
    }

    #[inline]
    pub fn key_lock_file(&self, key: &SnapshotKey) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", key.file_stem()))
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.locks_dir().join("storage.lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.work_dir())?;
        fs::create_dir_all(self.locks_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
