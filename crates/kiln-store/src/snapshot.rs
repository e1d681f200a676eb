use crate::integrity::{digest_file, verify_snapshot};
use crate::layout::{StoreLayout, SNAPSHOT_EXTENSION};
use crate::{fsync_dir, StoreError};
use fs2::FileExt;
use kiln_schema::SnapshotKey;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Lock file inside every working copy, held for the copy's lifetime so a
/// sweep can tell live copies from ones abandoned by a killed process.
const OWNER_FILE: &str = ".owner";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_NAME_ATTEMPTS: u32 = 64;
const OWNERLESS_GRACE: Duration = Duration::from_secs(60);

static WORK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sidecar written next to every snapshot image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub key: SnapshotKey,
    pub size: u64,
    pub blake3: String,
    pub created_at: String,
    pub mirror: String,
    pub worker: String,
}

/// Where a snapshot came from, recorded in its sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub mirror: String,
    pub worker: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: SnapshotKey,
    pub path: PathBuf,
    pub size: u64,
    pub record: Option<SnapshotRecord>,
}

/// A disposable directory holding at most one copy of a base image.
///
/// The directory is removed by [`release`](Self::release) or, failing that,
/// on drop. Removal failures are logged and otherwise ignored: the base
/// image is never touched through a working copy.
#[derive(Debug)]
pub struct WorkingCopy {
    dir: PathBuf,
    image: Option<PathBuf>,
    owner: Option<File>,
    released: bool,
}

impl WorkingCopy {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The copied image, if this working copy was made from a base.
    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    pub fn release(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(owner) = self.owner.take() {
            let _ = owner.unlock();
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("released working copy {}", self.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "failed to remove working copy {}: {e}",
                self.dir.display()
            ),
        }
    }
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Base snapshots and their working copies under one storage root.
///
/// Base images are only ever replaced by an atomic rename, never written
/// in place, so any number of readers can copy them without locking.
pub struct SnapshotStore {
    layout: StoreLayout,
}

impl SnapshotStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn resolve_path(&self, key: &SnapshotKey) -> PathBuf {
        self.layout.snapshot_path(key)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Copy a base image into a fresh working directory, using a reflink
    /// where the filesystem supports it.
    pub fn acquire_working_copy(&self, base: &Path) -> Result<WorkingCopy, StoreError> {
        if !self.exists(base) {
            return Err(StoreError::SnapshotMissing(base.to_path_buf()));
        }
        let file_name = base
            .file_name()
            .ok_or_else(|| StoreError::SnapshotMissing(base.to_path_buf()))?;

        let mut working = self.new_working_dir(&file_name.to_string_lossy())?;
        let image = working.dir.join(file_name);
        copy_cow(base, &image)?;
        debug!("working copy of {} at {}", base.display(), image.display());
        working.image = Some(image);
        Ok(working)
    }

    /// A working directory with no base image in it, for bootstrapping a
    /// snapshot that does not exist yet.
    pub fn create_scratch(&self, key: &SnapshotKey) -> Result<WorkingCopy, StoreError> {
        self.new_working_dir(&key.file_stem())
    }

    pub fn release(&self, working: WorkingCopy) {
        working.release();
    }

    /// Atomically make `produced` the snapshot for `key`.
    ///
    /// The tarball is moved (or copied) to a temporary name inside the
    /// storage root and renamed over the canonical path, so concurrent
    /// readers see either the old image or the complete new one. The record
    /// is written and synced to a temporary file before the image moves and
    /// renamed into place right after it, so a failure can only leave a new
    /// image beside its old record in the gap between two renames.
    pub fn install(
        &self,
        key: &SnapshotKey,
        produced: &Path,
        provenance: &Provenance,
    ) -> Result<SnapshotRecord, StoreError> {
        validate_tarball(produced)?;
        self.layout.initialize()?;

        let root = self.layout.root();
        let dest = self.layout.snapshot_path(key);
        let size = fs::metadata(produced)?.len();
        let blake3 = digest_file(produced)?;

        let record = SnapshotRecord {
            key: key.clone(),
            size,
            blake3,
            created_at: chrono::Utc::now().to_rfc3339(),
            mirror: provenance.mirror.clone(),
            worker: provenance.worker.clone(),
        };
        let mut staged_record = NamedTempFile::new_in(root)?;
        staged_record.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
        staged_record.as_file().sync_all()?;

        File::open(produced)?.sync_all()?;
        if let Err(e) = fs::rename(produced, &dest) {
            debug!("rename into place failed ({e}), copying through a temporary file");
            let mut tmp = NamedTempFile::new_in(root)?;
            io::copy(&mut File::open(produced)?, tmp.as_file_mut())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        }
        staged_record
            .persist(self.layout.record_path(key))
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(root)?;

        info!("installed snapshot {key} ({size} bytes) at {}", dest.display());
        Ok(record)
    }

    pub fn read_record(&self, key: &SnapshotKey) -> Result<Option<SnapshotRecord>, StoreError> {
        let path = self.layout.record_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    pub fn list(&self) -> Result<Vec<SnapshotEntry>, StoreError> {
        let root = self.layout.root();
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let suffix = format!(".{SNAPSHOT_EXTENSION}");
        let mut entries = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(&suffix)) else {
                continue;
            };
            let Some(key) = SnapshotKey::from_file_stem(stem) else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let record = self.read_record(&key).unwrap_or_else(|e| {
                warn!("unreadable record for {key}: {e}");
                None
            });
            entries.push(SnapshotEntry {
                key,
                path: entry.path(),
                size: meta.len(),
                record,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub fn verify(&self, key: &SnapshotKey) -> Result<SnapshotRecord, StoreError> {
        verify_snapshot(&self.layout, key)
    }

    /// Delete a snapshot and its record. Returns whether an image existed.
    pub fn remove(&self, key: &SnapshotKey) -> Result<bool, StoreError> {
        let image = self.layout.snapshot_path(key);
        let existed = match fs::remove_file(&image) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(self.layout.record_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if existed {
            info!("removed snapshot {key}");
        }
        Ok(existed)
    }

    /// Remove working copies whose owning process is gone.
    pub fn sweep_stale_work(&self) -> Result<usize, StoreError> {
        let work = self.layout.work_dir();
        if !work.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&work)? {
            let path = entry?.path();
            if !path.is_dir() || working_copy_in_use(&path) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!("removed stale working copy {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("failed to remove stale working copy {}: {e}", path.display()),
            }
        }
        Ok(removed)
    }

    fn new_working_dir(&self, stem: &str) -> Result<WorkingCopy, StoreError> {
        let work = self.layout.work_dir();
        fs::create_dir_all(&work)?;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let n = WORK_COUNTER.fetch_add(1, Ordering::Relaxed);
            let dir = work.join(format!("{stem}.{}.{n}", std::process::id()));
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let owner = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(false)
                        .open(dir.join(OWNER_FILE))?;
                    owner.lock_exclusive()?;
                    return Ok(WorkingCopy {
                        dir,
                        image: None,
                        owner: Some(owner),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("could not allocate a working directory under {}", work.display()),
        )))
    }
}

/// A directory with no owner file yet may be one another process is still
/// setting up, so it only counts as abandoned once it has aged.
fn working_copy_in_use(dir: &Path) -> bool {
    let Ok(owner) = OpenOptions::new().write(true).open(dir.join(OWNER_FILE)) else {
        return fs::metadata(dir)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age < OWNERLESS_GRACE);
    };
    match owner.try_lock_exclusive() {
        Ok(()) => {
            let _ = owner.unlock();
            false
        }
        Err(_) => true,
    }
}

/// `cp --reflink=auto` shares extents on btrfs/xfs and degrades to a normal
/// copy elsewhere; `fs::copy` covers hosts without GNU cp.
fn copy_cow(src: &Path, dst: &Path) -> Result<(), StoreError> {
    match Command::new("cp")
        .args(["--reflink=auto", "--sparse=always", "--"])
        .arg(src)
        .arg(dst)
        .status()
    {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => debug!("cp exited with {status}, falling back to a plain copy"),
        Err(e) => debug!("cp unavailable ({e}), falling back to a plain copy"),
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn validate_tarball(path: &Path) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidArtifact {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };
    let mut file = File::open(path).map_err(|_| invalid("file does not exist"))?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_err() {
        return Err(invalid("file is empty or truncated"));
    }
    if magic != GZIP_MAGIC {
        return Err(invalid("not a gzip-compressed tarball"));
    }
    Ok(())
}
