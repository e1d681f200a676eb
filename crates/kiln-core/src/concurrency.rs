use crate::CoreError;
use fs2::FileExt;
use kiln_runtime::CancelToken;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// Advisory lock on a file under the storage root, held for the length of
/// a stage. Builds share a key's lock with each other; replacing or removing
/// the snapshot takes it exclusively.
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    /// Block until the lock is free.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(lock_path)?;
        if file.try_lock_exclusive().is_err() {
            debug!("waiting for lock {}", lock_path.display());
            file.lock_exclusive()?;
        }
        Ok(Self { lock_file: file })
    }

    /// Block until no exclusive holder remains. Any number of shared
    /// holders may coexist.
    pub fn acquire_shared(lock_path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(lock_path)?;
        if file.try_lock_shared().is_err() {
            debug!("waiting for shared lock {}", lock_path.display());
            file.lock_shared()?;
        }
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Ctrl-C cancels `cancel`; a second Ctrl-C exits immediately.
pub fn install_signal_handler(cancel: CancelToken) {
    let _ = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        cancel.cancel();
        eprintln!("\ncancelling, stopping the worker...");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".locks").join("debian-sid-amd64.lock");
        let _lock = StoreLock::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let _lock = StoreLock::acquire(&lock_path).unwrap();
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        {
            let _lock = StoreLock::acquire(&lock_path).unwrap();
        }
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn acquire_waits_for_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");
        let held = StoreLock::acquire(&lock_path).unwrap();

        let path = lock_path.clone();
        let waiter = std::thread::spawn(move || {
            let _lock = StoreLock::acquire(&path).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(held);
        waiter.join().unwrap();
    }

    #[test]
    fn shared_holders_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let first = StoreLock::acquire_shared(&lock_path).unwrap();
        let path = lock_path.clone();
        let second = std::thread::spawn(move || StoreLock::acquire_shared(&path).map(drop));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(second.is_finished());
        second.join().unwrap().unwrap();
        drop(first);
    }

    #[test]
    fn shared_holder_blocks_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let shared = StoreLock::acquire_shared(&lock_path).unwrap();
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());

        let path = lock_path.clone();
        let writer = std::thread::spawn(move || {
            let _lock = StoreLock::acquire(&path).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!writer.is_finished());
        drop(shared);
        writer.join().unwrap();
    }

    #[test]
    fn exclusive_holder_blocks_shared() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");
        let held = StoreLock::acquire(&lock_path).unwrap();

        let path = lock_path.clone();
        let reader = std::thread::spawn(move || {
            let _lock = StoreLock::acquire_shared(&path).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reader.is_finished());
        drop(held);
        reader.join().unwrap();
    }
}
