use crate::cancel::CancelToken;
use crate::RuntimeError;
use kiln_schema::{WorkerDescriptor, WorkerKind};
use std::path::Path;
use std::time::Duration;

/// Result of one command run inside a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, the way a build log is read.
    pub fn combined(&self) -> Vec<u8> {
        let mut log = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        log.extend_from_slice(&self.stdout);
        log.extend_from_slice(&self.stderr);
        log
    }
}

/// One kind of worker. Implementations do the work; `WorkerHandle` owns the
/// state machine and calls these in a valid order only.
///
/// Guest paths are plain strings because they name files inside the worker,
/// not on the host.
pub trait WorkerBackend: Send {
    fn kind(&self) -> WorkerKind;

    fn available(&self) -> bool;

    /// Boot the worker and block until it reports readiness.
    fn start(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<(), RuntimeError>;

    /// Writable scratch directory inside the worker, known once started.
    fn scratch_dir(&self) -> Option<&str>;

    /// Copy a host file into the scratch directory, returning its guest path.
    fn copy_in(&mut self, host: &Path, cancel: &CancelToken) -> Result<String, RuntimeError>;

    fn execute(
        &mut self,
        command: &[String],
        env: &[(String, String)],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Copy a guest file or directory to the host. A directory is named
    /// with a trailing `/` on both paths.
    fn copy_out(&mut self, guest: &str, host: &Path, cancel: &CancelToken) -> Result<(), RuntimeError>;

    /// Shut the worker down, forcing it after `grace`. Must be safe to call
    /// on a backend that never started.
    fn stop(&mut self, grace: Duration) -> Result<(), RuntimeError>;
}

pub fn select_backend(descriptor: &WorkerDescriptor) -> Result<Box<dyn WorkerBackend>, RuntimeError> {
    match descriptor.kind {
        WorkerKind::Qemu => Ok(Box::new(crate::qemu::QemuBackend::new(&descriptor.locator))),
        WorkerKind::Mock => Ok(Box::new(crate::mock::MockBackend::new())),
    }
}
