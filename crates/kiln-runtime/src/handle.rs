use crate::backend::{ExecOutput, WorkerBackend};
use crate::cancel::CancelToken;
use crate::lifecycle::{validate_transition, WorkerState};
use crate::RuntimeError;
use kiln_schema::{TimeoutsSection, WorkerDescriptor};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounds on the blocking worker operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    pub boot: Duration,
    pub execute: Duration,
    pub stop_grace: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutsSection::default())
    }
}

impl From<&TimeoutsSection> for WorkerTimeouts {
    fn from(section: &TimeoutsSection) -> Self {
        Self {
            boot: Duration::from_secs(section.boot_secs),
            execute: Duration::from_secs(section.execute_secs),
            stop_grace: Duration::from_secs(section.stop_grace_secs),
        }
    }
}

/// One worker and its lifecycle.
///
/// ```text
/// Unstarted -> Booting -> Ready <-> Running
///                 |         |          |
///                 +------ Failed ------+
/// any state -> Stopped
/// ```
///
/// A handle that is dropped without `stop()` stops itself, so the worker
/// process never outlives its owner.
pub struct WorkerHandle {
    descriptor: WorkerDescriptor,
    backend: Box<dyn WorkerBackend>,
    state: WorkerState,
    timeouts: WorkerTimeouts,
    cancel: CancelToken,
    attached: Option<String>,
}

impl WorkerHandle {
    pub fn new(
        descriptor: WorkerDescriptor,
        backend: Box<dyn WorkerBackend>,
        timeouts: WorkerTimeouts,
        cancel: CancelToken,
    ) -> Self {
        Self {
            descriptor,
            backend,
            state: WorkerState::Unstarted,
            timeouts,
            cancel,
            attached: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    /// Guest path of the working image passed to `start`, if any.
    pub fn attached_image(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    pub fn scratch_dir(&self) -> Option<&str> {
        self.backend.scratch_dir()
    }

    fn transition(&mut self, to: WorkerState) -> Result<(), RuntimeError> {
        validate_transition(self.state, to)?;
        debug!("worker {}: {} -> {to}", self.descriptor, self.state);
        self.state = to;
        Ok(())
    }

    fn fail(&mut self, error: RuntimeError) -> RuntimeError {
        warn!("worker {} failed in state {}: {error}", self.descriptor, self.state);
        self.state = WorkerState::Failed;
        error
    }

    /// Boot the worker and, if given, attach the working image to it.
    pub fn start(&mut self, working_image: Option<&Path>) -> Result<(), RuntimeError> {
        if self.state != WorkerState::Unstarted {
            return Err(RuntimeError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.transition(WorkerState::Booting)?;
        info!("starting worker {}", self.descriptor);

        if let Err(e) = self.cancel.check() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.backend.start(self.timeouts.boot, &self.cancel) {
            let e = match e {
                RuntimeError::Io(io) => RuntimeError::StartFailed(io.to_string()),
                other => other,
            };
            return Err(self.fail(e));
        }
        if let Some(image) = working_image {
            match self.backend.copy_in(image, &self.cancel) {
                Ok(guest) => self.attached = Some(guest),
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.transition(WorkerState::Ready)
    }

    /// Run one command in the worker. Only valid in `Ready`.
    ///
    /// A non-zero exit is a successful call; the caller decides what the
    /// code means. Timeouts and cancellation leave the handle `Failed`.
    pub fn execute(
        &mut self,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput, RuntimeError> {
        if self.state != WorkerState::Ready {
            return Err(RuntimeError::InvalidState {
                operation: "execute",
                state: self.state,
            });
        }
        if let Err(e) = self.cancel.check() {
            return Err(self.fail(e));
        }
        self.transition(WorkerState::Running)?;

        match self
            .backend
            .execute(command, env, self.timeouts.execute, &self.cancel)
        {
            Ok(output) => {
                debug!("command exited with {}", output.exit_code);
                self.transition(WorkerState::Ready)?;
                Ok(output)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Copy a guest file, or a directory named with a trailing `/` on both
    /// sides, to the host.
    pub fn copy_out(&mut self, guest: &str, host: &Path) -> Result<(), RuntimeError> {
        self.copy("copy out of", |backend, cancel| backend.copy_out(guest, host, cancel))
    }

    pub fn copy_in(&mut self, host: &Path) -> Result<String, RuntimeError> {
        self.copy("copy into", |backend, cancel| backend.copy_in(host, cancel))
    }

    /// Copies run like commands: only from `Ready`, and a cancelled or
    /// timed-out copy leaves the handle `Failed`. Other copy errors keep it
    /// usable.
    fn copy<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut dyn WorkerBackend, &CancelToken) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        if self.state != WorkerState::Ready {
            return Err(RuntimeError::InvalidState {
                operation,
                state: self.state,
            });
        }
        if let Err(e) = self.cancel.check() {
            return Err(self.fail(e));
        }
        self.transition(WorkerState::Running)?;

        match f(self.backend.as_mut(), &self.cancel) {
            Ok(value) => {
                self.transition(WorkerState::Ready)?;
                Ok(value)
            }
            Err(e @ (RuntimeError::Cancelled | RuntimeError::Timeout { .. })) => Err(self.fail(e)),
            Err(e) => {
                self.transition(WorkerState::Ready)?;
                Err(e)
            }
        }
    }

    /// Shut the worker down. Always ends in `Stopped`; a second call is a
    /// no-op. Backend errors during shutdown are returned after the state
    /// change so the caller can log them.
    pub fn stop(&mut self) -> Result<(), RuntimeError> {
        if self.state == WorkerState::Stopped {
            return Ok(());
        }
        let result = if self.state == WorkerState::Unstarted {
            Ok(())
        } else {
            self.backend.stop(self.timeouts.stop_grace)
        };
        self.transition(WorkerState::Stopped)?;
        self.attached = None;
        info!("worker {} stopped", self.descriptor);
        result
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.state != WorkerState::Stopped {
            if let Err(e) = self.stop() {
                warn!("stopping worker {} on drop: {e}", self.descriptor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockCall, MockRecorder};

    fn descriptor() -> WorkerDescriptor {
        WorkerDescriptor::parse("mock test-worker").unwrap()
    }

    fn fast_timeouts() -> WorkerTimeouts {
        WorkerTimeouts {
            boot: Duration::from_millis(200),
            execute: Duration::from_millis(500),
            stop_grace: Duration::from_millis(100),
        }
    }

    fn handle_with(backend: MockBackend) -> (WorkerHandle, MockRecorder) {
        let recorder = backend.recorder();
        let handle = WorkerHandle::new(
            descriptor(),
            Box::new(backend),
            fast_timeouts(),
            CancelToken::new(),
        );
        (handle, recorder)
    }

    fn cmd(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn full_lifecycle() {
        let (mut handle, recorder) = handle_with(MockBackend::new());
        assert_eq!(handle.state(), WorkerState::Unstarted);
        assert_eq!(handle.descriptor().locator, "test-worker");

        handle.start(None).unwrap();
        assert_eq!(handle.state(), WorkerState::Ready);

        let out = handle.execute(&cmd(&["true"]), &[]).unwrap();
        assert!(out.success());
        assert_eq!(handle.state(), WorkerState::Ready);

        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert_eq!(recorder.stop_count(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut handle, recorder) = handle_with(MockBackend::new());
        handle.start(None).unwrap();
        handle.stop().unwrap();
        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert_eq!(recorder.stop_count(), 1);
    }

    #[test]
    fn stop_from_unstarted_skips_backend() {
        let (mut handle, recorder) = handle_with(MockBackend::new());
        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn execute_before_start_is_rejected() {
        let (mut handle, recorder) = handle_with(MockBackend::new());
        let err = handle.execute(&cmd(&["true"]), &[]).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InvalidState {
                state: WorkerState::Unstarted,
                ..
            }
        ));
        assert!(recorder.executed().is_empty());
    }

    #[test]
    fn execute_after_stop_is_rejected() {
        let (mut handle, _) = handle_with(MockBackend::new());
        handle.start(None).unwrap();
        handle.stop().unwrap();
        assert!(matches!(
            handle.execute(&cmd(&["true"]), &[]),
            Err(RuntimeError::InvalidState { .. })
        ));
    }

    #[test]
    fn start_twice_is_rejected() {
        let (mut handle, _) = handle_with(MockBackend::new());
        handle.start(None).unwrap();
        assert!(matches!(
            handle.start(None),
            Err(RuntimeError::InvalidState { .. })
        ));
        assert_eq!(handle.state(), WorkerState::Ready);
    }

    #[test]
    fn boot_timeout_fails_handle() {
        let (mut handle, _) = handle_with(MockBackend::new().boot_delay(Duration::from_secs(10)));
        let err = handle.start(None).unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { operation: "boot", .. }));
        assert_eq!(handle.state(), WorkerState::Failed);
        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn start_failure_is_reported() {
        let (mut handle, _) = handle_with(MockBackend::new().fail_start());
        assert!(matches!(
            handle.start(None),
            Err(RuntimeError::StartFailed(_))
        ));
        assert_eq!(handle.state(), WorkerState::Failed);
    }

    #[test]
    fn execute_timeout_fails_handle() {
        let (mut handle, _) = handle_with(MockBackend::new().exec_delay(Duration::from_secs(10)));
        handle.start(None).unwrap();
        let err = handle.execute(&cmd(&["sleep"]), &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { operation: "execute", .. }));
        assert_eq!(handle.state(), WorkerState::Failed);
    }

    #[test]
    fn cancellation_during_execute() {
        let backend = MockBackend::new().exec_delay(Duration::from_secs(10));
        let cancel = CancelToken::new();
        let mut handle = WorkerHandle::new(
            descriptor(),
            Box::new(backend),
            WorkerTimeouts {
                execute: Duration::from_secs(30),
                ..fast_timeouts()
            },
            cancel.clone(),
        );
        handle.start(None).unwrap();

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let err = handle.execute(&cmd(&["sbuild"]), &[]).unwrap_err();
        t.join().unwrap();

        assert!(matches!(err, RuntimeError::Cancelled));
        assert_eq!(handle.state(), WorkerState::Failed);
        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn cancellation_during_copy_fails_handle() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("kiln-schroot.conf");
        std::fs::write(&conf, b"[kiln]\n").unwrap();

        let cancel = CancelToken::new();
        let mut handle = WorkerHandle::new(
            descriptor(),
            Box::new(MockBackend::new().copy_delay(Duration::from_secs(30))),
            fast_timeouts(),
            cancel.clone(),
        );
        handle.start(None).unwrap();

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let err = handle.copy_in(&conf).unwrap_err();
        t.join().unwrap();

        assert!(matches!(err, RuntimeError::Cancelled));
        assert_eq!(handle.state(), WorkerState::Failed);
        assert!(matches!(
            handle.copy_out("/nowhere", dir.path()),
            Err(RuntimeError::InvalidState { .. })
        ));
        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn failed_copy_keeps_handle_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (mut handle, _) = handle_with(MockBackend::new());
        handle.start(None).unwrap();

        let err = handle
            .copy_out("/no/such/guest/file", &dir.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CopyFailed(_)));
        assert_eq!(handle.state(), WorkerState::Ready);
    }

    #[test]
    fn working_image_is_attached() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("debian-sid-amd64.tar.gz");
        std::fs::write(&image, b"image").unwrap();

        let (mut handle, recorder) = handle_with(MockBackend::new());
        handle.start(Some(&image)).unwrap();
        let guest = handle.attached_image().unwrap().to_owned();
        assert!(guest.ends_with("debian-sid-amd64.tar.gz"));
        assert!(guest.starts_with(handle.scratch_dir().unwrap()));
        assert!(recorder.calls().contains(&MockCall::CopyIn(image)));
    }

    #[test]
    fn drop_stops_running_worker() {
        let recorder = {
            let (mut handle, recorder) = handle_with(MockBackend::new());
            handle.start(None).unwrap();
            recorder
        };
        assert_eq!(recorder.stop_count(), 1);
    }

    #[test]
    fn timeouts_from_config_section() {
        let t = WorkerTimeouts::from(&TimeoutsSection {
            boot_secs: 1,
            execute_secs: 2,
            stop_grace_secs: 3,
        });
        assert_eq!(t.boot, Duration::from_secs(1));
        assert_eq!(t.execute, Duration::from_secs(2));
        assert_eq!(t.stop_grace, Duration::from_secs(3));
    }
}
