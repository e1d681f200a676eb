use crate::backend::{ExecOutput, WorkerBackend};
use crate::cancel::{pause, CancelToken};
use crate::RuntimeError;
use kiln_schema::WorkerKind;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Start,
    CopyIn(PathBuf),
    Execute(Vec<String>),
    CopyOut { guest: String, host: PathBuf },
    Stop,
}

/// Shared view of the calls a `MockBackend` received. Clones observe the
/// same log, so a test can keep one after the backend is boxed away.
#[derive(Debug, Clone, Default)]
pub struct MockRecorder {
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn started(&self) -> bool {
        self.calls().contains(&MockCall::Start)
    }

    pub fn stop_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == MockCall::Stop).count()
    }

    pub fn executed(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Execute(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: MockCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

/// In-process worker. The "guest" is a host temp directory and commands are
/// recorded rather than run. A few are emulated so both stages can be
/// exercised end to end: `install -d <dir>` creates the directory,
/// `tar -czf <path>` writes a small gzip file, and a command given
/// `--chdir=<dir>` leaves `mock-exec.log` behind in that directory.
///
/// Copies out follow the autopkgtest rule that a directory is named with a
/// trailing `/` on both sides, and fail when the two paths disagree.
pub struct MockBackend {
    recorder: MockRecorder,
    boot_delay: Duration,
    exec_delay: Duration,
    copy_delay: Duration,
    failures: Vec<(String, i32)>,
    fail_start: bool,
    guest: Option<TempDir>,
    scratch: Option<String>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            recorder: MockRecorder::new(),
            boot_delay: Duration::ZERO,
            exec_delay: Duration::ZERO,
            copy_delay: Duration::ZERO,
            failures: Vec::new(),
            fail_start: false,
            guest: None,
            scratch: None,
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_recorder(mut self, recorder: MockRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    #[must_use]
    pub fn boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    #[must_use]
    pub fn exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Every copy in either direction takes this long.
    #[must_use]
    pub fn copy_delay(mut self, delay: Duration) -> Self {
        self.copy_delay = delay;
        self
    }

    /// Commands containing `pattern` as an argument exit with `code`.
    #[must_use]
    pub fn fail_command(mut self, pattern: &str, code: i32) -> Self {
        self.failures.push((pattern.to_owned(), code));
        self
    }

    #[must_use]
    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn recorder(&self) -> MockRecorder {
        self.recorder.clone()
    }

    fn scripted_exit(&self, command: &[String]) -> i32 {
        self.failures
            .iter()
            .find(|(pattern, _)| command.iter().any(|arg| arg == pattern))
            .map_or(0, |(_, code)| *code)
    }
}

impl WorkerBackend for MockBackend {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Mock
    }

    fn available(&self) -> bool {
        true
    }

    fn start(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<(), RuntimeError> {
        self.recorder.push(MockCall::Start);
        if self.fail_start {
            return Err(RuntimeError::StartFailed("mock worker refused to boot".to_owned()));
        }
        pause(self.boot_delay, timeout, cancel, "boot")?;

        let guest = tempfile::Builder::new().prefix("kiln-mock-").tempdir()?;
        self.scratch = Some(guest.path().to_string_lossy().into_owned());
        self.guest = Some(guest);
        Ok(())
    }

    fn scratch_dir(&self) -> Option<&str> {
        self.scratch.as_deref()
    }

    fn copy_in(&mut self, host: &Path, cancel: &CancelToken) -> Result<String, RuntimeError> {
        self.recorder.push(MockCall::CopyIn(host.to_path_buf()));
        pause(self.copy_delay, self.copy_delay, cancel, "copy")?;
        let (Some(scratch), Some(name)) = (self.scratch.as_deref(), host.file_name()) else {
            return Err(RuntimeError::CopyFailed(format!(
                "cannot copy {} into a worker that is not running",
                host.display()
            )));
        };
        let guest = Path::new(scratch).join(name);
        fs::copy(host, &guest)?;
        Ok(guest.to_string_lossy().into_owned())
    }

    fn execute(
        &mut self,
        command: &[String],
        _env: &[(String, String)],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, RuntimeError> {
        self.recorder.push(MockCall::Execute(command.to_vec()));
        pause(self.exec_delay, timeout, cancel, "execute")?;

        let line = command.join(" ");
        let exit_code = self.scripted_exit(command);
        if exit_code != 0 {
            return Ok(ExecOutput {
                exit_code,
                stdout: format!("mock-exec: {line}\n").into_bytes(),
                stderr: format!("mock failure: exit status {exit_code}\n").into_bytes(),
            });
        }

        if command.first().is_some_and(|p| p == "install") && command.iter().any(|a| a == "-d") {
            if let Some(dir) = command.last() {
                fs::create_dir_all(dir)?;
            }
        }

        if let Some(dir) = command.iter().find_map(|a| a.strip_prefix("--chdir=")) {
            if Path::new(dir).is_dir() {
                fs::write(Path::new(dir).join("mock-exec.log"), format!("{line}\n"))?;
            }
        }

        if let Some(pos) = command.iter().position(|arg| arg == "-czf") {
            if let Some(target) = command.get(pos + 1) {
                let target = Path::new(target);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut data = GZIP_MAGIC.to_vec();
                data.extend_from_slice(line.as_bytes());
                fs::write(target, data)?;
            }
        }

        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("mock-exec: {line}\n").into_bytes(),
            stderr: Vec::new(),
        })
    }

    fn copy_out(&mut self, guest: &str, host: &Path, cancel: &CancelToken) -> Result<(), RuntimeError> {
        self.recorder.push(MockCall::CopyOut {
            guest: guest.to_owned(),
            host: host.to_path_buf(),
        });
        pause(self.copy_delay, self.copy_delay, cancel, "copy")?;

        let guest_is_dir = guest.ends_with('/');
        if guest_is_dir != host.to_string_lossy().ends_with('/') {
            return Err(RuntimeError::CopyFailed(format!(
                "{guest} -> {}: both paths must end in '/' to copy a directory",
                host.display()
            )));
        }
        let failed =
            |e: std::io::Error| RuntimeError::CopyFailed(format!("{guest} -> {}: {e}", host.display()));
        let source = Path::new(guest);
        if guest_is_dir {
            fs::create_dir_all(host).map_err(failed)?;
            for entry in fs::read_dir(source).map_err(failed)? {
                let entry = entry.map_err(failed)?;
                if entry.path().is_file() {
                    fs::copy(entry.path(), host.join(entry.file_name())).map_err(failed)?;
                }
            }
            return Ok(());
        }
        fs::copy(source, host).map_err(failed)?;
        Ok(())
    }

    fn stop(&mut self, _grace: Duration) -> Result<(), RuntimeError> {
        self.recorder.push(MockCall::Stop);
        self.scratch = None;
        self.guest = None;
        Ok(())
    }
}
