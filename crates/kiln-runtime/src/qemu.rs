//! Worker backed by `autopkgtest-virt-qemu`.
//!
//! The virt server boots a throwaway overlay of the disk image and speaks a
//! line protocol on stdin/stdout. Every request gets one reply line starting
//! with `ok`; arguments in both directions are percent-encoded. Commands do
//! not go over the protocol: `print-execute-command` returns an "auxverb",
//! a host command prefix that runs the rest of its argv inside the guest.

use crate::backend::{ExecOutput, WorkerBackend};
use crate::cancel::{poll_interval, CancelToken};
use crate::RuntimeError;
use kiln_schema::WorkerKind;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const VIRT_SERVER: &str = "autopkgtest-virt-qemu";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const SIGTERM_WAIT: Duration = Duration::from_secs(5);

struct VirtServer {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<String>,
}

pub struct QemuBackend {
    image: PathBuf,
    program: String,
    server: Option<VirtServer>,
    scratch: Option<String>,
    auxverb: Vec<String>,
}

impl QemuBackend {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            program: VIRT_SERVER.to_owned(),
            server: None,
            scratch: None,
            auxverb: Vec::new(),
        }
    }

    fn server(&mut self) -> Result<&mut VirtServer, RuntimeError> {
        self.server
            .as_mut()
            .ok_or_else(|| RuntimeError::Protocol("virt server is not running".to_owned()))
    }

    /// Send one request and return the still-encoded words after `ok`.
    fn request(
        &mut self,
        verb: &str,
        args: &[&str],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, RuntimeError> {
        let mut line = verb.to_owned();
        for arg in args {
            line.push(' ');
            line.push_str(&percent_encode(arg));
        }
        debug!("virt> {line}");

        let server = self.server()?;
        writeln!(server.stdin, "{line}")?;
        server.stdin.flush()?;
        let reply = read_reply(&server.replies, timeout, cancel, "virt server request")?;
        parse_reply(verb, &reply)
    }

    fn auxverb_command(&self, command: &[String], env: &[(String, String)]) -> Result<Command, RuntimeError> {
        let (program, prefix) = self
            .auxverb
            .split_first()
            .ok_or_else(|| RuntimeError::Protocol("no execute command known".to_owned()))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix);
        cmd.args(["env", "--"]);
        for (k, v) in env {
            cmd.arg(format!("{k}={v}"));
        }
        cmd.args(command);
        Ok(cmd)
    }
}

impl WorkerBackend for QemuBackend {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Qemu
    }

    fn available(&self) -> bool {
        crate::prereq::command_exists(&self.program)
    }

    fn start(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<(), RuntimeError> {
        if !self.image.is_file() {
            return Err(RuntimeError::StartFailed(format!(
                "worker image not found: {}",
                self.image.display()
            )));
        }
        info!("booting {} {}", self.program, self.image.display());

        let mut child = Command::new(&self.program)
            .arg(&self.image)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::StartFailed(format!("{}: {e}", self.program)))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RuntimeError::StartFailed("virt server pipes unavailable".to_owned()));
        };

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                debug!("virt: {line}");
            }
        });

        self.server = Some(VirtServer {
            child,
            stdin,
            replies: rx,
        });

        let banner = {
            let server = self.server()?;
            read_reply(&server.replies, timeout, cancel, "boot")
        };
        match banner {
            Ok(line) if line.trim() == "ok" => {}
            Ok(line) => {
                return Err(RuntimeError::StartFailed(format!(
                    "unexpected virt server banner: {line}"
                )))
            }
            Err(RuntimeError::Protocol(msg)) => return Err(RuntimeError::StartFailed(msg)),
            Err(e) => return Err(e),
        }

        let opened = self.request("open", &[], timeout, cancel)?;
        let scratch = opened
            .first()
            .map(|w| percent_decode(w))
            .ok_or_else(|| RuntimeError::Protocol("open returned no scratch directory".to_owned()))?;

        let exec = self.request("print-execute-command", &[], REQUEST_TIMEOUT, cancel)?;
        let auxverb = exec
            .first()
            .map(|field| decode_auxverb(field))
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RuntimeError::Protocol("empty execute command".to_owned()))?;

        info!("worker ready, scratch directory {scratch}");
        self.scratch = Some(scratch);
        self.auxverb = auxverb;
        Ok(())
    }

    fn scratch_dir(&self) -> Option<&str> {
        self.scratch.as_deref()
    }

    fn copy_in(&mut self, host: &Path, cancel: &CancelToken) -> Result<String, RuntimeError> {
        let (Some(scratch), Some(name)) = (self.scratch.clone(), host.file_name()) else {
            return Err(RuntimeError::CopyFailed(format!(
                "cannot copy {} into a worker that is not running",
                host.display()
            )));
        };
        let guest = format!("{scratch}/{}", name.to_string_lossy());
        let host_str = host.to_string_lossy();
        self.request("copydown", &[&host_str, &guest], REQUEST_TIMEOUT, cancel)
            .map_err(copy_failed(format!("{host_str} -> {guest}")))?;
        Ok(guest)
    }

    fn execute(
        &mut self,
        command: &[String],
        env: &[(String, String)],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, RuntimeError> {
        debug!("exec in worker: {}", command.join(" "));
        let mut child = self
            .auxverb_command(command, env)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::Cancelled);
            }
            if started.elapsed() >= timeout {
                warn!("command exceeded {}s, killing it", timeout.as_secs());
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::Timeout {
                    operation: "execute",
                    limit: timeout,
                });
            }
            std::thread::sleep(poll_interval());
        };

        Ok(ExecOutput {
            exit_code: exit_code(status),
            stdout: join_output(stdout),
            stderr: join_output(stderr),
        })
    }

    fn copy_out(&mut self, guest: &str, host: &Path, cancel: &CancelToken) -> Result<(), RuntimeError> {
        let host_str = host.to_string_lossy();
        self.request("copyup", &[guest, &host_str], REQUEST_TIMEOUT, cancel)
            .map_err(copy_failed(format!("{guest} -> {host_str}")))?;
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<(), RuntimeError> {
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };
        self.scratch = None;
        self.auxverb.clear();

        for verb in ["close", "quit"] {
            if writeln!(server.stdin, "{verb}").and_then(|()| server.stdin.flush()).is_err() {
                break;
            }
        }
        drop(server.stdin);

        if wait_for_exit(&mut server.child, grace)?.is_some() {
            debug!("virt server exited cleanly");
            return Ok(());
        }

        warn!("virt server did not exit within {}s, sending SIGTERM", grace.as_secs());
        terminate(&server.child);
        if wait_for_exit(&mut server.child, SIGTERM_WAIT)?.is_some() {
            return Ok(());
        }

        warn!("virt server ignored SIGTERM, killing it");
        server.child.kill()?;
        server.child.wait()?;
        Ok(())
    }
}

impl Drop for QemuBackend {
    fn drop(&mut self) {
        if let Some(mut server) = self.server.take() {
            let _ = server.child.kill();
            let _ = server.child.wait();
        }
    }
}

fn read_reply(
    replies: &Receiver<String>,
    timeout: Duration,
    cancel: &CancelToken,
    operation: &'static str,
) -> Result<String, RuntimeError> {
    let started = Instant::now();
    loop {
        cancel.check()?;
        if started.elapsed() >= timeout {
            return Err(RuntimeError::Timeout {
                operation,
                limit: timeout,
            });
        }
        match replies.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => {
                debug!("virt< {line}");
                return Ok(line);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(RuntimeError::Protocol(
                    "virt server closed its output".to_owned(),
                ))
            }
        }
    }
}

/// Cancellation and timeouts pass through untouched.
fn copy_failed(what: String) -> impl FnOnce(RuntimeError) -> RuntimeError {
    move |e| match e {
        RuntimeError::Cancelled | RuntimeError::Timeout { .. } => e,
        other => RuntimeError::CopyFailed(format!("{what}: {other}")),
    }
}

fn parse_reply(verb: &str, reply: &str) -> Result<Vec<String>, RuntimeError> {
    let mut words = reply.split_whitespace();
    match words.next() {
        Some("ok") => Ok(words.map(str::to_owned).collect()),
        _ => Err(RuntimeError::Protocol(format!("{verb}: {reply}"))),
    }
}

/// The execute command is a comma-separated list of encoded words.
fn decode_auxverb(field: &str) -> Vec<String> {
    field
        .split(',')
        .filter(|w| !w.is_empty())
        .map(percent_decode)
        .collect()
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() || b"/_.-~".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn collect<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn wait_for_exit(child: &mut Child, limit: Duration) -> Result<Option<ExitStatus>, RuntimeError> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= limit {
            return Ok(None);
        }
        std::thread::sleep(poll_interval());
    }
}

/// Ask the virt server to shut down its VM before resorting to SIGKILL.
#[allow(unsafe_code)]
fn terminate(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill() has no memory-safety preconditions; `pid` is our own
    // unreaped child, so it cannot have been recycled.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}
