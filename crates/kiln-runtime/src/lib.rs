//! Worker runtime for kiln.
//!
//! A worker is an ephemeral machine that build commands run inside. This crate
//! defines the `WorkerBackend` capability trait, two implementations of it
//! (`qemu`, which drives an autopkgtest virt server, and an in-process `mock`),
//! and `WorkerHandle`, the state machine every caller goes through so that
//! boot and execution are bounded and the worker is always torn down.

pub mod backend;
pub mod cancel;
pub mod handle;
pub mod lifecycle;
pub mod mock;
pub mod prereq;
pub mod qemu;

pub use backend::{select_backend, ExecOutput, WorkerBackend};
pub use cancel::CancelToken;
pub use handle::{WorkerHandle, WorkerTimeouts};
pub use lifecycle::{validate_transition, WorkerState};
pub use mock::{MockBackend, MockCall, MockRecorder};
pub use prereq::{check_qemu_prereqs, format_missing, MissingPrereq};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("worker failed to start: {0}")]
    StartFailed(String),
    #[error("{operation} timed out after {}s", limit.as_secs())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("cannot {operation} a worker in state {state}")]
    InvalidState {
        operation: &'static str,
        state: WorkerState,
    },
    #[error("invalid worker state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },
    #[error("virt server protocol error: {0}")]
    Protocol(String),
    #[error("copy failed: {0}")]
    CopyFailed(String),
}
