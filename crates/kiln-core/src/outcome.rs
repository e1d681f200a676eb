use crate::CoreError;
use kiln_runtime::{RuntimeError, WorkerState};
use kiln_schema::SchemaError;
use kiln_store::StoreError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    BootstrapTarball,
    Build,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BootstrapTarball => "sbuild-tarball",
            Self::Build => "sbuild",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Skipped,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        })
    }
}

/// Why a stage did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureCause {
    InvalidDescriptor,
    InvalidKey,
    NoMirrorConfigured,
    SnapshotMissing,
    WorkerStartFailed,
    WorkerTimeout,
    WorkerError,
    InvalidWorkerState,
    NonZeroExit { code: i32 },
    InvalidSource,
    Cancelled,
    /// The snapshot store or a host-side file could not be read or written.
    Storage,
}

impl FailureCause {
    pub fn of(error: &CoreError) -> Self {
        match error {
            CoreError::Schema(SchemaError::InvalidDescriptor { .. }) | CoreError::NoWorker => {
                Self::InvalidDescriptor
            }
            CoreError::Schema(_) | CoreError::NoSuite(_) => Self::InvalidKey,
            CoreError::NoMirrorConfigured(_) => Self::NoMirrorConfigured,
            CoreError::Store(StoreError::SnapshotMissing(_)) => Self::SnapshotMissing,
            CoreError::Store(_) | CoreError::Io(_) => Self::Storage,
            CoreError::InvalidSource(_) => Self::InvalidSource,
            CoreError::Runtime(e) => match e {
                RuntimeError::Timeout { .. } => Self::WorkerTimeout,
                RuntimeError::StartFailed(_) | RuntimeError::BackendUnavailable(_) => {
                    Self::WorkerStartFailed
                }
                RuntimeError::Cancelled => Self::Cancelled,
                RuntimeError::InvalidState { .. } | RuntimeError::InvalidTransition { .. } => {
                    Self::InvalidWorkerState
                }
                RuntimeError::Protocol(_) | RuntimeError::CopyFailed(_) | RuntimeError::Io(_) => {
                    Self::WorkerError
                }
            },
        }
    }

    /// Detected before any worker or storage is touched.
    pub fn is_configuration(self) -> bool {
        matches!(
            self,
            Self::InvalidDescriptor
                | Self::InvalidKey
                | Self::NoMirrorConfigured
                | Self::InvalidSource
        )
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDescriptor => f.write_str("invalid worker descriptor"),
            Self::InvalidKey => f.write_str("invalid vendor, suite or architecture"),
            Self::NoMirrorConfigured => f.write_str("no mirror configured"),
            Self::SnapshotMissing => f.write_str("snapshot missing"),
            Self::WorkerStartFailed => f.write_str("worker failed to start"),
            Self::WorkerTimeout => f.write_str("worker timed out"),
            Self::WorkerError => f.write_str("worker error"),
            Self::InvalidWorkerState => f.write_str("invalid worker state"),
            Self::NonZeroExit { code } => write!(f, "command exited with status {code}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::InvalidSource => f.write_str("invalid source package"),
            Self::Storage => f.write_str("storage error"),
        }
    }
}

/// A configuration problem, reported before any stage started.
#[derive(Debug, Error)]
#[error("{stage}: {message}")]
pub struct StageError {
    pub stage: Stage,
    pub cause: FailureCause,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, error: &CoreError) -> Self {
        Self {
            stage,
            cause: FailureCause::of(error),
            message: error.to_string(),
        }
    }
}

/// What one stage did.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub stage: Stage,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub captured_log: Vec<u8>,
    pub cause: Option<FailureCause>,
    pub message: Option<String>,
    /// Installed snapshot for the bootstrap stage, output directory for a
    /// build that copied its products back.
    pub artifact: Option<PathBuf>,
    /// Final worker state; `None` when no worker was created.
    pub worker_state: Option<WorkerState>,
}

impl PipelineResult {
    pub(crate) fn success(stage: Stage, captured_log: Vec<u8>, artifact: Option<PathBuf>) -> Self {
        Self {
            stage,
            outcome: Outcome::Success,
            exit_code: Some(0),
            captured_log,
            cause: None,
            message: None,
            artifact,
            worker_state: None,
        }
    }

    pub(crate) fn non_zero(stage: Stage, code: i32, captured_log: Vec<u8>) -> Self {
        Self {
            stage,
            outcome: Outcome::Failed,
            exit_code: Some(code),
            captured_log,
            cause: Some(FailureCause::NonZeroExit { code }),
            message: Some(format!("command exited with status {code}")),
            artifact: None,
            worker_state: None,
        }
    }

    /// A missing snapshot is a skip; every other error is a failure.
    pub(crate) fn from_error(stage: Stage, error: &CoreError, captured_log: Vec<u8>) -> Self {
        let cause = FailureCause::of(error);
        let outcome = if cause == FailureCause::SnapshotMissing {
            Outcome::Skipped
        } else {
            Outcome::Failed
        };
        Self {
            stage,
            outcome,
            exit_code: None,
            captured_log,
            cause: Some(cause),
            message: Some(error.to_string()),
            artifact: None,
            worker_state: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn log_text(&self) -> String {
        String::from_utf8_lossy(&self.captured_log).into_owned()
    }
}
