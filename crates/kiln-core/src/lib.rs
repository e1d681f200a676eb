//! Build pipeline for kiln.
//!
//! This crate ties the schema, store and runtime layers together into
//! `BuildPipeline`: it resolves a request into a snapshot key, worker and
//! mirror before touching anything, then runs the bootstrap-tarball and build
//! stages in a worker, always stopping the worker and releasing the working
//! copy before reporting a per-stage `PipelineResult`.

pub mod commands;
pub mod concurrency;
pub mod mirror;
pub mod outcome;
pub mod pipeline;
pub mod source;

pub use concurrency::{install_signal_handler, StoreLock};
pub use mirror::MirrorConfig;
pub use outcome::{FailureCause, Outcome, PipelineResult, Stage, StageError};
pub use pipeline::{BackendFactory, BuildOptions, BuildPipeline, RunRequest, Target};
pub use source::PackageSource;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Schema(#[from] kiln_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] kiln_store::StoreError),
    #[error("worker error: {0}")]
    Runtime(#[from] kiln_runtime::RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no mirror configured for archive '{0}': pass --mirror, set KILN_MIRROR, or add [mirrors] to the config file")]
    NoMirrorConfigured(String),
    #[error("no worker given: pass --worker or set `worker` in the config file")]
    NoWorker,
    #[error("no suite given and vendor '{0}' has no default suite")]
    NoSuite(String),
    #[error("invalid source package: {0}")]
    InvalidSource(String),
}
