pub mod list;
pub mod remove;
pub mod sbuild;
pub mod sbuild_tarball;
pub mod verify;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{BuildPipeline, FailureCause, Outcome, PipelineResult, StageError};
use kiln_runtime::{check_qemu_prereqs, format_missing, CancelToken};
use kiln_schema::{KilnConfig, WorkerDescriptor, WorkerKind};
use kiln_store::{SnapshotStore, StoreLayout};
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
/// A command inside the worker exited non-zero.
pub const EXIT_BUILD_FAILED: u8 = 1;
/// Bad descriptor, key, mirror, or configuration file.
pub const EXIT_CONFIG_ERROR: u8 = 2;
/// The worker could not be started, timed out, or misbehaved.
pub const EXIT_WORKER_ERROR: u8 = 3;
/// Snapshot storage is unusable or a snapshot failed verification.
pub const EXIT_STORE_ERROR: u8 = 4;
/// Nothing was built because the snapshot does not exist yet.
pub const EXIT_SKIPPED: u8 = 77;
pub const EXIT_CANCELLED: u8 = 130;

pub const MIRROR_ENV: &str = "KILN_MIRROR";

pub struct Context {
    pub config: KilnConfig,
    pub storage: PathBuf,
    pub vendor: Option<String>,
    pub json: bool,
    pub verbose: bool,
    pub cancel: CancelToken,
}

impl Context {
    pub fn store(&self) -> SnapshotStore {
        SnapshotStore::new(StoreLayout::new(&self.storage))
    }

    pub fn pipeline(&self) -> BuildPipeline {
        BuildPipeline::new(self.config.clone(), self.store())
            .with_mirror_variable(std::env::var(MIRROR_ENV).ok())
            .with_cancel(self.cancel.clone())
    }
}

pub fn exit_code_for(cause: Option<FailureCause>) -> u8 {
    match cause {
        None => EXIT_SUCCESS,
        Some(FailureCause::NonZeroExit { .. }) => EXIT_BUILD_FAILED,
        Some(FailureCause::SnapshotMissing) => EXIT_SKIPPED,
        Some(FailureCause::Cancelled) => EXIT_CANCELLED,
        Some(
            FailureCause::InvalidDescriptor
            | FailureCause::InvalidKey
            | FailureCause::NoMirrorConfigured
            | FailureCause::InvalidSource,
        ) => EXIT_CONFIG_ERROR,
        Some(
            FailureCause::WorkerStartFailed
            | FailureCause::WorkerTimeout
            | FailureCause::WorkerError
            | FailureCause::InvalidWorkerState,
        ) => EXIT_WORKER_ERROR,
        Some(FailureCause::Storage) => EXIT_STORE_ERROR,
    }
}

/// Exit code for a sequence of stages: the first stage that did not
/// succeed decides.
pub fn exit_code_for_results(results: &[PipelineResult]) -> u8 {
    results
        .iter()
        .find(|r| !r.succeeded())
        .map_or(EXIT_SUCCESS, |r| exit_code_for(r.cause))
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn result_json(result: &PipelineResult) -> serde_json::Value {
    serde_json::json!({
        "stage": result.stage,
        "outcome": result.outcome,
        "exit_code": result.exit_code,
        "cause": result.cause,
        "message": result.message,
        "artifact": result.artifact,
        "worker_state": result.worker_state,
        "log": result.log_text(),
    })
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_outcome(outcome: Outcome) -> String {
    use console::Style;
    let text = outcome.to_string();
    match outcome {
        Outcome::Success => Style::new().green().apply_to(text).to_string(),
        Outcome::Skipped => Style::new().yellow().apply_to(text).to_string(),
        Outcome::Failed => Style::new().red().bold().apply_to(text).to_string(),
    }
}

/// Finish the spinner for one stage and print what the user needs to act on.
/// `worker` is the descriptor string the stage ran with.
pub fn report(pb: &ProgressBar, result: &PipelineResult, worker: Option<&str>, verbose: bool) {
    let summary = match (&result.message, &result.artifact) {
        (Some(message), _) => format!("{} {}: {message}", result.stage, colorize_outcome(result.outcome)),
        (None, Some(artifact)) => format!(
            "{} {}: {}",
            result.stage,
            colorize_outcome(result.outcome),
            artifact.display()
        ),
        (None, None) => format!("{} {}", result.stage, colorize_outcome(result.outcome)),
    };
    if result.succeeded() {
        spin_ok(pb, &summary);
    } else {
        spin_fail(pb, &summary);
    }

    let log = result.log_text();
    if !log.is_empty() && (verbose || result.outcome == Outcome::Failed) {
        eprintln!("--- {} log ---", result.stage);
        eprint!("{log}");
        if !log.ends_with('\n') {
            eprintln!();
        }
    }
    if wants_qemu_hint(result, worker) {
        let missing = check_qemu_prereqs();
        if !missing.is_empty() {
            eprint!("{}", format_missing(&missing));
        }
    }
}

/// Missing host tools only explain a start failure of a qemu worker.
fn wants_qemu_hint(result: &PipelineResult, worker: Option<&str>) -> bool {
    result.cause == Some(FailureCause::WorkerStartFailed)
        && worker
            .and_then(|w| WorkerDescriptor::parse(w).ok())
            .is_some_and(|d| d.kind == WorkerKind::Qemu)
}

/// Report a request rejected before any stage ran.
pub fn report_stage_error(err: &StageError, json: bool) -> Result<u8, String> {
    if json {
        let value = serde_json::json!({
            "stage": err.stage,
            "outcome": Outcome::Failed,
            "cause": err.cause,
            "message": err.message,
        });
        println!("{}", json_pretty(&value)?);
    } else {
        eprintln!("error: {err}");
    }
    Ok(exit_code_for(Some(err.cause)))
}
