//! The two build stages and their ordering.
//!
//! Every stage has the same shape: resolve the request into a `Plan` (pure,
//! fails with a `StageError`), take the per-key lock, get a working
//! directory, start a worker, run commands, then stop the worker and release
//! the working directory whatever happened. Failures after planning are
//! reported inside the `PipelineResult`, never as an `Err`.

use crate::commands::{self, SbuildInvocation};
use crate::concurrency::StoreLock;
use crate::mirror::MirrorConfig;
use crate::outcome::{PipelineResult, Stage, StageError};
use crate::source::PackageSource;
use crate::CoreError;
use kiln_runtime::{
    select_backend, CancelToken, RuntimeError, WorkerBackend, WorkerHandle, WorkerState,
    WorkerTimeouts,
};
use kiln_schema::{host_architecture, KilnConfig, SnapshotKey, Suite, WorkerDescriptor};
use kiln_store::{Provenance, SnapshotStore, StoreError, WorkingCopy, SNAPSHOT_EXTENSION};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

pub type BackendFactory =
    Box<dyn Fn(&WorkerDescriptor) -> Result<Box<dyn WorkerBackend>, RuntimeError> + Send + Sync>;

/// What to operate on. Unset fields fall back to the configuration file,
/// then to built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub vendor: Option<String>,
    pub suite: Option<String>,
    pub architecture: Option<String>,
    pub worker: Option<String>,
    pub mirror: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Archive package name (`name` or `name_version`), or the path of a
    /// local `.dsc` or `.changes` file.
    pub package: String,
    /// Copy the build products here when set.
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub target: Target,
    pub bootstrap: bool,
    pub build: Option<BuildOptions>,
}

/// A request with every name, path and URL resolved.
#[derive(Debug, Clone)]
struct Plan {
    suite: Suite,
    key: SnapshotKey,
    descriptor: WorkerDescriptor,
    mirror: String,
    /// Mirror and suite for each suite layered above the snapshot's root.
    overlays: Vec<(String, Suite)>,
}

enum StageEnd {
    Completed { artifact: Option<PathBuf> },
    Exited(i32),
}

pub struct BuildPipeline {
    config: KilnConfig,
    store: SnapshotStore,
    mirror_variable: Option<String>,
    cancel: CancelToken,
    backends: BackendFactory,
}

impl BuildPipeline {
    pub fn new(config: KilnConfig, store: SnapshotStore) -> Self {
        Self {
            config,
            store,
            mirror_variable: None,
            cancel: CancelToken::new(),
            backends: Box::new(select_backend),
        }
    }

    /// Value of the mirror environment variable, read by the caller.
    #[must_use]
    pub fn with_mirror_variable(mut self, value: Option<String>) -> Self {
        self.mirror_variable = value;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_backends<F>(mut self, factory: F) -> Self
    where
        F: Fn(&WorkerDescriptor) -> Result<Box<dyn WorkerBackend>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        self.backends = Box::new(factory);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Resolve vendor, suite and architecture into the suite to build for
    /// and the key of the snapshot it builds in.
    pub fn resolve_key(&self, target: &Target) -> Result<(Suite, SnapshotKey), CoreError> {
        let vendor_name = target
            .vendor
            .clone()
            .or_else(|| self.config.vendor.clone())
            .unwrap_or_else(|| "debian".to_owned());
        let vendor = self.config.vendor(&vendor_name);

        let suite_name = target
            .suite
            .clone()
            .or_else(|| vendor.default_suite.clone())
            .ok_or_else(|| CoreError::NoSuite(vendor_name.clone()))?;
        let suite = vendor.suite(&suite_name);

        let architecture = target
            .architecture
            .clone()
            .or_else(|| self.config.architecture.clone())
            .unwrap_or_else(host_architecture);

        let key = SnapshotKey::new(&vendor_name, &suite.root().name, &architecture)?;
        Ok((suite, key))
    }

    fn plan(&self, stage: Stage, target: &Target) -> Result<Plan, StageError> {
        self.try_plan(target)
            .map_err(|e| StageError::new(stage, &e))
    }

    fn try_plan(&self, target: &Target) -> Result<Plan, CoreError> {
        let (suite, key) = self.resolve_key(target)?;

        let worker = target
            .worker
            .clone()
            .or_else(|| self.config.worker.clone())
            .ok_or(CoreError::NoWorker)?;
        let descriptor = WorkerDescriptor::parse(&worker)?;
        descriptor.validate()?;

        let mirrors = MirrorConfig::new(
            target.mirror.clone(),
            self.mirror_variable.clone(),
            &self.config,
        );
        let mirror = mirrors.resolve_for(&suite.root().archive)?;
        let mut overlays = Vec::new();
        for layer in suite.hierarchy() {
            if layer.base.is_some() {
                overlays.push((mirrors.resolve_for(&layer.archive)?, layer.clone()));
            }
        }

        Ok(Plan {
            suite,
            key,
            descriptor,
            mirror,
            overlays,
        })
    }

    fn plan_build(
        &self,
        target: &Target,
        options: &BuildOptions,
    ) -> Result<(Plan, PackageSource), StageError> {
        let source = PackageSource::resolve(&options.package)
            .map_err(|e| StageError::new(Stage::Build, &e))?;
        Ok((self.plan(Stage::Build, target)?, source))
    }

    /// Create or replace the snapshot for the target's suite.
    pub fn bootstrap_tarball(&self, target: &Target) -> Result<PipelineResult, StageError> {
        let plan = self.plan(Stage::BootstrapTarball, target)?;
        Ok(self.run_tarball(&plan))
    }

    /// Build `options.package` in a working copy of the target's snapshot.
    pub fn build(&self, target: &Target, options: &BuildOptions) -> Result<PipelineResult, StageError> {
        let (plan, source) = self.plan_build(target, options)?;
        Ok(self.run_build(&plan, &source, options))
    }

    /// Run the requested stages in order. Both are planned before either
    /// starts, and a failed bootstrap means the build is not attempted.
    pub fn run(&self, request: &RunRequest) -> Result<Vec<PipelineResult>, StageError> {
        let tarball_plan = if request.bootstrap {
            Some(self.plan(Stage::BootstrapTarball, &request.target)?)
        } else {
            None
        };
        let build_plan = match &request.build {
            Some(options) => {
                let (plan, source) = self.plan_build(&request.target, options)?;
                Some((plan, source, options))
            }
            None => None,
        };

        let mut results = Vec::new();
        if let Some(plan) = tarball_plan {
            let result = self.run_tarball(&plan);
            let succeeded = result.succeeded();
            results.push(result);
            if !succeeded {
                if build_plan.is_some() {
                    warn!("bootstrap of {} failed, skipping build", plan.key);
                }
                return Ok(results);
            }
        }
        if let Some((plan, source, options)) = build_plan {
            results.push(self.run_build(&plan, &source, options));
        }
        Ok(results)
    }

    fn run_tarball(&self, plan: &Plan) -> PipelineResult {
        info!("bootstrapping {} from {}", plan.key, plan.mirror);
        let mut log = Vec::new();
        let mut worker_state = None;
        let result = self.tarball_stage(plan, &mut log, &mut worker_state);
        finish(Stage::BootstrapTarball, result, log, worker_state)
    }

    fn run_build(&self, plan: &Plan, source: &PackageSource, options: &BuildOptions) -> PipelineResult {
        info!("building {} for {} in {}", options.package, plan.suite, plan.key);
        let mut log = Vec::new();
        let mut worker_state = None;
        let result = self.build_stage(plan, source, options, &mut log, &mut worker_state);
        finish(Stage::Build, result, log, worker_state)
    }

    fn tarball_stage(
        &self,
        plan: &Plan,
        log: &mut Vec<u8>,
        worker_state: &mut Option<WorkerState>,
    ) -> Result<StageEnd, CoreError> {
        let _lock = StoreLock::acquire(&self.store.layout().key_lock_file(&plan.key))?;
        self.prepare_store()?;

        let scratch = self.store.create_scratch(&plan.key)?;
        let mut worker = self.worker(plan)?;
        let result = self.drive_tarball(plan, &mut worker, &scratch, log);
        *worker_state = Some(shutdown(&mut worker));
        scratch.release();
        result
    }

    fn drive_tarball(
        &self,
        plan: &Plan,
        worker: &mut WorkerHandle,
        scratch: &WorkingCopy,
        log: &mut Vec<u8>,
    ) -> Result<StageEnd, CoreError> {
        worker.start(None)?;
        let guest = guest_scratch(worker)?;
        let chroot = format!("{guest}/chroot");
        let out_dir = format!("{guest}/out");
        let name = format!("{}.{SNAPSHOT_EXTENSION}", plan.key.file_stem());
        let guest_tarball = format!("{out_dir}/{name}");

        let steps = [
            commands::apt_update(),
            commands::apt_install(&["debootstrap"]),
            commands::make_dir(&out_dir, None),
            commands::debootstrap(plan.suite.root(), &plan.key.architecture, &chroot, &plan.mirror),
            commands::pack_tarball(&chroot, &guest_tarball),
        ];
        if let Some(code) = run_steps(worker, &steps, log)? {
            return Ok(StageEnd::Exited(code));
        }

        let produced = scratch.dir().join(&name);
        worker.copy_out(&guest_tarball, &produced)?;
        self.cancel.check()?;

        let provenance = Provenance {
            mirror: plan.mirror.clone(),
            worker: plan.descriptor.to_string(),
        };
        let record = self.store.install(&plan.key, &produced, &provenance)?;
        let _ = writeln!(log, "installed {} ({} bytes, blake3 {})", plan.key, record.size, record.blake3);
        Ok(StageEnd::Completed {
            artifact: Some(self.store.resolve_path(&plan.key)),
        })
    }

    fn build_stage(
        &self,
        plan: &Plan,
        source: &PackageSource,
        options: &BuildOptions,
        log: &mut Vec<u8>,
        worker_state: &mut Option<WorkerState>,
    ) -> Result<StageEnd, CoreError> {
        let _lock = StoreLock::acquire_shared(&self.store.layout().key_lock_file(&plan.key))?;

        let base = self.store.resolve_path(&plan.key);
        if !self.store.exists(&base) {
            let _ = writeln!(
                log,
                "no snapshot for {} at {}; run sbuild-tarball for this suite first",
                plan.key,
                base.display()
            );
            return Err(StoreError::SnapshotMissing(base).into());
        }
        self.prepare_store()?;

        let working = self.store.acquire_working_copy(&base)?;
        let mut worker = self.worker(plan)?;
        let result = self.drive_build(plan, source, options, &mut worker, &working, log);
        *worker_state = Some(shutdown(&mut worker));
        working.release();
        result
    }

    fn drive_build(
        &self,
        plan: &Plan,
        source: &PackageSource,
        options: &BuildOptions,
        worker: &mut WorkerHandle,
        working: &WorkingCopy,
        log: &mut Vec<u8>,
    ) -> Result<StageEnd, CoreError> {
        let image = working
            .image()
            .ok_or_else(|| StoreError::SnapshotMissing(working.dir().to_path_buf()))?;
        worker.start(Some(image))?;
        let tarball = worker
            .attached_image()
            .ok_or_else(|| RuntimeError::CopyFailed("snapshot was not attached to the worker".to_owned()))?
            .to_owned();
        let out_dir = format!("{}/out", guest_scratch(worker)?);

        let setup = [
            commands::apt_update(),
            commands::apt_install(&["sbuild", "schroot"]),
        ];
        if let Some(code) = run_steps(worker, &setup, log)? {
            return Ok(StageEnd::Exited(code));
        }

        let conf = working.dir().join("kiln-schroot.conf");
        std::fs::write(&conf, commands::schroot_config(&tarball))?;
        let staged = worker.copy_in(&conf)?;

        let package = match source {
            PackageSource::Archive(name) => name.clone(),
            PackageSource::Local { dsc, files } => {
                for file in files {
                    worker.copy_in(file)?;
                }
                let guest_dsc = worker.copy_in(dsc)?;
                let _ = writeln!(log, "copied {} into the worker as {guest_dsc}", dsc.display());
                guest_dsc
            }
        };

        let sbuild = SbuildInvocation {
            suite: &plan.suite,
            architecture: &plan.key.architecture,
            overlays: plan.overlays.iter().map(|(m, s)| (m.clone(), s)).collect(),
            parallel: self.config.parallel,
            package: &package,
            out_dir: &out_dir,
        };
        let steps = [
            commands::install_schroot_config(&staged),
            commands::make_dir(&out_dir, Some("sbuild")),
            sbuild.argv(),
        ];
        if let Some(code) = run_steps(worker, &steps, log)? {
            return Ok(StageEnd::Exited(code));
        }

        let artifact = match &options.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                // Both sides end in '/' so the directory's contents are copied.
                let mut host = dir.clone().into_os_string();
                host.push("/");
                let host = PathBuf::from(host);
                worker.copy_out(&format!("{out_dir}/"), &host)?;
                info!("build products copied to {}", dir.display());
                Some(dir.clone())
            }
            None => None,
        };
        Ok(StageEnd::Completed { artifact })
    }

    fn worker(&self, plan: &Plan) -> Result<WorkerHandle, CoreError> {
        let backend = (self.backends)(&plan.descriptor)?;
        if !backend.available() {
            return Err(RuntimeError::BackendUnavailable(plan.descriptor.kind.to_string()).into());
        }
        Ok(WorkerHandle::new(
            plan.descriptor.clone(),
            backend,
            WorkerTimeouts::from(&self.config.timeouts),
            self.cancel.clone(),
        ))
    }

    /// Make sure the layout exists and clear out working copies left by
    /// processes that died, unless someone else is already doing so.
    fn prepare_store(&self) -> Result<(), CoreError> {
        let layout = self.store.layout();
        layout.initialize()?;
        if let Some(_guard) = StoreLock::try_acquire(&layout.lock_file())? {
            let swept = self.store.sweep_stale_work()?;
            if swept > 0 {
                info!("removed {swept} stale working copies");
            }
        }
        Ok(())
    }
}

fn guest_scratch(worker: &WorkerHandle) -> Result<String, RuntimeError> {
    worker
        .scratch_dir()
        .map(str::to_owned)
        .ok_or_else(|| RuntimeError::Protocol("worker has no scratch directory".to_owned()))
}

/// Run commands in order, appending their output to `log`. Returns the
/// exit code of the first command that fails.
fn run_steps(
    worker: &mut WorkerHandle,
    steps: &[Vec<String>],
    log: &mut Vec<u8>,
) -> Result<Option<i32>, CoreError> {
    let env = commands::worker_env();
    for step in steps {
        let line = step.join(" ");
        info!("running: {line}");
        let _ = writeln!(log, "$ {line}");
        let output = worker.execute(step, &env)?;
        log.extend_from_slice(&output.combined());
        if !output.success() {
            warn!("`{line}` exited with status {}", output.exit_code);
            return Ok(Some(output.exit_code));
        }
    }
    Ok(None)
}

fn shutdown(worker: &mut WorkerHandle) -> WorkerState {
    if let Err(e) = worker.stop() {
        warn!("error while stopping worker: {e}");
    }
    worker.state()
}

fn finish(
    stage: Stage,
    result: Result<StageEnd, CoreError>,
    mut log: Vec<u8>,
    worker_state: Option<WorkerState>,
) -> PipelineResult {
    let mut report = match result {
        Ok(StageEnd::Completed { artifact }) => PipelineResult::success(stage, log, artifact),
        Ok(StageEnd::Exited(code)) => PipelineResult::non_zero(stage, code, log),
        Err(e) => {
            warn!("{stage} failed: {e}");
            let _ = writeln!(log, "kiln: {e}");
            PipelineResult::from_error(stage, &e, log)
        }
    };
    report.worker_state = worker_state;
    report
}
