mod commands;

use clap::{Args, Parser, Subcommand};
use commands::{Context, EXIT_CONFIG_ERROR, EXIT_STORE_ERROR, EXIT_WORKER_ERROR};
use kiln_core::{install_signal_handler, Target};
use kiln_runtime::CancelToken;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Bootstrap sbuild snapshots and build Debian packages in throwaway VM workers"
)]
struct Cli {
    /// Vendor (distribution family) whose naming and suites apply.
    #[arg(long, global = true)]
    vendor: Option<String>,

    /// Directory holding snapshot tarballs [default: $XDG_CACHE_HOME/kiln].
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Configuration file [default: $KILN_CONFIG, then $XDG_CONFIG_HOME/kiln/config.toml].
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// Worker descriptor, `<kind> <locator>`, e.g. "qemu /srv/kiln/worker.qcow2".
    #[arg(long)]
    worker: Option<String>,
    /// Package mirror base URL [default: $KILN_MIRROR, then the config file].
    #[arg(long)]
    mirror: Option<String>,
    /// Suite (release) to target [default: the vendor's default suite].
    #[arg(long)]
    suite: Option<String>,
    /// Debian architecture name [default: the host's].
    #[arg(long)]
    architecture: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or replace the sbuild snapshot tarball for a suite.
    SbuildTarball {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Build a source package in a working copy of a suite's snapshot.
    Sbuild {
        #[command(flatten)]
        target: TargetArgs,
        /// Bootstrap the snapshot first; a failed bootstrap skips the build.
        #[arg(long, default_value_t = false)]
        tarball_first: bool,
        /// Copy the build products into this directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Source package to build: `name`, `name_version`, or the path of a
        /// local .dsc or .changes file.
        package: String,
    },
    /// List snapshots under the storage root.
    List,
    /// Check a snapshot against its recorded digest.
    Verify {
        /// Suite whose snapshot to check [default: the vendor's default suite].
        suite: Option<String>,
        #[arg(long)]
        architecture: Option<String>,
    },
    /// Delete a suite's snapshot.
    Remove {
        /// Suite whose snapshot to delete.
        suite: String,
        #[arg(long)]
        architecture: Option<String>,
    },
}

impl TargetArgs {
    fn into_target(self, vendor: Option<String>) -> Target {
        Target {
            vendor,
            suite: self.suite,
            architecture: self.architecture,
            worker: self.worker,
            mirror: self.mirror,
        }
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe") || msg.contains("failed printing to stdout") {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config = match kiln_schema::load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let storage = cli
        .storage
        .clone()
        .or_else(|| config.storage.clone())
        .unwrap_or_else(kiln_schema::default_storage_root);

    let cancel = CancelToken::new();
    if matches!(cli.command, Commands::SbuildTarball { .. } | Commands::Sbuild { .. }) {
        install_signal_handler(cancel.clone());
    }

    let ctx = Context {
        config,
        storage,
        vendor: cli.vendor,
        json: cli.json,
        verbose: cli.verbose || cli.trace,
        cancel,
    };

    let result = match cli.command {
        Commands::SbuildTarball { target } => {
            let target = target.into_target(ctx.vendor.clone());
            commands::sbuild_tarball::run(&ctx, &target)
        }
        Commands::Sbuild {
            target,
            tarball_first,
            output_dir,
            package,
        } => {
            let target = target.into_target(ctx.vendor.clone());
            commands::sbuild::run(&ctx, &target, &package, output_dir, tarball_first)
        }
        Commands::List => commands::list::run(&ctx),
        Commands::Verify {
            suite,
            architecture,
        } => commands::verify::run(&ctx, suite, architecture),
        Commands::Remove {
            suite,
            architecture,
        } => commands::remove::run(&ctx, suite, architecture),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else if msg.starts_with("worker error:") {
                EXIT_WORKER_ERROR
            } else {
                EXIT_CONFIG_ERROR
            };
            ExitCode::from(code)
        }
    }
}
