use super::sbuild_tarball::run_request;
use super::Context;
use kiln_core::{BuildOptions, RunRequest, Target};
use std::path::PathBuf;

pub fn run(
    ctx: &Context,
    target: &Target,
    package: &str,
    output_dir: Option<PathBuf>,
    tarball_first: bool,
) -> Result<u8, String> {
    let request = RunRequest {
        target: target.clone(),
        bootstrap: tarball_first,
        build: Some(BuildOptions {
            package: package.to_owned(),
            output_dir,
        }),
    };
    let message = if tarball_first {
        format!("bootstrapping snapshot and building {package}...")
    } else {
        format!("building {package}...")
    };
    run_request(ctx, &request, &message)
}
