use super::{exit_code_for_results, json_pretty, report, report_stage_error, result_json, spinner, Context};
use kiln_core::{RunRequest, Target};

pub fn run(ctx: &Context, target: &Target) -> Result<u8, String> {
    let request = RunRequest {
        target: target.clone(),
        bootstrap: true,
        build: None,
    };
    run_request(ctx, &request, "bootstrapping snapshot...")
}

/// Run `request` and report every stage it ran.
pub(crate) fn run_request(ctx: &Context, request: &RunRequest, message: &str) -> Result<u8, String> {
    let pipeline = ctx.pipeline();
    let pb = (!ctx.json).then(|| spinner(message));
    let results = match pipeline.run(request) {
        Ok(results) => results,
        Err(err) => {
            if let Some(pb) = &pb {
                pb.finish_and_clear();
            }
            return report_stage_error(&err, ctx.json);
        }
    };

    let worker = request.target.worker.as_deref().or(ctx.config.worker.as_deref());
    match &pb {
        Some(pb) => {
            for (i, result) in results.iter().enumerate() {
                if i == 0 {
                    report(pb, result, worker, ctx.verbose);
                } else {
                    report(&spinner(""), result, worker, ctx.verbose);
                }
            }
            if results.is_empty() {
                pb.finish_and_clear();
            }
        }
        None => {
            let values: Vec<_> = results.iter().map(result_json).collect();
            println!("{}", json_pretty(&values)?);
        }
    }
    Ok(exit_code_for_results(&results))
}
