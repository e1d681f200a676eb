use super::{json_pretty, Context, EXIT_STORE_ERROR, EXIT_SUCCESS};
use kiln_core::Target;

pub fn run(ctx: &Context, suite: Option<String>, architecture: Option<String>) -> Result<u8, String> {
    let target = Target {
        vendor: ctx.vendor.clone(),
        suite,
        architecture,
        ..Target::default()
    };
    let (_, key) = ctx.pipeline().resolve_key(&target).map_err(|e| e.to_string())?;

    match ctx.store().verify(&key) {
        Ok(record) => {
            if ctx.json {
                let value = serde_json::json!({
                    "key": key,
                    "verified": true,
                    "record": record,
                });
                println!("{}", json_pretty(&value)?);
            } else {
                println!("{key}: ok (blake3 {})", record.blake3);
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if ctx.json {
                let value = serde_json::json!({
                    "key": key,
                    "verified": false,
                    "error": e.to_string(),
                });
                println!("{}", json_pretty(&value)?);
            } else {
                eprintln!("{key}: {e}");
            }
            Ok(EXIT_STORE_ERROR)
        }
    }
}
