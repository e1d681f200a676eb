use super::{json_pretty, Context, EXIT_SUCCESS};
use kiln_core::{StoreLock, Target};

pub fn run(ctx: &Context, suite: String, architecture: Option<String>) -> Result<u8, String> {
    let target = Target {
        vendor: ctx.vendor.clone(),
        suite: Some(suite),
        architecture,
        ..Target::default()
    };
    let (_, key) = ctx.pipeline().resolve_key(&target).map_err(|e| e.to_string())?;

    let store = ctx.store();
    let _lock = StoreLock::acquire(&store.layout().key_lock_file(&key))
        .map_err(|e| format!("store lock: {e}"))?;
    let removed = store.remove(&key).map_err(|e| format!("store error: {e}"))?;

    if ctx.json {
        let value = serde_json::json!({ "key": key, "removed": removed });
        println!("{}", json_pretty(&value)?);
    } else if removed {
        println!("removed snapshot {key}");
    } else {
        println!("no snapshot for {key}");
    }
    Ok(EXIT_SUCCESS)
}
