use super::{json_pretty, Context, EXIT_SUCCESS};
use console::Style;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let entries = ctx
        .store()
        .list()
        .map_err(|e| format!("store error: {e}"))?;

    if ctx.json {
        let values: Vec<_> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "key": entry.key,
                    "path": entry.path,
                    "size": entry.size,
                    "record": entry.record,
                })
            })
            .collect();
        println!("{}", json_pretty(&values)?);
    } else if entries.is_empty() {
        println!("no snapshots in {}", ctx.storage.display());
    } else {
        println!("{:<32} {:>12} {:<26} MIRROR", "KEY", "SIZE", "CREATED");
        for entry in &entries {
            match &entry.record {
                Some(record) => println!(
                    "{:<32} {:>12} {:<26} {}",
                    entry.key.to_string(),
                    entry.size,
                    record.created_at,
                    record.mirror
                ),
                None => println!(
                    "{:<32} {:>12} {}",
                    entry.key.to_string(),
                    entry.size,
                    Style::new().dim().apply_to("(no record)")
                ),
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
