use crate::layout::StoreLayout;
use crate::snapshot::SnapshotRecord;
use crate::StoreError;
use kiln_schema::SnapshotKey;
use std::fs::{self, File};
use std::path::Path;

/// Streaming blake3 digest of a file, hex encoded.
pub fn digest_file(path: &Path) -> Result<String, StoreError> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Recompute a snapshot's digest and compare it with its sidecar record.
pub fn verify_snapshot(layout: &StoreLayout, key: &SnapshotKey) -> Result<SnapshotRecord, StoreError> {
    let image = layout.snapshot_path(key);
    if !image.is_file() {
        return Err(StoreError::SnapshotMissing(image));
    }
    let record_path = layout.record_path(key);
    if !record_path.is_file() {
        return Err(StoreError::RecordMissing(key.to_string()));
    }
    let record: SnapshotRecord = serde_json::from_str(&fs::read_to_string(record_path)?)?;

    let actual = digest_file(&image)?;
    if actual != record.blake3 {
        return Err(StoreError::IntegrityFailure {
            key: key.to_string(),
            expected: record.blake3,
            actual,
        });
    }
    Ok(record)
}
