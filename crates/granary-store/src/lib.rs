mod catalog;
mod checkpoint;
mod index;
mod shards;

pub use catalog::Catalog;
pub use checkpoint::{CheckpointStore, TimeRecord};
pub use index::RecordIndex;
pub use shards::{
    discover_tools, load_tool_identifiers, read_shard_records, shard_files, tool_name_from_shard,
    write_shard_records, RecordStore,
};

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tokio::fs;

/// Whole-file rewrite through a temp file plus atomic rename, so a crash
/// mid-write never leaves a half-written file visible to the next load.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let payload = serde_json::to_string_pretty(value).context("failed to serialize payload")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
