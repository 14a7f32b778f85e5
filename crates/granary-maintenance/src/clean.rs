use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use tokio::fs;
use tracing::{info, warn};

use granary_store::{read_shard_records, tool_name_from_shard, CheckpointStore};
use granary_types::ResultClassifier;

/// Outcome of one clean sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub records_removed: usize,
    pub checkpoints_updated: usize,
    /// Identifiers removed, grouped by tool; retried on the next run.
    pub removed_by_tool: HashMap<String, HashSet<String>>,
}

/// Purges records whose result exactly equals a known invalid marker, then
/// removes the matching identifiers from each affected tool's checkpoint in
/// the same pass. Only files that actually changed are rewritten; per-file
/// errors skip that file and the sweep continues.
pub async fn clean_invalid_records(
    data_dir: &Path,
    classifier: &ResultClassifier,
) -> anyhow::Result<CleanReport> {
    let mut records_removed = 0;
    let mut removed_by_tool: HashMap<String, HashSet<String>> = HashMap::new();

    let mut entries = fs::read_dir(data_dir)
        .await
        .with_context(|| format!("failed to read {}", data_dir.display()))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // Shard files only; the progress directory and stray files are
        // never touched.
        if tool_name_from_shard(name).is_none() {
            continue;
        }
        let records = match read_shard_records(&path).await {
            Ok(records) => records,
            Err(err) => {
                warn!(shard = %path.display(), error = %err, "skipping unreadable shard");
                continue;
            }
        };

        let original_len = records.len();
        let mut kept = Vec::with_capacity(original_len);
        for record in records {
            if classifier.is_invalid_result(&record.tool_result) {
                if let Some(identifier) = record.identifier() {
                    removed_by_tool
                        .entry(record.tool_name.clone())
                        .or_default()
                        .insert(identifier.to_string());
                }
                continue;
            }
            kept.push(record);
        }

        let removed = original_len - kept.len();
        if removed == 0 {
            continue;
        }
        if let Err(err) = granary_store::write_shard_records(&path, &kept).await {
            warn!(shard = %path.display(), error = %err, "failed to rewrite cleaned shard");
            continue;
        }
        records_removed += removed;
        info!(
            shard = %path.display(),
            removed,
            kept = kept.len(),
            "cleaned shard"
        );
    }

    let mut checkpoints_updated = 0;
    for (tool, identifiers) in &removed_by_tool {
        let checkpoint = CheckpointStore::load(data_dir, tool).await;
        let removed = checkpoint.remove_all(identifiers).await;
        if removed == 0 {
            continue;
        }
        match checkpoint.save().await {
            Ok(()) => {
                checkpoints_updated += 1;
                info!(tool = %tool, removed, "checkpoint entries removed");
            }
            Err(err) => {
                warn!(tool = %tool, error = %err, "failed to rewrite checkpoint");
            }
        }
    }

    let report = CleanReport {
        records_removed,
        checkpoints_updated,
        removed_by_tool,
    };

    info!(
        records_removed = report.records_removed,
        checkpoints_updated = report.checkpoints_updated,
        "clean sweep finished"
    );
    Ok(report)
}
