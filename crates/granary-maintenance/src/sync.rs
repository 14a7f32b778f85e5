use std::path::Path;

use tracing::{info, warn};

use granary_store::{discover_tools, load_tool_identifiers, Catalog, CheckpointStore};

/// Per-tool reconciliation result, measured against the catalog when one
/// is supplied.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub tool: String,
    pub completed: usize,
    pub remaining: Option<usize>,
    pub percent: Option<f64>,
    pub rewritten: bool,
}

/// Rebuilds every tool's checkpoint from the record store ground truth.
///
/// A checkpoint is rewritten when its completed set differs from the
/// identifiers actually present in the shards, when it carries deprecated
/// fields, or when it does not exist yet. Timing metadata survives only for
/// identifiers still in the canonical set. Per-tool failures are logged and
/// the sweep continues.
pub async fn sync_checkpoints(
    data_dir: &Path,
    catalog: Option<&Catalog>,
) -> anyhow::Result<Vec<SyncReport>> {
    let tools = discover_tools(data_dir).await?;
    info!(tools = tools.len(), "sync sweep started");

    let mut reports = Vec::new();
    for tool in tools {
        let canonical = load_tool_identifiers(data_dir, &tool).await;
        let checkpoint = CheckpointStore::load(data_dir, &tool).await;

        let needs_rewrite = !checkpoint.existed()
            || checkpoint.has_deprecated_fields().await
            || checkpoint.completed_set().await != canonical;

        let mut rewritten = false;
        if needs_rewrite {
            checkpoint.replace_completed(canonical.clone()).await;
            match checkpoint.save().await {
                Ok(()) => rewritten = true,
                Err(err) => {
                    warn!(tool = %tool, error = %err, "checkpoint rewrite failed");
                }
            }
        }

        let completed = canonical.len();
        let (remaining, percent) = match catalog {
            Some(catalog) if catalog.len() > 0 => {
                let remaining = catalog.len().saturating_sub(completed);
                (
                    Some(remaining),
                    Some(completed as f64 / catalog.len() as f64 * 100.0),
                )
            }
            _ => (None, None),
        };

        info!(
            tool = %tool,
            completed,
            remaining = remaining.map(|r| r as i64).unwrap_or(-1),
            rewritten,
            "tool synced"
        );
        reports.push(SyncReport {
            tool,
            completed,
            remaining,
            percent,
            rewritten,
        });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_store::RecordStore;
    use granary_types::{Record, ToolSpec};
    use std::fs as stdfs;

    fn tool() -> ToolSpec {
        ToolSpec {
            name: "crawl_company".to_string(),
            query: "full company profile".to_string(),
        }
    }

    #[tokio::test]
    async fn rebuilds_checkpoint_after_crash_between_flush_and_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path(), "crawl_company", u64::MAX, 1)
            .await
            .expect("store");
        store
            .append(Record::new(&tool(), "000001", "persisted result text".to_string()))
            .await
            .expect("append");
        // No checkpoint was ever saved: the crash window between record
        // flush and checkpoint save.

        let reports = sync_checkpoints(dir.path(), None).await.expect("sync");
        assert_eq!(reports.len(), 1);
        assert!(reports[0].rewritten);
        assert_eq!(reports[0].completed, 1);

        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        assert!(checkpoint.is_completed("000001").await);
    }

    #[tokio::test]
    async fn matching_checkpoint_is_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path(), "crawl_company", u64::MAX, 1)
            .await
            .expect("store");
        store
            .append(Record::new(&tool(), "000001", "persisted result text".to_string()))
            .await
            .expect("append");
        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        checkpoint.mark_completed("000001", Some(1.0)).await;
        checkpoint.save().await.expect("save");

        let reports = sync_checkpoints(dir.path(), None).await.expect("sync");
        assert!(!reports[0].rewritten);
    }

    #[tokio::test]
    async fn stale_entries_are_dropped_with_their_timing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path(), "crawl_company", u64::MAX, 1)
            .await
            .expect("store");
        store
            .append(Record::new(&tool(), "000001", "persisted result text".to_string()))
            .await
            .expect("append");
        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        checkpoint.mark_completed("000001", Some(1.0)).await;
        checkpoint.mark_completed("000099", Some(9.0)).await;
        checkpoint.save().await.expect("save");

        let reports = sync_checkpoints(dir.path(), None).await.expect("sync");
        assert!(reports[0].rewritten);

        let reloaded = CheckpointStore::load(dir.path(), "crawl_company").await;
        assert!(reloaded.is_completed("000001").await);
        assert!(!reloaded.is_completed("000099").await);
        let raw = stdfs::read_to_string(CheckpointStore::file_path(dir.path(), "crawl_company"))
            .expect("read");
        assert!(!raw.contains("000099"));
    }

    #[tokio::test]
    async fn catalog_yields_remaining_and_percent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path(), "crawl_company", u64::MAX, 1)
            .await
            .expect("store");
        store
            .append(Record::new(&tool(), "000001", "persisted result text".to_string()))
            .await
            .expect("append");

        let catalog_path = dir.path().join("catalog.csv");
        stdfs::write(&catalog_path, "symbol\n000001\n000002\n000003\n000004\n").expect("catalog");
        let catalog = Catalog::load(&catalog_path).await.expect("catalog");

        let reports = sync_checkpoints(dir.path(), Some(&catalog))
            .await
            .expect("sync");
        assert_eq!(reports[0].completed, 1);
        assert_eq!(reports[0].remaining, Some(3));
        assert_eq!(reports[0].percent, Some(25.0));
    }
}
