use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use tokio::fs;
use tracing::{info, warn};

use granary_store::{read_shard_records, write_shard_records};

/// Outcome of one store merge.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub files_copied: usize,
    pub files_merged: usize,
    pub records_added: usize,
}

/// Unions a source store into a destination store by identifier.
///
/// Matching relative paths are walked recursively. Files only the source
/// has are copied verbatim; files both sides have are parsed as record
/// lists and source records with a new identifier are appended at the end,
/// leaving destination records and their order untouched. The destination
/// file is rewritten only when something was actually added. Unparsable
/// pairs are skipped with a warning.
pub async fn merge_stores(source: &Path, dest: &Path) -> anyhow::Result<MergeReport> {
    let mut report = MergeReport::default();
    let mut stack = vec![source.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read {}", dir.display()))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(path);
                continue;
            }

            let relative = path
                .strip_prefix(source)
                .with_context(|| format!("path escapes source root: {}", path.display()))?;
            let target = dest.join(relative);

            if !target.exists() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                fs::copy(&path, &target)
                    .await
                    .with_context(|| format!("failed to copy {}", path.display()))?;
                report.files_copied += 1;
                info!(file = %relative.display(), "copied new file");
                continue;
            }

            let added = match merge_record_file(&path, &target).await {
                Ok(added) => added,
                Err(err) => {
                    warn!(file = %relative.display(), error = %err, "skipping unmergeable file");
                    continue;
                }
            };
            if added > 0 {
                report.files_merged += 1;
                report.records_added += added;
                info!(file = %relative.display(), added, "merged records");
            }
        }
    }

    info!(
        files_copied = report.files_copied,
        files_merged = report.files_merged,
        records_added = report.records_added,
        "merge finished"
    );
    Ok(report)
}

async fn merge_record_file(source: &Path, dest: &Path) -> anyhow::Result<usize> {
    let incoming = read_shard_records(source).await?;
    let mut existing = read_shard_records(dest).await?;

    let mut seen: HashSet<String> = existing
        .iter()
        .filter_map(|r| r.identifier().map(str::to_string))
        .collect();

    let mut added = 0;
    for record in incoming {
        let Some(identifier) = record.identifier().map(str::to_string) else {
            continue;
        };
        if seen.insert(identifier) {
            existing.push(record);
            added += 1;
        }
    }

    if added > 0 {
        write_shard_records(dest, &existing).await?;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_store::{read_shard_records, RecordStore};
    use granary_types::{Record, ToolSpec};

    fn tool() -> ToolSpec {
        ToolSpec {
            name: "crawl_company".to_string(),
            query: "full company profile".to_string(),
        }
    }

    async fn seed(dir: &Path, identifiers: &[&str]) {
        let store = RecordStore::open(dir, "crawl_company", u64::MAX, 1)
            .await
            .expect("store");
        for id in identifiers {
            store
                .append(Record::new(&tool(), id, format!("result text for {id}")))
                .await
                .expect("append");
        }
    }

    #[tokio::test]
    async fn union_by_identifier_preserves_destination_order() {
        let source = tempfile::tempdir().expect("source");
        let dest = tempfile::tempdir().expect("dest");
        seed(source.path(), &["000001", "000002", "000003"]).await;
        seed(dest.path(), &["000002", "000003", "000004"]).await;

        let shard = dest.path().join("crawl_company_01.json");
        let before = read_shard_records(&shard).await.expect("dest records");

        let report = merge_stores(source.path(), dest.path())
            .await
            .expect("merge");
        assert_eq!(report.records_added, 1);
        assert_eq!(report.files_merged, 1);
        assert_eq!(report.files_copied, 0);

        let after = read_shard_records(&shard).await.expect("dest records");
        let identifiers: Vec<_> = after.iter().filter_map(|r| r.identifier()).collect();
        assert_eq!(identifiers, ["000002", "000003", "000004", "000001"]);
        // Original destination records are byte-for-byte untouched.
        for (original, merged) in before.iter().zip(after.iter()) {
            assert_eq!(original.id, merged.id);
            assert_eq!(original.tool_result, merged.tool_result);
        }
    }

    #[tokio::test]
    async fn source_only_files_are_copied_verbatim() {
        let source = tempfile::tempdir().expect("source");
        let dest = tempfile::tempdir().expect("dest");
        seed(source.path(), &["000001"]).await;

        let report = merge_stores(source.path(), dest.path())
            .await
            .expect("merge");
        assert_eq!(report.files_copied, 1);
        assert_eq!(report.records_added, 0);

        let src_bytes =
            std::fs::read(source.path().join("crawl_company_01.json")).expect("source shard");
        let dst_bytes =
            std::fs::read(dest.path().join("crawl_company_01.json")).expect("dest shard");
        assert_eq!(src_bytes, dst_bytes);
    }

    #[tokio::test]
    async fn nothing_new_means_no_rewrite() {
        let source = tempfile::tempdir().expect("source");
        let dest = tempfile::tempdir().expect("dest");
        seed(source.path(), &["000001"]).await;
        seed(dest.path(), &["000001"]).await;

        let shard = dest.path().join("crawl_company_01.json");
        let before = std::fs::read(&shard).expect("dest shard");

        let report = merge_stores(source.path(), dest.path())
            .await
            .expect("merge");
        assert_eq!(report.records_added, 0);
        assert_eq!(report.files_merged, 0);
        assert_eq!(std::fs::read(&shard).expect("dest shard"), before);
    }

    #[tokio::test]
    async fn nested_directories_are_mirrored() {
        let source = tempfile::tempdir().expect("source");
        let dest = tempfile::tempdir().expect("dest");
        let nested = source.path().join("progress");
        std::fs::create_dir_all(&nested).expect("nested");
        std::fs::write(
            nested.join("crawl_company_progress.json"),
            r#"{"completed_codes": ["000001"], "time_records": {}}"#,
        )
        .expect("write");

        let report = merge_stores(source.path(), dest.path())
            .await
            .expect("merge");
        assert_eq!(report.files_copied, 1);
        assert!(dest
            .path()
            .join("progress")
            .join("crawl_company_progress.json")
            .exists());
    }
}
