use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use crate::catalog::Catalog;
use crate::write_json_atomic;

/// Timing metadata for one completed identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRecord {
    pub elapsed_seconds: f64,
    pub completed_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    completed_codes: Vec<String>,
    #[serde(default)]
    time_records: HashMap<String, TimeRecord>,
    /// Fields written by older versions of the tracker. Captured so Sync
    /// knows the file needs a canonical rewrite; never interpreted.
    #[serde(flatten)]
    deprecated: serde_json::Map<String, Value>,
}

#[derive(Debug, Default)]
struct CheckpointState {
    completed: HashSet<String>,
    time_records: HashMap<String, TimeRecord>,
    has_deprecated_fields: bool,
}

/// Per-tool resume index: the set of completed identifiers plus timing
/// metadata. Derived data: the record store is authoritative and this
/// file is rebuilt from it by Sync whenever they disagree.
pub struct CheckpointStore {
    path: PathBuf,
    existed: bool,
    state: RwLock<CheckpointState>,
}

impl CheckpointStore {
    pub fn progress_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("progress")
    }

    pub fn file_path(data_dir: &Path, tool_name: &str) -> PathBuf {
        Self::progress_dir(data_dir).join(format!("{tool_name}_progress.json"))
    }

    /// Loads persisted state. A missing file yields an empty checkpoint; a
    /// corrupt one yields an empty checkpoint with a warning. Never fatal.
    pub async fn load(data_dir: &Path, tool_name: &str) -> Self {
        let path = Self::file_path(data_dir, tool_name);
        let (state, existed) = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<CheckpointFile>(&raw) {
                Ok(file) => (
                    CheckpointState {
                        completed: file.completed_codes.into_iter().collect(),
                        time_records: file.time_records,
                        has_deprecated_fields: !file.deprecated.is_empty(),
                    },
                    true,
                ),
                Err(err) => {
                    warn!(
                        checkpoint = %path.display(),
                        error = %err,
                        "checkpoint unreadable, starting from empty state"
                    );
                    (CheckpointState::default(), true)
                }
            },
            Err(_) => (CheckpointState::default(), false),
        };
        Self {
            path,
            existed,
            state: RwLock::new(state),
        }
    }

    /// Whether a checkpoint file was present on disk at load time.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Idempotent: re-marking an identifier only refreshes its timing.
    pub async fn mark_completed(&self, identifier: &str, elapsed_seconds: Option<f64>) {
        let mut state = self.state.write().await;
        state.completed.insert(identifier.to_string());
        if let Some(elapsed) = elapsed_seconds {
            state.time_records.insert(
                identifier.to_string(),
                TimeRecord {
                    elapsed_seconds: (elapsed * 100.0).round() / 100.0,
                    completed_at: Utc::now().to_rfc3339(),
                },
            );
        }
    }

    pub async fn is_completed(&self, identifier: &str) -> bool {
        self.state.read().await.completed.contains(identifier)
    }

    pub async fn completed_len(&self) -> usize {
        self.state.read().await.completed.len()
    }

    pub async fn completed_set(&self) -> HashSet<String> {
        self.state.read().await.completed.clone()
    }

    pub async fn has_deprecated_fields(&self) -> bool {
        self.state.read().await.has_deprecated_fields
    }

    /// Catalog identifiers not yet completed, in catalog order.
    pub async fn remaining(&self, catalog: &Catalog) -> Vec<String> {
        let state = self.state.read().await;
        catalog
            .identifiers()
            .iter()
            .filter(|id| !state.completed.contains(*id))
            .cloned()
            .collect()
    }

    /// Removes identifiers from the completed set and the timing map in one
    /// pass. Returns how many were actually present. Used by Clean.
    pub async fn remove_all(&self, identifiers: &HashSet<String>) -> usize {
        let mut state = self.state.write().await;
        let mut removed = 0;
        for identifier in identifiers {
            if state.completed.remove(identifier) {
                removed += 1;
            }
            state.time_records.remove(identifier);
        }
        removed
    }

    /// Overwrites the completed set with the canonical one derived from the
    /// record store. Timing entries survive only for identifiers still in
    /// the set; deprecated fields are dropped on the next save.
    pub async fn replace_completed(&self, canonical: HashSet<String>) {
        let mut state = self.state.write().await;
        state.time_records.retain(|id, _| canonical.contains(id));
        state.completed = canonical;
        state.has_deprecated_fields = false;
    }

    /// Serializes the full state atomically. Failures are returned so the
    /// caller can log and retry at the next save point.
    pub async fn save(&self) -> anyhow::Result<()> {
        let file = {
            let state = self.state.read().await;
            let mut completed_codes: Vec<String> = state.completed.iter().cloned().collect();
            completed_codes.sort();
            CheckpointFile {
                completed_codes,
                time_records: state.time_records.clone(),
                deprecated: serde_json::Map::new(),
            }
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_json_atomic(&self.path, &file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        assert!(!checkpoint.existed());
        assert_eq!(checkpoint.completed_len().await, 0);
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = CheckpointStore::file_path(dir.path(), "crawl_company");
        stdfs::create_dir_all(path.parent().expect("parent")).expect("progress dir");
        stdfs::write(&path, "{not json").expect("write");

        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        assert!(checkpoint.existed());
        assert_eq!(checkpoint.completed_len().await, 0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        checkpoint.mark_completed("000001", Some(1.234)).await;
        checkpoint.mark_completed("600519", None).await;
        checkpoint.save().await.expect("save");

        let reloaded = CheckpointStore::load(dir.path(), "crawl_company").await;
        assert!(reloaded.is_completed("000001").await);
        assert!(reloaded.is_completed("600519").await);
        assert_eq!(reloaded.completed_len().await, 2);

        // No temp file left behind by the atomic rename.
        let leftovers: Vec<_> = stdfs::read_dir(CheckpointStore::progress_dir(dir.path()))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn remaining_preserves_catalog_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog_path = dir.path().join("catalog.csv");
        stdfs::write(&catalog_path, "symbol\n000003\n000001\n000002\n").expect("catalog");
        let catalog = Catalog::load(&catalog_path).await.expect("catalog");

        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        checkpoint.mark_completed("000001", None).await;
        let remaining = checkpoint.remaining(&catalog).await;
        assert_eq!(remaining, ["000003", "000002"]);
    }

    #[tokio::test]
    async fn mark_completed_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        checkpoint.mark_completed("000001", Some(2.0)).await;
        checkpoint.mark_completed("000001", Some(5.0)).await;
        assert_eq!(checkpoint.completed_len().await, 1);
    }

    #[tokio::test]
    async fn deprecated_fields_are_detected_and_dropped_on_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = CheckpointStore::file_path(dir.path(), "crawl_company");
        stdfs::create_dir_all(path.parent().expect("parent")).expect("progress dir");
        stdfs::write(
            &path,
            r#"{"completed_codes": ["000001"], "time_records": {}, "finished_batches": [1, 2]}"#,
        )
        .expect("write");

        let checkpoint = CheckpointStore::load(dir.path(), "crawl_company").await;
        assert!(checkpoint.has_deprecated_fields().await);

        checkpoint
            .replace_completed(["000001".to_string()].into_iter().collect())
            .await;
        checkpoint.save().await.expect("save");

        let raw = stdfs::read_to_string(&path).expect("read");
        assert!(!raw.contains("finished_batches"));
    }
}
