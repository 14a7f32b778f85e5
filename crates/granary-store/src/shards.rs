use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use granary_types::Record;

use crate::write_json_atomic;

#[derive(Debug, Default)]
struct StoreState {
    buffer: Vec<Record>,
    shard_index: u32,
}

/// Append-only, size-rotated record storage for one tool. Records buffer in
/// memory and land in `<data_dir>/<tool>_NN.json` shards; the active shard
/// index only ever increases.
pub struct RecordStore {
    data_dir: PathBuf,
    tool_name: String,
    max_shard_bytes: u64,
    flush_batch_size: usize,
    state: Mutex<StoreState>,
}

impl RecordStore {
    /// Opens the store, resuming at the highest existing shard index so a
    /// new run keeps appending where the last one stopped.
    pub async fn open(
        data_dir: &Path,
        tool_name: &str,
        max_shard_bytes: u64,
        flush_batch_size: usize,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let shard_index = highest_shard_index(data_dir, tool_name).await.unwrap_or(1);
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            tool_name: tool_name.to_string(),
            max_shard_bytes,
            flush_batch_size: flush_batch_size.max(1),
            state: Mutex::new(StoreState {
                buffer: Vec::new(),
                shard_index,
            }),
        })
    }

    fn shard_path(&self, index: u32) -> PathBuf {
        self.data_dir
            .join(format!("{}_{:02}.json", self.tool_name, index))
    }

    /// Buffers a record, flushing once the batch threshold is reached. A
    /// flush failure leaves the buffer intact for the next save point.
    pub async fn append(&self, record: Record) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.buffer.push(record);
        if state.buffer.len() >= self.flush_batch_size {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    pub async fn buffered_len(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    async fn flush_locked(&self, state: &mut StoreState) -> anyhow::Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        // Rotate before writing when the active shard is already over the
        // size threshold. The index never moves backwards.
        let mut path = self.shard_path(state.shard_index);
        if file_size(&path).await.unwrap_or(0) > self.max_shard_bytes {
            state.shard_index += 1;
            path = self.shard_path(state.shard_index);
        }

        let mut records = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<Vec<Record>>(&raw).unwrap_or_else(|err| {
                warn!(
                    shard = %path.display(),
                    error = %err,
                    "active shard unparsable, rewriting from buffer"
                );
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        records.extend(state.buffer.iter().cloned());
        write_json_atomic(&path, &records).await?;
        info!(
            shard = %path.display(),
            appended = state.buffer.len(),
            total = records.len(),
            "flushed records"
        );
        state.buffer.clear();
        Ok(())
    }
}

async fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).await.ok().map(|m| m.len())
}

async fn highest_shard_index(data_dir: &Path, tool_name: &str) -> Option<u32> {
    let mut highest = None;
    let mut entries = fs::read_dir(data_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((tool, index)) = split_shard_name(name) {
            if tool == tool_name {
                highest = Some(highest.map_or(index, |h: u32| h.max(index)));
            }
        }
    }
    highest
}

fn split_shard_name(file_name: &str) -> Option<(&str, u32)> {
    let stem = file_name.strip_suffix(".json")?;
    let (tool, index) = stem.rsplit_once('_')?;
    if tool.is_empty() || index.is_empty() {
        return None;
    }
    if !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((tool, index.parse().ok()?))
}

/// Tool name encoded in a shard file name (`crawl_company_02.json` →
/// `crawl_company`), or `None` when the name is not shard-shaped.
pub fn tool_name_from_shard(file_name: &str) -> Option<String> {
    split_shard_name(file_name).map(|(tool, _)| tool.to_string())
}

/// All shard files of one tool, sorted by name (and therefore by index).
pub async fn shard_files(data_dir: &Path, tool_name: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = fs::read_dir(data_dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((tool, _)) = split_shard_name(name) {
            if tool == tool_name {
                out.push(entry.path());
            }
        }
    }
    out.sort();
    out
}

/// Every tool that has at least one shard file in the data directory.
pub async fn discover_tools(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut tools = HashSet::new();
    let mut entries = fs::read_dir(data_dir)
        .await
        .with_context(|| format!("failed to read {}", data_dir.display()))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(tool) = tool_name_from_shard(name) {
            tools.insert(tool);
        }
    }
    let mut out: Vec<String> = tools.into_iter().collect();
    out.sort();
    Ok(out)
}

pub async fn read_shard_records(path: &Path) -> anyhow::Result<Vec<Record>> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Atomic whole-file rewrite of a shard, used by the maintenance sweeps.
pub async fn write_shard_records(path: &Path, records: &[Record]) -> anyhow::Result<()> {
    write_json_atomic(path, &records).await
}

/// Identifiers present in any shard of the tool, i.e. the canonical
/// completed set the checkpoint is reconciled against. Unreadable shards
/// are skipped with a warning rather than failing the scan.
pub async fn load_tool_identifiers(data_dir: &Path, tool_name: &str) -> HashSet<String> {
    let mut identifiers = HashSet::new();
    for path in shard_files(data_dir, tool_name).await {
        match read_shard_records(&path).await {
            Ok(records) => {
                for record in records {
                    if let Some(identifier) = record.identifier() {
                        identifiers.insert(identifier.to_string());
                    }
                }
            }
            Err(err) => {
                warn!(shard = %path.display(), error = %err, "skipping unreadable shard");
            }
        }
    }
    identifiers
}
