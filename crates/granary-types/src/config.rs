use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::classify::ResultClassifier;

/// A named fetch operation plus its fixed deep-query template. Each tool
/// owns its own checkpoint and record store under the data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub query: String,
}

/// Orchestrator configuration, loaded from a JSON file with every field
/// defaulted so a partial config stays valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// Maximum simultaneously in-flight remote calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Buffered records before the store flushes to the active shard.
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    /// Persist the checkpoint every N successful tasks.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// A shard exceeding this size rotates to the next index on flush.
    #[serde(default = "default_max_shard_bytes")]
    pub max_shard_bytes: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Randomized backoff bounds applied to retryable failures.
    #[serde(default = "default_min_backoff_secs")]
    pub min_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Fixed pause after each successful call.
    #[serde(default = "default_request_interval_secs")]
    pub request_interval_secs: u64,
    #[serde(default)]
    pub classifier: ResultClassifier,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            catalog_path: default_catalog_path(),
            endpoint: String::new(),
            tools: Vec::new(),
            max_concurrency: default_max_concurrency(),
            flush_batch_size: default_flush_batch_size(),
            checkpoint_every: default_checkpoint_every(),
            max_shard_bytes: default_max_shard_bytes(),
            max_retries: default_max_retries(),
            min_backoff_secs: default_min_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            request_interval_secs: default_request_interval_secs(),
            classifier: ResultClassifier::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("tool_cache")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("catalog.csv")
}

fn default_max_concurrency() -> usize {
    5
}

fn default_flush_batch_size() -> usize {
    1
}

fn default_checkpoint_every() -> usize {
    1
}

fn default_max_shard_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_backoff_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    120
}

fn default_request_interval_secs() -> u64 {
    3
}
