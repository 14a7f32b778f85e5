use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

use crate::shards::{read_shard_records, shard_files};

/// Read-side lookup over every shard of one tool: identifier → result text.
/// Built explicitly and owned by whoever needs it; lifecycle is tied to the
/// run, not to any global.
pub struct RecordIndex {
    tool_name: String,
    results: HashMap<String, String>,
}

impl RecordIndex {
    pub async fn load(data_dir: &Path, tool_name: &str) -> Self {
        let mut results = HashMap::new();
        for path in shard_files(data_dir, tool_name).await {
            match read_shard_records(&path).await {
                Ok(records) => {
                    for record in records {
                        if let Some(identifier) = record.identifier() {
                            // Later shards win on duplicates.
                            results.insert(identifier.to_string(), record.tool_result);
                        }
                    }
                }
                Err(err) => {
                    warn!(shard = %path.display(), error = %err, "skipping unreadable shard");
                }
            }
        }
        info!(tool = tool_name, records = results.len(), "record index loaded");
        Self {
            tool_name: tool_name.to_string(),
            results,
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.results.get(identifier).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
