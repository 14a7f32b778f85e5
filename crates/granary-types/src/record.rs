use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::ToolSpec;

/// Field inside `tool_args` that carries the entity identifier.
pub const IDENTIFIER_FIELD: &str = "code";
/// Field inside `tool_args` that carries the query template.
pub const QUERY_FIELD: &str = "query";
/// Identifiers are left-padded with zeros to this width.
pub const IDENTIFIER_WIDTH: usize = 6;

/// Normalize a raw catalog cell into a canonical identifier.
///
/// Blank cells become `None`; short numeric codes are zero-padded to the
/// width the remote service expects (`600519`, not `519`).
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() >= IDENTIFIER_WIDTH {
        return Some(trimmed.to_string());
    }
    let mut out = String::with_capacity(IDENTIFIER_WIDTH);
    for _ in trimmed.len()..IDENTIFIER_WIDTH {
        out.push('0');
    }
    out.push_str(trimmed);
    Some(out)
}

/// One durable fetch result. Field order matches the on-disk shard layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id")]
    pub id: String,
    pub cache_key: String,
    pub created_at: String,
    #[serde(default)]
    pub metadata: Value,
    pub tool_args: Value,
    pub tool_name: String,
    pub tool_result: String,
    pub updated_at: String,
}

impl Record {
    pub fn new(tool: &ToolSpec, identifier: &str, result: String) -> Self {
        let now = Utc::now().to_rfc3339();
        let args = json!({
            IDENTIFIER_FIELD: identifier,
            QUERY_FIELD: tool.query,
        });
        let cache_key = format!(
            "{}::{}",
            tool.name,
            serde_json::to_string(&args).unwrap_or_default()
        );
        Self {
            id: Uuid::new_v4().to_string(),
            cache_key,
            created_at: now.clone(),
            metadata: json!({
                "task_id": "bulk_harvest",
                "timestamp": now,
            }),
            tool_args: args,
            tool_name: tool.name.clone(),
            tool_result: result,
            updated_at: now,
        }
    }

    /// The entity identifier this record was fetched for, if present.
    pub fn identifier(&self) -> Option<&str> {
        self.tool_args.get(IDENTIFIER_FIELD).and_then(|v| v.as_str())
    }
}
