use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::debug;

const PROTOCOL_VERSION: &str = "2025-11-25";
const CLIENT_NAME: &str = "granary";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 600;

/// The remote call outcome as the executor sees it: rendered text plus the
/// service's own error flag. Transport and protocol failures surface as
/// `Err` from [`ToolCaller::call`] instead.
#[derive(Debug, Clone)]
pub struct ToolCallOutput {
    pub content: String,
    pub is_error: bool,
}

/// Seam between the scheduler/executor and the remote service.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call(&self, tool_name: &str, args: Value) -> anyhow::Result<ToolCallOutput>;
}

/// JSON-RPC 2.0 tool-call client speaking the MCP wire shape over HTTP.
/// `initialize` runs lazily once per client; every fetch is a `tools/call`.
pub struct McpToolClient {
    endpoint: String,
    http: reqwest::Client,
    initialized: OnceCell<()>,
}

impl McpToolClient {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_timeout(endpoint, Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS))
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
            initialized: OnceCell::new(),
        })
    }

    async fn ensure_initialized(&self) -> anyhow::Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let request = initialize_request();
                let response = self.post_json_rpc(request).await?;
                if let Some(err) = response.get("error") {
                    let message = err
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("initialize failed");
                    return Err(anyhow!("tool service initialize failed: {message}"));
                }
                debug!(endpoint = %self.endpoint, "tool service initialized");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn post_json_rpc(&self, request: Value) -> anyhow::Result<Value> {
        let response = self
            .http
            .post(&self.endpoint)
            .headers(default_headers())
            .json(&request)
            .send()
            .await
            .context("tool service request failed")?;
        let status = response.status();
        let payload = response
            .text()
            .await
            .context("failed to read tool service response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "tool service returned HTTP {}: {}",
                status.as_u16(),
                payload.chars().take(400).collect::<String>()
            ));
        }
        serde_json::from_str::<Value>(&payload).context("invalid JSON from tool service")
    }
}

#[async_trait]
impl ToolCaller for McpToolClient {
    async fn call(&self, tool_name: &str, args: Value) -> anyhow::Result<ToolCallOutput> {
        self.ensure_initialized().await?;
        let response = self.post_json_rpc(call_request(tool_name, args)).await?;

        if let Some(err) = response.get("error") {
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("tools/call failed");
            return Err(anyhow!("{message}"));
        }

        let result = response.get("result").cloned().unwrap_or(Value::Null);
        let is_error = result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let content = result
            .get("content")
            .map(render_tool_content)
            .unwrap_or_else(|| result.to_string());

        Ok(ToolCallOutput { content, is_error })
    }
}

fn default_headers() -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );
    map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    map
}

fn initialize_request() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": "initialize-1",
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": CLIENT_VERSION,
            }
        }
    })
}

fn call_request(tool_name: &str, args: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": format!("call-{}-{}", tool_name, now_ms()),
        "method": "tools/call",
        "params": {
            "name": tool_name,
            "arguments": args
        }
    })
}

/// Renders an MCP content array into one text blob; non-text items fall
/// back to their JSON form.
fn render_tool_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return value.to_string();
    };
    let mut chunks = Vec::new();
    for item in items {
        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
            chunks.push(text.to_string());
            continue;
        }
        chunks.push(item.to_string());
    }
    if chunks.is_empty() {
        String::new()
    } else {
        chunks.join("\n")
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_tool_content_joins_text_items() {
        let content = json!([
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"}
        ]);
        assert_eq!(render_tool_content(&content), "first\nsecond");
    }

    #[test]
    fn render_tool_content_empty_array_is_empty_string() {
        assert_eq!(render_tool_content(&json!([])), "");
    }

    #[test]
    fn call_request_targets_tools_call() {
        let request = call_request("crawl_company", json!({"code": "000001"}));
        assert_eq!(request["method"], "tools/call");
        assert_eq!(request["params"]["name"], "crawl_company");
        assert_eq!(request["params"]["arguments"]["code"], "000001");
    }
}
