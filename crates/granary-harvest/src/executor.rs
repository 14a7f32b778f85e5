use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};

use granary_client::ToolCaller;
use granary_store::{CheckpointStore, RecordStore};
use granary_types::{HarvestConfig, Record, ToolSpec, IDENTIFIER_FIELD, QUERY_FIELD};

/// Terminal result of one (tool, identifier) task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success { elapsed_seconds: f64 },
    /// Policy rejection; never retried, nothing persisted.
    PermanentSkip { reason: String },
    /// Retry budget spent; left incomplete for a future run.
    ExhaustedSkip { reason: String },
}

/// Issues one remote call per task, classifies the outcome and applies the
/// retry/backoff policy. Successful records flow into the record store and
/// the checkpoint; every skip leaves the identifier incomplete.
pub struct TaskExecutor {
    caller: Arc<dyn ToolCaller>,
    store: Arc<RecordStore>,
    checkpoint: Arc<CheckpointStore>,
    config: Arc<HarvestConfig>,
}

impl TaskExecutor {
    pub fn new(
        caller: Arc<dyn ToolCaller>,
        store: Arc<RecordStore>,
        checkpoint: Arc<CheckpointStore>,
        config: Arc<HarvestConfig>,
    ) -> Self {
        Self {
            caller,
            store,
            checkpoint,
            config,
        }
    }

    pub async fn run(
        &self,
        tool: &ToolSpec,
        identifier: &str,
        position: usize,
        total: usize,
    ) -> TaskOutcome {
        let args = json!({
            IDENTIFIER_FIELD: identifier,
            QUERY_FIELD: tool.query,
        });
        let max_retries = self.config.max_retries.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_retries {
            info!(
                tool = %tool.name,
                identifier,
                attempt,
                max_retries,
                position,
                total,
                "issuing tool call"
            );
            let started = Instant::now();
            let call = self.caller.call(&tool.name, args.clone()).await;
            let elapsed = started.elapsed().as_secs_f64();

            last_reason = match call {
                Ok(output) if !output.is_error => {
                    let verdict = self.config.classifier.classify_content(&output.content);
                    if verdict.is_valid() {
                        return self
                            .commit_success(tool, identifier, output.content, elapsed)
                            .await;
                    }
                    format!("{}: '{}'", verdict.reason(), truncate(&output.content))
                }
                Ok(output) => {
                    if self.config.classifier.is_permanent_rejection(&output.content) {
                        let reason = truncate(&output.content);
                        warn!(
                            tool = %tool.name,
                            identifier,
                            reason = %reason,
                            "permanent rejection, not retrying"
                        );
                        return TaskOutcome::PermanentSkip { reason };
                    }
                    format!("service error: {}", truncate(&output.content))
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    if self.config.classifier.is_permanent_rejection(&message) {
                        let reason = truncate(&message);
                        warn!(
                            tool = %tool.name,
                            identifier,
                            reason = %reason,
                            "permanent rejection, not retrying"
                        );
                        return TaskOutcome::PermanentSkip { reason };
                    }
                    format!("call failed: {}", truncate(&message))
                }
            };

            if attempt < max_retries {
                let wait_seconds = self.backoff_secs();
                warn!(
                    tool = %tool.name,
                    identifier,
                    attempt,
                    max_retries,
                    wait_seconds,
                    reason = %last_reason,
                    "retrying after backoff"
                );
                sleep(Duration::from_secs(wait_seconds)).await;
            }
        }

        error!(
            tool = %tool.name,
            identifier,
            max_retries,
            reason = %last_reason,
            "retry budget exhausted, leaving identifier incomplete"
        );
        TaskOutcome::ExhaustedSkip {
            reason: last_reason,
        }
    }

    async fn commit_success(
        &self,
        tool: &ToolSpec,
        identifier: &str,
        content: String,
        elapsed: f64,
    ) -> TaskOutcome {
        let record = Record::new(tool, identifier, content);
        if let Err(err) = self.store.append(record).await {
            // Buffered records survive a failed flush and retry at the
            // next save point; the run keeps going.
            warn!(
                tool = %tool.name,
                identifier,
                error = %err,
                "record flush failed, result kept in buffer"
            );
        }
        self.checkpoint
            .mark_completed(identifier, Some(elapsed))
            .await;
        info!(
            tool = %tool.name,
            identifier,
            elapsed_seconds = format!("{elapsed:.2}"),
            "task succeeded"
        );
        sleep(Duration::from_secs(self.config.request_interval_secs)).await;
        TaskOutcome::Success {
            elapsed_seconds: elapsed,
        }
    }

    fn backoff_secs(&self) -> u64 {
        let min = self.config.min_backoff_secs;
        let max = self.config.max_backoff_secs.max(min);
        if min == max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

fn truncate(message: &str) -> String {
    const LIMIT: usize = 100;
    if message.chars().count() <= LIMIT {
        message.to_string()
    } else {
        message.chars().take(LIMIT).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::{fast_config, MockCaller, Script};
    use granary_store::load_tool_identifiers;

    fn tool() -> ToolSpec {
        ToolSpec {
            name: "crawl_company".to_string(),
            query: "full company profile".to_string(),
        }
    }

    async fn executor_for(
        dir: &std::path::Path,
        caller: Arc<MockCaller>,
    ) -> (TaskExecutor, Arc<RecordStore>, Arc<CheckpointStore>) {
        let config = Arc::new(fast_config(dir));
        let store = Arc::new(
            RecordStore::open(dir, "crawl_company", config.max_shard_bytes, 1)
                .await
                .expect("store"),
        );
        let checkpoint = Arc::new(CheckpointStore::load(dir, "crawl_company").await);
        (
            TaskExecutor::new(caller, store.clone(), checkpoint.clone(), config),
            store,
            checkpoint,
        )
    }

    #[tokio::test]
    async fn success_persists_record_and_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caller = Arc::new(MockCaller::always(Script::Content(
            "a long enough answer for the classifier".to_string(),
        )));
        let (executor, _store, checkpoint) = executor_for(dir.path(), caller.clone()).await;

        let outcome = executor.run(&tool(), "000001", 1, 1).await;
        assert!(matches!(outcome, TaskOutcome::Success { .. }));
        assert_eq!(caller.calls(), 1);
        assert!(checkpoint.is_completed("000001").await);

        let identifiers = load_tool_identifiers(dir.path(), "crawl_company").await;
        assert!(identifiers.contains("000001"));
    }

    #[tokio::test]
    async fn invalid_marker_retries_then_exhausts_without_persisting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caller = Arc::new(MockCaller::always(Script::Content(
            "No relevant content found matching the query.".to_string(),
        )));
        let (executor, store, checkpoint) = executor_for(dir.path(), caller.clone()).await;

        let outcome = executor.run(&tool(), "000001", 1, 1).await;
        assert!(matches!(outcome, TaskOutcome::ExhaustedSkip { .. }));
        assert_eq!(caller.calls(), 3);
        assert!(!checkpoint.is_completed("000001").await);
        assert_eq!(store.buffered_len().await, 0);
        assert!(load_tool_identifiers(dir.path(), "crawl_company")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn permanent_rejection_bypasses_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caller = Arc::new(MockCaller::always(Script::Fail(
            "upstream refused: inappropriate content".to_string(),
        )));
        let (executor, _store, checkpoint) = executor_for(dir.path(), caller.clone()).await;

        let outcome = executor.run(&tool(), "000001", 1, 1).await;
        assert!(matches!(outcome, TaskOutcome::PermanentSkip { .. }));
        assert_eq!(caller.calls(), 1);
        assert!(!checkpoint.is_completed("000001").await);
    }

    #[tokio::test]
    async fn service_flagged_error_with_permanent_marker_skips_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caller = Arc::new(MockCaller::always(Script::ErrorFlag(
            "request blocked for inappropriate content".to_string(),
        )));
        let (executor, _store, _checkpoint) = executor_for(dir.path(), caller.clone()).await;

        let outcome = executor.run(&tool(), "000001", 1, 1).await;
        assert!(matches!(outcome, TaskOutcome::PermanentSkip { .. }));
        assert_eq!(caller.calls(), 1);
    }

    #[tokio::test]
    async fn transient_error_recovers_on_a_later_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caller = Arc::new(MockCaller::sequence(vec![
            Script::Fail("connection reset by peer".to_string()),
            Script::Content("a long enough answer for the classifier".to_string()),
        ]));
        let (executor, _store, checkpoint) = executor_for(dir.path(), caller.clone()).await;

        let outcome = executor.run(&tool(), "000001", 1, 1).await;
        assert!(matches!(outcome, TaskOutcome::Success { .. }));
        assert_eq!(caller.calls(), 2);
        assert!(checkpoint.is_completed("000001").await);
    }
}
