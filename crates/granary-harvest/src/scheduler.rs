use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use granary_client::ToolCaller;
use granary_store::{load_tool_identifiers, Catalog, CheckpointStore, RecordStore};
use granary_types::{HarvestConfig, ToolSpec};

use crate::executor::{TaskExecutor, TaskOutcome};

/// Per-tool outcome counts reported after a harvest pass.
#[derive(Debug, Clone, Default)]
pub struct ToolRunSummary {
    pub tool: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub permanent_skips: usize,
    pub exhausted_skips: usize,
    pub cancelled: bool,
}

/// Drives the configured tools sequentially, fanning each tool's remaining
/// identifiers out over a bounded number of in-flight task executors.
pub struct Harvester {
    caller: Arc<dyn ToolCaller>,
    config: Arc<HarvestConfig>,
    cancel: CancellationToken,
}

impl Harvester {
    pub fn new(caller: Arc<dyn ToolCaller>, config: Arc<HarvestConfig>) -> Self {
        Self {
            caller,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by every spawned task; cancelling it stops admission
    /// immediately while the final checkpoint save and record flush still
    /// run, so partial progress is never silently lost.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, catalog: &Catalog) -> anyhow::Result<Vec<ToolRunSummary>> {
        let mut total_remaining = 0;
        for tool in &self.config.tools {
            let checkpoint = CheckpointStore::load(&self.config.data_dir, &tool.name).await;
            let remaining = checkpoint.remaining(catalog).await.len();
            let completed = catalog.len() - remaining;
            if remaining > 0 {
                info!(tool = %tool.name, completed, remaining, "tool pending");
            }
            total_remaining += remaining;
        }
        info!(
            tools = self.config.tools.len(),
            catalog = catalog.len(),
            total_remaining,
            "harvest plan computed"
        );
        if total_remaining == 0 {
            info!("all tools complete, nothing to harvest");
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for tool in &self.config.tools {
            if self.cancel.is_cancelled() {
                warn!("harvest cancelled, remaining tools skipped");
                break;
            }
            summaries.push(self.run_tool(tool, catalog).await?);
        }
        Ok(summaries)
    }

    /// Drains one tool: reconcile the checkpoint against the record store,
    /// compute the remaining set, fan out bounded tasks, then always save
    /// and flush.
    pub async fn run_tool(
        &self,
        tool: &ToolSpec,
        catalog: &Catalog,
    ) -> anyhow::Result<ToolRunSummary> {
        let data_dir = &self.config.data_dir;
        let checkpoint = Arc::new(CheckpointStore::load(data_dir, &tool.name).await);

        // The record store is the source of truth; a size mismatch means
        // the checkpoint drifted (crash between flush and save), so rebuild
        // it instead of trusting it.
        let canonical = load_tool_identifiers(data_dir, &tool.name).await;
        if canonical.len() != checkpoint.completed_len().await {
            warn!(
                tool = %tool.name,
                checkpoint = checkpoint.completed_len().await,
                store = canonical.len(),
                "checkpoint drift detected, rebuilding from record store"
            );
            checkpoint.replace_completed(canonical).await;
            if let Err(err) = checkpoint.save().await {
                warn!(tool = %tool.name, error = %err, "checkpoint rebuild save failed");
            }
        }

        let remaining = checkpoint.remaining(catalog).await;
        let mut summary = ToolRunSummary {
            tool: tool.name.clone(),
            attempted: remaining.len(),
            ..ToolRunSummary::default()
        };
        if remaining.is_empty() {
            info!(tool = %tool.name, "all identifiers complete, skipping tool");
            return Ok(summary);
        }
        info!(
            tool = %tool.name,
            catalog = catalog.len(),
            completed = catalog.len() - remaining.len(),
            remaining = remaining.len(),
            "starting tool harvest"
        );

        let store = Arc::new(
            RecordStore::open(
                data_dir,
                &tool.name,
                self.config.max_shard_bytes,
                self.config.flush_batch_size,
            )
            .await?,
        );
        let executor = Arc::new(TaskExecutor::new(
            self.caller.clone(),
            store.clone(),
            checkpoint.clone(),
            self.config.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let success_count = Arc::new(AtomicUsize::new(0));
        let checkpoint_every = self.config.checkpoint_every.max(1);
        let total = remaining.len();

        let mut join_set: JoinSet<Option<TaskOutcome>> = JoinSet::new();
        for (index, identifier) in remaining.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let executor = executor.clone();
            let checkpoint = checkpoint.clone();
            let tool = tool.clone();
            let cancel = self.cancel.clone();
            let success_count = success_count.clone();
            join_set.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    },
                };
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    outcome = executor.run(&tool, &identifier, index + 1, total) => outcome,
                };
                if matches!(outcome, TaskOutcome::Success { .. }) {
                    let done = success_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if done % checkpoint_every == 0 {
                        if let Err(err) = checkpoint.save().await {
                            warn!(
                                tool = %tool.name,
                                error = %err,
                                "periodic checkpoint save failed"
                            );
                        }
                    }
                }
                Some(outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(TaskOutcome::Success { .. })) => summary.succeeded += 1,
                Ok(Some(TaskOutcome::PermanentSkip { .. })) => summary.permanent_skips += 1,
                Ok(Some(TaskOutcome::ExhaustedSkip { .. })) => summary.exhausted_skips += 1,
                Ok(None) => summary.cancelled = true,
                Err(err) => error!(tool = %tool.name, error = %err, "task join failed"),
            }
        }

        if let Err(err) = checkpoint.save().await {
            warn!(tool = %tool.name, error = %err, "final checkpoint save failed");
        }
        if let Err(err) = store.flush().await {
            warn!(tool = %tool.name, error = %err, "final record flush failed");
        }

        info!(
            tool = %tool.name,
            succeeded = summary.succeeded,
            permanent_skips = summary.permanent_skips,
            exhausted_skips = summary.exhausted_skips,
            cancelled = summary.cancelled,
            "tool harvest finished"
        );
        Ok(summary)
    }
}
