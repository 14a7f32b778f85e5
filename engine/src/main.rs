use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use granary_client::McpToolClient;
use granary_harvest::Harvester;
use granary_maintenance::{clean_invalid_records, merge_stores, sync_checkpoints};
use granary_observability::{
    canonical_logs_dir_from_root, init_process_logging, ProcessKind,
};
use granary_store::Catalog;
use granary_types::HarvestConfig;

#[derive(Parser, Debug)]
#[command(name = "granary-engine")]
#[command(about = "Resumable bulk tool-call harvester")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Harvest every configured tool over the catalog, resuming from
    /// checkpoints.
    Run {
        #[arg(long, env = "GRANARY_CONFIG", default_value = "harvest.json")]
        config: String,
        #[arg(long)]
        catalog: Option<String>,
        #[arg(long)]
        data_dir: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Rebuild checkpoints from the record stores and report progress.
    Sync {
        #[arg(long, env = "GRANARY_CONFIG", default_value = "harvest.json")]
        config: String,
        #[arg(long)]
        catalog: Option<String>,
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// Purge invalid records and their checkpoint entries.
    Clean {
        #[arg(long, env = "GRANARY_CONFIG", default_value = "harvest.json")]
        config: String,
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// Union a source store into a destination store by identifier.
    Merge {
        #[arg(long)]
        source: String,
        #[arg(long)]
        dest: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            catalog,
            data_dir,
            endpoint,
        } => {
            let config = load_config(Path::new(&config), catalog, data_dir, endpoint)?;
            let logs_dir = canonical_logs_dir_from_root(&config.data_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            info!("engine logging initialized: {:?}", log_info);
            run_harvest(config).await?;
        }
        Command::Sync {
            config,
            catalog,
            data_dir,
        } => {
            let config = load_config(Path::new(&config), catalog, data_dir, None)?;
            let logs_dir = canonical_logs_dir_from_root(&config.data_dir);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Maintenance, &logs_dir, 14)?;
            run_sync(config).await?;
        }
        Command::Clean { config, data_dir } => {
            let config = load_config(Path::new(&config), None, data_dir, None)?;
            let logs_dir = canonical_logs_dir_from_root(&config.data_dir);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Maintenance, &logs_dir, 14)?;
            let report = clean_invalid_records(&config.data_dir, &config.classifier).await?;
            info!(
                records_removed = report.records_removed,
                checkpoints_updated = report.checkpoints_updated,
                "clean complete"
            );
        }
        Command::Merge { source, dest } => {
            let dest_dir = PathBuf::from(&dest);
            let logs_dir = canonical_logs_dir_from_root(&dest_dir);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Maintenance, &logs_dir, 14)?;
            let report = merge_stores(Path::new(&source), &dest_dir).await?;
            info!(
                files_copied = report.files_copied,
                files_merged = report.files_merged,
                records_added = report.records_added,
                "merge complete"
            );
        }
    }

    Ok(())
}

async fn run_harvest(config: HarvestConfig) -> anyhow::Result<()> {
    if config.endpoint.trim().is_empty() {
        anyhow::bail!("no endpoint configured; set `endpoint` in the config file or pass --endpoint");
    }
    if config.tools.is_empty() {
        anyhow::bail!("no tools configured; nothing to harvest");
    }

    // Catalog failures are fatal before any tool starts.
    let catalog = Catalog::load(&config.catalog_path).await?;
    info!(
        catalog = %config.catalog_path.display(),
        identifiers = catalog.len(),
        tools = config.tools.len(),
        endpoint = %config.endpoint,
        "starting harvest"
    );

    let caller = Arc::new(McpToolClient::new(config.endpoint.clone())?);
    let harvester = Harvester::new(caller, Arc::new(config));

    // Ctrl-C stops admission; in-flight bookkeeping still flushes so the
    // next run resumes where this one stopped.
    let cancel = harvester.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing up and flushing progress");
            cancel.cancel();
        }
    });

    let summaries = harvester.run(&catalog).await?;
    for summary in &summaries {
        info!(
            tool = %summary.tool,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            permanent_skips = summary.permanent_skips,
            exhausted_skips = summary.exhausted_skips,
            cancelled = summary.cancelled,
            "tool summary"
        );
    }
    info!("harvest finished");
    Ok(())
}

async fn run_sync(config: HarvestConfig) -> anyhow::Result<()> {
    let catalog = match Catalog::load(&config.catalog_path).await {
        Ok(catalog) => Some(catalog),
        Err(err) => {
            warn!(error = %err, "catalog unavailable, progress percentages omitted");
            None
        }
    };
    let reports = sync_checkpoints(&config.data_dir, catalog.as_ref()).await?;
    if reports.is_empty() {
        info!("no tool stores found, nothing to sync");
        return Ok(());
    }
    for report in &reports {
        match (report.remaining, report.percent) {
            (Some(remaining), Some(percent)) => info!(
                tool = %report.tool,
                completed = report.completed,
                remaining,
                percent = format!("{percent:.1}"),
                rewritten = report.rewritten,
                "sync report"
            ),
            _ => info!(
                tool = %report.tool,
                completed = report.completed,
                rewritten = report.rewritten,
                "sync report"
            ),
        }
    }
    let incomplete = reports
        .iter()
        .filter(|r| r.remaining.unwrap_or(0) > 0)
        .count();
    if incomplete > 0 {
        warn!(incomplete, total = reports.len(), "tools still incomplete");
    } else {
        info!("all discovered tools fully harvested");
    }
    Ok(())
}

/// Reads the config file (defaults apply when it is absent) and layers CLI
/// overrides on top.
fn load_config(
    path: &Path,
    catalog: Option<String>,
    data_dir: Option<String>,
    endpoint: Option<String>,
) -> anyhow::Result<HarvestConfig> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str::<HarvestConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        warn!(config = %path.display(), "config file not found, using defaults");
        HarvestConfig::default()
    };
    if let Some(catalog) = catalog {
        config.catalog_path = PathBuf::from(catalog);
    }
    if let Some(data_dir) = data_dir {
        config.data_dir = PathBuf::from(data_dir);
    }
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    Ok(config)
}
