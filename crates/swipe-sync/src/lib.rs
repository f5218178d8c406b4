//! Transfer orchestration: recover, acquire, normalize, spool, load, merge and
//! acknowledge the source, once or on a fixed interval.

use std::sync::Arc;

use anyhow::{Context, Result};
use swipe_source::{FirebaseSource, TransactionPolicy};

pub mod config;
pub mod notify;
pub mod pipeline;
pub mod warehouse;
pub mod workers;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, TransferConfig, TransferMode};
pub use notify::{error_chain, LogNotifier, Notifier, SlackNotifier};
pub use pipeline::{
    IterationSummary, LoopOptions, Phase, PipelineSettings, RunMode, RunReport, Severity,
    SourceOutcome, TransferError, TransferPipeline,
};
pub use warehouse::{
    CommitError, LoadError, PgWarehouse, RecordOutcome, RecordWriter, ResultsWarehouse, StagedBatch,
};
pub use workers::{drain_records, PoolSummary};

pub const CRATE_NAME: &str = "swipe-sync";

/// Wire the production source, warehouse and notifier from `config`.
pub fn pipeline_from_config(config: &TransferConfig) -> Result<TransferPipeline> {
    let source = FirebaseSource::new(config.firebase_config()?)
        .context("building realtime database client")?;
    let warehouse = PgWarehouse::new(config.database_url.clone());
    let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
        Some(url) => Arc::new(
            SlackNotifier::new(url.clone(), &config.http_client_config())
                .context("building slack notifier")?,
        ),
        None => Arc::new(LogNotifier),
    };
    let settings = PipelineSettings {
        mode: config.mode,
        layout: config.layout,
        workers: config.workers,
        transaction: TransactionPolicy {
            max_attempts: config.transaction_max_attempts,
            ..TransactionPolicy::default()
        },
    };

    Ok(TransferPipeline::new(
        Arc::new(source),
        Arc::new(warehouse),
        notifier,
        config.spool_dir.clone(),
        config.quarantine_dir(),
        settings,
    ))
}

pub async fn run_transfer_from_env(
    mode_override: Option<TransferMode>,
    run_mode: RunMode,
) -> Result<RunReport> {
    let mut config = TransferConfig::from_env()?;
    if let Some(mode) = mode_override {
        config.mode = mode;
    }
    let pipeline = pipeline_from_config(&config)?;
    Ok(pipeline.run(run_mode).await?)
}

pub async fn migrate_from_env() -> Result<()> {
    let config = TransferConfig::from_env()?;
    PgWarehouse::new(config.database_url)
        .migrate()
        .await
        .context("applying warehouse migrations")
}
