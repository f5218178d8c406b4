//! One transfer iteration and the single-shot / continuous driver around it.
//!
//! Iteration phases, in order: recover a spool left by an interrupted run,
//! fetch, normalize, spool, load staging, merge, acknowledge the source. The
//! spool is removed only once the source no longer holds the batch.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use swipe_core::{normalize_records, RawResultsTree, Rejected, SchemaError, SourceLayout, StagingRow};
use swipe_source::{
    acquire_and_clear_with, Acquired, ResultsSource, SnapshotHandler, SourceError,
    TransactionError, TransactionPolicy,
};
use swipe_storage::{QuarantineStore, Spool, SpoolError, SpoolHandle};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::TransferMode;
use crate::notify::{error_chain, Notifier};
use crate::warehouse::{CommitError, LoadError, ResultsWarehouse};
use crate::workers::drain_records;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("results tree cannot be normalized")]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Retried on the next tick.
    Transient,
    /// Needs an operator; the continuous loop stops.
    Fatal,
}

impl TransferError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Schema(_) => Severity::Fatal,
            Self::Spool(err) if err.is_corruption() => Severity::Fatal,
            _ => Severity::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Recovering,
    Fetching,
    Normalizing,
    Spooling,
    Loading,
    Committing,
    ClearingSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    Empty,
    Cleared,
    RecordsDeleted { deleted: usize, failed: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: TransferMode,
    pub phases: Vec<Phase>,
    /// Handler runs in transaction mode; more than one means the source changed mid-transfer.
    pub attempts: u32,
    pub recovered_rows: u64,
    pub recovered_inserted: u64,
    pub fetched_rows: usize,
    pub loaded_rows: u64,
    pub inserted_rows: u64,
    pub duplicate_rows: u64,
    pub rejected_entries: usize,
    pub source: SourceOutcome,
}

#[derive(Debug, Default)]
struct Progress {
    phases: Vec<Phase>,
    attempts: u32,
    recovered_rows: u64,
    recovered_inserted: u64,
    fetched_rows: usize,
    loaded_rows: u64,
    inserted_rows: u64,
    duplicate_rows: u64,
    rejected_entries: usize,
    spooled: Option<SpoolHandle>,
}

/// Shared by the iteration and the snapshot handler, which only gets `&self`.
#[derive(Debug, Default)]
struct Tracker(Mutex<Progress>);

impl Tracker {
    fn update<T>(&self, f: impl FnOnce(&mut Progress) -> T) -> T {
        let mut progress = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut progress)
    }

    fn enter(&self, phase: Phase) {
        self.update(|p| p.phases.push(phase));
    }

    fn into_inner(self) -> Progress {
        self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub mode: TransferMode,
    pub layout: SourceLayout,
    pub workers: usize,
    pub transaction: TransactionPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            mode: TransferMode::default(),
            layout: SourceLayout::default(),
            workers: 8,
            transaction: TransactionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub sleep: Duration,
    /// `None` runs until a fatal error.
    pub max_iterations: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub enum RunMode {
    Once,
    Continuous(LoopOptions),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub iterations: u64,
    pub failures: u64,
    pub rows_inserted: u64,
    pub last_summary: Option<IterationSummary>,
}

pub struct TransferPipeline {
    source: Arc<dyn ResultsSource>,
    warehouse: Arc<dyn ResultsWarehouse>,
    notifier: Arc<dyn Notifier>,
    spool: Spool,
    quarantine: QuarantineStore,
    settings: PipelineSettings,
}

impl TransferPipeline {
    pub fn new(
        source: Arc<dyn ResultsSource>,
        warehouse: Arc<dyn ResultsWarehouse>,
        notifier: Arc<dyn Notifier>,
        spool_dir: impl Into<PathBuf>,
        quarantine_dir: impl Into<PathBuf>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            warehouse,
            notifier,
            spool: Spool::new(spool_dir),
            quarantine: QuarantineStore::new(quarantine_dir),
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunReport, TransferError> {
        let mut report = RunReport::default();
        match mode {
            RunMode::Once => {
                report.iterations = 1;
                match self.run_iteration().await {
                    Ok(summary) => report.record(summary),
                    Err(err) => {
                        self.report_failure(&err).await;
                        return Err(err);
                    }
                }
            }
            RunMode::Continuous(options) => loop {
                report.iterations += 1;
                match self.run_iteration().await {
                    Ok(summary) => report.record(summary),
                    Err(err) => {
                        report.failures += 1;
                        self.report_failure(&err).await;
                        if err.severity() == Severity::Fatal {
                            error!(iterations = report.iterations, "fatal transfer error; stopping loop");
                            return Err(err);
                        }
                    }
                }
                if options
                    .max_iterations
                    .is_some_and(|max| report.iterations >= max)
                {
                    break;
                }
                tokio::time::sleep(options.sleep).await;
            },
        }
        Ok(report)
    }

    async fn report_failure(&self, err: &TransferError) {
        let severity = err.severity();
        let chain = error_chain(err);
        error!(?severity, error = %chain, "transfer iteration failed");
        self.notifier
            .notify(&format!(
                "results transfer from `{}` failed ({severity:?}): {chain}",
                self.source.root_path()
            ))
            .await;
    }

    pub async fn run_iteration(&self) -> Result<IterationSummary, TransferError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("transfer_iteration", %run_id, mode = %self.settings.mode);
        async {
            let started_at = Utc::now();
            let tracker = Tracker::default();

            self.recover(&tracker).await?;
            let source = match self.settings.mode {
                TransferMode::Transaction => self.transfer_transaction(&tracker).await?,
                TransferMode::PerRecord => self.transfer_per_record(&tracker).await?,
            };

            let p = tracker.into_inner();
            let summary = IterationSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                mode: self.settings.mode,
                phases: p.phases,
                attempts: p.attempts,
                recovered_rows: p.recovered_rows,
                recovered_inserted: p.recovered_inserted,
                fetched_rows: p.fetched_rows,
                loaded_rows: p.loaded_rows,
                inserted_rows: p.inserted_rows,
                duplicate_rows: p.duplicate_rows,
                rejected_entries: p.rejected_entries,
                source,
            };
            info!(
                recovered = summary.recovered_rows,
                fetched = summary.fetched_rows,
                inserted = summary.inserted_rows,
                duplicates = summary.duplicate_rows,
                rejected = summary.rejected_entries,
                source = ?summary.source,
                "transfer iteration complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Replay a batch spooled by an interrupted run. The source is not
    /// consulted; the merge ignores rows that already made it.
    async fn recover(&self, tracker: &Tracker) -> Result<(), TransferError> {
        let Some(handle) = self.spool.detect().await? else {
            return Ok(());
        };
        tracker.enter(Phase::Recovering);
        info!(path = %handle.path.display(), rows = handle.rows, "replaying spooled batch");

        let rows = self.spool.read(&handle).await?;
        let batch = self.warehouse.load_staging(&rows).await?;
        let loaded = batch.rows();
        let inserted = batch.commit().await?;
        self.spool.clear(&handle).await?;

        tracker.update(|p| {
            p.recovered_rows = loaded;
            p.recovered_inserted = inserted;
        });
        Ok(())
    }

    async fn transfer_transaction(&self, tracker: &Tracker) -> Result<SourceOutcome, TransferError> {
        tracker.enter(Phase::Fetching);
        let handler = BulkHandler {
            pipeline: self,
            tracker,
        };
        let acquired =
            acquire_and_clear_with(self.source.as_ref(), &self.settings.transaction, &handler).await?;

        match acquired {
            Acquired::Empty => Ok(SourceOutcome::Empty),
            Acquired::Snapshot(_) => {
                if let Some(handle) = tracker.update(|p| p.spooled.take()) {
                    self.spool.clear(&handle).await?;
                }
                Ok(SourceOutcome::Cleared)
            }
        }
    }

    async fn transfer_per_record(&self, tracker: &Tracker) -> Result<SourceOutcome, TransferError> {
        tracker.enter(Phase::Fetching);
        let snapshot = self.source.get_subtree().await?;
        if snapshot.tree.is_empty() {
            info!(path = self.source.root_path(), "no results in source");
            return Ok(SourceOutcome::Empty);
        }

        tracker.enter(Phase::Normalizing);
        let normalized = normalize_records(&snapshot.tree, self.settings.layout)?;
        self.quarantine_all(&normalized.rejected).await?;
        let rows: Vec<StagingRow> = normalized
            .records
            .iter()
            .flat_map(|record| record.rows.iter().cloned())
            .collect();
        tracker.update(|p| {
            p.fetched_rows = rows.len();
            p.rejected_entries = normalized.rejected.len();
        });

        let spooled = if rows.is_empty() {
            None
        } else {
            tracker.enter(Phase::Spooling);
            Some(self.spool.write(&rows).await?)
        };

        tracker.enter(Phase::Committing);
        let pool = drain_records(
            self.source.clone(),
            self.warehouse.clone(),
            normalized.records,
            self.settings.workers,
        )
        .await;
        if pool.failed > 0 {
            warn!(failed = pool.failed, "records left in source for the next iteration");
        }
        if let Some(handle) = spooled {
            self.spool.clear(&handle).await?;
        }

        tracker.update(|p| {
            p.inserted_rows = pool.inserted;
            p.duplicate_rows = pool.duplicates;
        });
        Ok(SourceOutcome::RecordsDeleted {
            deleted: pool.deleted,
            failed: pool.failed,
        })
    }

    async fn quarantine_all(&self, rejected: &[Rejected]) -> Result<(), TransferError> {
        for entry in rejected {
            self.quarantine.store(entry).await?;
        }
        Ok(())
    }
}

impl RunReport {
    fn record(&mut self, summary: IterationSummary) {
        self.rows_inserted += summary.recovered_inserted + summary.inserted_rows;
        self.last_summary = Some(summary);
    }
}

/// Everything between the versioned read and the swap in transaction mode.
struct BulkHandler<'a> {
    pipeline: &'a TransferPipeline,
    tracker: &'a Tracker,
}

#[async_trait]
impl<'a> SnapshotHandler for BulkHandler<'a> {
    type Error = TransferError;

    async fn handle(&self, snapshot: &RawResultsTree) -> Result<(), TransferError> {
        let pipeline = self.pipeline;
        let tracker = self.tracker;
        let attempt = tracker.update(|p| {
            p.attempts += 1;
            p.attempts
        });
        if attempt > 1 {
            tracker.enter(Phase::Fetching);
        }

        tracker.enter(Phase::Normalizing);
        let normalized =
            normalize_records(snapshot, pipeline.settings.layout)?.into_normalized();
        pipeline.quarantine_all(&normalized.rejected).await?;
        let rows = normalized.rows;
        tracker.update(|p| {
            p.fetched_rows = rows.len();
            p.rejected_entries = normalized.rejected.len();
        });

        let (loaded, inserted) = if rows.is_empty() {
            (0, 0)
        } else {
            tracker.enter(Phase::Spooling);
            let handle = pipeline.spool.write(&rows).await?;
            tracker.update(|p| p.spooled = Some(handle));

            tracker.enter(Phase::Loading);
            let batch = pipeline.warehouse.load_staging(&rows).await?;
            let loaded = batch.rows();
            tracker.enter(Phase::Committing);
            let inserted = batch.commit().await?;
            (loaded, inserted)
        };

        tracker.update(|p| {
            p.loaded_rows = loaded;
            p.inserted_rows = inserted;
            p.duplicate_rows = loaded.saturating_sub(inserted);
            p.phases.push(Phase::ClearingSource);
        });
        Ok(())
    }
}
