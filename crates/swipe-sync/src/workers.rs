//! Fixed-size worker pool for the per-record path.
//!
//! Each worker takes one source record at a time from a shared queue, persists
//! its rows and then deletes that record from the source. A failure is counted
//! and leaves the record in the source for the next iteration.

use std::sync::Arc;

use swipe_core::SourceRecord;
use swipe_source::ResultsSource;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::warehouse::{RecordWriter, ResultsWarehouse};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub records: usize,
    pub inserted: u64,
    pub duplicates: u64,
    pub deleted: usize,
    pub failed: usize,
}

impl PoolSummary {
    fn absorb(&mut self, other: PoolSummary) {
        self.records += other.records;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

type Queue = Arc<Mutex<mpsc::UnboundedReceiver<SourceRecord>>>;

/// Enqueue every record, close the queue and wait for all workers to drain it.
pub async fn drain_records(
    source: Arc<dyn ResultsSource>,
    warehouse: Arc<dyn ResultsWarehouse>,
    records: Vec<SourceRecord>,
    workers: usize,
) -> PoolSummary {
    let (tx, rx) = mpsc::unbounded_channel();
    for record in records {
        // The receiver is alive until the end of this function.
        let _ = tx.send(record);
    }
    drop(tx);

    let queue: Queue = Arc::new(Mutex::new(rx));
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        set.spawn(run_worker(
            worker,
            queue.clone(),
            source.clone(),
            warehouse.clone(),
        ));
    }

    let mut summary = PoolSummary::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(worker_summary) => summary.absorb(worker_summary),
            Err(err) => warn!(error = %err, "record worker aborted"),
        }
    }
    summary
}

async fn run_worker(
    worker: usize,
    queue: Queue,
    source: Arc<dyn ResultsSource>,
    warehouse: Arc<dyn ResultsWarehouse>,
) -> PoolSummary {
    let mut summary = PoolSummary::default();
    let mut writer: Option<Box<dyn RecordWriter>> = None;

    loop {
        let next = queue.lock().await.recv().await;
        let Some(record) = next else { break };
        summary.records += 1;
        let path = record.path.join("/");

        if writer.is_none() {
            match warehouse.record_writer().await {
                Ok(w) => writer = Some(w),
                Err(err) => {
                    warn!(worker, record = %path, error = %err, "no warehouse connection for record");
                    summary.failed += 1;
                    continue;
                }
            }
        }
        let Some(active) = writer.as_mut() else { continue };

        match active.insert_record(&record.rows).await {
            Ok(outcome) => {
                summary.inserted += outcome.inserted;
                summary.duplicates += outcome.duplicates;
            }
            Err(err) => {
                warn!(worker, record = %path, error = %err, "persisting record failed; left in source");
                summary.failed += 1;
                // The connection may be unusable after a failed statement.
                writer = None;
                continue;
            }
        }

        match source.delete_path(&record.path).await {
            Ok(()) => {
                summary.deleted += 1;
                debug!(worker, record = %path, rows = record.rows.len(), "record transferred");
            }
            Err(err) => {
                warn!(worker, record = %path, error = %err, "record persisted but not deleted from source");
                summary.failed += 1;
            }
        }
    }

    summary
}
