//! In-process doubles for the warehouse, notifier and an unreachable source.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use swipe_core::{ResultKey, StagingRow};
use swipe_source::{ResultsSource, SourceError, SwapOutcome, Versioned};

use crate::notify::Notifier;
use crate::warehouse::{
    CommitError, LoadError, RecordOutcome, RecordWriter, ResultsWarehouse, StagedBatch,
};

fn injected(what: &str) -> sqlx::Error {
    sqlx::Error::Protocol(format!("injected {what} failure"))
}

#[derive(Debug, Default)]
struct WarehouseState {
    staging: Vec<StagingRow>,
    results: BTreeMap<ResultKey, StagingRow>,
}

/// Staging table semantics match `PgWarehouse`: one shared table, reserved
/// from load until the batch is merged or dropped.
#[derive(Debug, Default)]
pub(crate) struct MemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
    staging_lock: Arc<tokio::sync::Mutex<()>>,
    fail_load: AtomicBool,
    fail_user: Option<String>,
}

impl MemoryWarehouse {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record inserts for `user_id` fail; everything else succeeds.
    pub(crate) fn failing_for_user(user_id: &str) -> Self {
        Self {
            fail_user: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn results(&self) -> Vec<StagingRow> {
        self.state.lock().unwrap().results.values().cloned().collect()
    }
}

fn insert_new(state: &mut WarehouseState, row: &StagingRow) -> bool {
    let key = row.key();
    if state.results.contains_key(&key) {
        return false;
    }
    state.results.insert(key, row.clone());
    true
}

#[async_trait]
impl ResultsWarehouse for MemoryWarehouse {
    async fn load_staging(&self, rows: &[StagingRow]) -> Result<Box<dyn StagedBatch>, LoadError> {
        let guard = self.staging_lock.clone().lock_owned().await;
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(LoadError::Copy {
                rows: rows.len(),
                source: injected("load"),
            });
        }
        self.state.lock().unwrap().staging = rows.to_vec();
        Ok(Box::new(MemoryStagedBatch {
            state: self.state.clone(),
            rows: rows.len() as u64,
            _guard: guard,
        }))
    }

    async fn record_writer(&self) -> Result<Box<dyn RecordWriter>, CommitError> {
        Ok(Box::new(MemoryRecordWriter {
            state: self.state.clone(),
            fail_user: self.fail_user.clone(),
        }))
    }
}

struct MemoryStagedBatch {
    state: Arc<Mutex<WarehouseState>>,
    rows: u64,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

#[async_trait]
impl StagedBatch for MemoryStagedBatch {
    fn rows(&self) -> u64 {
        self.rows
    }

    async fn commit(self: Box<Self>) -> Result<u64, CommitError> {
        let mut state = self.state.lock().unwrap();
        let staged = std::mem::take(&mut state.staging);
        let inserted = staged.iter().filter(|row| insert_new(&mut state, row)).count();
        state.staging = staged;
        Ok(inserted as u64)
    }
}

struct MemoryRecordWriter {
    state: Arc<Mutex<WarehouseState>>,
    fail_user: Option<String>,
}

#[async_trait]
impl RecordWriter for MemoryRecordWriter {
    async fn insert_record(&mut self, rows: &[StagingRow]) -> Result<RecordOutcome, CommitError> {
        if let Some(row) = rows.iter().find(|r| Some(&r.user_id) == self.fail_user.as_ref()) {
            return Err(CommitError::Insert {
                key: row.key().to_string(),
                source: injected("insert"),
            });
        }
        let mut state = self.state.lock().unwrap();
        let mut outcome = RecordOutcome::default();
        for row in rows {
            if insert_new(&mut state, row) {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Source whose every call fails with a 503.
#[derive(Debug, Default)]
pub(crate) struct UnreachableSource {
    pub(crate) calls: AtomicUsize,
}

impl UnreachableSource {
    fn unavailable(&self) -> SourceError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SourceError::HttpStatus {
            status: 503,
            url: "https://example.invalid/v2/results.json".into(),
        }
    }
}

#[async_trait]
impl ResultsSource for UnreachableSource {
    fn root_path(&self) -> &str {
        "v2/results"
    }

    async fn get_subtree(&self) -> Result<Versioned, SourceError> {
        Err(self.unavailable())
    }

    async fn compare_and_swap(&self, _: &str, _: &JsonValue) -> Result<SwapOutcome, SourceError> {
        Err(self.unavailable())
    }

    async fn delete_path(&self, _: &[String]) -> Result<(), SourceError> {
        Err(self.unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn row(task_id: &str) -> StagingRow {
        let at = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).single().unwrap();
        StagingRow {
            project_id: "p1".into(),
            group_id: "g1".into(),
            user_id: "u1".into(),
            task_id: task_id.into(),
            timestamp: at,
            start_time: at,
            end_time: at,
            result: 1,
            wkt: None,
            coordinates: None,
        }
    }

    #[tokio::test]
    async fn overlapping_transfers_merge_their_own_batches() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let older = vec![row("t1")];
        let newer = vec![row("t1"), row("t2")];

        let first = warehouse.load_staging(&older).await.unwrap();
        let other = warehouse.clone();
        let mut second = tokio::spawn(async move {
            let batch = other.load_staging(&newer).await.unwrap();
            batch.commit().await.unwrap()
        });
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut second)
            .await
            .is_err());

        assert_eq!(first.commit().await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 1);
        assert_eq!(warehouse.results().len(), 2);
    }

    #[tokio::test]
    async fn empty_load_clears_previous_staging() {
        let warehouse = MemoryWarehouse::new();
        drop(warehouse.load_staging(&[row("t1")]).await.unwrap());

        let empty = warehouse.load_staging(&[]).await.unwrap();
        assert_eq!(empty.rows(), 0);
        assert_eq!(empty.commit().await.unwrap(), 0);
        assert!(warehouse.results().is_empty());
    }
}
