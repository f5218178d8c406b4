//! Relational side of the transfer: bulk `COPY` into an unconstrained staging
//! table, then a set-based merge into `results` that skips rows whose natural
//! key already exists.
//!
//! `results_temp` is shared by every transfer process. A load takes a
//! session advisory lock on its own connection and keeps it until the merge of
//! that same batch finishes, so two processes never interleave truncate, copy
//! and merge. Connections are not pooled across iterations.

use async_trait::async_trait;
use sqlx::migrate::MigrateError;
use sqlx::{Connection, PgConnection};
use swipe_core::{encode_rows, StagingRow, STAGING_COLUMNS};
use thiserror::Error;
use tracing::{debug, info};

const UNIQUE_VIOLATION: &str = "23505";
const CONFLICT_TARGET: &str = "(project_id, group_id, user_id, task_id)";
/// Advisory lock key guarding `results_temp`.
const STAGING_LOCK_KEY: i64 = 0x0073_7769_7065_7400;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("connecting to warehouse for staging load")]
    Connect(#[source] sqlx::Error),
    #[error("acquiring the staging table lock")]
    Lock(#[source] sqlx::Error),
    #[error("bulk load of {rows} rows into results_temp failed")]
    Copy {
        rows: usize,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("connecting to warehouse for merge")]
    Connect(#[source] sqlx::Error),
    #[error("merging results_temp into results failed")]
    Merge(#[source] sqlx::Error),
    #[error("inserting result row {key} failed")]
    Insert {
        key: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Per-record persistence counts. Rows whose key already exists are duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

#[async_trait]
pub trait ResultsWarehouse: Send + Sync {
    /// Truncate the staging table and fill it with `rows`. The staging table
    /// stays reserved for the returned batch until it is committed or dropped;
    /// a concurrent load waits.
    async fn load_staging(&self, rows: &[StagingRow]) -> Result<Box<dyn StagedBatch>, LoadError>;

    /// A writer owning its own connection, one per pool worker.
    async fn record_writer(&self) -> Result<Box<dyn RecordWriter>, CommitError>;
}

/// Rows sitting in the staging table, waiting to be merged.
#[async_trait]
pub trait StagedBatch: Send {
    fn rows(&self) -> u64;

    /// Merge staged rows into `results`; returns how many were new.
    async fn commit(self: Box<Self>) -> Result<u64, CommitError>;
}

#[async_trait]
pub trait RecordWriter: Send {
    async fn insert_record(&mut self, rows: &[StagingRow]) -> Result<RecordOutcome, CommitError>;
}

fn column_list() -> String {
    STAGING_COLUMNS
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn copy_statement() -> String {
    format!("COPY results_temp ({}) FROM STDIN", column_list())
}

fn merge_statement() -> String {
    let columns = column_list();
    format!(
        "INSERT INTO results ({columns}) SELECT {columns} FROM results_temp \
         ON CONFLICT {CONFLICT_TARGET} DO NOTHING"
    )
}

fn insert_statement() -> String {
    let placeholders = (1..=STAGING_COLUMNS.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO results ({}) VALUES ({placeholders}) ON CONFLICT {CONFLICT_TARGET} DO NOTHING",
        column_list()
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    database_url: String,
}

impl PgWarehouse {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        PgConnection::connect(&self.database_url).await
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), MigrateError> {
        let mut conn = self.connect().await.map_err(MigrateError::Execute)?;
        sqlx::migrate!("../../migrations").run(&mut conn).await?;
        info!("warehouse migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ResultsWarehouse for PgWarehouse {
    async fn load_staging(&self, rows: &[StagingRow]) -> Result<Box<dyn StagedBatch>, LoadError> {
        let copy_failed = |source| LoadError::Copy {
            rows: rows.len(),
            source,
        };

        let mut conn = self.connect().await.map_err(LoadError::Connect)?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(STAGING_LOCK_KEY)
            .execute(&mut conn)
            .await
            .map_err(LoadError::Lock)?;

        let mut tx = conn.begin().await.map_err(copy_failed)?;
        sqlx::query("TRUNCATE results_temp")
            .execute(&mut *tx)
            .await
            .map_err(copy_failed)?;
        let loaded = if rows.is_empty() {
            0
        } else {
            let mut copy = tx
                .copy_in_raw(&copy_statement())
                .await
                .map_err(copy_failed)?;
            copy.send(encode_rows(rows).into_bytes())
                .await
                .map_err(copy_failed)?;
            copy.finish().await.map_err(copy_failed)?
        };
        tx.commit().await.map_err(copy_failed)?;

        debug!(rows = loaded, "loaded staging table");
        Ok(Box::new(PgStagedBatch { conn, rows: loaded }))
    }

    async fn record_writer(&self) -> Result<Box<dyn RecordWriter>, CommitError> {
        let conn = self.connect().await.map_err(CommitError::Connect)?;
        Ok(Box::new(PgRecordWriter {
            conn,
            statement: insert_statement(),
        }))
    }
}

/// Owns the connection holding the staging lock; closing it releases the lock.
struct PgStagedBatch {
    conn: PgConnection,
    rows: u64,
}

#[async_trait]
impl StagedBatch for PgStagedBatch {
    fn rows(&self) -> u64 {
        self.rows
    }

    async fn commit(self: Box<Self>) -> Result<u64, CommitError> {
        let PgStagedBatch { mut conn, .. } = *self;
        let inserted = sqlx::query(&merge_statement())
            .execute(&mut conn)
            .await
            .map_err(CommitError::Merge)?
            .rows_affected();
        debug!(inserted, "merged staging table into results");
        if let Err(err) = conn.close().await {
            debug!(error = %err, "closing staging connection");
        }
        Ok(inserted)
    }
}

struct PgRecordWriter {
    conn: PgConnection,
    statement: String,
}

#[async_trait]
impl RecordWriter for PgRecordWriter {
    async fn insert_record(&mut self, rows: &[StagingRow]) -> Result<RecordOutcome, CommitError> {
        let mut outcome = RecordOutcome::default();
        for row in rows {
            let coords = row.coordinates;
            let result = sqlx::query(&self.statement)
                .bind(&row.project_id)
                .bind(&row.group_id)
                .bind(&row.user_id)
                .bind(&row.task_id)
                .bind(row.timestamp)
                .bind(row.start_time)
                .bind(row.end_time)
                .bind(row.result)
                .bind(row.wkt.as_deref())
                .bind(coords.map(|c| c.x))
                .bind(coords.map(|c| c.y))
                .bind(coords.map(|c| c.z))
                .execute(&mut self.conn)
                .await;
            match result {
                Ok(done) if done.rows_affected() > 0 => outcome.inserted += 1,
                Ok(_) => outcome.duplicates += 1,
                Err(err) if is_unique_violation(&err) => outcome.duplicates += 1,
                Err(source) => {
                    return Err(CommitError::Insert {
                        key: row.key().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn statements_share_the_staging_column_order() {
        assert_eq!(
            copy_statement(),
            "COPY results_temp (\"project_id\", \"group_id\", \"user_id\", \"task_id\", \
             \"timestamp\", \"start_time\", \"end_time\", \"result\", \"wkt\", \"task_x\", \
             \"task_y\", \"task_z\") FROM STDIN"
        );
        assert!(merge_statement().ends_with(
            "FROM results_temp ON CONFLICT (project_id, group_id, user_id, task_id) DO NOTHING"
        ));
        assert!(insert_statement().contains("VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"));
    }

    #[test]
    fn protocol_errors_are_not_duplicates() {
        assert!(!is_unique_violation(&sqlx::Error::Protocol("boom".into())));
    }

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

    /// Needs a disposable database: `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn merge_is_idempotent_against_postgres() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL");
        let warehouse = PgWarehouse::new(url);
        warehouse.migrate().await.unwrap();

        let task = format!("t-{}", uuid::Uuid::new_v4());
        let rows = vec![row(&task)];
        let batch = warehouse.load_staging(&rows).await.unwrap();
        assert_eq!(batch.rows(), 1);
        assert_eq!(batch.commit().await.unwrap(), 1);
        let batch = warehouse.load_staging(&rows).await.unwrap();
        assert_eq!(batch.commit().await.unwrap(), 0);
        let empty = warehouse.load_staging(&[]).await.unwrap();
        assert_eq!(empty.rows(), 0);
        assert_eq!(empty.commit().await.unwrap(), 0);

        let mut writer = warehouse.record_writer().await.unwrap();
        let outcome = writer.insert_record(&rows).await.unwrap();
        assert_eq!(outcome, RecordOutcome { inserted: 0, duplicates: 1 });
    }

    #[tokio::test]
    #[ignore]
    async fn second_load_waits_for_the_first_merge_against_postgres() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL");
        let warehouse = PgWarehouse::new(url);
        warehouse.migrate().await.unwrap();

        let first = vec![row(&format!("t-{}", uuid::Uuid::new_v4()))];
        let mut both = first.clone();
        both.push(row(&format!("t-{}", uuid::Uuid::new_v4())));

        let batch_a = warehouse.load_staging(&first).await.unwrap();
        let other = warehouse.clone();
        let mut load_b = tokio::spawn(async move {
            let batch = other.load_staging(&both).await.unwrap();
            batch.commit().await.unwrap()
        });
        assert!(tokio::time::timeout(std::time::Duration::from_millis(200), &mut load_b)
            .await
            .is_err());

        assert_eq!(batch_a.commit().await.unwrap(), 1);
        assert_eq!(load_b.await.unwrap(), 1);
    }
}
