//! Source store contracts: read-and-clear access to the remote results subtree.
//!
//! The primary path is a compare-and-swap transaction over the whole subtree:
//! read it together with a version tag, hand the snapshot to the caller, then
//! replace it with empty only if nobody wrote in between. A conflict re-reads
//! and re-runs the handler, so data appended mid-transfer is either part of the
//! committed snapshot or still in the source afterwards. The degraded path
//! deletes individual leaves with [`ResultsSource::delete_path`].

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use swipe_core::RawResultsTree;
use swipe_storage::BackoffPolicy;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod firebase;
pub mod memory;

pub use firebase::{FirebaseConfig, FirebaseSource};
pub use memory::InMemorySource;

pub const CRATE_NAME: &str = "swipe-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} carries no ETag header")]
    MissingEtag { url: String },
    #[error("invalid json from {url}")]
    Json {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid source url `{0}`")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction on `{path}` still contended after {attempts} attempts")]
    Contended { path: String, attempts: u32 },
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Subtree contents plus the opaque version tag needed to swap them.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub tree: RawResultsTree,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Committed,
    /// The subtree changed since it was read; nothing was written.
    Conflict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Acquired {
    Empty,
    Snapshot(RawResultsTree),
}

#[async_trait]
pub trait ResultsSource: Send + Sync {
    /// Path of the results subtree inside the store, for logs and errors.
    fn root_path(&self) -> &str;

    async fn get_subtree(&self) -> Result<Versioned, SourceError>;

    async fn compare_and_swap(
        &self,
        expected_version: &str,
        replacement: &JsonValue,
    ) -> Result<SwapOutcome, SourceError>;

    /// Remove one node below the results root, e.g. `[task_id, child_id]`.
    async fn delete_path(&self, path: &[String]) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionPolicy {
    pub max_attempts: u32,
    /// Pause between conflicting attempts.
    pub backoff: BackoffPolicy,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: std::time::Duration::from_millis(50),
                max_delay: std::time::Duration::from_secs(2),
            },
        }
    }
}

/// Work done on a snapshot before the source is cleared. Runs again on every
/// conflicting attempt, so it must be idempotent.
#[async_trait]
pub trait SnapshotHandler: Send + Sync {
    type Error: From<TransactionError> + Send;

    async fn handle(&self, snapshot: &RawResultsTree) -> Result<(), Self::Error>;
}

struct Passthrough;

#[async_trait]
impl SnapshotHandler for Passthrough {
    type Error = TransactionError;

    async fn handle(&self, _snapshot: &RawResultsTree) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Atomically take the whole subtree, leaving it empty.
pub async fn acquire_and_clear<S>(
    source: &S,
    policy: &TransactionPolicy,
) -> Result<Acquired, TransactionError>
where
    S: ResultsSource + ?Sized,
{
    acquire_and_clear_with(source, policy, &Passthrough).await
}

/// Like [`acquire_and_clear`], running `handler` on each snapshot before the swap.
/// A handler error aborts without touching the source.
pub async fn acquire_and_clear_with<S, H>(
    source: &S,
    policy: &TransactionPolicy,
    handler: &H,
) -> Result<Acquired, H::Error>
where
    S: ResultsSource + ?Sized,
    H: SnapshotHandler,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let snapshot = source.get_subtree().await.map_err(TransactionError::from)?;
        if snapshot.tree.is_empty() {
            info!(path = source.root_path(), "no results in source");
            return Ok(Acquired::Empty);
        }

        handler.handle(&snapshot.tree).await?;

        let outcome = source
            .compare_and_swap(&snapshot.version, &JsonValue::Null)
            .await
            .map_err(TransactionError::from)?;
        match outcome {
            SwapOutcome::Committed => {
                debug!(path = source.root_path(), attempt, "cleared results subtree");
                return Ok(Acquired::Snapshot(snapshot.tree));
            }
            SwapOutcome::Conflict => {
                warn!(
                    path = source.root_path(),
                    attempt,
                    "results subtree changed during transfer; retrying"
                );
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff.delay_for_attempt(attempt as usize - 1)).await;
                }
            }
        }
    }

    Err(TransactionError::Contended {
        path: source.root_path().to_string(),
        attempts,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn quick_policy(max_attempts: u32) -> TransactionPolicy {
        TransactionPolicy {
            max_attempts,
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        }
    }

    fn entry(task: &str) -> JsonValue {
        json!({
            "timestamp": "2023-01-01T10:00:00Z",
            "startTime": "2023-01-01T10:00:00Z",
            "endTime": "2023-01-01T10:00:00Z",
            "results": {task: 1}
        })
    }

    #[tokio::test]
    async fn empty_source_yields_empty_marker() {
        let source = InMemorySource::new("v2/results");
        let acquired = acquire_and_clear(&source, &quick_policy(3)).await.unwrap();
        assert_eq!(acquired, Acquired::Empty);
    }

    #[tokio::test]
    async fn acquire_returns_snapshot_and_clears() {
        let tree = json!({"p1": {"g1": {"u1": entry("t1")}}});
        let source = InMemorySource::with_tree("v2/results", tree.clone());

        let acquired = acquire_and_clear(&source, &quick_policy(3)).await.unwrap();
        assert_eq!(acquired, Acquired::Snapshot(RawResultsTree::new(tree)));
        assert!(source.tree().await.is_null());
    }

    /// Simulates a client submitting results while the first snapshot is processed.
    struct AppendOnce<'a> {
        source: &'a InMemorySource,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl<'a> SnapshotHandler for AppendOnce<'a> {
        type Error = TransactionError;

        async fn handle(&self, _snapshot: &RawResultsTree) -> Result<(), Self::Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.source.insert(&["p1", "g1", "u2"], entry("t9")).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_append_is_part_of_the_retried_snapshot() {
        let source = InMemorySource::with_tree("v2/results", json!({"p1": {"g1": {"u1": entry("t1")}}}));
        let handler = AppendOnce {
            source: &source,
            calls: AtomicUsize::new(0),
        };

        let acquired = acquire_and_clear_with(&source, &quick_policy(5), &handler)
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let Acquired::Snapshot(tree) = acquired else {
            panic!("expected a snapshot");
        };
        assert!(tree.as_value().pointer("/p1/g1/u2").is_some());
        assert!(source.tree().await.is_null());
    }

    struct AlwaysContended(InMemorySource);

    #[async_trait]
    impl ResultsSource for AlwaysContended {
        fn root_path(&self) -> &str {
            self.0.root_path()
        }

        async fn get_subtree(&self) -> Result<Versioned, SourceError> {
            self.0.get_subtree().await
        }

        async fn compare_and_swap(&self, _: &str, _: &JsonValue) -> Result<SwapOutcome, SourceError> {
            Ok(SwapOutcome::Conflict)
        }

        async fn delete_path(&self, path: &[String]) -> Result<(), SourceError> {
            self.0.delete_path(path).await
        }
    }

    #[tokio::test]
    async fn exhausted_contention_is_a_transaction_error_and_keeps_data() {
        let tree = json!({"p1": {"g1": {"u1": entry("t1")}}});
        let source = AlwaysContended(InMemorySource::with_tree("v2/results", tree.clone()));

        let err = acquire_and_clear(&source, &quick_policy(4)).await.unwrap_err();
        assert!(matches!(err, TransactionError::Contended { attempts: 4, .. }));
        assert_eq!(source.0.tree().await, tree);
    }

    struct FailingHandler;

    #[derive(Debug)]
    enum HandlerFailure {
        Load,
        Transaction,
    }

    impl From<TransactionError> for HandlerFailure {
        fn from(_: TransactionError) -> Self {
            Self::Transaction
        }
    }

    #[async_trait]
    impl SnapshotHandler for FailingHandler {
        type Error = HandlerFailure;

        async fn handle(&self, _snapshot: &RawResultsTree) -> Result<(), Self::Error> {
            Err(HandlerFailure::Load)
        }
    }

    #[tokio::test]
    async fn handler_failure_leaves_source_untouched() {
        let tree = json!({"p1": {"g1": {"u1": entry("t1")}}});
        let source = InMemorySource::with_tree("v2/results", tree.clone());

        let err = acquire_and_clear_with(&source, &quick_policy(3), &FailingHandler)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerFailure::Load));
        assert_eq!(source.tree().await, tree);
    }
}
