use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use swipe_core::RawResultsTree;
use tokio::sync::Mutex;

use crate::{ResultsSource, SourceError, SwapOutcome, Versioned};

#[derive(Debug)]
struct MemoryState {
    tree: JsonValue,
    version: u64,
}

/// Versioned in-process results tree with the same empty-node pruning as the
/// hosted store. Used for dry runs and tests.
#[derive(Debug)]
pub struct InMemorySource {
    root: String,
    state: Mutex<MemoryState>,
    reads: AtomicUsize,
}

impl InMemorySource {
    pub fn new(root: impl Into<String>) -> Self {
        Self::with_tree(root, JsonValue::Null)
    }

    pub fn with_tree(root: impl Into<String>, tree: JsonValue) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(MemoryState { tree, version: 0 }),
            reads: AtomicUsize::new(0),
        }
    }

    pub async fn tree(&self) -> JsonValue {
        self.state.lock().await.tree.clone()
    }

    /// Number of subtree reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Write `value` at `path`, creating intermediate maps, as a client submission would.
    pub async fn insert(&self, path: &[&str], value: JsonValue) {
        let mut state = self.state.lock().await;
        insert_at(&mut state.tree, path, value);
        state.version += 1;
    }
}

/// Set `path` to `value`, replacing any scalar on the way with a map.
fn insert_at(node: &mut JsonValue, path: &[&str], value: JsonValue) {
    let Some((head, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = JsonValue::Object(Map::new());
    }
    if let JsonValue::Object(map) = node {
        insert_at(map.entry(head.to_string()).or_insert(JsonValue::Null), rest, value);
    }
}

/// Remove the node at `path`; returns whether `value` itself became empty.
fn remove_at(value: &mut JsonValue, path: &[String]) -> bool {
    let Some((head, rest)) = path.split_first() else {
        *value = JsonValue::Null;
        return true;
    };
    let now_empty = match value {
        JsonValue::Object(map) => {
            let child_empty = map.get_mut(head).map(|child| remove_at(child, rest));
            if child_empty == Some(true) {
                map.remove(head);
            }
            map.is_empty()
        }
        JsonValue::Array(items) => {
            if let Some(child) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                if remove_at(child, rest) {
                    *child = JsonValue::Null;
                }
            }
            items.iter().all(JsonValue::is_null)
        }
        _ => false,
    };
    if now_empty {
        *value = JsonValue::Null;
    }
    now_empty
}

#[async_trait]
impl ResultsSource for InMemorySource {
    fn root_path(&self) -> &str {
        &self.root
    }

    async fn get_subtree(&self) -> Result<Versioned, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        Ok(Versioned {
            tree: RawResultsTree::new(state.tree.clone()),
            version: state.version.to_string(),
        })
    }

    async fn compare_and_swap(
        &self,
        expected_version: &str,
        replacement: &JsonValue,
    ) -> Result<SwapOutcome, SourceError> {
        let mut state = self.state.lock().await;
        if state.version.to_string() != expected_version {
            return Ok(SwapOutcome::Conflict);
        }
        state.tree = replacement.clone();
        state.version += 1;
        Ok(SwapOutcome::Committed)
    }

    async fn delete_path(&self, path: &[String]) -> Result<(), SourceError> {
        let mut state = self.state.lock().await;
        remove_at(&mut state.tree, path);
        state.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn delete_prunes_emptied_parents() {
        let source = InMemorySource::with_tree(
            "results",
            json!({"18-1-2": {"a": {"data": 1}, "b": {"data": 2}}, "18-1-3": {"c": {"data": 3}}}),
        );

        source.delete_path(&path(&["18-1-3", "c"])).await.unwrap();
        assert_eq!(
            source.tree().await,
            json!({"18-1-2": {"a": {"data": 1}, "b": {"data": 2}}})
        );

        source.delete_path(&path(&["18-1-2", "a"])).await.unwrap();
        source.delete_path(&path(&["18-1-2", "b"])).await.unwrap();
        assert!(source.tree().await.is_null());
    }

    #[tokio::test]
    async fn delete_inside_sparse_sequence_leaves_a_gap() {
        let source = InMemorySource::with_tree("results", json!([null, {"x": 1}, {"y": 2}]));
        source.delete_path(&path(&["1", "x"])).await.unwrap();
        assert_eq!(source.tree().await, json!([null, null, {"y": 2}]));
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let source = InMemorySource::with_tree("results", json!({"a": 1}));
        let first = source.get_subtree().await.unwrap();
        source.insert(&["b"], json!(2)).await;

        let outcome = source.compare_and_swap(&first.version, &JsonValue::Null).await.unwrap();
        assert_eq!(outcome, SwapOutcome::Conflict);
        assert_eq!(source.tree().await, json!({"a": 1, "b": 2}));
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn insert_creates_maps_over_scalars() {
        let source = InMemorySource::with_tree("results", json!({"p1": 5}));
        source.insert(&["p1", "g1", "u1"], json!({"t1": 1})).await;
        source.insert(&["p2"], json!(true)).await;
        assert_eq!(
            source.tree().await,
            json!({"p1": {"g1": {"u1": {"t1": 1}}}, "p2": true})
        );
        let versioned = source.get_subtree().await.unwrap();
        assert_eq!(versioned.version, "2");
    }
}
