//! Core result model, error taxonomy and normalization for the results transfer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod codec;
pub mod normalize;
pub mod timestamp;

pub use codec::{decode_rows, encode_row, encode_rows, CodecError};
pub use normalize::{
    normalize, normalize_records, Normalized, NormalizedRecords, Rejected, ResultsContainer,
    SourceRecord,
};
pub use timestamp::{parse_iso_value, parse_timestamp, parse_timestamp_or_millis};

pub const CRATE_NAME: &str = "swipe-core";

/// Column order shared by the spool file, the staging table and the permanent table.
pub const STAGING_COLUMNS: [&str; 12] = [
    "project_id",
    "group_id",
    "user_id",
    "task_id",
    "timestamp",
    "start_time",
    "end_time",
    "result",
    "wkt",
    "task_x",
    "task_y",
    "task_z",
];

/// Natural key of a result. Unique in the permanent store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultKey {
    pub project_id: String,
    pub group_id: String,
    pub user_id: String,
    pub task_id: String,
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project_id, self.group_id, self.user_id, self.task_id
        )
    }
}

/// Tile indices encoded in legacy task identifiers as `"<z>-<x>-<y>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCoordinates {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl FromStr for TaskCoordinates {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::TaskCoordinates(s.to_string());
        let mut parts = s.split('-');
        let (Some(z), Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        Ok(Self {
            x: x.trim().parse().map_err(|_| invalid())?,
            y: y.trim().parse().map_err(|_| invalid())?,
            z: z.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// One flat result row, in the column order of [`STAGING_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRow {
    pub project_id: String,
    pub group_id: String,
    pub user_id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub result: i16,
    pub wkt: Option<String>,
    pub coordinates: Option<TaskCoordinates>,
}

impl StagingRow {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            project_id: self.project_id.clone(),
            group_id: self.group_id.clone(),
            user_id: self.user_id.clone(),
            task_id: self.task_id.clone(),
        }
    }
}

/// Shape of the source results subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLayout {
    /// `<project>/<group>/<user>` holding `{timestamp, startTime, endTime, results}`.
    #[default]
    Grouped,
    /// `<task_id>/<child_id>` holding `{data: {...}}`, one result per leaf.
    Legacy,
}

impl FromStr for SourceLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grouped" => Ok(Self::Grouped),
            "legacy" => Ok(Self::Legacy),
            other => Err(format!("unknown results layout `{other}` (expected grouped or legacy)")),
        }
    }
}

impl fmt::Display for SourceLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grouped => f.write_str("grouped"),
            Self::Legacy => f.write_str("legacy"),
        }
    }
}

/// Snapshot of the source results subtree as downloaded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawResultsTree(JsonValue);

impl RawResultsTree {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        self.0
    }

    /// The source store represents an absent subtree as `null`; empty containers count too.
    pub fn is_empty(&self) -> bool {
        is_vacant(&self.0)
    }
}

impl From<JsonValue> for RawResultsTree {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

fn is_vacant(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.iter().all(JsonValue::is_null),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

pub(crate) fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a sequence",
        JsonValue::Object(_) => "a map",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("expected a map or sparse sequence at `{path}`, found {found}")]
    UnexpectedContainer { path: String, found: &'static str },
    #[error("`results` at `{path}` must be a map or sparse sequence, found {found}")]
    ResultsContainer { path: String, found: &'static str },
    #[error("missing field `{field}` at `{path}`")]
    MissingField { path: String, field: &'static str },
    #[error("`{path}` is {found} with no entries")]
    Empty { path: String, found: &'static str },
}

impl SchemaError {
    /// Whether the whole batch is structurally incompatible, as opposed to one bad entry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResultsContainer { .. })
            || matches!(self, Self::UnexpectedContainer { path, .. } if path.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid timestamp `{value}` in `{field}`")]
    Timestamp { field: &'static str, value: String },
    #[error("invalid result code `{0}`")]
    ResultCode(String),
    #[error("invalid task coordinates `{0}` (expected z-x-y)")]
    TaskCoordinates(String),
    #[error("invalid identifier `{value}` in `{field}`")]
    Identifier { field: &'static str, value: String },
}

/// Row- or entry-level failure raised while flattening one part of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}
