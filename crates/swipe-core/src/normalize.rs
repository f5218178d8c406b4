//! Flattening of the nested results tree into staging rows.
//!
//! The source store silently turns any map whose keys are small integers into a
//! sequence padded with nulls, so every level of the tree may arrive as either
//! form. [`ResultsContainer`] resolves that once per level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::{
    json_kind, parse_iso_value, parse_timestamp_or_millis, NormalizeError, ParseError,
    RawResultsTree, SchemaError, SourceLayout, StagingRow, TaskCoordinates,
};

/// One level of the results tree.
#[derive(Debug, Clone, Copy)]
pub enum ResultsContainer<'a> {
    Mapping(&'a Map<String, JsonValue>),
    /// Index is the key; null slots are gaps, not entries.
    SparseSequence(&'a [JsonValue]),
}

impl<'a> ResultsContainer<'a> {
    pub fn resolve(value: &'a JsonValue, path: &str) -> Result<Self, SchemaError> {
        match value {
            JsonValue::Object(map) => Ok(Self::Mapping(map)),
            JsonValue::Array(items) => Ok(Self::SparseSequence(items)),
            other => Err(SchemaError::UnexpectedContainer {
                path: path.to_string(),
                found: json_kind(other),
            }),
        }
    }

    /// Present entries as `(key, value)`. Only `null` is a gap; empty strings,
    /// maps and sequences are entries and must be rejected by the caller.
    pub fn entries(self) -> Vec<(String, &'a JsonValue)> {
        match self {
            Self::Mapping(map) => map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v))
                .collect(),
            Self::SparseSequence(items) => items
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        }
    }
}

/// A part of the tree that could not be turned into rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejected {
    pub path: String,
    pub reason: String,
    pub raw: JsonValue,
}

/// Rows produced from one deletable leaf of the source tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub path: Vec<String>,
    pub rows: Vec<StagingRow>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub rows: Vec<StagingRow>,
    pub rejected: Vec<Rejected>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecords {
    pub records: Vec<SourceRecord>,
    pub rejected: Vec<Rejected>,
}

impl NormalizedRecords {
    pub fn row_count(&self) -> usize {
        self.records.iter().map(|r| r.rows.len()).sum()
    }

    pub fn into_normalized(self) -> Normalized {
        Normalized {
            rows: self.records.into_iter().flat_map(|r| r.rows).collect(),
            rejected: self.rejected,
        }
    }
}

/// Normalize a grouped (`project/group/user`) tree into flat rows.
pub fn normalize(tree: &RawResultsTree) -> Result<Normalized, SchemaError> {
    normalize_records(tree, SourceLayout::Grouped).map(NormalizedRecords::into_normalized)
}

/// Normalize a tree into per-record rows. Only structural incompatibility of the
/// whole batch is returned as an error; everything else lands in `rejected`.
pub fn normalize_records(
    tree: &RawResultsTree,
    layout: SourceLayout,
) -> Result<NormalizedRecords, SchemaError> {
    let mut out = NormalizedRecords::default();
    if tree.is_empty() {
        return Ok(out);
    }
    let top = ResultsContainer::resolve(tree.as_value(), "")?;
    match layout {
        SourceLayout::Grouped => walk_grouped(top, &mut out)?,
        SourceLayout::Legacy => walk_legacy(top, &mut out),
    }
    Ok(out)
}

fn walk_grouped(projects: ResultsContainer<'_>, out: &mut NormalizedRecords) -> Result<(), SchemaError> {
    for (project_id, groups) in projects.entries() {
        let Some(groups) = child_container(groups, &project_id, out) else {
            continue;
        };
        for (group_id, users) in groups.entries() {
            let group_path = format!("{project_id}/{group_id}");
            let Some(users) = child_container(users, &group_path, out) else {
                continue;
            };
            for (user_id, entry) in users.entries() {
                let path = vec![project_id.clone(), group_id.clone(), user_id.clone()];
                match user_entry(&path, entry, out) {
                    Ok(rows) => out.records.push(SourceRecord { path, rows }),
                    Err(NormalizeError::Schema(err)) if err.is_fatal() => return Err(err),
                    Err(err) => reject(out, path.join("/"), &err, entry),
                }
            }
        }
    }
    Ok(())
}

fn walk_legacy(tasks: ResultsContainer<'_>, out: &mut NormalizedRecords) {
    for (task_id, children) in tasks.entries() {
        let Some(children) = child_container(children, &task_id, out) else {
            continue;
        };
        for (child_id, leaf) in children.entries() {
            let path = vec![task_id.clone(), child_id.clone()];
            match legacy_leaf(&task_id, &child_id, leaf) {
                Ok(row) => out.records.push(SourceRecord { path, rows: vec![row] }),
                Err(err) => reject(out, path.join("/"), &err, leaf),
            }
        }
    }
}

/// Resolve a nested level. A scalar or a level without a single entry is rejected.
fn child_container<'a>(
    value: &'a JsonValue,
    path: &str,
    out: &mut NormalizedRecords,
) -> Option<ResultsContainer<'a>> {
    let resolved = ResultsContainer::resolve(value, path).and_then(|container| {
        if container.entries().is_empty() {
            Err(SchemaError::Empty {
                path: path.to_string(),
                found: json_kind(value),
            })
        } else {
            Ok(container)
        }
    });
    match resolved {
        Ok(container) => Some(container),
        Err(err) => {
            reject(out, path.to_string(), &NormalizeError::Schema(err), value);
            None
        }
    }
}

fn reject(out: &mut NormalizedRecords, path: String, err: &NormalizeError, raw: &JsonValue) {
    warn!(path = %path, error = %err, "skipping malformed results entry");
    out.rejected.push(Rejected {
        path,
        reason: err.to_string(),
        raw: raw.clone(),
    });
}

struct EntryTimes {
    timestamp: DateTime<Utc>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

fn user_entry(
    path: &[String],
    entry: &JsonValue,
    out: &mut NormalizedRecords,
) -> Result<Vec<StagingRow>, NormalizeError> {
    let joined = path.join("/");
    let JsonValue::Object(fields) = entry else {
        return Err(SchemaError::UnexpectedContainer {
            path: joined,
            found: json_kind(entry),
        }
        .into());
    };

    let times = EntryTimes {
        timestamp: timestamp_field(fields, "timestamp", &joined, parse_iso_value)?,
        start_time: timestamp_field(fields, "startTime", &joined, parse_iso_value)?,
        end_time: timestamp_field(fields, "endTime", &joined, parse_iso_value)?,
    };

    let results = fields.get("results").ok_or_else(|| SchemaError::MissingField {
        path: joined.clone(),
        field: "results",
    })?;
    let container = match results {
        JsonValue::Null => return Ok(Vec::new()),
        JsonValue::Object(map) => ResultsContainer::Mapping(map),
        JsonValue::Array(items) => ResultsContainer::SparseSequence(items),
        other => {
            return Err(SchemaError::ResultsContainer {
                path: joined,
                found: json_kind(other),
            }
            .into())
        }
    };

    let mut rows = Vec::new();
    for (task_id, code) in container.entries() {
        match result_code(code) {
            Ok(result) => rows.push(StagingRow {
                project_id: path[0].clone(),
                group_id: path[1].clone(),
                user_id: path[2].clone(),
                task_id,
                timestamp: times.timestamp,
                start_time: times.start_time,
                end_time: times.end_time,
                result,
                wkt: None,
                coordinates: None,
            }),
            Err(err) => reject(
                out,
                format!("{joined}/results/{task_id}"),
                &NormalizeError::from(err),
                code,
            ),
        }
    }
    Ok(rows)
}

fn timestamp_field(
    fields: &Map<String, JsonValue>,
    field: &'static str,
    path: &str,
    parse: fn(&JsonValue) -> Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, NormalizeError> {
    let value = fields.get(field).ok_or_else(|| SchemaError::MissingField {
        path: path.to_string(),
        field,
    })?;
    parse(value).ok_or_else(|| {
        ParseError::Timestamp {
            field,
            value: value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()),
        }
        .into()
    })
}

fn result_code(value: &JsonValue) -> Result<i16, ParseError> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|code| i16::try_from(code).ok())
        .ok_or_else(|| ParseError::ResultCode(value.to_string()))
}

fn identifier(value: Option<&JsonValue>, field: &'static str) -> Result<String, NormalizeError> {
    match value {
        Some(JsonValue::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ParseError::Identifier {
            field,
            value: other.to_string(),
        }
        .into()),
        None => Err(SchemaError::MissingField {
            path: String::new(),
            field,
        }
        .into()),
    }
}

fn legacy_leaf(task_id: &str, child_id: &str, leaf: &JsonValue) -> Result<StagingRow, NormalizeError> {
    let path = format!("{task_id}/{child_id}");
    let data = match leaf.get("data") {
        Some(JsonValue::Object(data)) => data,
        _ => {
            return Err(SchemaError::MissingField { path, field: "data" }.into());
        }
    };

    let with_path = |err: NormalizeError| match err {
        NormalizeError::Schema(SchemaError::MissingField { field, .. }) => {
            NormalizeError::Schema(SchemaError::MissingField { path: path.clone(), field })
        }
        other => other,
    };

    let task_id = match data.get("id") {
        Some(JsonValue::String(id)) if !id.is_empty() => id.clone(),
        _ => task_id.to_string(),
    };
    let user_id = identifier(data.get("user"), "user").map_err(with_path)?;
    let project_id = identifier(data.get("projectId"), "projectId").map_err(with_path)?;
    let result = result_code(data.get("result").unwrap_or(&JsonValue::Null))?;
    let timestamp = timestamp_field(data, "timestamp", &path, parse_timestamp_or_millis)?;
    let wkt = data
        .get("wkt")
        .and_then(JsonValue::as_str)
        .filter(|wkt| !wkt.is_empty())
        .map(str::to_string);
    let coordinates: TaskCoordinates = task_id.parse()?;

    Ok(StagingRow {
        project_id,
        group_id: String::new(),
        user_id,
        task_id,
        timestamp,
        start_time: timestamp,
        end_time: timestamp,
        result,
        wkt,
        coordinates: Some(coordinates),
    })
}
