//! PostgreSQL `COPY` text format for staging rows.
//!
//! The same bytes are written to the spool file and streamed into `COPY ...
//! FROM STDIN`, so a recovered spool can be replayed without re-encoding.

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::{StagingRow, TaskCoordinates, STAGING_COLUMNS};

const NULL: &str = "\\N";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("line {line}: expected {expected} columns, found {found}")]
    ColumnCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: invalid value `{value}` for column `{column}`")]
    InvalidValue {
        line: usize,
        column: &'static str,
        value: String,
    },
}

pub fn encode_rows(rows: &[StagingRow]) -> String {
    let mut out = String::with_capacity(rows.len() * 128);
    for row in rows {
        encode_row(row, &mut out);
    }
    out
}

pub fn encode_row(row: &StagingRow, out: &mut String) {
    let coords = row.coordinates;
    let fields: [Option<String>; 12] = [
        Some(row.project_id.clone()),
        Some(row.group_id.clone()),
        Some(row.user_id.clone()),
        Some(row.task_id.clone()),
        Some(format_timestamp(row.timestamp)),
        Some(format_timestamp(row.start_time)),
        Some(format_timestamp(row.end_time)),
        Some(row.result.to_string()),
        row.wkt.clone(),
        coords.map(|c| c.x.to_string()),
        coords.map(|c| c.y.to_string()),
        coords.map(|c| c.z.to_string()),
    ];
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        match field {
            Some(value) => escape_into(value, out),
            None => out.push_str(NULL),
        }
    }
    out.push('\n');
}

pub fn decode_rows(text: &str) -> Result<Vec<StagingRow>, CodecError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .map(|(i, line)| decode_line(i + 1, line))
        .collect()
}

fn decode_line(line: usize, text: &str) -> Result<StagingRow, CodecError> {
    let raw: Vec<&str> = text.split('\t').collect();
    if raw.len() != STAGING_COLUMNS.len() {
        return Err(CodecError::ColumnCount {
            line,
            expected: STAGING_COLUMNS.len(),
            found: raw.len(),
        });
    }
    let fields: Vec<Option<String>> = raw
        .iter()
        .map(|f| (*f != NULL).then(|| unescape(f)))
        .collect();

    let invalid = |index: usize| CodecError::InvalidValue {
        line,
        column: STAGING_COLUMNS[index],
        value: raw[index].to_string(),
    };
    let text_at = |index: usize| fields[index].clone().ok_or_else(|| invalid(index));
    let time_at = |index: usize| {
        fields[index]
            .as_deref()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
            .ok_or_else(|| invalid(index))
    };
    let int_at = |index: usize| -> Result<Option<i32>, CodecError> {
        fields[index]
            .as_deref()
            .map(|v| v.parse::<i32>().map_err(|_| invalid(index)))
            .transpose()
    };

    let coordinates = match (int_at(9)?, int_at(10)?, int_at(11)?) {
        (Some(x), Some(y), Some(z)) => Some(TaskCoordinates { x, y, z }),
        (None, None, None) => None,
        _ => return Err(invalid(9)),
    };

    Ok(StagingRow {
        project_id: text_at(0)?,
        group_id: text_at(1)?,
        user_id: text_at(2)?,
        task_id: text_at(3)?,
        timestamp: time_at(4)?,
        start_time: time_at(5)?,
        end_time: time_at(6)?,
        result: fields[7]
            .as_deref()
            .and_then(|v| v.parse::<i16>().ok())
            .ok_or_else(|| invalid(7))?,
        wkt: fields[8].clone(),
        coordinates,
    })
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
