//! Permissive ISO-8601 timestamp parsing.
//!
//! Clients submit timestamps with or without a UTC offset and with or without
//! fractional seconds. Values without an offset are taken as UTC. Only legacy
//! records may carry epoch milliseconds instead; grouped entries are ISO only.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;

const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Some(parsed.with_timezone(&Utc));
    }

    let zulu = input
        .strip_suffix('Z')
        .or_else(|| input.strip_suffix('z'))
        .map(|rest| format!("{rest}+00:00"));
    let with_offset = zulu.as_deref().unwrap_or(input);
    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(with_offset, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(input, format) {
            return Some(parsed.and_utc());
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// ISO-8601 from a JSON string; anything else is unparseable.
pub fn parse_iso_value(value: &JsonValue) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

/// Accepts an ISO-8601 string, or epoch milliseconds as a number or numeric string.
pub fn parse_timestamp_or_millis(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_timestamp(s).or_else(|| {
            s.trim()
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
        }),
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}
