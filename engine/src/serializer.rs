use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use sandbox::DeclaredResult;
use serde_json::Value;

use crate::types::{Cell, Payload, ResultTable, TextFallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializerLimits {
    pub max_rows: usize,
    pub max_columns: usize,
    /// Ceiling for the textual fallback, in bytes.
    pub max_text_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializeError {
    #[error("result row {row} has {found} cells but the table has {expected} columns")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Convert a declared result into the transport form.
///
/// Tables keep column and row order. Anything that is not a table becomes a
/// [`TextFallback`] built from the captured stdout and the scalar's text.
pub fn serialize(
    declared: &DeclaredResult,
    stdout: &[u8],
    limits: &SerializerLimits,
) -> Result<Payload, SerializeError> {
    match declared {
        DeclaredResult::Table {
            columns,
            rows,
            truncated,
        } => serialize_table(columns, rows, *truncated, limits).map(Payload::Table),
        DeclaredResult::Scalar { text } => Ok(Payload::Text(text_fallback(
            stdout,
            Some(text),
            limits.max_text_bytes,
        ))),
        DeclaredResult::Absent => Ok(Payload::Text(text_fallback(
            stdout,
            None,
            limits.max_text_bytes,
        ))),
    }
}

fn serialize_table(
    columns: &[String],
    rows: &[Vec<Value>],
    guest_truncated: bool,
    limits: &SerializerLimits,
) -> Result<ResultTable, SerializeError> {
    let width = columns.len().min(limits.max_columns);
    let mut truncated = guest_truncated || columns.len() > width || rows.len() > limits.max_rows;

    let mut out = Vec::with_capacity(rows.len().min(limits.max_rows));
    for (i, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(SerializeError::Ragged {
                row: i,
                expected: columns.len(),
                found: row.len(),
            });
        }
        if i >= limits.max_rows {
            truncated = true;
            continue;
        }
        out.push(row.iter().take(width).map(cell).collect());
    }

    Ok(ResultTable {
        columns: unique_columns(columns.iter().take(width)),
        rows: out,
        truncated,
    })
}

/// Repeated names get `.1`, `.2`, ... suffixes, skipping names already in use.
fn unique_columns<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let names: Vec<&String> = names.collect();
    let mut taken: std::collections::HashSet<String> = names.iter().map(|n| (*n).clone()).collect();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if seen.insert(name.clone()) {
            out.push(name.clone());
            continue;
        }
        let mut n = 1;
        let mut candidate = format!("{name}.{n}");
        while taken.contains(&candidate) {
            n += 1;
            candidate = format!("{name}.{n}");
        }
        taken.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

fn cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Cell::Integer(i),
            // Above i64::MAX; keep every digit.
            (None, _) if n.is_u64() => Cell::Text(n.to_string()),
            (None, Some(f)) => Cell::Float(f),
            (None, None) => Cell::Text(n.to_string()),
        },
        Value::String(s) => Cell::Text(s.clone()),
        Value::Object(map) if map.len() == 1 => match map.iter().next() {
            Some((tag, Value::String(raw))) => special_cell(tag, raw).unwrap_or_else(|| compact(value)),
            _ => compact(value),
        },
        Value::Array(_) | Value::Object(_) => compact(value),
    }
}

fn special_cell(tag: &str, raw: &str) -> Option<Cell> {
    match tag {
        "$int" => Some(match raw.parse::<i64>() {
            Ok(i) => Cell::Integer(i),
            Err(_) => Cell::Text(raw.to_string()),
        }),
        "$float" => match raw {
            "NaN" => Some(Cell::Float(f64::NAN)),
            "Infinity" => Some(Cell::Float(f64::INFINITY)),
            "-Infinity" => Some(Cell::Float(f64::NEG_INFINITY)),
            _ => None,
        },
        "$timestamp" => Some(timestamp(raw)),
        _ => None,
    }
}

/// Normalize an ISO 8601 value. Zoned values become UTC; naive ones keep
/// their wall-clock form; unparsable ones stay text.
fn timestamp(raw: &str) -> Cell {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Cell::Timestamp(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Cell::Timestamp(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Cell::Timestamp(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(t) = NaiveTime::parse_from_str(raw, "%H:%M:%S%.f") {
        return Cell::Timestamp(t.format("%H:%M:%S%.f").to_string());
    }
    Cell::Text(raw.to_string())
}

fn compact(value: &Value) -> Cell {
    Cell::Text(value.to_string())
}

/// Stdout followed by the scalar text, capped at `max_bytes` on a char boundary.
fn text_fallback(stdout: &[u8], scalar: Option<&str>, max_bytes: usize) -> TextFallback {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    if let Some(scalar) = scalar {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(scalar);
    }
    if text.len() <= max_bytes {
        return TextFallback {
            text,
            truncated: false,
        };
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    TextFallback {
        text,
        truncated: true,
    }
}
