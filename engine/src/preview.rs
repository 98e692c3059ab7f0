use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sandbox::FormatHint;
use serde::Serialize;
use serde_json::Value;
use storage::ObjectStore;

use crate::error::EngineResult;
use crate::format;

/// Characters of raw text shown for files that are not tables.
const TEXT_PREVIEW_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    Bool,
    Date,
    String,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Preview {
    #[serde(rename_all = "camelCase")]
    Table {
        format: String,
        columns: Vec<PreviewColumn>,
        rows: Vec<Vec<Value>>,
        rows_shown: usize,
        total_rows: usize,
    },
    Text {
        format: String,
        data: String,
        truncated: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Fetch an object (at most `max_bytes`) and preview its first `rows` rows.
pub async fn preview_object(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    rows: usize,
    max_bytes: u64,
) -> EngineResult<Preview> {
    let meta = store.stat_object(bucket, key).await?;
    let bytes = store.get_object(bucket, key, max_bytes).await?;
    Ok(preview_bytes(key, meta.content_type.as_deref(), &bytes, rows))
}

pub fn preview_bytes(name: &str, content_type: Option<&str>, bytes: &[u8], rows: usize) -> Preview {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    let hint = format::infer(name, content_type, bytes);
    if hint == FormatHint::Binary {
        return Preview::Text {
            format: ext,
            data: String::new(),
            truncated: false,
            message: Some("binary file, no text preview".to_string()),
        };
    }

    let text = String::from_utf8_lossy(bytes);
    let table = match ext.as_str() {
        "csv" => delimited(&text, b',', rows),
        "tsv" => delimited(&text, b'\t', rows),
        "json" => match serde_json::from_str::<Value>(&text) {
            Ok(value) => Ok(json_table(value, rows)),
            Err(e) => Err(format!("invalid JSON: {e}")),
        },
        _ => return text_preview(ext, &text, None),
    };
    match table {
        Ok((columns, rows, total_rows)) => Preview::Table {
            format: ext,
            rows_shown: rows.len(),
            columns,
            rows,
            total_rows,
        },
        Err(message) => text_preview(ext, &text, Some(message)),
    }
}

fn text_preview(format: String, text: &str, message: Option<String>) -> Preview {
    let truncated = text.chars().count() > TEXT_PREVIEW_CHARS;
    Preview::Text {
        format,
        data: text.chars().take(TEXT_PREVIEW_CHARS).collect(),
        truncated,
        message,
    }
}

type TablePreview = (Vec<PreviewColumn>, Vec<Vec<Value>>, usize);

/// Column types are inferred over every record, not just the shown ones.
fn delimited(text: &str, delimiter: u8, limit: usize) -> Result<TablePreview, String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| format!("read header: {e}"))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut types: Vec<Option<ColumnType>> = vec![None; headers.len()];
    let mut shown: Vec<Vec<String>> = Vec::new();
    let mut total = 0;
    for record in reader.records() {
        let record = record.map_err(|e| format!("read record {}: {e}", total + 1))?;
        for (slot, field) in types.iter_mut().zip(record.iter()) {
            if !field.is_empty() {
                *slot = Some(widen(*slot, classify_field(field)));
            }
        }
        if shown.len() < limit {
            shown.push(record.iter().map(str::to_string).collect());
        }
        total += 1;
    }

    let types: Vec<ColumnType> = types
        .into_iter()
        .map(|t| t.unwrap_or(ColumnType::String))
        .collect();
    let rows = shown
        .into_iter()
        .map(|fields| {
            types
                .iter()
                .enumerate()
                .map(|(i, t)| match fields.get(i) {
                    Some(f) => typed_value(f, *t),
                    None => Value::Null,
                })
                .collect()
        })
        .collect();
    let columns = headers
        .into_iter()
        .zip(types)
        .map(|(name, column_type)| PreviewColumn { name, column_type })
        .collect();
    Ok((columns, rows, total))
}

fn classify_field(field: &str) -> ColumnType {
    if field.parse::<i64>().is_ok() {
        ColumnType::Int
    } else if field.parse::<f64>().is_ok() {
        ColumnType::Float
    } else if field.eq_ignore_ascii_case("true") || field.eq_ignore_ascii_case("false") {
        ColumnType::Bool
    } else if is_date(field) {
        ColumnType::Date
    } else {
        ColumnType::String
    }
}

fn is_date(field: &str) -> bool {
    NaiveDate::parse_from_str(field, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || DateTime::parse_from_rfc3339(field).is_ok()
}

/// Smallest type that holds both `a` and `b`.
fn widen(current: Option<ColumnType>, next: ColumnType) -> ColumnType {
    match (current, next) {
        (None, t) => t,
        (Some(a), b) if a == b => a,
        (Some(ColumnType::Int), ColumnType::Float) | (Some(ColumnType::Float), ColumnType::Int) => {
            ColumnType::Float
        }
        _ => ColumnType::String,
    }
}

fn typed_value(field: &str, column_type: ColumnType) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    match column_type {
        ColumnType::Int => field.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        ColumnType::Float => field
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(field.to_string())),
        ColumnType::Bool => Value::Bool(field.eq_ignore_ascii_case("true")),
        ColumnType::Date | ColumnType::String | ColumnType::Json => Value::String(field.to_string()),
    }
}

fn json_table(value: Value, limit: usize) -> TablePreview {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return (
                vec![PreviewColumn {
                    name: "data".to_string(),
                    column_type: ColumnType::Json,
                }],
                vec![vec![other]],
                1,
            );
        }
    };

    let total = items.len();
    let shown: Vec<Value> = items.into_iter().take(limit).collect();
    let mut names: Vec<String> = Vec::new();
    for item in &shown {
        if let Value::Object(map) = item {
            for key in map.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
    }
    if names.is_empty() {
        names.push("value".to_string());
    }

    let rows: Vec<Vec<Value>> = shown
        .iter()
        .map(|item| match item {
            Value::Object(map) => names
                .iter()
                .map(|n| map.get(n).cloned().unwrap_or(Value::Null))
                .collect(),
            other => {
                let mut row = vec![Value::Null; names.len()];
                if let Some(first) = row.first_mut() {
                    *first = other.clone();
                }
                row
            }
        })
        .collect();

    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| PreviewColumn {
            column_type: json_column_type(rows.iter().filter_map(|r| r.get(i))),
            name,
        })
        .collect();
    (columns, rows, total)
}

fn json_column_type<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnType {
    let mut current = None;
    for value in values {
        let t = match value {
            Value::Null => continue,
            Value::Bool(_) => ColumnType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Int,
            Value::Number(_) => ColumnType::Float,
            Value::String(s) if is_date(s) => ColumnType::Date,
            Value::String(_) => ColumnType::String,
            Value::Array(_) | Value::Object(_) => ColumnType::Json,
        };
        current = Some(widen(current, t));
    }
    current.unwrap_or(ColumnType::String)
}
