//! Flat CSV dump of harvested timelines.

use std::io::Write;
use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

use crate::models::{numeric, TIMELINES};
use crate::storage::{DocumentStore, Filter};

const SEPARATOR: &str = ";";
const COLUMNS: [&str; 7] = [
    "id_str",
    "created_at",
    "text",
    "retweet_count",
    "favorite_count",
    "user_id",
    "screen_name",
];

/// Write every stored timeline post as one row. Returns the number of rows.
pub async fn export_timelines<W: Write>(store: &dyn DocumentStore, mut out: W) -> Result<usize> {
    writeln!(out, "{}", COLUMNS.join(SEPARATOR))?;

    let mut cursor = store.find(TIMELINES, Filter::All).await?;
    let mut rows = 0usize;
    while let Some(doc) = cursor.next().await {
        let doc = doc.context("Timeline scan failed during export")?;
        let line = row(&doc)
            .iter()
            .map(|field| quote(field))
            .collect::<Vec<_>>()
            .join(SEPARATOR);
        writeln!(out, "{}", line)?;
        rows += 1;
    }
    out.flush()?;
    info!(rows, "Timelines exported");
    Ok(rows)
}

fn row(doc: &Value) -> [String; 7] {
    let text = doc
        .get("full_text")
        .or_else(|| doc.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .replace(['\n', '\r'], " ");
    let user = doc.get("user");
    [
        string_field(doc.get("id_str")),
        string_field(doc.get("created_at")),
        text,
        count(doc.get("retweet_count")),
        count(doc.get("favorite_count")),
        string_field(user.and_then(|u| u.get("id_str"))),
        string_field(user.and_then(|u| u.get("screen_name"))),
    ]
}

fn string_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn count(value: Option<&Value>) -> String {
    value.and_then(numeric).unwrap_or(0).to_string()
}

// Minimal quoting: only fields holding the separator or a quote are wrapped.
fn quote(field: &str) -> String {
    if field.contains(SEPARATOR) || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
