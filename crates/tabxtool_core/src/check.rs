use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;

const SAMPLE_CHARS: usize = 120;

/// A data cell that the wiki is likely to reject or mangle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellViolation {
    pub row: usize,
    pub column: usize,
    pub column_name: Option<String>,
    pub length: usize,
    pub has_tab: bool,
    pub starts_with_space: bool,
    pub ends_with_space: bool,
    pub sample: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub rows: usize,
    pub bytes: usize,
    pub violations: Vec<CellViolation>,
}

pub fn check_chunk_file(path: &Path, long_field_threshold: usize) -> Result<CheckReport> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    check_chunk_text(&content, long_field_threshold)
        .with_context(|| format!("failed to check {}", path.display()))
}

pub fn check_chunk_text(content: &str, long_field_threshold: usize) -> Result<CheckReport> {
    let parsed: Value = serde_json::from_str(content).context("chunk is not valid JSON")?;
    let Some(rows) = parsed.get("data").and_then(Value::as_array) else {
        bail!("invalid tabx chunk: missing data array");
    };
    let column_names = parsed
        .pointer("/schema/fields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .map(|field| field.get("name").and_then(Value::as_str).map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut violations = Vec::new();
    for (row_index, row) in rows.iter().enumerate() {
        let Some(cells) = row.as_array() else {
            continue;
        };
        for (column, cell) in cells.iter().enumerate() {
            let Some(text) = cell.as_str() else {
                continue;
            };
            let length = text.chars().count();
            let has_tab = text.contains('\t');
            let starts_with_space = text.starts_with(' ');
            let ends_with_space = text.ends_with(' ');
            if length <= long_field_threshold && !has_tab && !starts_with_space && !ends_with_space {
                continue;
            }
            violations.push(CellViolation {
                row: row_index,
                column,
                column_name: column_names.get(column).cloned().flatten(),
                length,
                has_tab,
                starts_with_space,
                ends_with_space,
                sample: text.chars().take(SAMPLE_CHARS).collect(),
            });
        }
    }

    Ok(CheckReport {
        rows: rows.len(),
        bytes: content.len(),
        violations,
    })
}
