//! CSV helpers shared by the matrix and the summary tables.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::atomic_write_bytes;

/// Serialises `rows` under an explicit header so empty tables still carry
/// their column names, then replaces `path` atomically.
pub fn write_csv<T: Serialize>(path: &Path, header: &[&str], rows: &[T]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("csv buffer flush failed: {}", e))?;
    atomic_write_bytes(path, &bytes).with_context(|| format!("writing {}", path.display()))
}

pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for (idx, record) in reader.deserialize().enumerate() {
        let row: T = record.with_context(|| format!("{}: row {}", path.display(), idx + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Fixed-precision cell for an optional metric; blank when absent.
pub fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => String::new(),
    }
}
