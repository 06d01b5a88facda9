//! Readers for the trust sidecar's CSV outputs. Every reader returns
//! `None` for a field it cannot establish; nothing here fails a run.

use std::path::Path;
use tracing::debug;

use crate::{EXPOSURE_FILE, PARENT_SWITCH_FILE, STATS_FILE};

/// Positional fallback columns when the exposure file has no header.
const EXPOSURE_E1_COL: usize = 5;
const EXPOSURE_E3_COL: usize = 6;
const STATS_SWITCH_COL: usize = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrustMetrics {
    pub e1: Option<f64>,
    pub e3: Option<f64>,
    pub parent_switch: Option<f64>,
}

impl TrustMetrics {
    pub fn is_complete(&self) -> bool {
        self.e1.is_some() && self.e3.is_some() && self.parent_switch.is_some()
    }
}

pub fn read_trust_metrics(run_dir: &Path) -> TrustMetrics {
    let (e1, e3) = read_exposure(&run_dir.join(EXPOSURE_FILE));
    let parent_switch = read_parent_switch(&run_dir.join(PARENT_SWITCH_FILE))
        .or_else(|| read_stats_switch_rate(&run_dir.join(STATS_FILE)));
    TrustMetrics {
        e1,
        e3,
        parent_switch,
    }
}

/// Non-empty rows with trimmed cells; `None` when the file is absent.
fn read_rows(path: &Path) -> Option<Vec<Vec<String>>> {
    if !path.is_file() {
        return None;
    }
    let mut reader = match csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
    {
        Ok(reader) => reader,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "sidecar file unreadable");
            return None;
        }
    };
    let mut rows = Vec::new();
    for record in reader.byte_records() {
        match record {
            Ok(record) => {
                let row: Vec<String> = record
                    .iter()
                    .map(|cell| String::from_utf8_lossy(cell).trim().to_string())
                    .collect();
                if row.iter().any(|c| !c.is_empty()) {
                    rows.push(row);
                }
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "stopping at unreadable row");
                break;
            }
        }
    }
    Some(rows)
}

fn number(cell: Option<&String>) -> Option<f64> {
    cell?.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn column(header: &[String], name: &str) -> Option<usize> {
    header.iter().position(|c| c == name)
}

/// E1 and E3 from the last data row. Columns are located by header name
/// when the file has one, otherwise by position.
pub fn read_exposure(path: &Path) -> (Option<f64>, Option<f64>) {
    let Some(rows) = read_rows(path) else {
        return (None, None);
    };
    let rows: Vec<&Vec<String>> = rows.iter().filter(|r| !r[0].starts_with('#')).collect();
    let Some(first) = rows.first() else {
        return (None, None);
    };
    if let Some(e1_col) = column(first, "e1") {
        let e3_col = column(first, "e3");
        let Some(last) = rows.iter().skip(1).last() else {
            return (None, None);
        };
        return (
            number(last.get(e1_col)),
            e3_col.and_then(|c| number(last.get(c))),
        );
    }
    let Some(last) = rows.last() else {
        return (None, None);
    };
    if last.len() <= EXPOSURE_E3_COL {
        return (None, None);
    }
    (
        number(last.get(EXPOSURE_E1_COL)),
        number(last.get(EXPOSURE_E3_COL)),
    )
}

/// Mean of the `switch_rate` column; `None` when no row has a number there.
pub fn read_parent_switch(path: &Path) -> Option<f64> {
    let rows = read_rows(path)?;
    let (header, data) = rows.split_first()?;
    let col = column(header, "switch_rate")?;
    let rates: Vec<f64> = data.iter().filter_map(|r| number(r.get(col))).collect();
    if rates.is_empty() {
        return None;
    }
    Some(rates.iter().sum::<f64>() / rates.len() as f64)
}

/// Switch rate from the last periodic-stats row, skipping header rows.
pub fn read_stats_switch_rate(path: &Path) -> Option<f64> {
    let rows = read_rows(path)?;
    let col = rows
        .first()
        .and_then(|h| column(h, "parent_switch_rate"))
        .unwrap_or(STATS_SWITCH_COL);
    let last = rows.iter().filter(|r| r[0] != "line").last()?;
    number(last.get(col))
}
