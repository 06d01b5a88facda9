pub mod aggregate;
pub mod extract;
pub mod records;
pub mod report;
pub mod sidecar;
pub mod stats;
pub mod validity;

pub use aggregate::{aggregate, AggregateRow, Metric, RunMetrics};
pub use extract::{extract_run, parse_log, Endpoint, LogMetrics, RawMetrics};
pub use report::{Advisory, AdvisoryKind, ReportSettings};
pub use sidecar::TrustMetrics;
pub use stats::Moments;
pub use validity::{classify, ReasonCode, ValidityVerdict};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sweep_core::table::write_csv;
use sweep_core::{
    atomic_write_bytes, read_statuses, MatrixRow, ParameterTuple, RunIdentity, RunStatus,
    SweepMatrix, MATRIX_FILE_NAME,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use records::{
    aggregate_header, aggregate_record, InvalidRow, SummaryRow, AGGREGATE_FILE, INVALID_FILE,
    INVALID_HEADER, REPORT_FILE, SUMMARY_FILE, SUMMARY_HEADER,
};
use report::{render_report, sanity_checks, ReportScope};

/// Simulator log, inside each run's `logs/` directory.
pub const SIM_LOG_FILE: &str = "COOJA.testlog";
pub const EXPOSURE_FILE: &str = "exposure.csv";
pub const PARENT_SWITCH_FILE: &str = "parent_switch.csv";
pub const STATS_FILE: &str = "stats.csv";

/// A run directory found under a results directory.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Directory name; older sweeps used other naming schemes.
    pub name: String,
    pub tuple: ParameterTuple,
    pub status: RunStatus,
    pub dir: PathBuf,
}

/// Immediate subdirectories whose names parse as run names, sorted by name.
pub fn discover_runs(results_dir: &Path) -> Result<Vec<(String, ParameterTuple, PathBuf)>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(results_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("listing {}", results_dir.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        match RunIdentity::parse_lenient(name) {
            Ok(tuple) => found.push((name.to_string(), tuple, entry.path().to_path_buf())),
            Err(err) => debug!(dir = name, error = %err, "not a run directory"),
        }
    }
    Ok(found)
}

/// Pairs discovered run directories with their matrix status. An existing
/// matrix is read leniently and left untouched, whatever sweep wrote it.
/// Without one a matrix is rebuilt from the directories: runs with a
/// simulator log count as completed, the rest as planned.
pub fn reconcile_runs(results_dir: &Path) -> Result<(Vec<RunRecord>, PathBuf)> {
    let discovered = discover_runs(results_dir)?;
    let matrix_path = results_dir.join(MATRIX_FILE_NAME);
    let has_log = |dir: &Path| dir.join("logs").join(SIM_LOG_FILE).is_file();

    let statuses: BTreeMap<RunIdentity, RunStatus> = if matrix_path.exists() {
        let read = read_statuses(&matrix_path)?;
        if !read.unreadable.is_empty() {
            warn!(
                path = %matrix_path.display(),
                rows = read.unreadable.len(),
                first = %read.unreadable[0],
                "matrix rows with unreadable run name or status"
            );
        }
        read.statuses
    } else {
        let mut rows: BTreeMap<RunIdentity, MatrixRow> = BTreeMap::new();
        for (_, tuple, dir) in &discovered {
            let status = if has_log(dir) {
                RunStatus::Completed
            } else {
                RunStatus::Planned
            };
            rows.entry(RunIdentity::for_tuple(tuple))
                .or_insert_with(|| MatrixRow::with_status(tuple, status));
        }
        let matrix = SweepMatrix::from_rows(&matrix_path, rows.into_values().collect())?;
        matrix.save()?;
        info!(
            path = %matrix_path.display(),
            runs = matrix.rows().len(),
            "rebuilt sweep matrix from run directories"
        );
        matrix.rows().iter().map(|r| (r.run.clone(), r.status)).collect()
    };

    let records = discovered
        .into_iter()
        .map(|(name, tuple, dir)| {
            let status = statuses
                .get(&RunIdentity::for_tuple(&tuple))
                .copied()
                .unwrap_or(if has_log(&dir) {
                    RunStatus::Completed
                } else {
                    RunStatus::Planned
                });
            RunRecord {
                name,
                tuple,
                status,
                dir,
            }
        })
        .collect();
    Ok((records, matrix_path))
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryOutputs {
    pub summary: PathBuf,
    pub invalid: PathBuf,
    pub aggregate: PathBuf,
    pub report: PathBuf,
    pub matrix: PathBuf,
    pub runs: usize,
    pub valid_runs: usize,
    pub invalid_runs: usize,
    pub groups: usize,
    pub advisories: Vec<Advisory>,
}

/// Extracts, classifies and aggregates every run under `results_dir`, and
/// rewrites the summary tables and report from scratch.
pub fn summarize(results_dir: &Path, settings: &ReportSettings) -> Result<SummaryOutputs> {
    if !results_dir.is_dir() {
        return Err(anyhow!(
            "results directory not found: {}",
            results_dir.display()
        ));
    }
    let (records, matrix) = reconcile_runs(results_dir)?;

    let mut valid: Vec<RunMetrics> = Vec::new();
    let mut invalid: Vec<InvalidRow> = Vec::new();
    let mut scope = ReportScope {
        runs: records.len(),
        ..ReportScope::default()
    };
    for record in &records {
        scope.topologies.insert(record.tuple.topology().to_string());
        scope.attack_rates.insert(record.tuple.attack_rate());
        let raw = extract_run(&record.dir)?;
        let verdict = classify(&record.tuple, raw.as_ref());
        match raw.as_ref() {
            Some(raw) if verdict.is_valid() => {
                valid.push(RunMetrics::from_raw(&record.name, &record.tuple, raw));
            }
            raw => {
                debug!(run = %record.name, reasons = %verdict.reason_string(), "invalid run");
                invalid.push(InvalidRow::new(
                    &record.name,
                    &record.tuple,
                    record.status,
                    raw,
                    &verdict,
                ));
            }
        }
    }
    scope.valid = valid.len();

    let summary_path = results_dir.join(SUMMARY_FILE);
    let summary_rows: Vec<SummaryRow> = valid.iter().map(SummaryRow::from).collect();
    write_csv(&summary_path, &SUMMARY_HEADER, &summary_rows)?;

    let invalid_path = results_dir.join(INVALID_FILE);
    write_csv(&invalid_path, &INVALID_HEADER, &invalid)?;

    let groups = aggregate(&valid);
    let aggregate_path = results_dir.join(AGGREGATE_FILE);
    let header = aggregate_header();
    let header_refs: Vec<&str> = header.iter().map(String::as_str).collect();
    let group_rows: Vec<Vec<String>> = groups.iter().map(aggregate_record).collect();
    write_csv(&aggregate_path, &header_refs, &group_rows)?;

    let advisories = sanity_checks(&valid, settings);
    let report_path = results_dir.join(REPORT_FILE);
    let report = render_report(&scope, &invalid, &groups, &advisories, settings);
    atomic_write_bytes(&report_path, report.as_bytes())?;

    info!(
        runs = records.len(),
        valid = valid.len(),
        invalid = invalid.len(),
        groups = groups.len(),
        warnings = advisories.len(),
        "summary written"
    );
    Ok(SummaryOutputs {
        summary: summary_path,
        invalid: invalid_path,
        aggregate: aggregate_path,
        report: report_path,
        matrix,
        runs: records.len(),
        valid_runs: valid.len(),
        invalid_runs: invalid.len(),
        groups: groups.len(),
        advisories,
    })
}
