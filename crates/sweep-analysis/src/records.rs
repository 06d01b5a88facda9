//! Tabular forms of the evaluated runs and condition groups.

use serde::Serialize;
use sweep_core::params::{flag01, na_option};
use sweep_core::table::fmt_opt;
use sweep_core::{ParameterTuple, RunStatus};

use crate::aggregate::{AggregateRow, Metric, RunMetrics};
use crate::extract::RawMetrics;
use crate::validity::ValidityVerdict;

pub const SUMMARY_FILE: &str = "experiment_summary.csv";
pub const INVALID_FILE: &str = "invalid_runs.csv";
pub const AGGREGATE_FILE: &str = "aggregate_by_group.csv";
pub const REPORT_FILE: &str = "report.md";

pub const SUMMARY_HEADER: [&str; 16] = [
    "run",
    "topology",
    "attack_rate",
    "trust",
    "lambda",
    "gamma",
    "seed",
    "pdr",
    "avg_delay_ms",
    "tx",
    "rx",
    "delivered",
    "lost",
    "e1",
    "e3",
    "parent_switch_rate",
];

pub const INVALID_HEADER: [&str; 11] = [
    "run",
    "topology",
    "attack_rate",
    "trust",
    "lambda",
    "gamma",
    "seed",
    "status",
    "tx",
    "rx",
    "reason",
];

const GROUP_COLUMNS: [&str; 6] = ["topology", "attack_rate", "trust", "lambda", "gamma", "n"];

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub run: String,
    pub topology: String,
    pub attack_rate: u32,
    #[serde(with = "flag01")]
    pub trust: bool,
    #[serde(with = "na_option")]
    pub lambda: Option<u32>,
    #[serde(with = "na_option")]
    pub gamma: Option<u32>,
    pub seed: u64,
    pub pdr: String,
    pub avg_delay_ms: String,
    pub tx: usize,
    pub rx: usize,
    pub delivered: usize,
    pub lost: usize,
    pub e1: String,
    pub e3: String,
    pub parent_switch_rate: String,
}

impl From<&RunMetrics> for SummaryRow {
    fn from(m: &RunMetrics) -> Self {
        let cell = |metric: Metric| fmt_opt(m.value(metric), metric.precision());
        Self {
            run: m.run.clone(),
            topology: m.tuple.topology().to_string(),
            attack_rate: m.tuple.attack_rate(),
            trust: m.tuple.trust_enabled(),
            lambda: m.tuple.lambda(),
            gamma: m.tuple.gamma(),
            seed: m.tuple.seed(),
            pdr: cell(Metric::Pdr),
            avg_delay_ms: cell(Metric::AvgDelayMs),
            tx: m.tx,
            rx: m.rx,
            delivered: m.delivered,
            lost: m.lost,
            e1: cell(Metric::E1),
            e3: cell(Metric::E3),
            parent_switch_rate: cell(Metric::ParentSwitch),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidRow {
    pub run: String,
    pub topology: String,
    pub attack_rate: u32,
    #[serde(with = "flag01")]
    pub trust: bool,
    #[serde(with = "na_option")]
    pub lambda: Option<u32>,
    #[serde(with = "na_option")]
    pub gamma: Option<u32>,
    pub seed: u64,
    /// Matrix status, so timeouts and crashes can be told apart.
    pub status: RunStatus,
    /// Blank when the run left no log.
    pub tx: Option<usize>,
    pub rx: Option<usize>,
    pub reason: String,
}

impl InvalidRow {
    pub fn new(
        run: &str,
        tuple: &ParameterTuple,
        status: RunStatus,
        raw: Option<&RawMetrics>,
        verdict: &ValidityVerdict,
    ) -> Self {
        Self {
            run: run.to_string(),
            topology: tuple.topology().to_string(),
            attack_rate: tuple.attack_rate(),
            trust: tuple.trust_enabled(),
            lambda: tuple.lambda(),
            gamma: tuple.gamma(),
            seed: tuple.seed(),
            status,
            tx: raw.map(|r| r.log.tx()),
            rx: raw.map(|r| r.log.rx()),
            reason: verdict.reason_string(),
        }
    }
}

/// Group columns, then mean/std/ci95 for every metric.
pub fn aggregate_header() -> Vec<String> {
    let mut header: Vec<String> = GROUP_COLUMNS.iter().map(|c| c.to_string()).collect();
    for metric in Metric::ALL {
        for stat in ["mean", "std", "ci95"] {
            header.push(format!("{}_{}", stat, metric.column()));
        }
    }
    header
}

/// A metric with no samples in the group renders as three blank cells.
pub fn aggregate_record(row: &AggregateRow) -> Vec<String> {
    let key = &row.condition;
    let mut record = vec![
        key.topology.clone(),
        key.attack_rate.to_string(),
        u8::from(key.trust_enabled).to_string(),
        sweep_core::params::na_or(key.lambda),
        sweep_core::params::na_or(key.gamma),
        row.n.to_string(),
    ];
    for metric in Metric::ALL {
        let p = metric.precision();
        let m = row.moments(metric);
        record.push(fmt_opt(m.map(|m| m.mean), p));
        record.push(fmt_opt(m.map(|m| m.std), p));
        record.push(fmt_opt(m.map(|m| m.ci95), p));
    }
    record
}
