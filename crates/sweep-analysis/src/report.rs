use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use sweep_core::params::na_or;
use sweep_core::table::fmt_opt;
use sweep_core::RunStatus;
use tracing::{info, warn};

use crate::aggregate::{AggregateRow, Metric, RunMetrics};
use crate::records::InvalidRow;
use crate::stats::mean;

/// What the report highlights and which sanity checks it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportSettings {
    pub focus_topology: String,
    pub focus_attack_rate: u32,
    /// Topology expected to show near-ideal delivery and exposure.
    pub control_topology: Option<String>,
    pub control_min_pdr: f64,
    pub control_max_e1: f64,
    /// Topologies where lambda/gamma should visibly move E1.
    pub flat_check_topologies: Vec<String>,
    pub flat_e1_epsilon: f64,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            focus_topology: "T3".to_string(),
            focus_attack_rate: 50,
            control_topology: Some("T2-random-15-seed1".to_string()),
            control_min_pdr: 95.0,
            control_max_e1: 0.01,
            flat_check_topologies: vec!["T3".to_string(), "T1-S".to_string()],
            flat_e1_epsilon: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryKind {
    BaselinePdrNotDecreasing,
    ControlNotIdeal,
    FlatExposure,
}

/// A non-fatal sanity warning about the sweep's results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advisory {
    pub kind: AdvisoryKind,
    pub topology: String,
    pub message: String,
}

/// Runs the sanity checks over valid runs and logs each finding.
pub fn sanity_checks(runs: &[RunMetrics], settings: &ReportSettings) -> Vec<Advisory> {
    let mut advisories = Vec::new();
    advisories.extend(check_baseline_monotonic(runs));
    advisories.extend(check_control(runs, settings));
    advisories.extend(check_flat_exposure(runs, settings));
    for a in &advisories {
        warn!(kind = ?a.kind, topology = %a.topology, "{}", a.message);
    }
    advisories
}

fn check_baseline_monotonic(runs: &[RunMetrics]) -> Vec<Advisory> {
    let mut by_topology: BTreeMap<&str, BTreeMap<u32, Vec<f64>>> = BTreeMap::new();
    for run in runs.iter().filter(|r| !r.tuple.trust_enabled()) {
        if let Some(pdr) = run.pdr {
            by_topology
                .entry(run.tuple.topology())
                .or_default()
                .entry(run.tuple.attack_rate())
                .or_default()
                .push(pdr);
        }
    }
    let mut out = Vec::new();
    for (topology, rates) in by_topology {
        if rates.len() < 2 {
            continue;
        }
        let means: Vec<(u32, f64)> = rates
            .iter()
            .filter_map(|(rate, values)| mean(values).map(|m| (*rate, m)))
            .collect();
        if means.windows(2).any(|w| w[0].1 < w[1].1) {
            let series: Vec<String> = means
                .iter()
                .map(|(rate, m)| format!("{}%={:.2}", rate, m))
                .collect();
            out.push(Advisory {
                kind: AdvisoryKind::BaselinePdrNotDecreasing,
                topology: topology.to_string(),
                message: format!(
                    "trust-off PDR does not decrease with attack rate on {}: {}",
                    topology,
                    series.join(", ")
                ),
            });
        }
    }
    out
}

fn check_control(runs: &[RunMetrics], settings: &ReportSettings) -> Option<Advisory> {
    let control = settings.control_topology.as_deref()?;
    let attacked: Vec<&RunMetrics> = runs
        .iter()
        .filter(|r| r.tuple.topology() == control && r.tuple.attack_rate() > 0)
        .collect();
    let pdrs: Vec<f64> = attacked.iter().filter_map(|r| r.pdr).collect();
    let mean_pdr = mean(&pdrs)?;
    let e1s: Vec<f64> = attacked.iter().filter_map(|r| r.e1).collect();
    let mean_e1 = mean(&e1s);
    let ideal =
        mean_pdr >= settings.control_min_pdr && mean_e1.map_or(true, |e| e <= settings.control_max_e1);
    if ideal {
        info!(topology = control, mean_pdr, "low exposure confirmed on control topology");
        return None;
    }
    Some(Advisory {
        kind: AdvisoryKind::ControlNotIdeal,
        topology: control.to_string(),
        message: format!(
            "control topology {} is not near-ideal under attack (mean pdr {:.2}, mean e1 {})",
            control,
            mean_pdr,
            fmt_opt(mean_e1, 4)
        ),
    })
}

fn check_flat_exposure(runs: &[RunMetrics], settings: &ReportSettings) -> Vec<Advisory> {
    let mut out = Vec::new();
    for topology in &settings.flat_check_topologies {
        let e1s: Vec<f64> = runs
            .iter()
            .filter(|r| {
                r.tuple.topology() == topology.as_str()
                    && r.tuple.trust_enabled()
                    && r.tuple.attack_rate() > 0
            })
            .filter_map(|r| r.e1)
            .collect();
        if e1s.is_empty() {
            continue;
        }
        let lo = e1s.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = e1s.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if hi - lo < settings.flat_e1_epsilon {
            out.push(Advisory {
                kind: AdvisoryKind::FlatExposure,
                topology: topology.clone(),
                message: format!(
                    "trust penalty has no visible effect on {} (E1 spread {:.4} across lambda/gamma)",
                    topology,
                    hi - lo
                ),
            });
        }
    }
    out
}

/// Counts for the scope section.
#[derive(Debug, Clone, Default)]
pub struct ReportScope {
    pub runs: usize,
    pub valid: usize,
    pub topologies: BTreeSet<String>,
    pub attack_rates: BTreeSet<u32>,
}

pub fn render_report(
    scope: &ReportScope,
    invalid: &[InvalidRow],
    aggregates: &[AggregateRow],
    advisories: &[Advisory],
    settings: &ReportSettings,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Trust-Aware Routing Sweep Report\n");

    let _ = writeln!(out, "## Experiment Scope");
    let _ = writeln!(
        out,
        "- Runs: {} ({} valid, {} invalid)",
        scope.runs,
        scope.valid,
        invalid.len()
    );
    let _ = writeln!(
        out,
        "- Topologies: {}",
        scope.topologies.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    let rates: Vec<String> = scope.attack_rates.iter().map(|r| r.to_string()).collect();
    let _ = writeln!(out, "- Attack rates (%): {}", rates.join(", "));
    let _ = writeln!(out, "- Conditions with valid runs: {}\n", aggregates.len());

    let _ = writeln!(out, "## Invalid Runs");
    let _ = writeln!(out, "- Invalid runs: {}", invalid.len());
    let unfinished = invalid
        .iter()
        .filter(|r| matches!(r.status, RunStatus::Timeout | RunStatus::Failed))
        .count();
    if unfinished > 0 {
        let _ = writeln!(out, "- Timed out or failed: {}", unfinished);
    }
    let mut reasons: BTreeMap<&str, usize> = BTreeMap::new();
    for row in invalid {
        *reasons.entry(row.reason.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = reasons.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    if !ranked.is_empty() {
        let _ = writeln!(out, "- Top reasons:");
        for (reason, count) in ranked.iter().take(3) {
            let _ = writeln!(out, "  - {}: {}", reason, count);
        }
    }
    let _ = writeln!(out);

    let focus = &settings.focus_topology;
    let rate = settings.focus_attack_rate;
    let _ = writeln!(out, "## Key Results ({}, attack={})", focus, rate);
    let slice: Vec<&AggregateRow> = aggregates
        .iter()
        .filter(|r| &r.condition.topology == focus && r.condition.attack_rate == rate)
        .collect();
    if slice.is_empty() {
        let _ = writeln!(out, "No valid {} attack={} results to summarize.", focus, rate);
    } else {
        let _ = writeln!(
            out,
            "| trust | lambda | gamma | n | mean_e1 | mean_e3 | mean_parent_switch | mean_pdr |"
        );
        let _ = writeln!(out, "|---|---|---|---|---|---|---|---|");
        for row in &slice {
            let c = &row.condition;
            let cell = |m: Metric| fmt_opt(row.mean(m), m.precision());
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                u8::from(c.trust_enabled),
                na_or(c.lambda),
                na_or(c.gamma),
                row.n,
                cell(Metric::E1),
                cell(Metric::E3),
                cell(Metric::ParentSwitch),
                cell(Metric::Pdr),
            );
        }
        let best = slice
            .iter()
            .filter(|r| r.condition.trust_enabled)
            .filter_map(|r| r.mean(Metric::E1).map(|e1| (e1, *r)))
            .min_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((e1, row)) = best {
            let _ = writeln!(
                out,
                "\nBest E1 reduction at lambda={} gamma={} (mean_e1={:.4}, mean_pdr={}).",
                na_or(row.condition.lambda),
                na_or(row.condition.gamma),
                e1,
                fmt_opt(row.mean(Metric::Pdr), 2)
            );
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Sanity Checks");
    if advisories.is_empty() {
        let _ = writeln!(out, "- No warnings.");
    }
    for a in advisories {
        let _ = writeln!(out, "- WARN: {}", a.message);
    }
    out
}
