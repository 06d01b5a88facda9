use serde::Serialize;
use std::collections::BTreeMap;
use sweep_core::{ConditionKey, ParameterTuple};

use crate::extract::RawMetrics;
use crate::stats::Moments;

/// Per-run quantities carried into the summary table and the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Pdr,
    AvgDelayMs,
    E1,
    E3,
    ParentSwitch,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Pdr,
        Metric::AvgDelayMs,
        Metric::E1,
        Metric::E3,
        Metric::ParentSwitch,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            Metric::Pdr => "pdr",
            Metric::AvgDelayMs => "avg_delay_ms",
            Metric::E1 => "e1",
            Metric::E3 => "e3",
            Metric::ParentSwitch => "parent_switch",
        }
    }

    /// Decimal places used when the metric is written out.
    pub fn precision(&self) -> usize {
        match self {
            Metric::Pdr | Metric::AvgDelayMs => 2,
            Metric::E1 | Metric::E3 | Metric::ParentSwitch => 4,
        }
    }
}

/// One run, evaluated. Built for valid and invalid runs alike; only valid
/// ones reach [`aggregate`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetrics {
    pub run: String,
    pub tuple: ParameterTuple,
    pub tx: usize,
    pub rx: usize,
    pub delivered: usize,
    pub lost: usize,
    pub pdr: Option<f64>,
    pub avg_delay_ms: Option<f64>,
    pub e1: Option<f64>,
    pub e3: Option<f64>,
    pub parent_switch: Option<f64>,
}

impl RunMetrics {
    pub fn from_raw(run: &str, tuple: &ParameterTuple, raw: &RawMetrics) -> Self {
        Self {
            run: run.to_string(),
            tuple: tuple.clone(),
            tx: raw.log.tx(),
            rx: raw.log.rx(),
            delivered: raw.log.delivered(),
            lost: raw.log.lost(),
            pdr: raw.log.delivery_ratio(),
            avg_delay_ms: raw.log.avg_delay_ms(),
            e1: raw.trust.e1,
            e3: raw.trust.e3,
            parent_switch: raw.trust.parent_switch,
        }
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Pdr => self.pdr,
            Metric::AvgDelayMs => self.avg_delay_ms,
            Metric::E1 => self.e1,
            Metric::E3 => self.e3,
            Metric::ParentSwitch => self.parent_switch,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub condition: ConditionKey,
    pub n: usize,
    /// Metrics with at least one sample in the group.
    pub metrics: BTreeMap<Metric, Moments>,
}

impl AggregateRow {
    pub fn moments(&self, metric: Metric) -> Option<&Moments> {
        self.metrics.get(&metric)
    }

    pub fn mean(&self, metric: Metric) -> Option<f64> {
        self.moments(metric).map(|m| m.mean)
    }
}

/// Groups runs by condition and summarises each metric. Rebuilt from
/// scratch on every call; conditions without runs never appear.
pub fn aggregate(runs: &[RunMetrics]) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<ConditionKey, Vec<&RunMetrics>> = BTreeMap::new();
    for run in runs {
        groups.entry(run.tuple.condition()).or_default().push(run);
    }
    groups
        .into_iter()
        .map(|(condition, members)| {
            let metrics = Metric::ALL
                .iter()
                .filter_map(|&metric| {
                    let values: Vec<f64> =
                        members.iter().filter_map(|r| r.value(metric)).collect();
                    Moments::of(&values).map(|m| (metric, m))
                })
                .collect();
            AggregateRow {
                condition,
                n: members.len(),
                metrics,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tuple: ParameterTuple, pdr: f64, e1: Option<f64>) -> RunMetrics {
        RunMetrics {
            run: sweep_core::RunIdentity::for_tuple(&tuple).to_string(),
            tuple,
            tx: 100,
            rx: pdr as usize,
            delivered: pdr as usize,
            lost: 100 - pdr as usize,
            pdr: Some(pdr),
            avg_delay_ms: Some(10.0),
            e1,
            e3: None,
            parent_switch: None,
        }
    }

    #[test]
    fn groups_ignore_seed_and_keep_blank_metrics_out() {
        let a = ParameterTuple::trust_on("T3", "attack", 50, 3, 2, 1).unwrap();
        let b = ParameterTuple::trust_on("T3", "attack", 50, 3, 2, 2).unwrap();
        let c = ParameterTuple::trust_off("T3", "attack", 50, 1).unwrap();
        let rows = aggregate(&[
            run(a, 90.0, Some(0.2)),
            run(b, 94.0, None),
            run(c, 80.0, None),
        ]);
        assert_eq!(rows.len(), 2);
        // trust-off sorts first (false < true)
        assert!(!rows[0].condition.trust_enabled);
        let on = &rows[1];
        assert_eq!(on.n, 2);
        let pdr = on.moments(Metric::Pdr).expect("pdr");
        assert_eq!(format!("{:.2}/{:.2}/{:.2}", pdr.mean, pdr.std, pdr.ci95), "92.00/2.83/3.92");
        let e1 = on.moments(Metric::E1).expect("e1");
        assert_eq!((e1.n, e1.std), (1, 0.0));
        assert!(on.moments(Metric::E3).is_none());
    }

    #[test]
    fn no_runs_no_rows() {
        assert!(aggregate(&[]).is_empty());
    }
}
