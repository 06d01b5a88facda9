use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use sweep_core::ParameterTuple;

use crate::extract::RawMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ReasonCode {
    #[serde(rename = "missing_log")]
    MissingLog,
    #[serde(rename = "tx=0")]
    TxZero,
    #[serde(rename = "rx=0")]
    RxZero,
    #[serde(rename = "routing_not_ready")]
    RoutingNotReady,
    #[serde(rename = "missing_core_metrics")]
    MissingCoreMetrics,
    #[serde(rename = "missing_trust_metrics")]
    MissingTrustMetrics,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::MissingLog => "missing_log",
            ReasonCode::TxZero => "tx=0",
            ReasonCode::RxZero => "rx=0",
            ReasonCode::RoutingNotReady => "routing_not_ready",
            ReasonCode::MissingCoreMetrics => "missing_core_metrics",
            ReasonCode::MissingTrustMetrics => "missing_trust_metrics",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every applicable reason, not just the first one found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidityVerdict {
    reasons: BTreeSet<ReasonCode>,
}

impl ValidityVerdict {
    pub fn is_valid(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn reasons(&self) -> &BTreeSet<ReasonCode> {
        &self.reasons
    }

    pub fn has(&self, code: ReasonCode) -> bool {
        self.reasons.contains(&code)
    }

    /// Codes in lexical order joined by `;`, as stored in the invalid-runs table.
    pub fn reason_string(&self) -> String {
        let names: BTreeSet<&str> = self.reasons.iter().map(ReasonCode::as_str).collect();
        names.into_iter().collect::<Vec<_>>().join(";")
    }
}

/// `metrics` is `None` when the run left no simulator log.
pub fn classify(tuple: &ParameterTuple, metrics: Option<&RawMetrics>) -> ValidityVerdict {
    let mut reasons = BTreeSet::new();
    let Some(metrics) = metrics else {
        reasons.insert(ReasonCode::MissingLog);
        return ValidityVerdict { reasons };
    };
    let log = &metrics.log;
    let not_ready = log.routing_not_ready();

    if log.tx() == 0 {
        reasons.insert(ReasonCode::TxZero);
        if not_ready {
            reasons.insert(ReasonCode::RoutingNotReady);
        }
    } else if log.rx() == 0 && not_ready {
        reasons.insert(ReasonCode::RxZero);
        reasons.insert(ReasonCode::RoutingNotReady);
    }
    if log.delivery_ratio().is_none() || log.avg_delay_ms().is_none() {
        reasons.insert(ReasonCode::MissingCoreMetrics);
    }
    if tuple.trust_enabled() && !metrics.trust.is_complete() {
        reasons.insert(ReasonCode::MissingTrustMetrics);
    }
    ValidityVerdict { reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{parse_log, Endpoint};
    use crate::sidecar::TrustMetrics;

    fn raw(log: &str, trust: TrustMetrics) -> RawMetrics {
        RawMetrics {
            log: parse_log(log.as_bytes()).expect("parse"),
            trust,
        }
    }

    fn full_trust() -> TrustMetrics {
        TrustMetrics {
            e1: Some(0.1),
            e3: Some(0.2),
            parent_switch: Some(0.01),
        }
    }

    fn trust_on() -> ParameterTuple {
        ParameterTuple::trust_on("T3", "attack", 50, 3, 2, 1).unwrap()
    }

    fn trust_off() -> ParameterTuple {
        ParameterTuple::trust_off("T3", "attack", 50, 1).unwrap()
    }

    #[test]
    fn missing_log_is_its_own_reason() {
        let v = classify(&trust_off(), None);
        assert_eq!(v.reason_string(), "missing_log");
    }

    #[test]
    fn no_traffic_with_sentinel_reports_both_reasons() {
        let m = raw("ROUTING_WAIT_TIMEOUT\n", full_trust());
        let v = classify(&trust_on(), Some(&m));
        assert!(v.has(ReasonCode::TxZero));
        assert!(v.has(ReasonCode::RoutingNotReady));
        assert!(v.has(ReasonCode::MissingCoreMetrics));
        assert_eq!(
            v.reason_string(),
            "missing_core_metrics;routing_not_ready;tx=0"
        );
    }

    #[test]
    fn silent_receiver_needs_sentinel_to_be_rx_zero() {
        let with = raw(
            "CSV,TX,2,1\nCSV,DELAY,5\nROUTING_WAIT joined=0 reachable=0\n",
            full_trust(),
        );
        let v = classify(&trust_off(), Some(&with));
        assert!(v.has(ReasonCode::RxZero) && v.has(ReasonCode::RoutingNotReady));

        let without = raw("CSV,TX,2,1\nCSV,DELAY,5\n", TrustMetrics::default());
        let v = classify(&trust_off(), Some(&without));
        assert!(v.is_valid(), "zero delivery is a result, not an invalid run");
        assert_eq!(without.log.delivery_ratio(), Some(0.0));
    }

    #[test]
    fn trust_metrics_only_matter_for_trust_runs() {
        let log = "CSV,TX,2,1\nCSV,RX,fd00::202:2:2:2,1\nCSV,DELAY,12\n";
        let partial = TrustMetrics {
            e3: None,
            ..full_trust()
        };
        let m = raw(log, partial);
        assert_eq!(m.log.received.iter().next().map(|k| &k.0), Some(&Endpoint::Node(2)));
        assert!(classify(&trust_off(), Some(&m)).is_valid());
        assert_eq!(
            classify(&trust_on(), Some(&m)).reason_string(),
            "missing_trust_metrics"
        );
        assert!(classify(&trust_on(), Some(&raw(log, full_trust()))).is_valid());
    }
}
