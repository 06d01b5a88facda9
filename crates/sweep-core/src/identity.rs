use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::params::{na_or, parse_na, ParameterError, ParameterTuple};

/// Joins the fields of a run name. Topology and scenario names may not
/// contain it, which keeps names splittable.
pub const SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("malformed run name '{name}': {reason}")]
    Malformed { name: String, reason: String },
    #[error("run name '{name}' is not in canonical form (expected '{canonical}')")]
    NonCanonical { name: String, canonical: String },
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

fn malformed(name: &str, reason: impl Into<String>) -> IdentityError {
    IdentityError::Malformed {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Directory-safe key for one run, e.g. `T3_attack_atk50_trust1_lam3_gam2_s111111`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunIdentity(String);

impl RunIdentity {
    pub fn for_tuple(tuple: &ParameterTuple) -> Self {
        RunIdentity(format!(
            "{topo}{s}{scenario}{s}atk{atk:02}{s}trust{trust}{s}lam{lam}{s}gam{gam}{s}s{seed}",
            topo = tuple.topology(),
            scenario = tuple.scenario(),
            atk = tuple.attack_rate(),
            trust = u8::from(tuple.trust_enabled()),
            lam = na_or(tuple.lambda()),
            gam = na_or(tuple.gamma()),
            seed = tuple.seed(),
            s = SEPARATOR,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts canonical names and the older naming schemes still found in
    /// archived results directories. Topology names that used `_` come back
    /// with `-`, the way topology ids are derived from template file names.
    pub fn parse_lenient(name: &str) -> Result<ParameterTuple, IdentityError> {
        match parse_run_name(name) {
            Ok(tuple) => Ok(tuple),
            Err(IdentityError::Parameter(e)) => Err(IdentityError::Parameter(e)),
            Err(_) => match parse_right_anchored(name) {
                Some(parsed) => parsed,
                None => parse_legacy_name(name),
            },
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tuple = parse_run_name(s)?;
        let canonical = RunIdentity::for_tuple(&tuple);
        if canonical.0 != s {
            return Err(IdentityError::NonCanonical {
                name: s.to_string(),
                canonical: canonical.0,
            });
        }
        Ok(canonical)
    }
}

impl TryFrom<String> for RunIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunIdentity> for String {
    fn from(value: RunIdentity) -> Self {
        value.0
    }
}

/// Parses a canonical run name back into its tuple.
pub fn parse_run_name(name: &str) -> Result<ParameterTuple, IdentityError> {
    let parts: Vec<&str> = name.split(SEPARATOR).collect();
    if parts.len() != 7 {
        return Err(malformed(
            name,
            format!("expected 7 fields, found {}", parts.len()),
        ));
    }
    let (attack_rate, trust, lambda, gamma, seed) = parse_tail(name, &parts[2..])?;
    Ok(ParameterTuple::new(
        parts[0],
        parts[1],
        attack_rate,
        trust,
        lambda,
        gamma,
        seed,
    )?)
}

type Tail = (u32, bool, Option<u32>, Option<u32>, u64);

/// The five fixed-shape trailing fields: `atkNN trustB lamX gamX sN`.
fn parse_tail(name: &str, tail: &[&str]) -> Result<Tail, IdentityError> {
    let [atk, trust, lam, gam, seed] = tail else {
        return Err(malformed(name, "expected five trailing fields"));
    };
    let attack_rate = prefixed_number::<u32>(name, atk, "atk")?;
    let trust = match *trust {
        "trust0" => false,
        "trust1" => true,
        other => return Err(malformed(name, format!("bad trust field '{}'", other))),
    };
    let lambda = prefixed_na(name, lam, "lam")?;
    let gamma = prefixed_na(name, gam, "gam")?;
    let seed = prefixed_number::<u64>(name, seed, "s")?;
    Ok((attack_rate, trust, lambda, gamma, seed))
}

/// Canonical layout whose topology held `_`, as older sweeps wrote for
/// templates like `T1_S.csc`. `None` when the tail does not have the
/// canonical shape.
fn parse_right_anchored(name: &str) -> Option<Result<ParameterTuple, IdentityError>> {
    let parts: Vec<&str> = name.split(SEPARATOR).collect();
    if parts.len() < 8 {
        return None;
    }
    let (head, tail) = parts.split_at(parts.len() - 5);
    let (attack_rate, trust, lambda, gamma, seed) = parse_tail(name, tail).ok()?;
    let (scenario, topology) = head.split_last()?;
    if topology.iter().any(|t| t.is_empty()) {
        return None;
    }
    Some(
        ParameterTuple::new(
            topology.join("-"),
            *scenario,
            attack_rate,
            trust,
            lambda,
            gamma,
            seed,
        )
        .map_err(IdentityError::from),
    )
}

fn prefixed_number<T: FromStr>(name: &str, field: &str, prefix: &str) -> Result<T, IdentityError> {
    let digits = field
        .strip_prefix(prefix)
        .ok_or_else(|| malformed(name, format!("field '{}' lacks prefix '{}'", field, prefix)))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(name, format!("field '{}' is not numeric", field)));
    }
    digits
        .parse::<T>()
        .map_err(|_| malformed(name, format!("field '{}' out of range", field)))
}

fn prefixed_na(name: &str, field: &str, prefix: &str) -> Result<Option<u32>, IdentityError> {
    let raw = field
        .strip_prefix(prefix)
        .ok_or_else(|| malformed(name, format!("field '{}' lacks prefix '{}'", field, prefix)))?;
    if raw != "NA" && !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(name, format!("field '{}' is not numeric", field)));
    }
    parse_na(raw).ok_or_else(|| malformed(name, format!("field '{}' is not numeric", field)))
}

/// Firmware defaults the trust build used before lambda/gamma were swept.
const LEGACY_LAMBDA: u32 = 0;
const LEGACY_GAMMA: u32 = 1;

fn parse_legacy_name(name: &str) -> Result<ParameterTuple, IdentityError> {
    let parts: Vec<&str> = name.split(SEPARATOR).collect();
    if parts.first().map_or(true, |t| t.is_empty()) {
        return Err(malformed(name, "empty name"));
    }
    let (atk_idx, attack_rate) = parts
        .iter()
        .enumerate()
        .skip(1)
        .find_map(|(i, p)| {
            numeric_suffix::<u32>(p, "atk")
                .or_else(|| numeric_suffix::<u32>(p, "p"))
                .map(|rate| (i, rate))
        })
        .ok_or_else(|| malformed(name, "no attack-rate field (atkNN or pNN)"))?;
    // `<topology..>_<scenario>_<rate>`; a lone leading token is the topology
    let topology = parts[..atk_idx.saturating_sub(1).max(1)].join("-");
    let rest = &parts[1..];

    let seed = parts
        .last()
        .and_then(|p| numeric_suffix::<u64>(p, "s"))
        .ok_or_else(|| malformed(name, "no trailing seed field (sNN)"))?;

    let trust = if rest.contains(&"trust1") {
        true
    } else if rest.contains(&"trust0") || rest.contains(&"notrust") {
        false
    } else {
        rest.contains(&"trust")
    };

    let lambda = rest.iter().find_map(|p| numeric_suffix::<u32>(p, "lam"));
    let gamma = rest.iter().find_map(|p| numeric_suffix::<u32>(p, "gam"));
    let (lambda, gamma) = if trust {
        (
            Some(lambda.unwrap_or(LEGACY_LAMBDA)),
            Some(gamma.unwrap_or(LEGACY_GAMMA)),
        )
    } else {
        (None, None)
    };
    let scenario = if attack_rate == 0 { "normal" } else { "attack" };
    Ok(ParameterTuple::new(
        topology,
        scenario,
        attack_rate,
        trust,
        lambda,
        gamma,
        seed,
    )?)
}

fn numeric_suffix<T: FromStr>(field: &str, prefix: &str) -> Option<T> {
    let digits = field.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_tuples() -> Vec<ParameterTuple> {
        vec![
            ParameterTuple::trust_off("T3", "normal", 0, 111111).unwrap(),
            ParameterTuple::trust_off("T1S", "attack", 5, 1).unwrap(),
            ParameterTuple::trust_on("T3", "attack", 50, 10, 4, 555555).unwrap(),
            ParameterTuple::trust_on("T2-random-15", "attack", 100, 0, 1, 0).unwrap(),
            ParameterTuple::trust_on("T3", "normal", 0, 3, 2, u64::MAX).unwrap(),
        ]
    }

    fn arb_tuple() -> impl Strategy<Value = ParameterTuple> {
        let name = "[A-Za-z0-9][A-Za-z0-9.-]{0,11}";
        (
            name,
            name,
            0u32..=100,
            prop::option::of((any::<u32>(), any::<u32>())),
            any::<u64>(),
        )
            .prop_map(|(topology, scenario, rate, weights, seed)| {
                let (lambda, gamma) = weights.unzip();
                ParameterTuple::new(topology, scenario, rate, weights.is_some(), lambda, gamma, seed)
                    .expect("generated tuple is valid")
            })
    }

    proptest! {
        #[test]
        fn any_tuple_round_trips(tuple in arb_tuple()) {
            let id = RunIdentity::for_tuple(&tuple);
            prop_assert_eq!(parse_run_name(id.as_str()).expect("parse"), tuple.clone());
            prop_assert_eq!(RunIdentity::parse_lenient(id.as_str()).expect("lenient"), tuple);
            let reparsed: RunIdentity = id.as_str().parse().expect("canonical");
            prop_assert_eq!(reparsed, id);
        }

        #[test]
        fn distinct_tuples_never_share_a_name(a in arb_tuple(), b in arb_tuple()) {
            prop_assume!(a != b);
            prop_assert_ne!(RunIdentity::for_tuple(&a), RunIdentity::for_tuple(&b));
        }
    }

    #[test]
    fn identity_round_trips_through_parse() {
        for tuple in sample_tuples() {
            let id = RunIdentity::for_tuple(&tuple);
            assert_eq!(parse_run_name(id.as_str()).expect("parse"), tuple);
            let reparsed: RunIdentity = id.as_str().parse().expect("canonical");
            assert_eq!(reparsed, id);
        }
    }

    #[test]
    fn identity_layout_is_stable() {
        let t = ParameterTuple::trust_off("T3", "attack", 5, 111111).unwrap();
        assert_eq!(
            RunIdentity::for_tuple(&t).as_str(),
            "T3_attack_atk05_trust0_lamNA_gamNA_s111111"
        );
        let t = ParameterTuple::trust_on("T3", "attack", 50, 3, 2, 7).unwrap();
        assert_eq!(
            RunIdentity::for_tuple(&t).as_str(),
            "T3_attack_atk50_trust1_lam3_gam2_s7"
        );
    }

    #[test]
    fn distinct_tuples_yield_distinct_identities() {
        let tuples = sample_tuples();
        let ids: std::collections::BTreeSet<_> =
            tuples.iter().map(RunIdentity::for_tuple).collect();
        assert_eq!(ids.len(), tuples.len());
    }

    #[test]
    fn malformed_names_are_rejected() {
        for bad in [
            "",
            "T3_attack_atk50_trust1_lam3_gam2",
            "T3_attack_atkXX_trust1_lam3_gam2_s7",
            "T3_attack_atk50_trust2_lam3_gam2_s7",
            "T3_attack_atk50_trust1_lamNA_gam2_s7",
            "T1_S_attack_atk50_trust0_lamNA_gamNA_s7",
        ] {
            assert!(parse_run_name(bad).is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn non_canonical_padding_is_rejected_by_from_str() {
        let err = "T3_attack_atk5_trust0_lamNA_gamNA_s7"
            .parse::<RunIdentity>()
            .unwrap_err();
        assert!(matches!(err, IdentityError::NonCanonical { .. }));
    }

    #[test]
    fn lenient_parse_understands_legacy_names() {
        let t = RunIdentity::parse_lenient("T3_brpl_p30_trust_s222222").expect("legacy trust");
        assert_eq!(t.attack_rate(), 30);
        assert!(t.trust_enabled());
        assert_eq!((t.lambda(), t.gamma()), (Some(0), Some(1)));
        assert_eq!(t.seed(), 222222);
        assert_eq!(t.scenario(), "attack");

        let t = RunIdentity::parse_lenient("T1S_brpl_p0_notrust_s3").expect("legacy notrust");
        assert!(!t.trust_enabled());
        assert_eq!((t.lambda(), t.gamma()), (None, None));
        assert_eq!(t.scenario(), "normal");

        let t = RunIdentity::parse_lenient("T3_x_atk50_trust1_lam10_gam4_rerun_s9")
            .expect("legacy with weights");
        assert_eq!((t.lambda(), t.gamma()), (Some(10), Some(4)));

        assert!(RunIdentity::parse_lenient("notes").is_err());
    }

    #[test]
    fn lenient_parse_keeps_multi_token_topologies() {
        let t = RunIdentity::parse_lenient("T1_S_attack_atk30_trust0_lamNA_gamNA_s111111")
            .expect("underscore topology");
        assert_eq!(t.topology(), "T1-S");
        assert_eq!(t.scenario(), "attack");
        assert_eq!((t.attack_rate(), t.seed()), (30, 111111));
        assert_eq!(
            RunIdentity::for_tuple(&t).as_str(),
            "T1-S_attack_atk30_trust0_lamNA_gamNA_s111111"
        );

        let t = RunIdentity::parse_lenient("T2_random_15_seed1_normal_atk00_trust1_lam3_gam2_s4")
            .expect("long topology");
        assert_eq!(t.topology(), "T2-random-15-seed1");
        assert_eq!((t.lambda(), t.gamma()), (Some(3), Some(2)));

        let t = RunIdentity::parse_lenient("T1_S_brpl_p30_trust_s2").expect("legacy");
        assert_eq!(t.topology(), "T1-S");
        assert!(t.trust_enabled());
    }
}
