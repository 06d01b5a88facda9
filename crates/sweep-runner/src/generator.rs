use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use sweep_core::{ParameterTuple, RunIdentity};

use crate::settings::{DesignSettings, SweepConfig};

pub const NORMAL_SCENARIO: &str = "normal";
pub const ATTACK_SCENARIO: &str = "attack";

pub fn scenario_for(attack_rate: u32) -> &'static str {
    if attack_rate == 0 {
        NORMAL_SCENARIO
    } else {
        ATTACK_SCENARIO
    }
}

/// Ordered tuples for one sweep plus the template behind each topology id.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub tuples: Vec<ParameterTuple>,
    pub templates: BTreeMap<String, PathBuf>,
}

impl SweepPlan {
    pub fn identities(&self) -> BTreeSet<RunIdentity> {
        self.tuples.iter().map(RunIdentity::for_tuple).collect()
    }
}

pub fn plan_from_config(config: &SweepConfig) -> Result<SweepPlan> {
    let mut templates = BTreeMap::new();
    let mut topologies = Vec::new();
    for spec in config.active_topologies() {
        let id = spec.resolved_id();
        templates.insert(id.clone(), spec.template.clone());
        topologies.push(id);
    }
    let tuples = generate(&topologies, &config.design)?;
    Ok(SweepPlan { tuples, templates })
}

/// Expands the design into tuples. Order: topology, attack rate, then the
/// trust-off baselines for every seed, then the trust-on grid (lambda,
/// gamma, seed) or, at attack rate 0, the sanity pairs when enabled.
pub fn generate(topologies: &[String], design: &DesignSettings) -> Result<Vec<ParameterTuple>> {
    let rates = design.effective_attack_rates();
    let mut tuples = Vec::new();
    for topo in topologies {
        for &rate in &rates {
            let scenario = scenario_for(rate);
            for &seed in &design.seeds {
                tuples.push(
                    ParameterTuple::trust_off(topo.as_str(), scenario, rate, seed)
                        .with_context(|| format!("trust-off tuple for {}", topo))?,
                );
            }
            if rate == 0 {
                if design.include_normal_sanity {
                    for &(lambda, gamma) in &design.sanity_pairs {
                        for &seed in &design.seeds {
                            tuples.push(ParameterTuple::trust_on(
                                topo.as_str(),
                                scenario,
                                rate,
                                lambda,
                                gamma,
                                seed,
                            )?);
                        }
                    }
                }
                continue;
            }
            for &lambda in &design.lambdas {
                for &gamma in &design.gammas {
                    for &seed in &design.seeds {
                        tuples.push(ParameterTuple::trust_on(
                            topo.as_str(),
                            scenario,
                            rate,
                            lambda,
                            gamma,
                            seed,
                        )?);
                    }
                }
            }
        }
    }

    let mut seen = BTreeSet::new();
    for tuple in &tuples {
        let id = RunIdentity::for_tuple(tuple);
        if !seen.insert(id.clone()) {
            return Err(anyhow!(
                "sweep design produces run {} more than once (repeated seed or grid value?)",
                id
            ));
        }
    }
    Ok(tuples)
}

/// Closed-form size of the sweep, used by `describe` and checked against
/// the generated list in tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepCount {
    pub topologies: usize,
    pub seeds: usize,
    pub attack_rates: Vec<u32>,
    pub trust_off: usize,
    pub trust_on: usize,
    pub sanity: usize,
    pub total: usize,
}

pub fn expected_count(topologies: usize, design: &DesignSettings) -> SweepCount {
    let rates = design.effective_attack_rates();
    let seeds = design.seeds.len();
    let nonzero = rates.iter().filter(|r| **r > 0).count();
    let has_zero = rates.contains(&0);
    let trust_off = topologies * seeds * rates.len();
    let trust_on = topologies * seeds * nonzero * design.lambdas.len() * design.gammas.len();
    let sanity = if has_zero && design.include_normal_sanity {
        topologies * seeds * design.sanity_pairs.len()
    } else {
        0
    };
    SweepCount {
        topologies,
        seeds,
        attack_rates: rates,
        trust_off,
        trust_on,
        sanity,
        total: trust_off + trust_on + sanity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn topos(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_design_matches_closed_form() {
        let design = DesignSettings::default();
        let tuples = generate(&topos(&["T3", "T1-S"]), &design).expect("generate");
        // 2 topologies, 5 seeds, rates {30,50}, 4x3 grid
        assert_eq!(tuples.len(), 2 * 5 * 2 + 2 * 5 * 2 * 12);
        assert_eq!(expected_count(2, &design).total, tuples.len());
    }

    #[test]
    fn extremes_and_sanity_match_closed_form() {
        let design = DesignSettings {
            include_attack_extremes: true,
            include_normal_sanity: true,
            ..DesignSettings::default()
        };
        let n = 3;
        let tuples = generate(&topos(&["T3", "T1-S", "T2-random-15-seed1"]), &design)
            .expect("generate");
        let s = 5;
        let a = 3;
        let (l, g) = (4, 3);
        let sanity = n * s * 2;
        assert_eq!(tuples.len(), n * s * (1 + a) + n * s * a * l * g + sanity);
        let count = expected_count(n, &design);
        assert_eq!(count.total, tuples.len());
        assert_eq!(count.sanity, sanity);
    }

    #[test]
    fn loop_order_is_topology_rate_trust_off_then_grid() {
        let design = DesignSettings {
            seeds: vec![1, 2],
            attack_rates: vec![50],
            lambdas: vec![0, 3],
            gammas: vec![1],
            ..DesignSettings::default()
        };
        let names: Vec<String> = generate(&topos(&["T3"]), &design)
            .expect("generate")
            .iter()
            .map(|t| RunIdentity::for_tuple(t).to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "T3_attack_atk50_trust0_lamNA_gamNA_s1",
                "T3_attack_atk50_trust0_lamNA_gamNA_s2",
                "T3_attack_atk50_trust1_lam0_gam1_s1",
                "T3_attack_atk50_trust1_lam0_gam1_s2",
                "T3_attack_atk50_trust1_lam3_gam1_s1",
                "T3_attack_atk50_trust1_lam3_gam1_s2",
            ]
        );
    }

    #[test]
    fn zero_rate_runs_are_normal_and_trust_off_only_without_sanity() {
        let design = DesignSettings {
            attack_rates: vec![0],
            ..DesignSettings::default()
        };
        let tuples = generate(&topos(&["T3"]), &design).expect("generate");
        assert_eq!(tuples.len(), 5);
        assert!(tuples
            .iter()
            .all(|t| t.scenario() == NORMAL_SCENARIO && !t.trust_enabled()));
    }

    fn grid<T: Ord + std::fmt::Debug + Clone>(
        values: impl Strategy<Value = T>,
        max: usize,
    ) -> impl Strategy<Value = Vec<T>> {
        prop::collection::btree_set(values, 1..=max).prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        #[test]
        fn generated_list_matches_closed_form(
            n in 1usize..4,
            seeds in grid(any::<u64>(), 4),
            attack_rates in grid(0u32..=100, 4),
            lambdas in grid(0u32..20, 4),
            gammas in grid(0u32..20, 3),
            sanity_pairs in grid((0u32..20, 0u32..20), 3),
            include_attack_extremes in any::<bool>(),
            include_normal_sanity in any::<bool>(),
        ) {
            let design = DesignSettings {
                seeds,
                attack_rates,
                include_attack_extremes,
                include_normal_sanity,
                lambdas,
                gammas,
                sanity_pairs,
                ..DesignSettings::default()
            };
            let names: Vec<String> = (0..n).map(|i| format!("T{}", i)).collect();
            let tuples = generate(&names, &design).expect("generate");

            let s = design.seeds.len();
            let rates = design.effective_attack_rates();
            let a = rates.iter().filter(|r| **r > 0).count();
            let (l, g) = (design.lambdas.len(), design.gammas.len());
            let sanity = if rates.contains(&0) && include_normal_sanity {
                n * s * design.sanity_pairs.len()
            } else {
                0
            };
            let count = expected_count(n, &design);
            prop_assert_eq!(tuples.len(), n * s * rates.len() + n * s * a * l * g + sanity);
            prop_assert_eq!(count.total, tuples.len());
            prop_assert_eq!(
                tuples.iter().filter(|t| !t.trust_enabled()).count(),
                count.trust_off
            );
        }
    }

    #[test]
    fn repeated_seed_is_a_configuration_error() {
        let design = DesignSettings {
            seeds: vec![7, 7],
            ..DesignSettings::default()
        };
        let err = generate(&topos(&["T3"]), &design).expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));
    }
}
