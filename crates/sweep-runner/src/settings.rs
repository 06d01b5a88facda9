//! Sweep configuration loaded from YAML. Everything the generator and the
//! orchestrator need is carried here; nothing is looked up from the
//! environment later on.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_analysis::ReportSettings;
use sweep_core::params::check_name;
use sweep_core::SEPARATOR;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("sweep config lists no topologies")]
    NoTopologies,
    #[error("sweep config lists no seeds")]
    NoSeeds,
    #[error("sweep config lists no attack rates")]
    NoAttackRates,
    #[error("attack rate {0} is outside 0..=100")]
    AttackRateOutOfRange(u32),
    #[error("non-zero attack rates need a non-empty lambda and gamma grid")]
    EmptyTrustGrid,
    #[error("topology id '{0}' is used more than once")]
    DuplicateTopology(String),
    #[error("topology id '{0}' is empty, contains '_' or is not a plain directory name")]
    InvalidTopologyId(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("control topology requested but none is configured")]
    MissingControlTopology,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologySpec {
    #[serde(default)]
    pub id: Option<String>,
    pub template: PathBuf,
}

impl TopologySpec {
    /// Explicit id, or the template stem with the run-name separator mapped
    /// to `-` (`T1_S.csc` becomes `T1-S`).
    pub fn resolved_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => self
                .template
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .replace(SEPARATOR, "-"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DesignSettings {
    pub seeds: Vec<u64>,
    pub attack_rates: Vec<u32>,
    pub extreme_attack_rates: Vec<u32>,
    pub include_attack_extremes: bool,
    pub include_control_topology: bool,
    pub include_normal_sanity: bool,
    pub lambdas: Vec<u32>,
    pub gammas: Vec<u32>,
    pub sanity_pairs: Vec<(u32, u32)>,
}

impl Default for DesignSettings {
    fn default() -> Self {
        Self {
            seeds: vec![111111, 222222, 333333, 444444, 555555],
            attack_rates: vec![30, 50],
            extreme_attack_rates: vec![0, 70],
            include_attack_extremes: false,
            include_control_topology: false,
            include_normal_sanity: false,
            lambdas: vec![0, 1, 3, 10],
            gammas: vec![1, 2, 4],
            sanity_pairs: vec![(0, 1), (3, 2)],
        }
    }
}

impl DesignSettings {
    /// Attack rates in execution order, extremes merged in when enabled.
    pub fn effective_attack_rates(&self) -> Vec<u32> {
        let mut rates: BTreeSet<u32> = self.attack_rates.iter().copied().collect();
        if self.include_attack_extremes {
            rates.extend(self.extreme_attack_rates.iter().copied());
        }
        rates.into_iter().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunTimings {
    pub sim_time_secs: u64,
    pub timeout_secs: u64,
    pub send_interval_secs: u64,
    pub warmup_secs: u64,
    pub sidecar_grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for RunTimings {
    fn default() -> Self {
        Self {
            sim_time_secs: 600,
            timeout_secs: 900,
            send_interval_secs: 30,
            warmup_secs: 120,
            sidecar_grace_ms: 5000,
            poll_interval_ms: 100,
        }
    }
}

impl RunTimings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sidecar_grace(&self) -> Duration {
        Duration::from_millis(self.sidecar_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathSettings {
    pub results_root: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub clean_build_dir: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("results"),
            scratch_dir: None,
            clean_build_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorSettings {
    pub java: String,
    pub java_opts: String,
    pub cooja_path: PathBuf,
    pub contiki_path: PathBuf,
    /// Replaces the `java ... -jar cooja.jar` prefix when set.
    pub command: Option<Vec<String>>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            java: "java".to_string(),
            java_opts: "-Xmx4G -Xms2G".to_string(),
            cooja_path: PathBuf::from("/home/dev/contiki-ng"),
            contiki_path: PathBuf::from("contiki-ng-brpl"),
            command: None,
        }
    }
}

impl SimulatorSettings {
    pub fn cooja_jar(&self) -> PathBuf {
        self.cooja_path
            .join("tools")
            .join("cooja")
            .join("build")
            .join("libs")
            .join("cooja.jar")
    }

    /// Program and leading arguments; the headless contract flags follow.
    pub fn launcher(&self) -> Vec<String> {
        if let Some(command) = &self.command {
            return command.clone();
        }
        let mut argv = vec![self.java.clone(), "--enable-preview".to_string()];
        argv.extend(self.java_opts.split_whitespace().map(|s| s.to_string()));
        argv.push("-jar".to_string());
        argv.push(self.cooja_jar().to_string_lossy().to_string());
        argv
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SidecarSettings {
    pub binary: PathBuf,
    /// Replaces `binary` as program plus leading arguments when set.
    pub command: Option<Vec<String>>,
    pub stats_interval: u64,
    pub metric: String,
    pub alpha: f64,
    pub ewma_min: f64,
    pub miss_threshold: u64,
    pub forwarders_only: bool,
    pub fwd_drop_threshold: f64,
    pub attacker_id: u16,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tools/trust_engine/target/release/trust_engine"),
            command: None,
            stats_interval: 200,
            metric: "ewma".to_string(),
            alpha: 0.2,
            ewma_min: 0.7,
            miss_threshold: 5,
            forwarders_only: true,
            fwd_drop_threshold: 0.2,
            attacker_id: 2,
        }
    }
}

impl SidecarSettings {
    pub fn launcher(&self) -> Vec<String> {
        match &self.command {
            Some(command) => command.clone(),
            None => vec![self.binary.to_string_lossy().to_string()],
        }
    }

    /// Scoring parameters in the sidecar's flag syntax.
    pub fn scoring_args(&self) -> Vec<String> {
        let mut args = vec![
            "--stats-interval".to_string(),
            self.stats_interval.to_string(),
            "--metric".to_string(),
            self.metric.clone(),
            "--alpha".to_string(),
            self.alpha.to_string(),
            "--ewma-min".to_string(),
            self.ewma_min.to_string(),
            "--miss-threshold".to_string(),
            self.miss_threshold.to_string(),
        ];
        if self.forwarders_only {
            args.push("--forwarders-only".to_string());
        }
        args.extend([
            "--fwd-drop-threshold".to_string(),
            self.fwd_drop_threshold.to_string(),
            "--attacker-id".to_string(),
            self.attacker_id.to_string(),
        ]);
        args
    }
}

/// Flags that only ever switch features on; a flag left off keeps the
/// file's value.
#[derive(Debug, Clone, Default)]
pub struct SweepOverrides {
    pub seeds: Option<Vec<u64>>,
    pub include_attack_extremes: bool,
    pub include_control_topology: bool,
    pub include_normal_sanity: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    pub topologies: Vec<TopologySpec>,
    #[serde(default)]
    pub control_topology: Option<TopologySpec>,
    #[serde(default)]
    pub design: DesignSettings,
    #[serde(default)]
    pub run: RunTimings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub simulator: SimulatorSettings,
    #[serde(default)]
    pub sidecar: SidecarSettings,
    #[serde(default)]
    pub report: ReportSettings,
}

impl SweepConfig {
    /// Reads a YAML sweep file; relative paths inside it are taken relative
    /// to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading sweep config {}", path.display()))?;
        let mut config: SweepConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing sweep config {}", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for topo in self.topologies.iter_mut() {
            resolve(&mut topo.template);
        }
        if let Some(control) = self.control_topology.as_mut() {
            resolve(&mut control.template);
        }
        resolve(&mut self.paths.results_root);
        if let Some(p) = self.paths.scratch_dir.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.paths.clean_build_dir.as_mut() {
            resolve(p);
        }
        resolve(&mut self.simulator.contiki_path);
        if self.sidecar.command.is_none() {
            resolve(&mut self.sidecar.binary);
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.topologies.is_empty() {
            return Err(SettingsError::NoTopologies);
        }
        if self.design.seeds.is_empty() {
            return Err(SettingsError::NoSeeds);
        }
        let rates = self.design.effective_attack_rates();
        if rates.is_empty() {
            return Err(SettingsError::NoAttackRates);
        }
        if let Some(bad) = rates.iter().find(|r| **r > 100) {
            return Err(SettingsError::AttackRateOutOfRange(*bad));
        }
        if rates.iter().any(|r| *r > 0)
            && (self.design.lambdas.is_empty() || self.design.gammas.is_empty())
        {
            return Err(SettingsError::EmptyTrustGrid);
        }
        if self.design.include_control_topology && self.control_topology.is_none() {
            return Err(SettingsError::MissingControlTopology);
        }
        let mut ids = BTreeSet::new();
        for topo in self.active_topologies() {
            let id = topo.resolved_id();
            if check_name("topology", &id).is_err() {
                return Err(SettingsError::InvalidTopologyId(id));
            }
            if !ids.insert(id.clone()) {
                return Err(SettingsError::DuplicateTopology(id));
            }
        }
        if self.run.timeout_secs == 0 {
            return Err(SettingsError::ZeroDuration("run.timeout_secs"));
        }
        if self.run.sim_time_secs == 0 {
            return Err(SettingsError::ZeroDuration("run.sim_time_secs"));
        }
        Ok(())
    }

    /// Applies command-line overrides and validates the result again.
    pub fn apply_overrides(&mut self, overrides: &SweepOverrides) -> Result<(), SettingsError> {
        if let Some(seeds) = &overrides.seeds {
            self.design.seeds = seeds.clone();
        }
        self.design.include_attack_extremes |= overrides.include_attack_extremes;
        self.design.include_control_topology |= overrides.include_control_topology;
        self.design.include_normal_sanity |= overrides.include_normal_sanity;
        if let Some(timeout) = overrides.timeout_secs {
            self.run.timeout_secs = timeout;
        }
        self.validate()
    }

    /// Topologies taking part in the sweep, control topology last.
    pub fn active_topologies(&self) -> Vec<&TopologySpec> {
        let mut topos: Vec<&TopologySpec> = self.topologies.iter().collect();
        if self.design.include_control_topology {
            if let Some(control) = &self.control_topology {
                topos.push(control);
            }
        }
        topos
    }
}
