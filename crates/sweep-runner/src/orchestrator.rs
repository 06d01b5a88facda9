use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use sweep_core::{
    atomic_write_json_pretty, ensure_dir, sha256_bytes, ParameterTuple, RunIdentity, RunStatus,
};
use tracing::{debug, info, warn};

use crate::generator::SweepPlan;
use crate::mutator::{ConfigMutator, RunSettings};
use crate::process::{ManagedChild, Termination};
use crate::settings::{RunTimings, SidecarSettings, SimulatorSettings, SweepConfig};

pub const RUN_META_FILE: &str = "run_meta.json";

/// Where one run's artifacts live.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub meta: PathBuf,
    pub sim_log: PathBuf,
    pub feedback: PathBuf,
    pub trust_metrics: PathBuf,
    pub blacklist: PathBuf,
    pub exposure: PathBuf,
    pub parent_switch: PathBuf,
    pub stats: PathBuf,
    pub sidecar_output: PathBuf,
    pub simulator_output: PathBuf,
}

impl RunPaths {
    pub fn new(results_dir: &Path, run: &RunIdentity) -> Self {
        let run_dir = results_dir.join(run.as_str());
        let log_dir = run_dir.join("logs");
        Self {
            meta: log_dir.join(RUN_META_FILE),
            sim_log: log_dir.join(sweep_analysis::SIM_LOG_FILE),
            feedback: run_dir.join("trust_feedback.txt"),
            trust_metrics: run_dir.join("trust_metrics.csv"),
            blacklist: run_dir.join("blacklist.csv"),
            exposure: run_dir.join(sweep_analysis::EXPOSURE_FILE),
            parent_switch: run_dir.join(sweep_analysis::PARENT_SWITCH_FILE),
            stats: run_dir.join(sweep_analysis::STATS_FILE),
            sidecar_output: run_dir.join("trust_engine.log"),
            simulator_output: run_dir.join("cooja_output.log"),
            log_dir,
            run_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(RunStatus),
    /// Dry run: directory and metadata written, nothing launched.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: RunIdentity,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
    pub sidecar_pid: Option<u32>,
    pub sidecar_stop: Option<Termination>,
}

#[derive(Debug, Clone)]
struct Template {
    path: PathBuf,
    text: String,
    digest: String,
}

#[derive(Serialize)]
struct RunMeta<'a> {
    schema_version: &'static str,
    run: &'a RunIdentity,
    parameters: &'a ParameterTuple,
    created_at: String,
    dry_run: bool,
    template: String,
    template_digest: &'a str,
    config_digest: String,
    sim_time_secs: u64,
    timeout_secs: u64,
    send_interval_secs: u64,
    warmup_secs: u64,
}

/// Materialized config for the running simulator; removed on drop.
struct TempConfig {
    path: PathBuf,
}

impl TempConfig {
    fn write(path: PathBuf, contents: &str) -> Result<Self> {
        let guard = TempConfig { path };
        fs::write(&guard.path, contents)
            .with_context(|| format!("writing {}", guard.path.display()))?;
        Ok(guard)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempConfig {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "could not remove temp config");
            }
        }
    }
}

pub struct Orchestrator {
    results_dir: PathBuf,
    scratch_dir: PathBuf,
    clean_build_dir: Option<PathBuf>,
    timings: RunTimings,
    simulator: SimulatorSettings,
    sidecar: SidecarSettings,
    templates: BTreeMap<String, Template>,
    mutator: ConfigMutator,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(
        config: &SweepConfig,
        plan: &SweepPlan,
        results_dir: &Path,
        dry_run: bool,
    ) -> Result<Self> {
        if !dry_run && config.sidecar.command.is_none() && !config.sidecar.binary.exists() {
            return Err(anyhow!(
                "trust sidecar binary not found at {}",
                config.sidecar.binary.display()
            ));
        }
        let mut templates = BTreeMap::new();
        for (id, path) in &plan.templates {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading template for {} at {}", id, path.display()))?;
            let digest = sha256_bytes(text.as_bytes());
            templates.insert(
                id.clone(),
                Template {
                    path: path.clone(),
                    text,
                    digest,
                },
            );
        }
        let scratch_dir = config
            .paths
            .scratch_dir
            .clone()
            .unwrap_or_else(|| results_dir.join(".scratch"));
        Ok(Self {
            results_dir: results_dir.to_path_buf(),
            scratch_dir,
            clean_build_dir: config.paths.clean_build_dir.clone(),
            timings: config.run.clone(),
            simulator: config.simulator.clone(),
            sidecar: config.sidecar.clone(),
            templates,
            mutator: ConfigMutator::new()?,
            dry_run,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Materializes each (topology, trust mode) once so template mismatches
    /// surface before any process starts.
    pub fn preflight(&self, tuples: &[ParameterTuple]) -> Result<()> {
        let mut checked = BTreeSet::new();
        for tuple in tuples {
            if !checked.insert((tuple.topology().to_string(), tuple.trust_enabled())) {
                continue;
            }
            let run = RunIdentity::for_tuple(tuple);
            let paths = RunPaths::new(&self.results_dir, &run);
            self.materialize(tuple, &paths)
                .with_context(|| format!("template check for {}", run))?;
        }
        debug!(combinations = checked.len(), "templates checked");
        Ok(())
    }

    fn template(&self, tuple: &ParameterTuple) -> Result<&Template> {
        self.templates
            .get(tuple.topology())
            .ok_or_else(|| anyhow!("no template registered for topology {}", tuple.topology()))
    }

    fn run_settings(&self, paths: &RunPaths) -> RunSettings {
        RunSettings {
            sim_time_secs: self.timings.sim_time_secs,
            send_interval_secs: self.timings.send_interval_secs,
            warmup_secs: self.timings.warmup_secs,
            feedback_path: paths.feedback.clone(),
        }
    }

    fn materialize(&self, tuple: &ParameterTuple, paths: &RunPaths) -> Result<String> {
        let template = self.template(tuple)?;
        let doc = self
            .mutator
            .materialize(&template.text, tuple, &self.run_settings(paths))
            .with_context(|| format!("materializing {}", template.path.display()))?;
        Ok(doc)
    }

    /// Executes one tuple end to end. Process failures and timeouts come
    /// back as a terminal status; `Err` is reserved for configuration and
    /// filesystem problems.
    pub fn run_one(&self, tuple: &ParameterTuple) -> Result<RunReport> {
        let started = Instant::now();
        let run = RunIdentity::for_tuple(tuple);
        let paths = RunPaths::new(&self.results_dir, &run);
        ensure_dir(&paths.log_dir)?;

        let doc = self.materialize(tuple, &paths)?;
        self.write_meta(&run, tuple, &paths, &doc)?;

        if self.dry_run {
            info!(run = %run, "dry run, not launching");
            return Ok(RunReport {
                run,
                outcome: RunOutcome::Skipped,
                elapsed: started.elapsed(),
                sidecar_pid: None,
                sidecar_stop: None,
            });
        }

        if let Some(dir) = &self.clean_build_dir {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .with_context(|| format!("cleaning build dir {}", dir.display()))?;
                debug!(dir = %dir.display(), "build dir removed");
            }
        }

        ensure_dir(&self.scratch_dir)?;
        let config = TempConfig::write(self.scratch_dir.join(format!("temp_{}.csc", run)), &doc)?;
        File::create(&paths.sim_log)
            .with_context(|| format!("creating {}", paths.sim_log.display()))?;
        File::create(&paths.feedback)
            .with_context(|| format!("creating {}", paths.feedback.display()))?;

        let mut sidecar_cmd = self.sidecar_command(&paths)?;
        let mut sidecar = match ManagedChild::spawn("sidecar", &mut sidecar_cmd) {
            Ok(child) => child,
            Err(err) => {
                warn!(run = %run, error = %err, "sidecar failed to start");
                return Ok(RunReport {
                    run,
                    outcome: RunOutcome::Finished(RunStatus::Failed),
                    elapsed: started.elapsed(),
                    sidecar_pid: None,
                    sidecar_stop: None,
                });
            }
        };

        let mut sim_cmd = self.simulator_command(&paths, config.path())?;
        let status = match ManagedChild::spawn("simulator", &mut sim_cmd) {
            Err(err) => {
                warn!(run = %run, error = %err, "simulator failed to start");
                RunStatus::Failed
            }
            Ok(mut sim) => match sim
                .wait_with_deadline(self.timings.timeout(), self.timings.poll_interval())?
            {
                Some(exit) if exit.success() => RunStatus::Completed,
                Some(exit) => {
                    warn!(run = %run, exit = ?exit.code(), "simulator exited with failure");
                    RunStatus::Failed
                }
                None => {
                    warn!(
                        run = %run,
                        timeout_secs = self.timings.timeout_secs,
                        "simulator timed out, killing"
                    );
                    sim.kill()?;
                    RunStatus::Timeout
                }
            },
        };

        let sidecar_pid = sidecar.pid();
        let stop = sidecar.terminate(self.timings.sidecar_grace(), self.timings.poll_interval())?;
        drop(config);

        let elapsed = started.elapsed();
        info!(
            run = %run,
            status = %status,
            elapsed_secs = elapsed.as_secs_f64(),
            sidecar = ?stop,
            "run finished"
        );
        Ok(RunReport {
            run,
            outcome: RunOutcome::Finished(status),
            elapsed,
            sidecar_pid: Some(sidecar_pid),
            sidecar_stop: Some(stop),
        })
    }

    fn write_meta(
        &self,
        run: &RunIdentity,
        tuple: &ParameterTuple,
        paths: &RunPaths,
        doc: &str,
    ) -> Result<()> {
        let template = self.template(tuple)?;
        let meta = RunMeta {
            schema_version: "run_meta_v1",
            run,
            parameters: tuple,
            created_at: chrono::Utc::now().to_rfc3339(),
            dry_run: self.dry_run,
            template: template.path.to_string_lossy().to_string(),
            template_digest: &template.digest,
            config_digest: sha256_bytes(doc.as_bytes()),
            sim_time_secs: self.timings.sim_time_secs,
            timeout_secs: self.timings.timeout_secs,
            send_interval_secs: self.timings.send_interval_secs,
            warmup_secs: self.timings.warmup_secs,
        };
        atomic_write_json_pretty(&paths.meta, &serde_json::to_value(&meta)?)
    }

    fn sidecar_command(&self, paths: &RunPaths) -> Result<Command> {
        let launcher = self.sidecar.launcher();
        let (program, lead) = launcher
            .split_first()
            .ok_or_else(|| anyhow!("sidecar command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(lead);
        let outputs: [(&str, &Path); 7] = [
            ("--input", paths.sim_log.as_path()),
            ("--output", paths.feedback.as_path()),
            ("--metrics-out", paths.trust_metrics.as_path()),
            ("--blacklist-out", paths.blacklist.as_path()),
            ("--exposure-out", paths.exposure.as_path()),
            ("--parent-out", paths.parent_switch.as_path()),
            ("--stats-out", paths.stats.as_path()),
        ];
        for (flag, path) in outputs {
            cmd.arg(flag).arg(path);
        }
        cmd.args(self.sidecar.scoring_args());
        cmd.arg("--follow");
        let (stdout, stderr) = capture(&paths.sidecar_output)?;
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        Ok(cmd)
    }

    fn simulator_command(&self, paths: &RunPaths, config: &Path) -> Result<Command> {
        let launcher = self.simulator.launcher();
        let (program, lead) = launcher
            .split_first()
            .ok_or_else(|| anyhow!("simulator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(lead)
            .arg("--no-gui")
            .arg("--autostart")
            .arg(format!("--contiki={}", self.simulator.contiki_path.display()))
            .arg(format!("--logdir={}", paths.log_dir.display()))
            .arg(config);
        cmd.env("CONTIKI_NG_PATH", &self.simulator.contiki_path)
            .env("COOJA_PATH", &self.simulator.cooja_path)
            .env("SERIAL_SOCKET_DISABLE", "1")
            .env("JAVA_OPTS", &self.simulator.java_opts);
        let (stdout, stderr) = capture(&paths.simulator_output)?;
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        Ok(cmd)
    }
}

/// One file receiving both stdout and stderr.
fn capture(path: &Path) -> Result<(Stdio, Stdio)> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let dup = file
        .try_clone()
        .with_context(|| format!("duplicating handle for {}", path.display()))?;
    Ok((Stdio::from(file), Stdio::from(dup)))
}
