pub mod generator;
pub mod mutator;
pub mod orchestrator;
pub mod process;
pub mod settings;

pub use generator::{expected_count, generate, plan_from_config, SweepCount, SweepPlan};
pub use mutator::{ConfigMutator, MutationError, RunSettings};
pub use orchestrator::{Orchestrator, RunOutcome, RunPaths, RunReport};
pub use process::{ManagedChild, Termination};
pub use settings::{SettingsError, SweepConfig, SweepOverrides};

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use sweep_analysis::SummaryOutputs;
use sweep_core::{ensure_dir, RunIdentity, RunStatus, SweepMatrix, MATRIX_FILE_NAME};
use tracing::{debug, info};

/// `results/experiments-YYYYmmdd-HHMMSS` under the configured root.
pub fn default_results_dir(root: &Path) -> PathBuf {
    root.join(format!(
        "experiments-{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ))
}

/// Loads the matrix already in `results_dir` or writes a fresh all-planned
/// one. An existing matrix must describe exactly the planned runs.
pub fn open_matrix(results_dir: &Path, plan: &SweepPlan) -> Result<SweepMatrix> {
    let path = results_dir.join(MATRIX_FILE_NAME);
    if path.exists() {
        let matrix = SweepMatrix::load(&path)?;
        let existing = matrix.identities();
        let planned = plan.identities();
        if existing != planned {
            let missing = planned.difference(&existing).count();
            let extra = existing.difference(&planned).count();
            return Err(anyhow!(
                "{} belongs to a different sweep ({} planned runs missing, {} unknown rows)",
                path.display(),
                missing,
                extra
            ));
        }
        info!(
            path = %path.display(),
            finished = matrix.rows().iter().filter(|r| r.status.is_terminal()).count(),
            "resuming existing sweep matrix"
        );
        return Ok(matrix);
    }
    ensure_dir(results_dir)?;
    let matrix = SweepMatrix::plan(&path, &plan.tuples)?;
    matrix.save()?;
    Ok(matrix)
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub results_dir: PathBuf,
    pub matrix_path: PathBuf,
    pub runs: usize,
    pub count: SweepCount,
}

/// Writes (or re-validates) the sweep matrix without running anything.
pub fn plan_sweep(config: &SweepConfig, results_dir: Option<&Path>) -> Result<PlanResult> {
    let plan = plan_from_config(config)?;
    let results_dir = results_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_results_dir(&config.paths.results_root));
    let matrix = open_matrix(&results_dir, &plan)?;
    Ok(PlanResult {
        matrix_path: matrix.path().to_path_buf(),
        runs: matrix.rows().len(),
        count: expected_count(config.active_topologies().len(), &config.design),
        results_dir,
    })
}

#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    pub results_dir: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub results_dir: PathBuf,
    pub matrix_path: PathBuf,
    pub total: usize,
    pub executed: usize,
    pub resumed: usize,
    pub skipped: usize,
    pub completed: usize,
    pub timeout: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
    pub summary: Option<SummaryOutputs>,
}

/// Runs every planned tuple in order, one at a time. Rows already in a
/// terminal state are left alone, so an interrupted sweep can be restarted
/// against the same results directory.
pub fn run_sweep(config: &SweepConfig, options: &SweepOptions) -> Result<SweepResult> {
    let started = Instant::now();
    let plan = plan_from_config(config)?;
    let results_dir = options
        .results_dir
        .clone()
        .unwrap_or_else(|| default_results_dir(&config.paths.results_root));
    let mut matrix = open_matrix(&results_dir, &plan)?;
    let orchestrator = Orchestrator::new(config, &plan, &results_dir, options.dry_run)?;
    orchestrator.preflight(&plan.tuples)?;

    let total = plan.tuples.len();
    info!(
        results_dir = %results_dir.display(),
        runs = total,
        dry_run = options.dry_run,
        "sweep started"
    );

    let mut executed = 0;
    let mut resumed = 0;
    let mut skipped = 0;
    for (idx, tuple) in plan.tuples.iter().enumerate() {
        let run = RunIdentity::for_tuple(tuple);
        if matrix.status_of(&run).is_some_and(|s| s.is_terminal()) {
            debug!(run = %run, "already finished, skipping");
            resumed += 1;
            continue;
        }
        info!(run = %run, index = idx + 1, total, "run starting");
        let report = orchestrator.run_one(tuple)?;
        match report.outcome {
            RunOutcome::Finished(status) => {
                matrix.record_status(&run, status)?;
                executed += 1;
            }
            RunOutcome::Skipped => skipped += 1,
        }
    }
    // leaves a non-empty scratch dir in place for inspection
    let _ = fs::remove_dir(orchestrator.scratch_dir());

    let summary = if options.dry_run {
        None
    } else {
        Some(sweep_analysis::summarize(&results_dir, &config.report)?)
    };

    let result = SweepResult {
        matrix_path: matrix.path().to_path_buf(),
        total,
        executed,
        resumed,
        skipped,
        completed: matrix.count_by_status(RunStatus::Completed),
        timeout: matrix.count_by_status(RunStatus::Timeout),
        failed: matrix.count_by_status(RunStatus::Failed),
        elapsed_secs: started.elapsed().as_secs_f64(),
        summary,
        results_dir,
    };
    info!(
        completed = result.completed,
        timeout = result.timeout,
        failed = result.failed,
        skipped = result.skipped,
        "sweep finished"
    );
    Ok(result)
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyInfo {
    pub id: String,
    pub template: PathBuf,
    pub template_exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepDescription {
    pub topologies: Vec<TopologyInfo>,
    pub count: SweepCount,
    pub lambdas: Vec<u32>,
    pub gammas: Vec<u32>,
    pub sim_time_secs: u64,
    pub timeout_secs: u64,
    pub results_root: PathBuf,
    pub simulator: Vec<String>,
    pub sidecar: Vec<String>,
}

pub fn describe_sweep(config: &SweepConfig) -> SweepDescription {
    let topologies: Vec<TopologyInfo> = config
        .active_topologies()
        .into_iter()
        .map(|spec| TopologyInfo {
            id: spec.resolved_id(),
            template: spec.template.clone(),
            template_exists: spec.template.exists(),
        })
        .collect();
    let mut sidecar = config.sidecar.launcher();
    sidecar.extend(config.sidecar.scoring_args());
    SweepDescription {
        count: expected_count(topologies.len(), &config.design),
        topologies,
        lambdas: config.design.lambdas.clone(),
        gammas: config.design.gammas.clone(),
        sim_time_secs: config.run.sim_time_secs,
        timeout_secs: config.run.timeout_secs,
        results_root: config.paths.results_root.clone(),
        simulator: config.simulator.launcher(),
        sidecar,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;

    const TEMPLATE: &str = "<randomseed>1</randomseed> TIMEOUT(@SIM_TIME_SEC@) \
        @TRUST_FEEDBACK_PATH@ TRUST_ENABLED=0,ATTACK_DROP_PCT=0,SEND_INTERVAL_SECONDS=1,\
        WARMUP_SECONDS=1,TRUST_LAMBDA=0\n";

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "sweep_runner_{}_{}_{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn config(root: &Path, simulator: &str) -> SweepConfig {
        fs::create_dir_all(root).expect("root");
        fs::write(root.join("T3.csc"), TEMPLATE).expect("template");
        let yaml = format!(
            "topologies:\n  - template: T3.csc\n\
             design:\n  seeds: [1, 2]\n  attack_rates: [50]\n  lambdas: [3]\n  gammas: [2]\n\
             run:\n  timeout_secs: 5\n  sidecar_grace_ms: 500\n  poll_interval_ms: 20\n\
             simulator:\n  command: [sh, -c, {:?}, sim]\n\
             sidecar:\n  command: [sh, -c, 'exec sleep 30', sidecar]\n",
            simulator
        );
        let mut config: SweepConfig = serde_yaml::from_str(&yaml).expect("yaml");
        config.resolve_paths(root);
        config.validate().expect("valid");
        config
    }

    #[test]
    fn sweep_records_every_run_and_summarizes() {
        let root = scratch("sweep");
        let config = config(&root, "exit 0");
        let results = root.join("results").join("one");
        let result = run_sweep(
            &config,
            &SweepOptions {
                results_dir: Some(results.clone()),
                dry_run: false,
            },
        )
        .expect("sweep");
        assert_eq!(result.total, 4);
        assert_eq!(result.executed, 4);
        assert_eq!(result.completed, 4);
        assert!(result.summary.is_some());
        assert!(results.join("experiment_summary.csv").exists());
        assert!(!results.join(".scratch").exists());

        let matrix = SweepMatrix::load(&results.join(MATRIX_FILE_NAME)).expect("matrix");
        assert!(matrix.rows().iter().all(|r| r.status == RunStatus::Completed));

        let again = run_sweep(
            &config,
            &SweepOptions {
                results_dir: Some(results.clone()),
                dry_run: false,
            },
        )
        .expect("resume");
        assert_eq!(again.executed, 0);
        assert_eq!(again.resumed, 4);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dry_run_leaves_rows_planned() {
        let root = scratch("dry");
        let config = config(&root, "exit 1");
        let results = root.join("results").join("dry");
        let result = run_sweep(
            &config,
            &SweepOptions {
                results_dir: Some(results.clone()),
                dry_run: true,
            },
        )
        .expect("dry sweep");
        assert_eq!(result.skipped, 4);
        assert!(result.summary.is_none());
        let matrix = SweepMatrix::load(&results.join(MATRIX_FILE_NAME)).expect("matrix");
        assert_eq!(matrix.count_by_status(RunStatus::Planned), 4);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn foreign_matrix_is_refused() {
        let root = scratch("foreign");
        let mut config = config(&root, "exit 0");
        let results = root.join("results").join("x");
        plan_sweep(&config, Some(&results)).expect("plan");
        config.design.seeds = vec![9];
        let err = plan_sweep(&config, Some(&results)).expect_err("mismatch");
        assert!(err.to_string().contains("different sweep"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn template_mismatch_aborts_before_launch() {
        let root = scratch("mismatch");
        let config = config(&root, "exit 0");
        fs::write(root.join("T3.csc"), "<randomseed>1</randomseed>\n").expect("template");
        let results = root.join("results").join("m");
        let err = run_sweep(
            &config,
            &SweepOptions {
                results_dir: Some(results.clone()),
                dry_run: false,
            },
        )
        .expect_err("mismatch");
        assert!(format!("{:#}", err).contains("template"));
        assert!(!results.join("T3_attack_atk50_trust0_lamNA_gamNA_s1").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn describe_reports_closed_form_count() {
        let root = scratch("describe");
        let config = config(&root, "exit 0");
        let description = describe_sweep(&config);
        assert_eq!(description.count.total, 4);
        assert_eq!(description.topologies[0].id, "T3");
        assert!(description.topologies[0].template_exists);
        let _ = fs::remove_dir_all(root);
    }
}
