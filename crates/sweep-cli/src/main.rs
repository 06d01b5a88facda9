use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use sweep_analysis::{ReportSettings, SummaryOutputs};
use sweep_runner::{SweepConfig, SweepOptions, SweepOverrides};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sweep",
    version = "0.3.0",
    about = "Trust-aware routing simulation sweeps"
)]
struct Cli {
    /// Default log level debug instead of info (RUST_LOG still wins).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct OverrideArgs {
    /// Replaces the configured seeds, e.g. --seeds 1,2,3
    #[arg(long, value_delimiter = ',')]
    seeds: Option<Vec<u64>>,
    #[arg(long)]
    include_attack_extremes: bool,
    #[arg(long)]
    include_control_topology: bool,
    #[arg(long)]
    include_normal_sanity: bool,
    /// Per-run wall-clock timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

impl From<OverrideArgs> for SweepOverrides {
    fn from(value: OverrideArgs) -> Self {
        SweepOverrides {
            seeds: value.seeds,
            include_attack_extremes: value.include_attack_extremes,
            include_control_topology: value.include_control_topology,
            include_normal_sanity: value.include_normal_sanity,
            timeout_secs: value.timeout,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Init {
        #[arg(long, default_value = "sweep.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Describe {
        config: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    Plan {
        config: PathBuf,
        #[arg(long)]
        results_dir: Option<PathBuf>,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    Run {
        config: PathBuf,
        #[arg(long)]
        results_dir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    Summarize {
        results_dir: PathBuf,
        /// Sweep file whose `report` section drives the report.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path, overrides: OverrideArgs) -> Result<SweepConfig> {
    let mut config = SweepConfig::load(path)?;
    config.apply_overrides(&overrides.into())?;
    debug!(
        config = %path.display(),
        topologies = config.active_topologies().len(),
        "sweep config loaded"
    );
    Ok(config)
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, SWEEP_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: point topologies at your .csc templates and set the simulator paths");
            println!("next: sweep describe {}", path.display());
        }
        Commands::Describe {
            config,
            overrides,
            json,
        } => {
            let config = load_config(&config, overrides)?;
            let description = sweep_runner::describe_sweep(&config);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "sweep": serde_json::to_value(&description)?,
                })));
            }
            for topo in &description.topologies {
                println!(
                    "topology: {} ({}{})",
                    topo.id,
                    topo.template.display(),
                    if topo.template_exists { "" } else { ", missing" }
                );
            }
            let count = &description.count;
            println!("seeds: {}", count.seeds);
            println!("attack_rates: {:?}", count.attack_rates);
            println!("lambdas: {:?}", description.lambdas);
            println!("gammas: {:?}", description.gammas);
            println!("trust_off_runs: {}", count.trust_off);
            println!("trust_on_runs: {}", count.trust_on);
            println!("sanity_runs: {}", count.sanity);
            println!("total_runs: {}", count.total);
            println!("sim_time_secs: {}", description.sim_time_secs);
            println!("timeout_secs: {}", description.timeout_secs);
            println!("results_root: {}", description.results_root.display());
            println!("simulator: {:?}", description.simulator);
            println!("sidecar: {:?}", description.sidecar);
        }
        Commands::Plan {
            config,
            results_dir,
            overrides,
            json,
        } => {
            let config = load_config(&config, overrides)?;
            let plan = sweep_runner::plan_sweep(&config, results_dir.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "plan": serde_json::to_value(&plan)?,
                })));
            }
            println!("results_dir: {}", plan.results_dir.display());
            println!("matrix: {}", plan.matrix_path.display());
            println!("runs: {}", plan.runs);
        }
        Commands::Run {
            config,
            results_dir,
            dry_run,
            overrides,
            json,
        } => {
            let config = load_config(&config, overrides)?;
            let options = SweepOptions {
                results_dir,
                dry_run,
            };
            let result = sweep_runner::run_sweep(&config, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "dry_run": dry_run,
                    "sweep": serde_json::to_value(&result)?,
                })));
            }
            println!("results_dir: {}", result.results_dir.display());
            println!("runs: {}", result.total);
            println!("executed: {}", result.executed);
            println!("resumed: {}", result.resumed);
            if dry_run {
                println!("skipped: {}", result.skipped);
            }
            println!("completed: {}", result.completed);
            println!("timeout: {}", result.timeout);
            println!("failed: {}", result.failed);
            println!("elapsed_secs: {:.1}", result.elapsed_secs);
            if let Some(summary) = &result.summary {
                print_summary(summary);
            }
        }
        Commands::Summarize {
            results_dir,
            config,
            json,
        } => {
            let settings = match &config {
                Some(path) => SweepConfig::load(path)?.report,
                None => ReportSettings::default(),
            };
            let summary = sweep_analysis::summarize(&results_dir, &settings)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "summary": serde_json::to_value(&summary)?,
                })));
            }
            print_summary(&summary);
        }
    }
    Ok(None)
}

fn print_summary(summary: &SummaryOutputs) {
    println!("runs_found: {}", summary.runs);
    println!("valid_runs: {}", summary.valid_runs);
    println!("invalid_runs: {}", summary.invalid_runs);
    println!("groups: {}", summary.groups);
    println!("summary: {}", summary.summary.display());
    println!("invalid: {}", summary.invalid.display());
    println!("aggregate: {}", summary.aggregate.display());
    println!("report: {}", summary.report.display());
    for advisory in &summary.advisories {
        println!("warning: {}", advisory.message);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Run { json, .. }
        | Commands::Summarize { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

const SWEEP_TEMPLATE: &str = "\
# Paths are relative to this file.
topologies:
  - template: configs/topologies/T3.csc
  - template: configs/topologies/T1_S.csc
# Opt in with design.include_control_topology or --include-control-topology.
control_topology:
  template: configs/topologies/T2_random_15_seed1.csc
design:
  seeds: [111111, 222222, 333333, 444444, 555555]
  attack_rates: [30, 50]
  extreme_attack_rates: [0, 70]
  include_attack_extremes: false
  include_control_topology: false
  include_normal_sanity: false       # (lambda, gamma) pairs at attack rate 0
  lambdas: [0, 1, 3, 10]
  gammas: [1, 2, 4]
  sanity_pairs: [[0, 1], [3, 2]]
run:
  sim_time_secs: 600
  timeout_secs: 900                  # wall clock per run
  send_interval_secs: 30
  warmup_secs: 120
  sidecar_grace_ms: 5000
paths:
  results_root: results
  # clean_build_dir: build            # removed before every run
simulator:
  java: java
  java_opts: -Xmx4G -Xms2G
  cooja_path: /home/dev/contiki-ng  # REQUIRED: contains tools/cooja
  contiki_path: contiki-ng-brpl
sidecar:
  binary: tools/trust_engine/target/release/trust_engine   # REQUIRED
  stats_interval: 200
  metric: ewma
  alpha: 0.2
  ewma_min: 0.7
  miss_threshold: 5
  forwarders_only: true
  fwd_drop_threshold: 0.2
  attacker_id: 2
report:
  focus_topology: T3
  focus_attack_rate: 50
  control_topology: T2-random-15-seed1
  control_min_pdr: 95.0
  control_max_e1: 0.01
  flat_check_topologies: [T3, T1-S]
  flat_e1_epsilon: 0.01
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_template_parses_and_validates() {
        let config: SweepConfig = serde_yaml::from_str(SWEEP_TEMPLATE).expect("template yaml");
        config.validate().expect("template validates");
        assert_eq!(config.active_topologies().len(), 2);
        assert_eq!(config.design.sanity_pairs, vec![(0, 1), (3, 2)]);
        assert_eq!(config.report, ReportSettings::default());
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "sweep",
            "--verbose",
            "run",
            "sweep.yaml",
            "--dry-run",
            "--seeds",
            "1,2",
            "--timeout",
            "60",
            "--json",
        ])
        .expect("parse");
        assert!(cli.verbose);
        assert!(command_json_mode(&cli.command));
        let Commands::Run {
            dry_run, overrides, ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert!(dry_run);
        let overrides: SweepOverrides = overrides.into();
        assert_eq!(overrides.seeds, Some(vec![1, 2]));
        assert_eq!(overrides.timeout_secs, Some(60));
        assert!(!overrides.include_attack_extremes);
    }

    #[test]
    fn error_envelope_shape() {
        let v = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("command_failed"));
    }
}
