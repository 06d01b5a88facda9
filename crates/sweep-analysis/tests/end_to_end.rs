use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_analysis::{summarize, ReportSettings, SIM_LOG_FILE};
use sweep_core::{RunStatus, SweepMatrix, MATRIX_FILE_NAME};

fn results_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "sweep_analysis_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("create results dir");
    root
}

/// `sent` packets from node 3, the first `received` of them delivered.
fn sim_log(sent: u32, received: u32) -> String {
    let mut log = String::from("00:00.100\tID:1\tRPL root ready\n");
    for seq in 1..=sent {
        log.push_str(&format!("00:{:02}.000\tID:3\tCSV,TX,3,{},{},1\n", seq % 60, seq, seq * 1000));
    }
    for seq in 1..=received {
        log.push_str(&format!("00:{:02}.500\tID:1\tCSV,RX,3,{},{},64\n", seq % 60, seq, seq * 1000 + 40));
        log.push_str(&format!("00:{:02}.500\tID:1\tCSV,DELAY,40,3,{}\n", seq % 60, seq));
    }
    log
}

fn write_run(root: &Path, name: &str, log: Option<&str>, e1: Option<f64>) {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("logs")).expect("run dirs");
    if let Some(log) = log {
        fs::write(dir.join("logs").join(SIM_LOG_FILE), log).expect("write log");
    }
    if let Some(e1) = e1 {
        fs::write(
            dir.join("exposure.csv"),
            format!("time_s,window,forwarders,attacker,dropped,e1,e3\n600,10,8,2,5,{e1},0.05\n"),
        )
        .expect("write exposure");
        fs::write(
            dir.join("parent_switch.csv"),
            "node,switches,window_s,switch_rate\n3,2,600,0.002\n4,4,600,0.004\n",
        )
        .expect("write parent switch");
    }
}

fn read_table(path: &Path) -> Vec<HashMap<String, String>> {
    let mut reader = csv::Reader::from_path(path).expect("open table");
    let header = reader.headers().expect("header").clone();
    reader
        .records()
        .map(|r| {
            let r = r.expect("record");
            header
                .iter()
                .zip(r.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect()
        })
        .collect()
}

#[test]
fn summary_tables_follow_validity_and_grouping() {
    let root = results_root("e2e");
    write_run(&root, "T3_attack_atk50_trust1_lam3_gam2_s1", Some(&sim_log(50, 45)), Some(0.1));
    write_run(&root, "T3_attack_atk50_trust1_lam3_gam2_s2", Some(&sim_log(50, 47)), Some(0.3));
    write_run(&root, "T3_attack_atk50_trust0_lamNA_gamNA_s1", Some(&sim_log(20, 15)), None);
    write_run(
        &root,
        "T3_attack_atk50_trust0_lamNA_gamNA_s2",
        Some("00:30.000\tID:3\tROUTING_WAIT_TIMEOUT after 120s\n"),
        None,
    );
    write_run(&root, "T3_attack_atk50_trust1_lam1_gam1_s1", None, None);
    fs::create_dir_all(root.join("notes")).expect("stray dir");

    let outputs = summarize(&root, &ReportSettings::default()).expect("summarize");
    assert_eq!(outputs.runs, 5);
    assert_eq!(outputs.valid_runs, 3);
    assert_eq!(outputs.invalid_runs, 2);
    assert_eq!(outputs.groups, 2);
    assert!(outputs.advisories.is_empty());

    let summary = read_table(&outputs.summary);
    assert_eq!(summary.len(), 3);
    let first = summary
        .iter()
        .find(|r| r["run"] == "T3_attack_atk50_trust1_lam3_gam2_s1")
        .expect("valid run present");
    assert_eq!(first["pdr"], "90.00");
    assert_eq!(first["avg_delay_ms"], "40.00");
    assert_eq!(first["lost"], "5");
    assert_eq!(first["parent_switch_rate"], "0.0030");

    let invalid = read_table(&outputs.invalid);
    let reason = |run: &str| {
        invalid
            .iter()
            .find(|r| r["run"] == run)
            .map(|r| r["reason"].clone())
            .expect("invalid row")
    };
    let stalled = reason("T3_attack_atk50_trust0_lamNA_gamNA_s2");
    assert!(stalled.split(';').any(|c| c == "tx=0"));
    assert!(stalled.split(';').any(|c| c == "routing_not_ready"));
    assert_eq!(reason("T3_attack_atk50_trust1_lam1_gam1_s1"), "missing_log");
    let never_ran = invalid
        .iter()
        .find(|r| r["run"] == "T3_attack_atk50_trust1_lam1_gam1_s1")
        .expect("missing-log row");
    assert_eq!((never_ran["tx"].as_str(), never_ran["rx"].as_str()), ("", ""));
    assert_eq!(never_ran["status"], "planned");

    let groups = read_table(&outputs.aggregate);
    assert_eq!(groups.len(), 2);
    let trust_on = groups
        .iter()
        .find(|g| g["trust"] == "1")
        .expect("trust-on group");
    assert_eq!(trust_on["lambda"], "3");
    assert_eq!(trust_on["n"], "2");
    assert_eq!(trust_on["mean_pdr"], "92.00");
    assert_eq!(trust_on["std_pdr"], "2.83");
    assert_eq!(trust_on["ci95_pdr"], "3.92");
    let trust_off = groups
        .iter()
        .find(|g| g["trust"] == "0")
        .expect("trust-off group");
    assert_eq!(trust_off["n"], "1");
    assert_eq!(trust_off["std_pdr"], "0.00");
    assert_eq!(trust_off["mean_e1"], "");
    assert!(!groups.iter().any(|g| g["lambda"] == "1"));

    let report = fs::read_to_string(&outputs.report).expect("report");
    assert!(report.contains("## Key Results (T3, attack=50)"));
    assert!(report.contains("missing_log"));
    assert!(report.contains("- No warnings."));

    let matrix = SweepMatrix::load(&root.join(MATRIX_FILE_NAME)).expect("rebuilt matrix");
    assert_eq!(matrix.rows().len(), 5);
    assert_eq!(matrix.count_by_status(RunStatus::Completed), 4);
    assert_eq!(matrix.count_by_status(RunStatus::Planned), 1);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn older_sweep_directory_with_underscore_topology() {
    let root = results_root("older");
    let matrix = "run,topology,scenario,attack_rate,trust,lambda,gamma,seed,status\n\
        T1_S_attack_atk30_trust0_lamNA_gamNA_s111111,T1_S,attack,30,0,NA,NA,111111,completed\n\
        T1_S_attack_atk30_trust0_lamNA_gamNA_s222222,T1_S,attack,30,0,NA,NA,222222,timeout\n";
    fs::write(root.join(MATRIX_FILE_NAME), matrix).expect("write matrix");
    write_run(&root, "T1_S_attack_atk30_trust0_lamNA_gamNA_s111111", Some(&sim_log(10, 10)), None);
    write_run(&root, "T1_S_attack_atk30_trust0_lamNA_gamNA_s222222", None, None);

    let outputs = summarize(&root, &ReportSettings::default()).expect("summarize");
    assert_eq!((outputs.valid_runs, outputs.invalid_runs), (1, 1));

    let summary = read_table(&outputs.summary);
    assert_eq!(summary[0]["run"], "T1_S_attack_atk30_trust0_lamNA_gamNA_s111111");
    assert_eq!(summary[0]["topology"], "T1-S");
    assert_eq!(summary[0]["pdr"], "100.00");

    let invalid = read_table(&outputs.invalid);
    assert_eq!(invalid[0]["status"], "timeout");
    assert_eq!(invalid[0]["reason"], "missing_log");

    let groups = read_table(&outputs.aggregate);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["topology"], "T1-S");

    let report = fs::read_to_string(&outputs.report).expect("report");
    assert!(report.contains("- Timed out or failed: 1"));
    assert_eq!(
        fs::read_to_string(root.join(MATRIX_FILE_NAME)).expect("matrix"),
        matrix
    );
    let _ = fs::remove_dir_all(root);
}

#[test]
fn rerun_is_idempotent_and_keeps_existing_matrix() {
    let root = results_root("rerun");
    write_run(&root, "T1-S_attack_atk30_trust1_lam3_gam2_s1", Some(&sim_log(10, 9)), Some(0.2));

    let first = summarize(&root, &ReportSettings::default()).expect("first pass");
    let summary_once = fs::read_to_string(&first.summary).expect("summary");
    let aggregate_once = fs::read_to_string(&first.aggregate).expect("aggregate");

    let second = summarize(&root, &ReportSettings::default()).expect("second pass");
    assert_eq!(fs::read_to_string(&second.summary).expect("summary"), summary_once);
    assert_eq!(fs::read_to_string(&second.aggregate).expect("aggregate"), aggregate_once);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn empty_results_still_write_headers() {
    let root = results_root("empty");
    let outputs = summarize(&root, &ReportSettings::default()).expect("summarize");
    assert_eq!(outputs.runs, 0);
    let aggregate = fs::read_to_string(&outputs.aggregate).expect("aggregate");
    assert!(aggregate.starts_with("topology,attack_rate,trust,lambda,gamma,n,mean_pdr"));
    assert_eq!(aggregate.lines().count(), 1);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn missing_results_dir_is_an_error() {
    let root = std::env::temp_dir().join(format!("sweep_analysis_absent_{}", std::process::id()));
    assert!(summarize(&root, &ReportSettings::default()).is_err());
}
