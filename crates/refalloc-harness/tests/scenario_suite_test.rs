use std::process::Command;

use refalloc_harness::scenarios::{self, SCENARIOS};
use refalloc_harness::structured_log::validate_log_line;
use refalloc_harness::{LogEmitter, Outcome, run_scenarios};

fn log_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("refalloc-harness-{tag}-{}.jsonl", std::process::id()))
}

#[test]
fn every_scenario_passes() {
    for scenario in SCENARIOS {
        let report = scenario.run();
        assert!(report.passed(), "{}: {:?}", scenario.name, report.error);
    }
}

#[test]
fn run_log_has_a_start_and_end_line_per_scenario() {
    let path = log_path("suite");
    let selected: Vec<_> = SCENARIOS.iter().collect();
    let mut emitter = LogEmitter::to_file(&path, "suite").unwrap();
    let reports = run_scenarios(&selected, &mut emitter).unwrap();
    drop(emitter);
    assert!(reports.iter().all(|r| r.outcome == Outcome::Pass));

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = content.lines().map(|l| validate_log_line(l).unwrap()).collect();
    assert_eq!(lines.len(), 2 * SCENARIOS.len());
    for (pair, scenario) in lines.chunks(2).zip(SCENARIOS) {
        assert_eq!(pair[0]["event"], "scenario_start");
        assert_eq!(pair[1]["event"], "scenario_end");
        assert_eq!(pair[1]["scenario"], scenario.name);
        assert_eq!(pair[1]["outcome"], "pass");
        assert!(pair[1]["metrics"]["allocations"].as_u64().unwrap() > 0);
    }
    assert_eq!(lines[0]["trace_id"], "refalloc::suite::001");
    std::fs::remove_file(&path).ok();
}

#[test]
fn aligned_sweep_reports_allocator_records() {
    let report = scenarios::find("aligned_sweep").unwrap().run();
    assert!(report.passed(), "{:?}", report.error);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["name"], "aligned_sweep");
    assert!(json.get("error").is_none());
}

#[test]
fn cli_lists_every_scenario() {
    let output = Command::new(env!("CARGO_BIN_EXE_harness"))
        .arg("list")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    for scenario in SCENARIOS {
        assert!(stdout.contains(scenario.name), "missing {}", scenario.name);
    }
}

#[test]
fn cli_runs_one_scenario_and_writes_log() {
    let path = log_path("cli");
    let output = Command::new(env!("CARGO_BIN_EXE_harness"))
        .args(["run", "--scenario", "custom_chain", "--log"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("PASS custom_chain"));
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 2);
    std::fs::remove_file(&path).ok();
}

#[test]
fn cli_rejects_unknown_scenario() {
    let output = Command::new(env!("CARGO_BIN_EXE_harness"))
        .args(["run", "--scenario", "nope"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));
}
