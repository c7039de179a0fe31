//! Verification harness for the refalloc allocation facade.
//!
//! This crate provides:
//! - Named lifecycle scenarios covering every built-in backend
//! - A runner that logs each scenario as structured JSONL
//! - The `harness` CLI (`harness list`, `harness run`)

pub mod error;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use scenarios::{SCENARIOS, Scenario, ScenarioReport};
pub use structured_log::{LogEmitter, LogEntry, Outcome};

use refalloc_core::LogLevel;

/// Run `scenarios` in order, logging a start and end entry for each.
///
/// Every scenario runs even after a failure.
pub fn run_scenarios(
    scenarios: &[&Scenario],
    emitter: &mut LogEmitter,
) -> Result<Vec<ScenarioReport>, HarnessError> {
    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        emitter.emit_entry(
            LogEntry::new(String::new(), LogLevel::Info, "scenario_start")
                .with_scenario(scenario.name),
        )?;
        let report = scenario.run();
        let level = if report.passed() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        let mut entry = LogEntry::new(String::new(), level, "scenario_end")
            .with_scenario(report.name)
            .with_outcome(report.outcome)
            .with_duration_ms(report.duration_ms)
            .with_metrics(report.metrics)
            .with_allocator_records(report.records.clone());
        if let Some(error) = &report.error {
            entry = entry.with_details(serde_json::json!({ "error": error }));
        }
        emitter.emit_entry(entry)?;
        reports.push(report);
    }
    emitter.flush()?;
    Ok(reports)
}
