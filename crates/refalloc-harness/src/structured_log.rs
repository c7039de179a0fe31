//! JSONL run logs for harness scenarios.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes records to a file or an in-memory buffer.
//! - [`validate_log_line`]: checks a single JSONL line against the schema.

use std::io::Write;
use std::path::Path;

use refalloc_core::{LogLevel, LogRecord, MetricsSnapshot};
use serde::{Deserialize, Serialize};

/// Scenario outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Canonical harness log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Facade counters at the end of the scenario.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    /// Allocator records emitted while the scenario ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocator_records: Option<Vec<LogRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create an entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            scenario: None,
            outcome: None,
            duration_ms: None,
            metrics: None,
            allocator_records: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsSnapshot) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_allocator_records(mut self, records: Vec<LogRecord>) -> Self {
        self.allocator_records = Some(records);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Writes [`LogEntry`] lines, numbering trace ids within one run.
pub struct LogEmitter {
    writer: Box<dyn Write>,
    seq: u64,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            writer: Box::new(std::io::BufWriter::new(file)),
            seq: 0,
            run_id: run_id.to_string(),
        })
    }

    /// Create an emitter that discards its output (used when no log path is given).
    #[must_use]
    pub fn sink(run_id: &str) -> Self {
        Self {
            writer: Box::new(std::io::sink()),
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("refalloc::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a bare entry with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let entry = LogEntry::new(self.next_trace_id(), level, event);
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Emit a populated entry, filling in the trace id if it is empty.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Check a JSONL line for the required fields and a known level.
pub fn validate_log_line(line: &str) -> Result<serde_json::Value, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|err| format!("invalid JSON: {err}"))?;
    for field in ["timestamp", "trace_id", "level", "event"] {
        if !value.get(field).is_some_and(serde_json::Value::is_string) {
            return Err(format!("missing or non-string field `{field}`"));
        }
    }
    serde_json::from_value::<LogLevel>(value["level"].clone())
        .map_err(|_| format!("unknown level {}", value["level"]))?;
    if let Some(outcome) = value.get("outcome") {
        serde_json::from_value::<Outcome>(outcome.clone())
            .map_err(|_| format!("unknown outcome {outcome}"))?;
    }
    Ok(value)
}

/// RFC 3339 UTC timestamp with millisecond precision.
fn now_utc() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let (year, month, day) = civil_from_days(secs / 86_400);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        now.subsec_millis(),
    )
}

/// Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_required_fields_only() {
        let entry = LogEntry::new("refalloc::run::001", LogLevel::Info, "scenario_start");
        let parsed = validate_log_line(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["trace_id"], "refalloc::run::001");
        assert_eq!(parsed["level"], "info");
        assert!(parsed.get("scenario").is_none());
        assert!(parsed.get("metrics").is_none());
    }

    #[test]
    fn populated_entry_round_trips_through_validation() {
        let entry = LogEntry::new("t", LogLevel::Error, "scenario_end")
            .with_scenario("aligned_sweep")
            .with_outcome(Outcome::Fail)
            .with_duration_ms(3)
            .with_details(serde_json::json!({"error": "misaligned"}));
        let parsed = validate_log_line(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["outcome"], "fail");
        assert_eq!(parsed["details"]["error"], "misaligned");
    }

    #[test]
    fn validation_rejects_missing_fields() {
        assert!(validate_log_line(r#"{"timestamp":"x","trace_id":"y","level":"info"}"#).is_err());
        assert!(
            validate_log_line(r#"{"timestamp":"x","trace_id":"y","level":"loud","event":"e"}"#)
                .is_err()
        );
        assert!(validate_log_line("not json").is_err());
    }

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
    }

    #[test]
    fn emitter_numbers_trace_ids() {
        let mut emitter = LogEmitter::sink("unit");
        let first = emitter.emit(LogLevel::Info, "a").unwrap();
        let second = emitter.emit(LogLevel::Info, "b").unwrap();
        assert_eq!(first.trace_id, "refalloc::unit::001");
        assert_eq!(second.trace_id, "refalloc::unit::002");
    }
}
