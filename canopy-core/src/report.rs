// End-of-run summaries

use crate::telemetry::{TelemetrySnapshot, format_duration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub pages_dir: String,
    pub mode: String,
    pub workers: usize,
    pub finished_at: DateTime<Utc>,
    /// True when the run ended on a stop request rather than an empty queue.
    pub interrupted: bool,
    pub telemetry: TelemetrySnapshot,
}

pub fn generate_text_report(summary: &HarvestSummary) -> String {
    let t = &summary.telemetry;
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                           CANOPY HARVEST SUMMARY\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Finished:     {}\n", summary.finished_at.to_rfc3339()));
    report.push_str(&format!("Mode:         {} ({} workers)\n", summary.mode, summary.workers));
    report.push_str(&format!("Pages:        {}\n", summary.pages_dir));
    report.push_str(&format!("Duration:     {}\n", format_duration(t.elapsed)));
    if summary.interrupted {
        report.push_str("Status:       interrupted, rerun to resume\n");
    }
    report.push('\n');

    report.push_str(RULE);
    report.push_str("COUNTS\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("  [OK]       {}\n", t.ok));
    report.push_str(&format!("  [ERROR]    {}", t.error));
    if t.not_found > 0 {
        report.push_str(&format!("  ({} not found)", t.not_found));
    }
    report.push('\n');
    report.push_str(&format!("  [SKIPPED]  {}\n", t.skipped));
    if t.resumed > 0 {
        report.push_str(&format!(
            "\n  {} entities were already harvested by a previous run.\n",
            t.resumed
        ));
    }
    report.push('\n');

    if t.fetched() > 0 {
        report.push_str(&format!("Throughput:   {:.2} items/s\n", t.rate));
        report.push_str(&format!("Error rate:   {:.1}%\n", t.error_rate() * 100.0));
        report.push('\n');
    }

    report.push_str(RULE);
    report
}

pub fn generate_json_report(summary: &HarvestSummary) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(summary)
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
