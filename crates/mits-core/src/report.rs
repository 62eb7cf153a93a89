use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::suite::{SuiteKind, TestOutcome};
use crate::validator::ChannelVerdict;

/// Results of one suite run, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub suite: SuiteKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub outcomes: Vec<TestOutcome>,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        suite: SuiteKind,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcomes: Vec<TestOutcome>,
    ) -> Self {
        let passed = outcomes.iter().filter(|o| o.passed()).count();
        Self {
            run_id,
            suite,
            started_at,
            finished_at,
            total: outcomes.len(),
            passed,
            failed: outcomes.len() - passed,
            outcomes,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

const HEADERS: [&str; 7] = ["Suite", "Test", "Output", "Kernel log", "Daemon log", "Denied", "Result"];

fn cell(valid: bool) -> &'static str {
    if valid {
        "ok"
    } else {
        "FAIL"
    }
}

fn denied_cell(denied: Option<ChannelVerdict>) -> &'static str {
    match denied {
        Some(v) => cell(v.passed()),
        None => "-",
    }
}

fn render_line<S: AsRef<str>>(values: impl Iterator<Item = S>, widths: &[usize]) -> String {
    let cells: Vec<String> = values
        .zip(widths)
        .map(|(v, w)| format!("{:<w$}", v.as_ref(), w = *w))
        .collect();
    format!("{}\n", cells.join("  ").trim_end())
}

/// Render outcomes as an aligned plain-text table followed by a summary line.
pub fn render_table(outcomes: &[TestOutcome]) -> String {
    let rows: Vec<[String; 7]> = outcomes
        .iter()
        .map(|o| {
            let allowed = o.verdict.allowed;
            [
                o.suite.to_string(),
                o.name.clone(),
                cell(allowed.output_valid).to_string(),
                cell(allowed.kernel_log_valid).to_string(),
                cell(allowed.daemon_log_valid).to_string(),
                denied_cell(o.verdict.denied).to_string(),
                if o.passed() { "PASS" } else { "FAIL" }.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, value) in widths.iter_mut().zip(row) {
            *width = (*width).max(value.len());
        }
    }

    let mut out = render_line(HEADERS.iter(), &widths);
    out.push_str(&render_line(widths.iter().map(|w| "-".repeat(*w)), &widths));
    for row in &rows {
        out.push_str(&render_line(row.iter(), &widths));
    }

    let passed = outcomes.iter().filter(|o| o.passed()).count();
    out.push_str(&format!(
        "\n{} passed, {} failed, {} total\n",
        passed,
        outcomes.len() - passed,
        outcomes.len()
    ));
    out
}

/// Write the run report in pretty JSON format.
pub fn write_results_json(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}
