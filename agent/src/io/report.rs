//! Markdown run reports under `.agent/reports/`.
//!
//! The report format is consumed by the `metrics` aggregator, so the status,
//! duration and flow metric lines are a stable contract.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::diagnostics;
use crate::core::state::RunState;
use crate::core::types::Terminal;

const RUN_REPORT_TEMPLATE: &str = include_str!("templates/run_report.md");

/// Coarse outcome shown on the `**Status:**` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Failed,
    Partial,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Success => "success",
            ReportStatus::Failed => "failed",
            ReportStatus::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<ReportStatus> {
        match value.trim() {
            "success" => Some(ReportStatus::Success),
            "failed" => Some(ReportStatus::Failed),
            "partial" => Some(ReportStatus::Partial),
            _ => None,
        }
    }

    /// `done` is a success, aborts are failures, anything else is partial.
    pub fn from_terminal(terminal: Option<Terminal>) -> ReportStatus {
        match terminal {
            Some(Terminal::Done) => ReportStatus::Success,
            Some(Terminal::AbortedStuck | Terminal::AbortedConstraint) => ReportStatus::Failed,
            Some(Terminal::AskHuman) | None => ReportStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct FailureCount {
    kind: String,
    count: u32,
}

/// Failure-mode token: `none` on success, else the dominant failure kind,
/// else the terminal tag, else `cancelled`.
pub fn failure_mode(state: &RunState) -> String {
    if state.terminal_status == Some(Terminal::Done) {
        return "none".to_string();
    }
    if let Some(kind) = state.dominant_failure() {
        return kind.as_str().to_string();
    }
    match state.terminal_status {
        Some(terminal) => terminal.as_str().to_string(),
        None => "cancelled".to_string(),
    }
}

/// Collapse whitespace so free text stays on its own header line.
fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render the report for `state`, timing the run up to `ended_at`.
pub fn render_report(state: &RunState, ended_at: DateTime<Utc>) -> Result<String> {
    let status = ReportStatus::from_terminal(state.terminal_status);
    let duration_secs = (ended_at - state.started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let primary = diagnostics::primary_failure(&state.diagnostics_log);
    let failures: Vec<FailureCount> = state
        .failure_counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(kind, count)| FailureCount {
            kind: kind.as_str().to_string(),
            count: *count,
        })
        .collect();
    let budget = &state.budget;
    let checks_passed = state.functional_checks.iter().filter(|c| c.passed).count();

    let mut env = Environment::new();
    env.add_template("run_report", RUN_REPORT_TEMPLATE)?;
    let template = env.get_template("run_report")?;
    let mut rendered = template.render(context! {
        run_id => &state.run_id,
        goal => single_line(&state.goal),
        ticket => state.ticket.as_deref().map(single_line),
        profile => state.profile.as_str(),
        status => status.as_str(),
        duration => format!("{duration_secs:.2}"),
        terminal => state.terminal_status.map(Terminal::as_str),
        reason => state
            .terminal_reason
            .as_deref()
            .or(Some(state.last_reason.as_str()))
            .map(single_line)
            .filter(|s| !s.is_empty()),
        total_steps => state.total_steps,
        revision => state.revision,
        files_changed => state.file_changes.len(),
        checks_passed => checks_passed,
        checks_total => state.functional_checks.len(),
        commands_used => budget.commands_used,
        commands_max => budget.max_commands,
        tests_used => budget.test_runs_used,
        tests_max => budget.max_test_runs,
        web_used => budget.web_requests_used,
        web_max => budget.max_web_requests,
        failure_mode => failure_mode(state),
        failures => failures,
        primary_diagnostic => (status != ReportStatus::Success && !primary.is_empty()).then_some(primary),
    })?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

/// Render and persist the report for `state`.
#[instrument(skip_all, fields(run_id = %state.run_id))]
pub fn write_report(path: &Path, state: &RunState, ended_at: DateTime<Utc>) -> Result<()> {
    let rendered = render_report(state, ended_at)?;
    debug!(path = %path.display(), "writing run report");
    super::write_atomic(path, &rendered)
}
