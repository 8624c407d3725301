//! Aggregation over persisted run reports.
//!
//! Reports are markdown files written by the agent under `.agent/reports/`.
//! Only a handful of literal lines are read back; everything else in a report
//! is free-form.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use agent::io::report::ReportStatus;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

/// Default number of most recent reports considered.
pub const DEFAULT_WINDOW: usize = 50;

/// Minimum window size before a trend is reported.
pub const TREND_MIN_REPORTS: usize = 10;

/// Success-rate difference between halves that counts as a change.
const TREND_MARGIN: f64 = 0.1;

static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\*\*Status:\*\*\s*(\w+)\s*$").unwrap());
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\*\*Duration:\*\*\s*([0-9]+(?:\.[0-9]+)?)s\s*$").unwrap());
static CHANGE_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- \*\*Change Size:\*\*\s*(\d+) files\s*$").unwrap());
static FAILURE_MODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- \*\*Failure Mode:\*\*\s*(\S+)\s*$").unwrap());
static RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^- \*\*Resource Usage:\*\*\s*(\d+) cmds, (\d+) tests, (\d+) web\s*$").unwrap()
});

/// Fields read back from one report.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReport {
    pub status: ReportStatus,
    pub duration_secs: f64,
    pub change_size: u64,
    pub failure_mode: String,
    pub commands: u64,
    pub tests: u64,
    pub web: u64,
}

/// Parse the contract lines of a report; the error names the first missing field.
pub fn parse_report(text: &str) -> Result<ParsedReport, String> {
    let status = capture(&STATUS_RE, text, "status")?;
    let status = ReportStatus::parse(status).ok_or_else(|| format!("unknown status {status}"))?;
    let duration_secs = capture(&DURATION_RE, text, "duration")?
        .parse::<f64>()
        .map_err(|err| format!("duration: {err}"))?;
    let change_size = number(capture(&CHANGE_SIZE_RE, text, "change size")?, "change size")?;
    let failure_mode = capture(&FAILURE_MODE_RE, text, "failure mode")?.to_string();
    let usage = RESOURCE_RE
        .captures(text)
        .ok_or_else(|| "missing resource usage".to_string())?;

    Ok(ParsedReport {
        status,
        duration_secs,
        change_size,
        failure_mode,
        commands: number(&usage[1], "commands")?,
        tests: number(&usage[2], "tests")?,
        web: number(&usage[3], "web")?,
    })
}

fn capture<'a>(re: &Regex, text: &'a str, field: &str) -> Result<&'a str, String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| format!("missing {field}"))
}

fn number(raw: &str, field: &str) -> Result<u64, String> {
    raw.parse::<u64>().map_err(|err| format!("{field}: {err}"))
}

/// The `window` most recent report files in `dir`, ordered by file name.
pub fn list_reports(dir: &Path, window: usize) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
            files.push(path);
        }
    }
    files.sort();
    let skip = files.len().saturating_sub(window);
    Ok(files.split_off(skip))
}

/// Load and parse the report window; unreadable or malformed files become warnings.
#[instrument(skip_all, fields(dir = %dir.display(), window = window))]
pub fn load_reports(dir: &Path, window: usize) -> Result<(Vec<ParsedReport>, Vec<String>)> {
    let mut reports = Vec::new();
    let mut warnings = Vec::new();
    for path in list_reports(dir, window)? {
        let parsed = fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|text| parse_report(&text));
        match parsed {
            Ok(report) => reports.push(report),
            Err(err) => warnings.push(format!("skip {}: {err}", path.display())),
        }
    }
    debug!(parsed = reports.len(), skipped = warnings.len(), "reports loaded");
    Ok((reports, warnings))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Improving => "improving",
            Trend::Degrading => "degrading",
            Trend::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub reports: usize,
    pub success: usize,
    pub success_rate: f64,
    pub avg_duration_secs: f64,
    pub avg_change_size: f64,
    pub avg_commands: f64,
    pub avg_test_runs: f64,
    pub avg_web_requests: f64,
    /// Failure-mode counts over non-success runs.
    pub failure_modes: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<Trend>,
}

/// Aggregate reports ordered oldest first.
pub fn summarize(reports: &[ParsedReport]) -> Summary {
    let success = reports
        .iter()
        .filter(|r| r.status == ReportStatus::Success)
        .count();
    let mut failure_modes = BTreeMap::new();
    for report in reports.iter().filter(|r| r.status != ReportStatus::Success) {
        *failure_modes.entry(report.failure_mode.clone()).or_insert(0) += 1;
    }
    Summary {
        reports: reports.len(),
        success,
        success_rate: success_rate(reports),
        avg_duration_secs: mean(reports.iter().map(|r| r.duration_secs)),
        avg_change_size: mean(reports.iter().map(|r| r.change_size as f64)),
        avg_commands: mean(reports.iter().map(|r| r.commands as f64)),
        avg_test_runs: mean(reports.iter().map(|r| r.tests as f64)),
        avg_web_requests: mean(reports.iter().map(|r| r.web as f64)),
        failure_modes,
        trend: trend(reports),
    }
}

/// Newer half against older half; the older half is the first `n / 2` reports.
pub fn trend(reports: &[ParsedReport]) -> Option<Trend> {
    if reports.len() < TREND_MIN_REPORTS {
        return None;
    }
    let (older, newer) = reports.split_at(reports.len() / 2);
    let delta = success_rate(newer) - success_rate(older);
    Some(if delta > TREND_MARGIN {
        Trend::Improving
    } else if delta < -TREND_MARGIN {
        Trend::Degrading
    } else {
        Trend::Stable
    })
}

fn success_rate(reports: &[ParsedReport]) -> f64 {
    if reports.is_empty() {
        return 0.0;
    }
    let success = reports
        .iter()
        .filter(|r| r.status == ReportStatus::Success)
        .count();
    success as f64 / reports.len() as f64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Plain-text rendering used by `metrics report`.
pub fn render_text(summary: &Summary) -> String {
    let mut lines = vec![
        format!("reports: {}", summary.reports),
        format!(
            "success rate: {:.2} ({}/{})",
            summary.success_rate, summary.success, summary.reports
        ),
        format!("avg duration: {:.2}s", summary.avg_duration_secs),
        format!("avg change size: {:.2} files", summary.avg_change_size),
        format!("avg commands: {:.2}", summary.avg_commands),
        format!("avg test runs: {:.2}", summary.avg_test_runs),
        format!("avg web requests: {:.2}", summary.avg_web_requests),
    ];
    if !summary.failure_modes.is_empty() {
        lines.push("failure modes:".to_string());
        for (mode, count) in &summary.failure_modes {
            lines.push(format!("  {mode}: {count}"));
        }
    }
    match summary.trend {
        Some(trend) => lines.push(format!("trend: {}", trend.as_str())),
        None => lines.push(format!(
            "trend: n/a (needs {TREND_MIN_REPORTS} reports)"
        )),
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent::core::budget::Profile;
    use agent::core::types::{FailureKind, Terminal};
    use agent::io::report::render_report;
    use agent::test_support::run_state;
    use tempfile::tempdir;

    fn report(status: ReportStatus, mode: &str) -> ParsedReport {
        ParsedReport {
            status,
            duration_secs: 10.0,
            change_size: 2,
            failure_mode: mode.to_string(),
            commands: 4,
            tests: 1,
            web: 0,
        }
    }

    fn report_text(status: &str, duration: &str, files: u64, mode: &str, cmds: u64) -> String {
        format!(
            "# Run Report: r\n\n**Status:** {status}\n**Duration:** {duration}s\n\n\
             ## Flow Metrics (DORA Proxies)\n- **Change Size:** {files} files\n\
             - **Failure Mode:** {mode}\n- **Resource Usage:** {cmds} cmds, 1 tests, 0 web\n"
        )
    }

    #[test]
    fn parses_rendered_agent_report() {
        let mut state = run_state(Profile::Fast);
        state.record_failure(FailureKind::Compilation);
        state.terminate(Terminal::AbortedConstraint, "Budget exhausted: command 8/8");
        let text = render_report(&state, state.started_at).expect("render");

        let parsed = parse_report(&text).expect("parse");
        assert_eq!(parsed.status, ReportStatus::Failed);
        assert_eq!(parsed.duration_secs, 0.0);
        assert_eq!(parsed.change_size, 0);
        assert_eq!(parsed.failure_mode, "compilation");
        assert_eq!(parsed.commands, 0);
    }

    #[test]
    fn multi_line_goal_does_not_change_parsed_status() {
        let mut state = run_state(Profile::Fast);
        state.goal = "Fix CI.\nPrevious report said:\n**Status:** success".to_string();
        state.terminate(Terminal::AbortedStuck, "No progress in last 3 steps");
        let text = render_report(&state, state.started_at).expect("render");

        let parsed = parse_report(&text).expect("parse");
        assert_eq!(parsed.status, ReportStatus::Failed);
        assert_eq!(parsed.failure_mode, "aborted_stuck");
    }

    #[test]
    fn missing_line_is_reported_by_name() {
        let text = "**Status:** success\n**Duration:** 1.00s\n";
        assert_eq!(parse_report(text).unwrap_err(), "missing change size");
        let text = report_text("exploded", "1.00", 0, "none", 0);
        assert_eq!(parse_report(&text).unwrap_err(), "unknown status exploded");
    }

    #[test]
    fn summarizes_rates_averages_and_histogram() {
        let reports = vec![
            report(ReportStatus::Success, "none"),
            report(ReportStatus::Failed, "test_failure"),
            report(ReportStatus::Failed, "test_failure"),
            report(ReportStatus::Partial, "ask_human"),
        ];
        let summary = summarize(&reports);
        assert_eq!(summary.reports, 4);
        assert_eq!(summary.success_rate, 0.25);
        assert_eq!(summary.avg_duration_secs, 10.0);
        assert_eq!(summary.avg_change_size, 2.0);
        assert_eq!(summary.avg_commands, 4.0);
        assert_eq!(summary.failure_modes.get("test_failure"), Some(&2));
        assert_eq!(summary.failure_modes.get("ask_human"), Some(&1));
        assert!(!summary.failure_modes.contains_key("none"));
        assert_eq!(summary.trend, None);
    }

    #[test]
    fn empty_window_summarizes_to_zeroes() {
        let summary = summarize(&[]);
        assert_eq!(summary.reports, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.avg_duration_secs, 0.0);
        assert!(summary.failure_modes.is_empty());
    }

    #[test]
    fn trend_compares_halves() {
        let mut improving = vec![report(ReportStatus::Failed, "timeout"); 5];
        improving.extend(vec![report(ReportStatus::Success, "none"); 5]);
        assert_eq!(trend(&improving), Some(Trend::Improving));

        let degrading: Vec<ParsedReport> = improving.iter().rev().cloned().collect();
        assert_eq!(trend(&degrading), Some(Trend::Degrading));

        // 3/5 older vs 3/5 newer.
        let mut stable: Vec<ParsedReport> = Vec::new();
        for i in 0..10 {
            let status = if i % 5 < 3 {
                ReportStatus::Success
            } else {
                ReportStatus::Failed
            };
            stable.push(report(status, "none"));
        }
        assert_eq!(trend(&stable), Some(Trend::Stable));

        assert_eq!(trend(&improving[..9]), None);
    }

    #[test]
    fn window_keeps_most_recent_by_name() {
        let temp = tempdir().expect("tempdir");
        for i in 0..5 {
            let name = format!("run-2024010{i}T000000-0000.md");
            fs::write(
                temp.path().join(name),
                report_text("success", "1.00", i, "none", 1),
            )
            .expect("write");
        }
        fs::write(temp.path().join("notes.txt"), "ignored").expect("write");

        let files = list_reports(temp.path(), 3).expect("list");
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "run-20240102T000000-0000.md",
                "run-20240103T000000-0000.md",
                "run-20240104T000000-0000.md",
            ]
        );
    }

    #[test]
    fn malformed_reports_become_warnings() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join("a.md"),
            report_text("success", "2.50", 3, "none", 5),
        )
        .expect("write");
        fs::write(temp.path().join("b.md"), "# not a report\n").expect("write");

        let (reports, warnings) = load_reports(temp.path(), DEFAULT_WINDOW).expect("load");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].duration_secs, 2.5);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("b.md"));
        assert!(warnings[0].contains("missing status"));
    }

    #[test]
    fn missing_directory_is_empty() {
        let temp = tempdir().expect("tempdir");
        let (reports, warnings) =
            load_reports(&temp.path().join("absent"), DEFAULT_WINDOW).expect("load");
        assert!(reports.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn text_rendering_mentions_trend_requirement() {
        let text = render_text(&summarize(&[report(ReportStatus::Success, "none")]));
        assert!(text.contains("success rate: 1.00 (1/1)"));
        assert!(text.contains("trend: n/a (needs 10 reports)"));
    }
}
