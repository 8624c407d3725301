//! Diagnostics extraction, deduplication and summarization.
//!
//! Raw tool output is scanned line by line through an ordered list of
//! [`LineMatcher`] strategies; the first strategy that recognizes a trimmed
//! line wins and unrecognized lines are skipped. Entries are deduplicated by
//! identity `(source, file, message, line)` and kept most-recent first.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Sentinel returned by [`summarize`] for an empty log.
pub const EMPTY_SUMMARY: &str = "No diagnostics recorded.";

/// Default number of entries rendered by [`summarize`].
pub const DEFAULT_SUMMARY_ENTRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSource {
    Build,
    Test,
    Lint,
    Lsp,
    Runtime,
}

impl DiagnosticSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticSource::Build => "build",
            DiagnosticSource::Test => "test",
            DiagnosticSource::Lint => "lint",
            DiagnosticSource::Lsp => "lsp",
            DiagnosticSource::Runtime => "runtime",
        }
    }

    pub fn parse(value: &str) -> Option<DiagnosticSource> {
        match value.trim().to_ascii_lowercase().as_str() {
            "build" => Some(DiagnosticSource::Build),
            "test" => Some(DiagnosticSource::Test),
            "lint" => Some(DiagnosticSource::Lint),
            "lsp" => Some(DiagnosticSource::Lsp),
            "runtime" => Some(DiagnosticSource::Runtime),
            _ => None,
        }
    }
}

impl fmt::Display for DiagnosticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// One deduplicated, occurrence-counted failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsEntry {
    pub source: DiagnosticSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub message: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: u32,
}

impl DiagnosticsEntry {
    fn same_identity(&self, other: &DiagnosticsEntry) -> bool {
        self.source == other.source
            && self.file == other.file
            && self.message == other.message
            && self.location.map(|l| l.line) == other.location.map(|l| l.line)
    }

    /// Summary line without the occurrence suffix.
    fn headline(&self) -> String {
        let source = self.source.as_str().to_ascii_uppercase();
        match (&self.file, self.location) {
            (Some(file), Some(location)) => {
                format!("[{source}] {file}:{}: {}", location.line, self.message)
            }
            (Some(file), None) => format!("[{source}] {file}: {}", self.message),
            (None, _) => format!("[{source}] {}", self.message),
        }
    }
}

/// A diagnostic recognized on a single line, before timestamps are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub source: DiagnosticSource,
    pub file: Option<String>,
    pub location: Option<Location>,
    pub message: String,
}

/// One recognition strategy for a trimmed output line.
pub trait LineMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy runs for output of the given source.
    fn applies_to(&self, _source: DiagnosticSource) -> bool {
        true
    }

    fn match_line(&self, line: &str) -> Option<LineMatch>;
}

/// `file(line,col): error CODE: message` (MSBuild / tsc classic).
pub struct ParenLocationMatcher;

/// `file:line:col - error CODE: message` (tsc pretty).
pub struct DashLocationMatcher;

/// `FAIL path/to/test ...` (jest / vitest).
pub struct FailLineMatcher;

/// `● Suite › test name` (jest failure headline).
pub struct BulletMatcher;

fn location_match(caps: &Captures<'_>) -> Option<LineMatch> {
    let line = caps.name("line")?.as_str().parse().ok()?;
    let column = caps.name("col")?.as_str().parse().ok()?;
    let msg = caps.name("msg").map_or("", |m| m.as_str()).trim();
    let message = match caps.name("code") {
        Some(code) => format!("{}: {msg}", code.as_str()),
        None => msg.to_string(),
    };
    Some(LineMatch {
        source: DiagnosticSource::Build,
        file: Some(caps.name("file")?.as_str().trim().to_string()),
        location: Some(Location { line, column }),
        message,
    })
}

impl LineMatcher for ParenLocationMatcher {
    fn name(&self) -> &'static str {
        "paren_location"
    }

    fn match_line(&self, line: &str) -> Option<LineMatch> {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(
                r"^(?P<file>[^\s(][^(]*?)\((?P<line>\d+),(?P<col>\d+)\):\s*(?:error|warning)\s*(?:(?P<code>[A-Za-z]+\d+):)?\s*(?P<msg>.*)$",
            )
            .unwrap()
        });
        RE.captures(line).and_then(|caps| location_match(&caps))
    }
}

impl LineMatcher for DashLocationMatcher {
    fn name(&self) -> &'static str {
        "dash_location"
    }

    fn match_line(&self, line: &str) -> Option<LineMatch> {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(
                r"^(?P<file>\S+?):(?P<line>\d+):(?P<col>\d+)\s+-\s+(?:error|warning)\s*(?:(?P<code>[A-Za-z]+\d+):)?\s*(?P<msg>.*)$",
            )
            .unwrap()
        });
        RE.captures(line).and_then(|caps| location_match(&caps))
    }
}

impl LineMatcher for FailLineMatcher {
    fn name(&self) -> &'static str {
        "fail_line"
    }

    fn applies_to(&self, source: DiagnosticSource) -> bool {
        source == DiagnosticSource::Test
    }

    fn match_line(&self, line: &str) -> Option<LineMatch> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "FAIL" {
            return None;
        }
        Some(LineMatch {
            source: DiagnosticSource::Test,
            file: tokens.next().map(str::to_string),
            location: None,
            message: line.to_string(),
        })
    }
}

impl LineMatcher for BulletMatcher {
    fn name(&self) -> &'static str {
        "bullet"
    }

    fn applies_to(&self, source: DiagnosticSource) -> bool {
        source == DiagnosticSource::Test
    }

    fn match_line(&self, line: &str) -> Option<LineMatch> {
        let rest = line.strip_prefix('●')?.trim();
        if rest.is_empty() {
            return None;
        }
        Some(LineMatch {
            source: DiagnosticSource::Test,
            file: None,
            location: None,
            message: rest.to_string(),
        })
    }
}

/// The shipped matcher list, in evaluation order.
pub fn default_matchers() -> Vec<Box<dyn LineMatcher>> {
    vec![
        Box::new(ParenLocationMatcher),
        Box::new(DashLocationMatcher),
        Box::new(FailLineMatcher),
        Box::new(BulletMatcher),
    ]
}

/// Extract entries from raw output using the default matchers.
pub fn parse(raw: &str, source: DiagnosticSource, now: DateTime<Utc>) -> Vec<DiagnosticsEntry> {
    parse_with(&default_matchers(), raw, source, now)
}

/// Extract entries from raw output using an explicit matcher list.
pub fn parse_with(
    matchers: &[Box<dyn LineMatcher>],
    raw: &str,
    source: DiagnosticSource,
    now: DateTime<Utc>,
) -> Vec<DiagnosticsEntry> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            matchers
                .iter()
                .filter(|m| m.applies_to(source))
                .find_map(|m| m.match_line(line))
        })
        .map(|found| DiagnosticsEntry {
            source: found.source,
            file: found.file,
            location: found.location,
            message: found.message,
            first_seen_at: now,
            last_seen_at: now,
            occurrence_count: 1,
        })
        .collect()
}

/// Merge `incoming` into `existing`.
///
/// A matching identity bumps the count and takes the incoming `last_seen_at`;
/// anything else is appended. The result is sorted most-recent first, stable
/// for equal timestamps.
pub fn merge(
    mut existing: Vec<DiagnosticsEntry>,
    incoming: Vec<DiagnosticsEntry>,
) -> Vec<DiagnosticsEntry> {
    for entry in incoming {
        match existing.iter_mut().find(|e| e.same_identity(&entry)) {
            Some(found) => {
                found.last_seen_at = entry.last_seen_at;
                found.occurrence_count += 1;
            }
            None => existing.push(entry),
        }
    }
    existing.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
    existing
}

/// Render up to `max_entries` lines for injection into role input.
pub fn summarize(log: &[DiagnosticsEntry], max_entries: usize) -> String {
    if log.is_empty() {
        return EMPTY_SUMMARY.to_string();
    }
    let mut lines: Vec<String> = log
        .iter()
        .take(max_entries)
        .map(|e| format!("{} (x{})", e.headline(), e.occurrence_count))
        .collect();
    if log.len() > max_entries {
        lines.push(format!("... and {} more", log.len() - max_entries));
    }
    lines.join("\n")
}

/// Headline of the most recent entry, or an empty string.
pub fn primary_failure(log: &[DiagnosticsEntry]) -> String {
    log.first().map(DiagnosticsEntry::headline).unwrap_or_default()
}
