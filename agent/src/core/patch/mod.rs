//! Unified-diff application with a strict path and an approximate fallback.
//!
//! The strict path requires every hunk's old side to match the running content
//! exactly. When it fails and the target looks like a small source edit, the
//! hunks are handed to an [`ApproximatePatcher`]. Either way the result is all
//! or nothing: a failing hunk leaves the caller's content untouched.

pub mod fuzzy;

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use fuzzy::{ApproximatePatcher, SimilarPatcher};

/// Fuzzy fallback is refused for diffs touching this many lines or more.
pub const FUZZY_MAX_CHANGED_LINES: usize = 50;

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "c", "h", "cc", "cpp",
    "hpp", "cs", "rb", "php", "swift", "scala", "vue", "svelte", "css", "scss", "html", "sh",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("malformed diff: {0}")]
    MalformedDiff(String),
    #[error("hunk {index} does not match the file")]
    HunkMismatch { index: usize },
    #[error("fuzzy fallback not available: {0}")]
    FuzzyUnavailable(String),
    #[error("fuzzy hunk {index} failed: expected {expected:?}, replacement {replacement:?}")]
    FuzzyHunkFailed {
        index: usize,
        expected: String,
        replacement: String,
    },
}

/// Similarity tolerances for the approximate path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchThresholds {
    /// A window matches when its similarity is at least `1 - match_threshold`.
    pub match_threshold: f64,
    /// A deletion succeeds when the found text is within this distance of the expected text.
    pub delete_threshold: f64,
}

impl Default for PatchThresholds {
    fn default() -> Self {
        Self {
            match_threshold: 0.5,
            delete_threshold: 0.5,
        }
    }
}

/// One contiguous before/after region.
///
/// `expected` is context plus removed lines, `replacement` is context plus
/// added lines, both in diff order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub expected: Vec<String>,
    pub replacement: Vec<String>,
    /// Zero-based line index where the hunk lands, from the `@@` header.
    pub hint: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDiff {
    pub hunks: Vec<Hunk>,
    /// Added plus removed lines over all hunks.
    pub changed_lines: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    Strict,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub content: String,
    pub mode: ApplyMode,
}

/// Reject diffs that are wrapped in markup or carry no change at all.
pub fn validate_diff(diff: &str) -> Result<(), PatchError> {
    static WRAPPER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)</?(tool_call|tool_use|tool_result|function_calls?|invoke|parameter|patch|diff)\b[^>]*>",
        )
        .unwrap()
    });

    if diff.contains("```") {
        return Err(PatchError::MalformedDiff(
            "diff contains a markdown fence".to_string(),
        ));
    }
    if let Some(found) = WRAPPER_RE.find(diff) {
        return Err(PatchError::MalformedDiff(format!(
            "diff contains wrapper tag {}",
            found.as_str()
        )));
    }
    let has_header = diff.lines().any(|line| line.starts_with("@@"));
    let has_change = diff.lines().any(|line| {
        (line.starts_with('+') && !line.starts_with("+++"))
            || (line.starts_with('-') && !line.starts_with("---"))
    });
    if !has_header && !has_change {
        return Err(PatchError::MalformedDiff(
            "diff has no hunk header and no changed lines".to_string(),
        ));
    }
    Ok(())
}

fn parse_header(line: &str) -> Option<(usize, Option<usize>)> {
    static HEADER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^@@\s*-(\d+)(?:,(\d+))?\s+\+\d+(?:,\d+)?\s*@@").unwrap());
    let caps = HEADER_RE.captures(line)?;
    let start = caps.get(1)?.as_str().parse().ok()?;
    let count = caps.get(2).and_then(|m| m.as_str().parse().ok());
    Some((start, count))
}

fn is_file_header(line: &str) -> bool {
    line.starts_with("diff --git ")
        || line.starts_with("index ")
        || line.starts_with("--- ")
        || line.starts_with("+++ ")
        || line == "---"
        || line == "+++"
        || line.starts_with("new file mode")
        || line.starts_with("deleted file mode")
}

/// Parse a unified diff into hunks.
///
/// A diff without any `@@` header is treated as a single hunk with no
/// position hint.
pub fn parse_diff(diff: &str) -> Result<ParsedDiff, PatchError> {
    validate_diff(diff)?;

    let mut hunks = Vec::new();
    let mut changed_lines = 0usize;
    let mut current: Option<Hunk> = None;
    let mut in_preamble = true;

    for line in diff.lines() {
        if line.starts_with("@@") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            in_preamble = false;
            // `-N,0` inserts after line N; otherwise N is the first old line.
            let hint = match parse_header(line) {
                Some((start, Some(0))) => Some(start),
                Some((start, _)) => Some(start.saturating_sub(1)),
                None => None,
            };
            current = Some(Hunk {
                expected: Vec::new(),
                replacement: Vec::new(),
                hint,
            });
            continue;
        }
        if line.starts_with('\\') {
            continue;
        }
        if in_preamble && is_file_header(line) {
            continue;
        }
        let hunk = current.get_or_insert_with(|| Hunk {
            expected: Vec::new(),
            replacement: Vec::new(),
            hint: None,
        });
        if let Some(rest) = line.strip_prefix('+') {
            hunk.replacement.push(rest.to_string());
            changed_lines += 1;
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.expected.push(rest.to_string());
            changed_lines += 1;
        } else {
            let rest = line.strip_prefix(' ').unwrap_or(line);
            hunk.expected.push(rest.to_string());
            hunk.replacement.push(rest.to_string());
        }
    }
    if let Some(hunk) = current.take() {
        hunks.push(hunk);
    }

    hunks.retain(|h| !(h.expected.is_empty() && h.replacement.is_empty()));
    if hunks.is_empty() {
        return Err(PatchError::MalformedDiff("diff has no hunks".to_string()));
    }
    Ok(ParsedDiff {
        hunks,
        changed_lines,
    })
}

/// Line-oriented view of a text buffer that remembers its line ending.
#[derive(Debug, Clone)]
pub(crate) struct Lines {
    pub lines: Vec<String>,
    eol: &'static str,
    trailing_newline: bool,
}

impl Lines {
    pub(crate) fn new(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
            eol: if text.contains("\r\n") { "\r\n" } else { "\n" },
            trailing_newline: text.is_empty() || text.ends_with('\n'),
        }
    }

    pub(crate) fn render(&self) -> String {
        let mut out = self.lines.join(self.eol);
        if self.trailing_newline && !self.lines.is_empty() {
            out.push_str(self.eol);
        }
        out
    }
}

fn matches_at(lines: &[String], expected: &[String], pos: usize) -> bool {
    lines
        .get(pos..pos + expected.len())
        .is_some_and(|window| window == expected)
}

/// Apply every hunk by exact matching.
pub fn apply_strict(original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let mut text = Lines::new(original);
    let mut cursor = 0usize;
    let mut offset: isize = 0;

    for (index, hunk) in hunks.iter().enumerate() {
        let hinted = hunk
            .hint
            .map(|h| h.saturating_add_signed(offset))
            .filter(|&pos| pos >= cursor);

        let pos = if hunk.expected.is_empty() {
            match hinted {
                Some(pos) if pos <= text.lines.len() => pos,
                Some(_) => text.lines.len(),
                None => cursor,
            }
        } else {
            match hinted.filter(|&pos| matches_at(&text.lines, &hunk.expected, pos)) {
                Some(pos) => pos,
                None => (cursor..text.lines.len())
                    .find(|&pos| matches_at(&text.lines, &hunk.expected, pos))
                    .ok_or(PatchError::HunkMismatch { index })?,
            }
        };

        text.lines.splice(
            pos..pos + hunk.expected.len(),
            hunk.replacement.iter().cloned(),
        );
        cursor = pos + hunk.replacement.len();
        offset += hunk.replacement.len() as isize - hunk.expected.len() as isize;
    }
    Ok(text.render())
}

/// Whether `path` and the diff size qualify for approximate application.
pub fn fuzzy_gate(path: &Path, parsed: &ParsedDiff) -> Result<(), PatchError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let Some(extension) = extension.filter(|e| SOURCE_EXTENSIONS.contains(&e.as_str())) else {
        return Err(PatchError::FuzzyUnavailable(format!(
            "{} is not a recognized source file",
            path.display()
        )));
    };
    if parsed.changed_lines >= FUZZY_MAX_CHANGED_LINES {
        return Err(PatchError::FuzzyUnavailable(format!(
            "{} changed lines in .{extension} diff (limit {FUZZY_MAX_CHANGED_LINES})",
            parsed.changed_lines
        )));
    }
    Ok(())
}

/// Apply `diff` to `original`, falling back to `patcher` when strict matching fails.
pub fn apply_diff(
    original: &str,
    diff: &str,
    path: &Path,
    patcher: &dyn ApproximatePatcher,
) -> Result<PatchOutcome, PatchError> {
    let parsed = parse_diff(diff)?;
    match apply_strict(original, &parsed.hunks) {
        Ok(content) => Ok(PatchOutcome {
            content,
            mode: ApplyMode::Strict,
        }),
        Err(strict_err) => {
            debug!(err = %strict_err, path = %path.display(), "strict apply failed");
            fuzzy_gate(path, &parsed)?;
            let content = patcher.apply_approximate(original, &parsed.hunks)?;
            Ok(PatchOutcome {
                content,
                mode: ApplyMode::Fuzzy,
            })
        }
    }
}
