//! Tolerant extraction of JSON from text-generated output.
//!
//! Output from role collaborators routinely wraps JSON in prose or markdown
//! fences, leaves trailing commas, uses single quotes or bare keys, and is
//! sometimes cut off mid-value. This module finds the most plausible JSON
//! payload, cleans it, and parses it, first strictly and then after a
//! string-aware repair pass. Failures come back as [`ParseFailure`] values.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    ParseError,
    Truncated,
}

impl ParseErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseErrorKind::ParseError => "parse_error",
            ParseErrorKind::Truncated => "truncated",
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ParseFailure {
    pub kind: ParseErrorKind,
    pub message: String,
    pub raw: String,
    pub sanitized: String,
}

/// Parse the most plausible JSON value out of `raw`.
///
/// Empty input yields an empty object.
pub fn parse(raw: &str) -> Result<Value, ParseFailure> {
    let visible = strip_invisible(raw);
    if visible.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let mut truncated = false;
    let mut first_failure: Option<(String, String)> = None;
    for candidate in extract_candidates(&visible) {
        let (sanitized, cut) = sanitize(&candidate);
        truncated |= cut;
        match parse_sanitized(&sanitized) {
            Ok(value) => return Ok(value),
            Err(message) => {
                if first_failure.is_none() {
                    first_failure = Some((message, sanitized));
                }
            }
        }
    }

    let (message, sanitized) =
        first_failure.unwrap_or_else(|| ("no JSON candidate found".to_string(), String::new()));
    Err(ParseFailure {
        kind: if truncated {
            ParseErrorKind::Truncated
        } else {
            ParseErrorKind::ParseError
        },
        message,
        raw: raw.to_string(),
        sanitized,
    })
}

fn parse_sanitized(text: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Ok(value),
        Err(strict_err) => {
            let repaired = repair(text);
            serde_json::from_str::<Value>(&repaired).map_err(|_| strict_err.to_string())
        }
    }
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200D}'
            | '\u{2060}'
            | '\u{FEFF}'
            | '\u{200E}'
            | '\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2066}'..='\u{2069}'
    )
}

fn strip_invisible(raw: &str) -> String {
    raw.chars().filter(|c| !is_invisible(*c)).collect()
}

/// Widest top-level bracket span, by byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    /// False when the opener never closes and the span runs to the end of the text.
    closed: bool,
}

impl Span {
    /// Whether `start..end` nests strictly inside a balanced span.
    fn encloses(self, start: usize, end: usize) -> bool {
        self.closed && self.start < start && end <= self.end
    }
}

fn widest_span(text: &str) -> Option<Span> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut open_at: Option<usize> = None;
    let mut widest: Option<(usize, usize)> = None;
    let mut first_open: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' | '[' => {
                if depth == 0 {
                    open_at = Some(i);
                    first_open.get_or_insert(i);
                }
                depth += 1;
            }
            '}' | ']' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(start) = open_at.take()
                {
                    let end = i + c.len_utf8();
                    if widest.is_none_or(|(s, e)| end - start > e - s) {
                        widest = Some((start, end));
                    }
                }
            }
            _ => {}
        }
    }

    widest
        .map(|(start, end)| Span {
            start,
            end,
            closed: true,
        })
        .or_else(|| {
            first_open.map(|start| Span {
                start,
                end: text.len(),
                closed: false,
            })
        })
}

/// Candidate payloads in priority order, deduplicated.
pub(crate) fn extract_candidates(text: &str) -> Vec<String> {
    static JSON_FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?is)```json[^\n]*\n(.*?)(?:```|\z)").unwrap());
    static ANY_FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)(?:```|\z)").unwrap());

    let span = widest_span(text);

    let mut candidates: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() && !candidates.iter().any(|c| c == trimmed) {
            candidates.push(trimmed.to_string());
        }
    };

    for re in [&*JSON_FENCE_RE, &*ANY_FENCE_RE] {
        for caps in re.captures_iter(text) {
            let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if !span.is_some_and(|span| span.encloses(whole.start(), whole.end())) {
                push(body.as_str());
            }
        }
    }
    if let Some(span) = span {
        push(&text[span.start..span.end]);
    }
    push(text);
    candidates
}

fn is_marker_line(trimmed: &str) -> bool {
    static MARKER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(?:…|⋮|⋯|\.{3,})+$").unwrap());
    MARKER_RE.is_match(trimmed)
}

fn is_fence_line(trimmed: &str) -> bool {
    trimmed
        .strip_prefix("```")
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn is_preamble_line(trimmed: &str) -> bool {
    static PREAMBLE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^(?:(?:here(?:'s| is)|below is)\b[^{\[]*\bjson\b[^{\[]*|json)\s*:?$")
            .unwrap()
    });
    PREAMBLE_RE.is_match(trimmed)
}

/// Whether the string state is open at the end of `line`, starting from `open`.
fn string_open_after(line: &str, mut open: bool) -> bool {
    let mut escaped = false;
    for c in line.chars() {
        if open {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => open = false,
                _ => {}
            }
        } else if c == '"' {
            open = true;
        }
    }
    open
}

fn strip_trailing_marker(line: &str) -> Option<&str> {
    let body = line.trim_end();
    for glyph in ["…", "⋮", "⋯"] {
        if let Some(rest) = body.strip_suffix(glyph) {
            return Some(rest);
        }
    }
    let dots = body.len() - body.trim_end_matches('.').len();
    (dots >= 3).then(|| &body[..body.len() - dots])
}

/// Clean a candidate, returning the text and whether truncation was observed.
pub(crate) fn sanitize(candidate: &str) -> (String, bool) {
    let mut truncated = false;
    let mut in_string = false;
    let mut seen_content = false;
    let mut out: Vec<String> = Vec::new();

    for line in candidate.lines() {
        let trimmed = line.trim();
        if !in_string {
            if is_fence_line(trimmed) {
                continue;
            }
            if !trimmed.is_empty() && is_marker_line(trimmed) {
                truncated = true;
                continue;
            }
            if !seen_content && is_preamble_line(trimmed) {
                continue;
            }
        }
        if !trimmed.is_empty() {
            seen_content = true;
        }

        let open_after = string_open_after(line, in_string);
        let kept = match strip_trailing_marker(line) {
            Some(rest) if !open_after => {
                truncated = true;
                rest.to_string()
            }
            _ => line.to_string(),
        };
        in_string = open_after;
        out.push(kept);
    }
    (out.join("\n").trim().to_string(), truncated)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    Ascii,
    SingleAscii,
    SmartDouble,
    SmartSingle,
}

impl Quote {
    fn opening(c: char) -> Option<Quote> {
        match c {
            '"' => Some(Quote::Ascii),
            '\'' => Some(Quote::SingleAscii),
            '“' | '”' | '„' => Some(Quote::SmartDouble),
            '‘' | '’' => Some(Quote::SmartSingle),
            _ => None,
        }
    }

    fn closes(self, c: char) -> bool {
        match self {
            Quote::Ascii => c == '"',
            Quote::SingleAscii => c == '\'',
            Quote::SmartDouble => matches!(c, '”' | '“' | '"'),
            Quote::SmartSingle => matches!(c, '’' | '‘' | '\''),
        }
    }
}

fn literal_replacement(word: &str) -> Option<&'static str> {
    match word {
        "True" | "TRUE" => Some("true"),
        "False" | "FALSE" => Some("false"),
        "None" | "NULL" | "Null" | "undefined" | "nil" => Some("null"),
        _ => None,
    }
}

/// String-aware rewrite of common JSON mistakes into strict JSON.
pub(crate) fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0usize;

    let next_significant = |from: usize| {
        chars[from..]
            .iter()
            .copied()
            .find(|c| !c.is_whitespace())
    };

    while i < chars.len() {
        let c = chars[i];

        if let Some(quote) = Quote::opening(c) {
            out.push('"');
            i += 1;
            let mut escaped = false;
            while i < chars.len() {
                let s = chars[i];
                i += 1;
                if escaped {
                    escaped = false;
                    if s == '\'' && quote != Quote::Ascii {
                        out.pop();
                        out.push('\'');
                    } else {
                        out.push(s);
                    }
                    continue;
                }
                if s == '\\' {
                    escaped = true;
                    out.push(s);
                    continue;
                }
                if quote.closes(s) {
                    break;
                }
                if s == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(s);
                }
            }
            out.push('"');
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            continue;
        }

        if c == ',' && matches!(next_significant(i + 1), Some('}' | ']') | None) {
            i += 1;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '-'))
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if next_significant(i) == Some(':') {
                out.push('"');
                out.push_str(&word);
                out.push('"');
            } else if let Some(replacement) = literal_replacement(&word) {
                out.push_str(replacement);
            } else {
                out.push_str(&word);
            }
            continue;
        }

        out.push(c);
        i += 1;
    }
    out
}
