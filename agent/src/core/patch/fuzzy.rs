//! Approximate hunk application.
//!
//! Each hunk is placed on the best-matching window of the running content,
//! then the line edit script `expected -> replacement` is replayed against
//! that window. Context lines are never rewritten, so drift around the edited
//! lines (extra blank lines, comments, re-indentation) is kept as found.

use similar::{Algorithm, DiffOp, TextDiff};
use tracing::debug;

use super::{Hunk, Lines, PatchError, PatchThresholds};

/// Upper bound on windows tried per hunk before giving up.
const MAX_CANDIDATES: usize = 8;

const PREVIEW_CHARS: usize = 80;

/// Strategy for applying hunks whose context no longer matches exactly.
pub trait ApproximatePatcher {
    fn apply_approximate(&self, original: &str, hunks: &[Hunk]) -> Result<String, PatchError>;
}

/// [`ApproximatePatcher`] backed by Myers diffs from `similar`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarPatcher {
    thresholds: PatchThresholds,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    start: usize,
    len: usize,
    ratio: f32,
}

impl SimilarPatcher {
    pub fn new(thresholds: PatchThresholds) -> Self {
        Self { thresholds }
    }

    fn match_floor(&self) -> f32 {
        (1.0 - self.thresholds.match_threshold) as f32
    }

    fn delete_floor(&self) -> f32 {
        (1.0 - self.thresholds.delete_threshold) as f32
    }

    fn apply_hunk(&self, lines: &mut Vec<String>, hunk: &Hunk, hint: Option<usize>) -> bool {
        if hunk.expected.is_empty() {
            let pos = hint.unwrap_or(lines.len()).min(lines.len());
            lines.splice(pos..pos, hunk.replacement.iter().cloned());
            return true;
        }
        for candidate in self.candidates(lines, &hunk.expected, hint) {
            let range = candidate.start..candidate.start + candidate.len;
            if let Some(rebuilt) = self.rewrite_window(&lines[range.clone()], hunk) {
                debug!(
                    start = candidate.start,
                    len = candidate.len,
                    ratio = candidate.ratio,
                    "fuzzy window applied"
                );
                lines.splice(range, rebuilt);
                return true;
            }
        }
        false
    }

    /// Windows scoring at or above the match floor, best first.
    fn candidates(&self, lines: &[String], expected: &[String], hint: Option<usize>) -> Vec<Candidate> {
        let expected: Vec<&str> = expected.iter().map(|l| l.trim()).collect();
        let trimmed: Vec<&str> = lines.iter().map(|l| l.trim()).collect();
        let n = expected.len();
        let slack = (n / 2).max(3);
        let min_len = n.saturating_sub(slack).max(1);
        let floor = self.match_floor();

        let mut scored = Vec::new();
        for start in 0..trimmed.len() {
            let max_len = (n + slack).min(trimmed.len() - start);
            for len in min_len..=max_len {
                let ratio = line_ratio(&expected, &trimmed[start..start + len]);
                if ratio >= floor {
                    scored.push(Candidate { start, len, ratio });
                }
            }
        }

        let distance = |start: usize| hint.map_or(0, |h| start.abs_diff(h));
        scored.sort_by(|a, b| {
            b.ratio
                .total_cmp(&a.ratio)
                .then_with(|| distance(a.start).cmp(&distance(b.start)))
                .then_with(|| a.start.cmp(&b.start))
                .then_with(|| b.len.cmp(&a.len))
        });
        scored.truncate(MAX_CANDIDATES);
        scored
    }

    /// Map each expected line to a window line, by trimmed equality or close similarity.
    fn align(&self, window: &[String], expected: &[String]) -> Vec<Option<usize>> {
        let expected: Vec<&str> = expected.iter().map(|l| l.trim()).collect();
        let window: Vec<&str> = window.iter().map(|l| l.trim()).collect();
        let mut map = vec![None; expected.len()];
        for op in similar::capture_diff_slices(Algorithm::Myers, &expected, &window) {
            match op {
                DiffOp::Equal {
                    old_index,
                    new_index,
                    len,
                } => {
                    for k in 0..len {
                        map[old_index + k] = Some(new_index + k);
                    }
                }
                DiffOp::Replace {
                    old_index,
                    old_len,
                    new_index,
                    new_len,
                } => {
                    for k in 0..old_len.min(new_len) {
                        let ratio = TextDiff::from_chars(expected[old_index + k], window[new_index + k])
                            .ratio();
                        if ratio >= self.delete_floor() {
                            map[old_index + k] = Some(new_index + k);
                        }
                    }
                }
                DiffOp::Delete { .. } | DiffOp::Insert { .. } => {}
            }
        }
        map
    }

    /// Replay `expected -> replacement` on `window`; `None` when any micro-edit fails.
    fn rewrite_window(&self, window: &[String], hunk: &Hunk) -> Option<Vec<String>> {
        let map = self.align(window, &hunk.expected);
        let mut deleted = vec![false; window.len()];
        let mut inserts: Vec<Vec<String>> = vec![Vec::new(); window.len() + 1];

        let ops = similar::capture_diff_slices(Algorithm::Myers, &hunk.expected, &hunk.replacement);
        for op in ops {
            match op {
                DiffOp::Equal { .. } => {}
                DiffOp::Delete {
                    old_index, old_len, ..
                } => {
                    self.delete_range(window, &map, &hunk.expected, old_index, old_len, &mut deleted)?;
                }
                DiffOp::Insert {
                    old_index,
                    new_index,
                    new_len,
                } => {
                    let pos = insertion_point(&map, old_index);
                    inserts[pos].extend_from_slice(&hunk.replacement[new_index..new_index + new_len]);
                }
                DiffOp::Replace {
                    old_index,
                    old_len,
                    new_index,
                    new_len,
                } => {
                    let pos = self.delete_range(
                        window,
                        &map,
                        &hunk.expected,
                        old_index,
                        old_len,
                        &mut deleted,
                    )?;
                    inserts[pos].extend_from_slice(&hunk.replacement[new_index..new_index + new_len]);
                }
            }
        }

        let mut out = Vec::with_capacity(window.len() + hunk.replacement.len());
        for (i, pending) in inserts.into_iter().enumerate() {
            out.extend(pending);
            if i < window.len() && !deleted[i] {
                out.push(window[i].clone());
            }
        }
        Some(out)
    }

    /// Remove the window lines standing for `expected[start..start + len]`.
    ///
    /// Returns the first removed window index.
    fn delete_range(
        &self,
        window: &[String],
        map: &[Option<usize>],
        expected: &[String],
        start: usize,
        len: usize,
        deleted: &mut [bool],
    ) -> Option<usize> {
        let range = start..start + len;
        if map[range.clone()].iter().all(Option::is_some) {
            let targets: Vec<usize> = map[range].iter().flatten().copied().collect();
            if targets.iter().any(|&i| deleted[i]) {
                return None;
            }
            for &i in &targets {
                deleted[i] = true;
            }
            return targets.into_iter().min();
        }

        // Fall back to the span between the surrounding anchors.
        let mut lo = map[..start]
            .iter()
            .rev()
            .find_map(|m| *m)
            .map_or(0, |i| i + 1);
        let mut hi = map[start + len..]
            .iter()
            .find_map(|m| *m)
            .unwrap_or(window.len());
        while lo < hi && window[lo].trim().is_empty() {
            lo += 1;
        }
        while hi > lo && window[hi - 1].trim().is_empty() {
            hi -= 1;
        }
        if lo >= hi || deleted[lo..hi].iter().any(|d| *d) {
            return None;
        }

        let wanted = join_trimmed(&expected[range]);
        let found = join_trimmed(&window[lo..hi]);
        if TextDiff::from_chars(wanted.as_str(), found.as_str()).ratio() < self.delete_floor() {
            return None;
        }
        deleted[lo..hi].fill(true);
        Some(lo)
    }
}

impl ApproximatePatcher for SimilarPatcher {
    fn apply_approximate(&self, original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
        let mut text = Lines::new(original);
        let mut offset: isize = 0;
        for (index, hunk) in hunks.iter().enumerate() {
            let hint = hunk.hint.map(|h| h.saturating_add_signed(offset));
            let before = text.lines.len();
            if !self.apply_hunk(&mut text.lines, hunk, hint) {
                return Err(PatchError::FuzzyHunkFailed {
                    index,
                    expected: preview(&hunk.expected),
                    replacement: preview(&hunk.replacement),
                });
            }
            offset += text.lines.len() as isize - before as isize;
        }
        Ok(text.render())
    }
}

fn line_ratio(expected: &[&str], window: &[&str]) -> f32 {
    let ops = similar::capture_diff_slices(Algorithm::Myers, expected, window);
    similar::get_diff_ratio(&ops, expected.len(), window.len())
}

fn insertion_point(map: &[Option<usize>], old_index: usize) -> usize {
    map[..old_index]
        .iter()
        .rev()
        .find_map(|m| *m)
        .map_or(0, |i| i + 1)
}

fn join_trimmed(lines: &[String]) -> String {
    lines.iter().map(|l| l.trim()).collect::<Vec<_>>().join("\n")
}

fn preview(lines: &[String]) -> String {
    let joined = lines.join("\n");
    if joined.chars().count() <= PREVIEW_CHARS {
        return joined;
    }
    let mut out: String = joined.chars().take(PREVIEW_CHARS).collect();
    out.push('…');
    out
}
