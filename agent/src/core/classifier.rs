//! Deterministic classification of failed command output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::FailureKind;

/// Classify a command result into exactly one [`FailureKind`].
///
/// Checks run in a fixed order and the first hit wins: timeout, test-runner
/// failure signatures, compiler signatures, non-zero exit, then `unknown`.
pub fn classify(output: &str, exit_code: Option<i32>, timed_out: bool) -> FailureKind {
    if timed_out {
        return FailureKind::Timeout;
    }
    if is_test_failure(output) {
        return FailureKind::TestFailure;
    }
    if is_compilation_failure(output) {
        return FailureKind::Compilation;
    }
    match exit_code {
        Some(0) => FailureKind::Unknown,
        Some(_) => FailureKind::RuntimeError,
        None => FailureKind::Unknown,
    }
}

fn is_test_failure(output: &str) -> bool {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?m)(^\s*FAIL\s+\S|^\s*●\s|Tests:.*\bfailed\b|^FAILED\s+\S|=+.*\b\d+ failed\b|test result: FAILED|panicked at|^\s*--- FAIL:)",
        )
        .unwrap()
    });
    RE.is_match(output)
}

fn is_compilation_failure(output: &str) -> bool {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?m)(error TS\d+|error\[E\d+\]|could not compile|^\S+\.go:\d+:\d+: undefined:|SyntaxError:|IndentationError:|error: cannot find symbol|\.java:\d+: error:)",
        )
        .unwrap()
    });
    RE.is_match(output)
}
