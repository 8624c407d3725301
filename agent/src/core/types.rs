//! Shared deterministic types for the workflow core.
//!
//! These types define stable contracts between the engine and its
//! collaborators. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named stage of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Researcher,
    Coder,
    Verifier,
    Janitor,
    Retrospective,
    TicketCloser,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Planner,
        Role::Researcher,
        Role::Coder,
        Role::Verifier,
        Role::Janitor,
        Role::Retrospective,
        Role::TicketCloser,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Researcher => "researcher",
            Role::Coder => "coder",
            Role::Verifier => "verifier",
            Role::Janitor => "janitor",
            Role::Retrospective => "retrospective",
            Role::TicketCloser => "ticket_closer",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final, non-resumable outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    #[serde(alias = "done_success")]
    Done,
    AbortedStuck,
    AbortedConstraint,
    AskHuman,
}

impl Terminal {
    pub fn as_str(self) -> &'static str {
        match self {
            Terminal::Done => "done",
            Terminal::AbortedStuck => "aborted_stuck",
            Terminal::AbortedConstraint => "aborted_constraint",
            Terminal::AskHuman => "ask_human",
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing directive: either another role or a terminal tag.
///
/// Serialized as a bare string (`"coder"`, `"done"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Next {
    Role(Role),
    Terminal(Terminal),
}

impl Next {
    pub fn as_role(self) -> Option<Role> {
        match self {
            Next::Role(role) => Some(role),
            Next::Terminal(_) => None,
        }
    }

    pub fn as_terminal(self) -> Option<Terminal> {
        match self {
            Next::Terminal(terminal) => Some(terminal),
            Next::Role(_) => None,
        }
    }
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Role(role) => role.fmt(f),
            Next::Terminal(terminal) => terminal.fmt(f),
        }
    }
}

impl From<Role> for Next {
    fn from(role: Role) -> Self {
        Next::Role(role)
    }
}

impl From<Terminal> for Next {
    fn from(terminal: Terminal) -> Self {
        Next::Terminal(terminal)
    }
}

/// Classified kind of a failed command or test run.
///
/// Variant order is the tie-break order when picking a dominant kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    TestFailure,
    Compilation,
    RuntimeError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::TestFailure => "test_failure",
            FailureKind::Compilation => "compilation",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
