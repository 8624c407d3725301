//! Canonical run state and the deterministic merge of role updates.
//!
//! The engine is the only writer of [`RunState`]. Roles receive a cloned
//! snapshot inside [`RoleInput`] and answer with a [`RoleUpdate`] delta that
//! is folded in by [`RunState::merge_update`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::budget::{BudgetState, Profile};
use crate::core::diagnostics::{self, DiagnosticSource, DiagnosticsEntry};
use crate::core::progress::ProgressSnapshot;
use crate::core::types::{FailureKind, Next, Role, Terminal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMarker {
    Created,
    Modified,
    Deleted,
}

/// Result of one functional probe reported by a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionalCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Raw tool output a role wants folded into the diagnostics log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticInput {
    pub source: DiagnosticSource,
    pub output: String,
}

/// Side effect requested by a role, executed by the engine after merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    RunCommand { command: String },
    RunTests { command: String },
    WebRequest { url: String },
    ApplyPatch { path: String, diff: String },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::RunCommand { .. } => "run_command",
            ToolCall::RunTests { .. } => "run_tests",
            ToolCall::WebRequest { .. } => "web_request",
            ToolCall::ApplyPatch { .. } => "apply_patch",
        }
    }

    /// The command, URL or path the call targets.
    pub fn target(&self) -> &str {
        match self {
            ToolCall::RunCommand { command } | ToolCall::RunTests { command } => command,
            ToolCall::WebRequest { url } => url,
            ToolCall::ApplyPatch { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Failed,
    Rejected,
}

/// What happened to one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub tool: String,
    pub target: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ToolRecord {
    pub fn new(call: &ToolCall, status: ToolStatus) -> Self {
        Self {
            tool: call.name().to_string(),
            target: call.target().to_string(),
            status,
            exit_code: None,
            failure_kind: None,
            duration_ms: 0,
            message: String::new(),
        }
    }

    pub fn rejected(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::new(call, ToolStatus::Rejected)
        }
    }
}

/// Partial-state update returned by a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleUpdate {
    pub next: Next,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_changes: Option<BTreeMap<String, ChangeMarker>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functional_checks: Option<Vec<FunctionalCheck>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<DiagnosticInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl RoleUpdate {
    pub fn new(next: impl Into<Next>, reason: impl Into<String>) -> Self {
        Self {
            next: next.into(),
            reason: reason.into(),
            error: None,
            file_changes: None,
            functional_checks: None,
            notes: None,
            diagnostics: Vec::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Update standing in for a failed role: carries the error, routes to planner.
    pub fn role_error(role: Role, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            error: Some(error.clone()),
            ..Self::new(Role::Planner, format!("{role} failed: {error}"))
        }
    }
}

/// Snapshot handed to a role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleInput {
    pub role: Role,
    pub diagnostics_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    pub state: RunState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    pub profile: Profile,
    pub started_at: DateTime<Utc>,
    pub revision: u64,
    pub current: Next,
    #[serde(default)]
    pub previous: Option<Role>,
    #[serde(default)]
    pub loop_counters: BTreeMap<String, u32>,
    #[serde(default)]
    pub total_steps: u32,
    pub budget: BudgetState,
    #[serde(default)]
    pub diagnostics_log: Vec<DiagnosticsEntry>,
    #[serde(default)]
    pub progress_history: Vec<ProgressSnapshot>,
    #[serde(default)]
    pub file_changes: BTreeMap<String, ChangeMarker>,
    #[serde(default)]
    pub functional_checks: Vec<FunctionalCheck>,
    #[serde(default)]
    pub notes: Map<String, Value>,
    #[serde(default)]
    pub last_reason: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_test_signature: Option<String>,
    #[serde(default)]
    pub same_error_count: u32,
    #[serde(default)]
    pub last_primary_failure: String,
    #[serde(default)]
    pub failure_counts: BTreeMap<FailureKind, u32>,
    #[serde(default)]
    pub tool_records: Vec<ToolRecord>,
    #[serde(default)]
    pub terminal_status: Option<Terminal>,
    #[serde(default)]
    pub terminal_reason: Option<String>,
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        goal: impl Into<String>,
        ticket: Option<String>,
        profile: Profile,
        budget: BudgetState,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            goal: goal.into(),
            ticket,
            profile,
            started_at,
            revision: 0,
            current: Next::Role(Role::Planner),
            previous: None,
            loop_counters: BTreeMap::new(),
            total_steps: 0,
            budget,
            diagnostics_log: Vec::new(),
            progress_history: Vec::new(),
            file_changes: BTreeMap::new(),
            functional_checks: Vec::new(),
            notes: Map::new(),
            last_reason: String::new(),
            last_error: None,
            last_test_signature: None,
            same_error_count: 0,
            last_primary_failure: String::new(),
            failure_counts: BTreeMap::new(),
            tool_records: Vec::new(),
            terminal_status: None,
            terminal_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status.is_some()
    }

    /// Set the terminal outcome once; later calls are ignored.
    pub fn terminate(&mut self, status: Terminal, reason: impl Into<String>) {
        if self.terminal_status.is_some() {
            return;
        }
        self.terminal_status = Some(status);
        self.terminal_reason = Some(reason.into());
        self.current = Next::Terminal(status);
    }

    /// Fold a role's delta into the state.
    pub fn merge_update(&mut self, update: &RoleUpdate, now: DateTime<Utc>) {
        self.revision += 1;
        self.current = update.next;
        self.last_reason = update.reason.clone();
        self.last_error = update.error.clone();
        if let Some(changes) = &update.file_changes {
            self.file_changes = changes.clone();
        }
        if let Some(checks) = &update.functional_checks {
            self.functional_checks = checks.clone();
        }
        if let Some(notes) = &update.notes {
            for (key, value) in notes {
                self.notes.insert(key.clone(), value.clone());
            }
        }
        for input in &update.diagnostics {
            self.merge_diagnostics(&input.output, input.source, now);
        }
    }

    pub fn merge_diagnostics(&mut self, output: &str, source: DiagnosticSource, now: DateTime<Utc>) {
        let incoming = diagnostics::parse(output, source, now);
        if incoming.is_empty() {
            return;
        }
        let log = std::mem::take(&mut self.diagnostics_log);
        self.diagnostics_log = diagnostics::merge(log, incoming);
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        *self.failure_counts.entry(kind).or_insert(0) += 1;
    }

    /// Most frequent failure kind; ties go to the earlier kind.
    pub fn dominant_failure(&self) -> Option<FailureKind> {
        self.failure_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .max_by(|(ka, a), (kb, b)| a.cmp(b).then_with(|| kb.cmp(ka)))
            .map(|(kind, _)| *kind)
    }

    /// Refresh `same_error_count` from the current primary failure.
    pub fn refresh_error_streak(&mut self) {
        let primary = diagnostics::primary_failure(&self.diagnostics_log);
        self.same_error_count = if primary.is_empty() {
            0
        } else if primary == self.last_primary_failure {
            self.same_error_count + 1
        } else {
            1
        };
        self.last_primary_failure = primary;
    }

    pub fn snapshot(&self, node: &str, now: DateTime<Utc>) -> ProgressSnapshot {
        ProgressSnapshot {
            node: node.to_string(),
            file_change_count: self.file_changes.len(),
            same_error_count: self.same_error_count,
            last_test_signature: self.last_test_signature.clone(),
            functional_checks_count: self.functional_checks.len(),
            timestamp: now,
        }
    }

    pub fn role_input(&self, role: Role, max_turns: Option<u32>) -> RoleInput {
        RoleInput {
            role,
            diagnostics_summary: diagnostics::summarize(
                &self.diagnostics_log,
                diagnostics::DEFAULT_SUMMARY_ENTRIES,
            ),
            max_turns,
            state: self.clone(),
        }
    }
}

/// Stable fingerprint of test output: digits are dropped so timings do not matter.
pub fn test_signature(output: &str) -> String {
    let normalized: String = output.chars().filter(|c| !c.is_ascii_digit()).collect();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}
