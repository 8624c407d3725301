//! Test-only doubles and fixtures for driving the workflow without processes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};

use crate::core::budget::{BudgetOverrides, BudgetState, Profile};
use crate::core::patch::ApplyMode;
use crate::core::path::resolve_within_root;
use crate::core::state::{RoleUpdate, RunState};
use crate::core::types::Role;
use crate::io::config::RolesConfig;
use crate::io::executor::{RoleExecutor, RoleRequest};
use crate::io::patch_file::{ApplyError, FileApplyOutcome};
use crate::io::process::CommandResult;
use crate::io::tools::ToolRunner;
use crate::step::StepConfig;

/// Role executor that replays a fixed script of updates.
///
/// An exhausted script is reported as an executor error.
#[derive(Default)]
pub struct ScriptedRoleExecutor {
    script: RefCell<VecDeque<Result<RoleUpdate, String>>>,
    seen: RefCell<Vec<(Role, Option<u32>)>>,
}

impl ScriptedRoleExecutor {
    pub fn new(updates: impl IntoIterator<Item = RoleUpdate>) -> Self {
        Self::from_results(updates.into_iter().map(Ok))
    }

    /// Script that mixes updates with executor failures (`Err(message)`).
    pub fn from_results(results: impl IntoIterator<Item = Result<RoleUpdate, String>>) -> Self {
        Self {
            script: RefCell::new(results.into_iter().collect()),
            seen: RefCell::new(Vec::new()),
        }
    }

    /// Roles invoked so far, in order.
    pub fn invoked_roles(&self) -> Vec<Role> {
        self.seen.borrow().iter().map(|(role, _)| *role).collect()
    }

    /// `max_turns` handed to each invocation, in order.
    pub fn max_turns_seen(&self) -> Vec<Option<u32>> {
        self.seen.borrow().iter().map(|(_, turns)| *turns).collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }
}

impl RoleExecutor for ScriptedRoleExecutor {
    fn invoke(&self, request: &RoleRequest) -> Result<RoleUpdate> {
        self.seen
            .borrow_mut()
            .push((request.role, request.input.max_turns));
        match self.script.borrow_mut().pop_front() {
            Some(Ok(update)) => Ok(update),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("script exhausted at role {}", request.role)),
        }
    }
}

/// Tool runner that records what it was asked to do.
///
/// Shell commands return scripted results in order, then succeed with empty
/// output. Fetches always fail. Patches always apply strictly.
#[derive(Default)]
pub struct ScriptedToolRunner {
    results: RefCell<VecDeque<CommandResult>>,
    executed: RefCell<Vec<String>>,
    patched: RefCell<Vec<String>>,
}

impl ScriptedToolRunner {
    pub fn with_results(results: impl IntoIterator<Item = CommandResult>) -> Self {
        Self {
            results: RefCell::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Shell commands actually executed, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.borrow().clone()
    }

    pub fn patched(&self) -> Vec<String> {
        self.patched.borrow().clone()
    }
}

impl ToolRunner for ScriptedToolRunner {
    fn run_shell(&self, command: &str) -> Result<CommandResult> {
        self.executed.borrow_mut().push(command.to_string());
        Ok(self
            .results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| command_result(command, Some(0), "")))
    }

    fn fetch(&self, url: &str) -> Result<String> {
        Err(anyhow!("no network in tests: {url}"))
    }

    fn apply_patch(&self, path: &str, _diff: &str) -> Result<FileApplyOutcome, ApplyError> {
        self.patched.borrow_mut().push(path.to_string());
        Ok(FileApplyOutcome {
            path: resolve_within_root(Path::new(""), path)?,
            mode: ApplyMode::Strict,
            created: false,
        })
    }
}

/// A finished command with the given exit code and stdout.
pub fn command_result(command: &str, exit_code: Option<i32>, stdout: &str) -> CommandResult {
    CommandResult {
        command: command.to_string(),
        args: Vec::new(),
        exit_code,
        stdout: stdout.to_string(),
        stderr: String::new(),
        timed_out: false,
        killed: false,
        duration_ms: 5,
    }
}

/// Fresh run state at a fixed start time.
pub fn run_state(profile: Profile) -> RunState {
    RunState::new(
        "run-20231114T221320-0a1b",
        "make the tests pass",
        None,
        profile,
        BudgetState::from_profile(profile, &BudgetOverrides::default()),
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    )
}

/// Step settings rooted at `root`, with iteration logs under `root/.agent/iterations`.
pub fn step_config(root: &Path) -> StepConfig {
    StepConfig {
        workdir: root.to_path_buf(),
        roles: RolesConfig::default(),
        role_timeout: Duration::from_secs(5),
        output_limit_bytes: 10_000,
        stuck_window: 3,
        coder_max_turns: None,
        iterations_dir: Some(root.join(".agent").join("iterations")),
        deadline: None,
    }
}
