//! Workflow-level tests for full run lifecycle scenarios.
//!
//! These tests start a run on disk and drive `run_workflow` with scripted
//! roles and tools to verify the ceilings, the governor and the persisted
//! artifacts end to end.

use std::fs;

use agent::core::budget::Profile;
use agent::core::state::{FunctionalCheck, RoleUpdate, ToolCall, ToolStatus};
use agent::core::transitions::MAX_STEPS;
use agent::core::types::{Role, Terminal};
use agent::io::init::AgentPaths;
use agent::io::run_state::{load_run_state, write_run_state};
use agent::looping::{WorkflowOptions, WorkflowStop, run_workflow};
use agent::start::{StartRequest, start_run};
use agent::test_support::{ScriptedRoleExecutor, ScriptedToolRunner};
use chrono::Utc;

fn start(root: &std::path::Path, profile: &str) {
    start_run(
        root,
        &StartRequest {
            goal: "make the build green".to_string(),
            ticket: None,
            profile: Some(profile.to_string()),
        },
        Utc::now(),
    )
    .expect("start");
}

fn checks(n: usize) -> Vec<FunctionalCheck> {
    (0..n)
        .map(|i| FunctionalCheck {
            name: format!("probe-{i}"),
            passed: true,
            detail: String::new(),
        })
        .collect()
}

/// Under `fast`, ten `run_command` requests yield eight executions and two
/// rejections; the run then ends in `aborted_constraint`.
#[test]
fn fast_profile_caps_commands_at_eight() {
    let temp = tempfile::tempdir().expect("tempdir");
    start(temp.path(), "fast");

    let mut update = RoleUpdate::new(Role::Coder, "gather context");
    update.tool_calls = (0..10)
        .map(|i| ToolCall::RunCommand {
            command: format!("cat file{i}.txt"),
        })
        .collect();
    let executor = ScriptedRoleExecutor::new([update]);
    let tools = ScriptedToolRunner::default();

    let outcome = run_workflow(
        temp.path(),
        &executor,
        &tools,
        &WorkflowOptions::default(),
        |_| {},
    )
    .expect("workflow");

    assert_eq!(tools.executed().len(), 8);
    let rejected = outcome
        .state
        .tool_records
        .iter()
        .filter(|r| r.status == ToolStatus::Rejected)
        .count();
    assert_eq!(rejected, 2);
    assert_eq!(outcome.state.budget.commands_used, 8);
    assert_eq!(outcome.state.budget.command_history.len(), 8);
    assert_eq!(
        outcome.stop,
        WorkflowStop::Terminal(Terminal::AbortedConstraint)
    );
    assert_eq!(
        outcome.state.terminal_reason.as_deref(),
        Some("Budget exhausted: command 8/8")
    );

    let report = fs::read_to_string(&outcome.report_path).expect("report");
    assert!(report.contains("**Status:** failed"));
    assert!(report.contains("- **Resource Usage:** 8 cmds, 0 tests, 0 web"));
}

/// Repeating `planner→planner` a sixth time aborts before the role body runs.
#[test]
fn loop_ceiling_aborts_on_sixth_take() {
    let temp = tempfile::tempdir().expect("tempdir");
    start(temp.path(), "fast");

    // Vary functional checks so the stuck detector stays quiet.
    let updates: Vec<RoleUpdate> = (1..=10)
        .map(|i| {
            let mut update = RoleUpdate::new(Role::Planner, "rethink");
            update.functional_checks = Some(checks(i));
            update
        })
        .collect();
    let executor = ScriptedRoleExecutor::new(updates);

    let outcome = run_workflow(
        temp.path(),
        &executor,
        &ScriptedToolRunner::default(),
        &WorkflowOptions::default(),
        |_| {},
    )
    .expect("workflow");

    // One initial invocation plus five takes of the edge.
    assert_eq!(executor.invoked_roles().len(), 6);
    assert_eq!(outcome.steps_executed, 6);
    assert_eq!(outcome.stop, WorkflowStop::Terminal(Terminal::AbortedStuck));
    assert_eq!(
        outcome.state.terminal_reason.as_deref(),
        Some("Loop limit exceeded on edge planner→planner (6/5)")
    );
    assert_eq!(outcome.state.loop_counters.get("planner→planner"), Some(&5));
}

#[test]
fn step_ceiling_aborts_regardless_of_next() {
    let temp = tempfile::tempdir().expect("tempdir");
    start(temp.path(), "fast");
    let paths = AgentPaths::new(temp.path());
    let mut state = load_run_state(&paths.run_state_path).expect("load");
    state.total_steps = MAX_STEPS;
    write_run_state(&paths.run_state_path, &state).expect("write");

    let executor = ScriptedRoleExecutor::new([RoleUpdate::new(Terminal::Done, "done")]);
    let outcome = run_workflow(
        temp.path(),
        &executor,
        &ScriptedToolRunner::default(),
        &WorkflowOptions::default(),
        |_| {},
    )
    .expect("workflow");

    assert!(executor.invoked_roles().is_empty());
    assert_eq!(outcome.stop, WorkflowStop::Terminal(Terminal::AbortedStuck));
    assert_eq!(
        outcome.state.terminal_reason.as_deref(),
        Some("Max steps limit reached")
    );
}

/// Cycling between roles while nothing changes is flagged as stuck.
#[test]
fn cycling_without_progress_is_stuck() {
    let temp = tempfile::tempdir().expect("tempdir");
    start(temp.path(), "strict");
    let executor = ScriptedRoleExecutor::new([
        RoleUpdate::new(Role::Researcher, "look around"),
        RoleUpdate::new(Role::Planner, "nothing found"),
        RoleUpdate::new(Role::Researcher, "look again"),
        RoleUpdate::new(Role::Planner, "still nothing"),
    ]);

    let outcome = run_workflow(
        temp.path(),
        &executor,
        &ScriptedToolRunner::default(),
        &WorkflowOptions::default(),
        |_| {},
    )
    .expect("workflow");

    assert_eq!(outcome.steps_executed, 3);
    assert_eq!(outcome.stop, WorkflowStop::Terminal(Terminal::AbortedStuck));
    assert!(
        outcome
            .state
            .terminal_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("No progress in last 3 steps"))
    );
    assert_eq!(outcome.state.progress_history.len(), 3);
}

/// A full happy path: plan, patch, verify, finish; artifacts land under `.agent/`.
#[test]
fn happy_path_writes_iterations_and_report() {
    let temp = tempfile::tempdir().expect("tempdir");
    start(temp.path(), "strict");

    let mut coder = RoleUpdate::new(Role::Verifier, "patched handler");
    coder.tool_calls = vec![ToolCall::ApplyPatch {
        path: "src/handler.rs".to_string(),
        diff: "@@ -1 +1 @@\n-old\n+new\n".to_string(),
    }];
    let mut verifier = RoleUpdate::new(Terminal::Done, "tests pass");
    verifier.tool_calls = vec![ToolCall::RunTests {
        command: "cargo test".to_string(),
    }];
    let executor = ScriptedRoleExecutor::new([
        RoleUpdate::new(Role::Coder, "small change"),
        coder,
        verifier,
    ]);
    let tools = ScriptedToolRunner::default();

    let outcome = run_workflow(
        temp.path(),
        &executor,
        &tools,
        &WorkflowOptions::default(),
        |_| {},
    )
    .expect("workflow");

    assert_eq!(outcome.stop, WorkflowStop::Terminal(Terminal::Done));
    assert_eq!(outcome.state.profile, Profile::Strict);
    assert_eq!(tools.patched(), vec!["src/handler.rs".to_string()]);
    assert_eq!(tools.executed(), vec!["cargo test".to_string()]);
    assert!(outcome.state.last_test_signature.is_some());

    let paths = AgentPaths::new(temp.path());
    let run_dir = paths.iterations_dir.join(&outcome.run_id);
    for step in 1..=3 {
        assert!(run_dir.join(step.to_string()).join("meta.json").is_file());
    }
    assert!(run_dir.join("2").join("tools.json").is_file());

    let report = fs::read_to_string(&outcome.report_path).expect("report");
    assert!(report.contains("**Status:** success"));
    assert!(report.contains("- **Change Size:** 1 files"));
    assert!(report.contains("- **Failure Mode:** none"));
}

#[test]
fn resume_of_finished_run_invokes_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    start(temp.path(), "fast");
    let first = ScriptedRoleExecutor::new([RoleUpdate::new(Terminal::AskHuman, "need a key")]);
    run_workflow(
        temp.path(),
        &first,
        &ScriptedToolRunner::default(),
        &WorkflowOptions::default(),
        |_| {},
    )
    .expect("workflow");

    let second = ScriptedRoleExecutor::new([RoleUpdate::new(Role::Coder, "go")]);
    let outcome = run_workflow(
        temp.path(),
        &second,
        &ScriptedToolRunner::default(),
        &WorkflowOptions::default(),
        |_| {},
    )
    .expect("resume");

    assert!(second.invoked_roles().is_empty());
    assert_eq!(outcome.steps_executed, 0);
    assert_eq!(outcome.stop, WorkflowStop::Terminal(Terminal::AskHuman));
    let report = fs::read_to_string(&outcome.report_path).expect("report");
    assert!(report.contains("**Status:** partial"));
}
