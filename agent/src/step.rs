//! Orchestration for a single workflow step.
//!
//! One call to [`run_step`] checks the ceilings, invokes the current role,
//! merges its update, executes the requested tool calls through the governor
//! and then consults the stuck detector and the budget before honoring a
//! terminal `next`.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetDecision, ResourceKind, effective_turns, remaining_budget};
use crate::core::classifier::classify;
use crate::core::diagnostics::DiagnosticSource;
use crate::core::progress::{Detection, detect};
use crate::core::state::{
    ChangeMarker, RoleUpdate, RunState, ToolCall, ToolRecord, ToolStatus, test_signature,
};
use crate::core::transitions::{LOOP_THRESHOLD, MAX_STEPS, edge_name, is_allowed, is_loop_eligible};
use crate::core::types::{FailureKind, Next, Role, Terminal};
use crate::io::config::{AgentConfig, RolesConfig};
use crate::io::executor::{RoleExecutor, RoleRequest};
use crate::io::init::AgentPaths;
use crate::io::iteration_log::{IterationMeta, IterationPaths, IterationWriteRequest, write_iteration};
use crate::io::process::CommandResult;
use crate::io::tools::ToolRunner;

/// Settings for a single step, derived from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub workdir: PathBuf,
    pub roles: RolesConfig,
    pub role_timeout: Duration,
    pub output_limit_bytes: usize,
    pub stuck_window: usize,
    pub coder_max_turns: Option<i64>,
    /// Where per-step logs go; `None` disables them.
    pub iterations_dir: Option<PathBuf>,
    /// Wall-clock deadline for the whole run; caps the role timeout.
    pub deadline: Option<Instant>,
}

impl StepConfig {
    pub fn from_config(cfg: &AgentConfig, paths: &AgentPaths) -> Self {
        Self {
            workdir: paths.root.clone(),
            roles: cfg.roles.clone(),
            role_timeout: Duration::from_secs(cfg.role_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            stuck_window: cfg.stuck_window,
            coder_max_turns: cfg.coder_max_turns,
            iterations_dir: Some(paths.iterations_dir.clone()),
            deadline: None,
        }
    }
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// 1-based step number this call accounted for.
    pub step: u32,
    /// The role that was scheduled, if the state was not already terminal.
    pub role: Option<Role>,
    /// Whether the role body actually ran.
    pub invoked: bool,
    /// The run deadline passed before the role could be invoked.
    pub deadline_passed: bool,
    pub next: Next,
    pub terminal: Option<Terminal>,
}

/// Execute one step of the workflow against `state`.
///
/// Engine-detected fatal conditions (step ceiling, loop ceiling, stuck
/// detection, budget exhaustion) resolve into a terminal status on `state`;
/// they are never returned as errors. An expired run deadline is reported
/// through [`StepOutcome::deadline_passed`]. Errors are limited to logging
/// failures.
#[instrument(skip_all, fields(run_id = %state.run_id, step = state.total_steps + 1))]
pub fn run_step<E, T>(
    state: &mut RunState,
    executor: &E,
    tools: &T,
    config: &StepConfig,
    now: DateTime<Utc>,
) -> Result<StepOutcome>
where
    E: RoleExecutor + ?Sized,
    T: ToolRunner + ?Sized,
{
    let started = Instant::now();
    let step = state.total_steps + 1;

    if state.is_terminal() {
        debug!("state already terminal, nothing to do");
        return Ok(outcome(state, step, None, false));
    }
    let role = match state.current {
        Next::Role(role) => role,
        Next::Terminal(terminal) => {
            let reason = state.last_reason.clone();
            state.terminate(terminal, reason);
            return Ok(outcome(state, step, None, false));
        }
    };

    if state.total_steps >= MAX_STEPS {
        warn!(total_steps = state.total_steps, "step ceiling reached");
        state.terminate(Terminal::AbortedStuck, "Max steps limit reached");
        log_step(config, state, step, role, None, now, started)?;
        return Ok(outcome(state, step, Some(role), false));
    }

    let taken_edge = state
        .previous
        .filter(|prev| is_loop_eligible(*prev, role))
        .map(|prev| edge_name(prev, role));
    if let Some(edge) = &taken_edge {
        let count = state.loop_counters.get(edge).copied().unwrap_or(0) + 1;
        if count > LOOP_THRESHOLD {
            warn!(edge = %edge, count, "loop ceiling reached");
            state.terminate(
                Terminal::AbortedStuck,
                format!("Loop limit exceeded on edge {edge} ({count}/{LOOP_THRESHOLD})"),
            );
            log_step(config, state, step, role, None, now, started)?;
            return Ok(outcome(state, step, Some(role), false));
        }
    }

    let paths = config
        .iterations_dir
        .as_deref()
        .map(|dir| IterationPaths::new(dir, &state.run_id, step));
    let timeout = match config.deadline.map(remaining_budget) {
        Some(Ok(remaining)) => remaining.min(config.role_timeout),
        Some(Err(_)) => {
            warn!(role = %role, "run deadline passed before invoking role");
            return Ok(StepOutcome {
                deadline_passed: true,
                ..outcome(state, step, Some(role), false)
            });
        }
        None => config.role_timeout,
    };
    let max_turns = (role == Role::Coder).then(|| effective_turns(state.profile, config.coder_max_turns));
    let request = RoleRequest {
        role,
        input: state.role_input(role, max_turns),
        argv: config.roles.argv_for(role),
        workdir: config.workdir.clone(),
        timeout,
        output_limit_bytes: config.output_limit_bytes,
        log_path: paths.as_ref().map(|p| p.role_log_path.clone()),
    };

    info!(role = %role, "invoking role");
    let update = match executor.invoke(&request) {
        Ok(update) => screen_update(role, update),
        Err(err) => {
            warn!(role = %role, err = %format!("{err:#}"), "role failed");
            RoleUpdate::role_error(role, format!("{err:#}"))
        }
    };

    state.merge_update(&update, now);
    state.tool_records = execute_tool_calls(state, &update.tool_calls, tools, &config.workdir, now);

    state.total_steps += 1;
    if let Some(edge) = taken_edge {
        *state.loop_counters.entry(edge).or_insert(0) += 1;
    }
    state.previous = Some(role);
    state.refresh_error_streak();
    let snapshot = state.snapshot(role.as_str(), now);
    state.progress_history.push(snapshot);

    if let Detection::StuckCandidate { reason } = detect(&state.progress_history, config.stuck_window) {
        warn!(reason = %reason, "run is not progressing");
        state.terminate(Terminal::AbortedStuck, reason);
    } else if let Some(reason) = state.budget.exhausted_reason() {
        warn!(reason = %reason, "budget exhausted");
        state.terminate(Terminal::AbortedConstraint, reason);
    } else if let Next::Terminal(terminal) = update.next {
        let reason = if update.reason.is_empty() {
            terminal.as_str().to_string()
        } else {
            update.reason.clone()
        };
        state.terminate(terminal, reason);
    }

    info!(role = %role, next = %state.current, terminal = ?state.terminal_status, "step finished");
    log_step(config, state, step, role, Some(&update), now, started)?;
    Ok(outcome(state, step, Some(role), true))
}

/// Route role-reported errors and illegal transitions back to the planner.
fn screen_update(role: Role, mut update: RoleUpdate) -> RoleUpdate {
    if !is_allowed(role, update.next) {
        warn!(role = %role, next = %update.next, "transition not allowed");
        return RoleUpdate::role_error(
            role,
            format!("transition {role} → {} is not allowed", update.next),
        );
    }
    if let Some(error) = &update.error
        && update.next != Next::Role(Role::Planner)
    {
        debug!(role = %role, error = %error, "role reported an error, routing to planner");
        update.next = Next::Role(Role::Planner);
    }
    update
}

/// Run `calls` in order through the governor.
///
/// Rejected calls are recorded and never executed.
fn execute_tool_calls<T: ToolRunner + ?Sized>(
    state: &mut RunState,
    calls: &[ToolCall],
    tools: &T,
    workdir: &Path,
    now: DateTime<Utc>,
) -> Vec<ToolRecord> {
    calls
        .iter()
        .map(|call| execute_tool_call(state, call, tools, workdir, now))
        .collect()
}

fn execute_tool_call<T: ToolRunner + ?Sized>(
    state: &mut RunState,
    call: &ToolCall,
    tools: &T,
    workdir: &Path,
    now: DateTime<Utc>,
) -> ToolRecord {
    match call {
        ToolCall::RunCommand { command } | ToolCall::RunTests { command } => {
            if let Some(message) = state.budget.gate_command(command) {
                warn!(command = %command, "command rejected by profile");
                return ToolRecord::rejected(call, message);
            }
            let is_test = matches!(call, ToolCall::RunTests { .. });
            let kind = if is_test {
                ResourceKind::Test
            } else {
                ResourceKind::Command
            };
            if let Some(message) = consume(state, kind, Some(command), now) {
                return ToolRecord::rejected(call, message);
            }
            match tools.run_shell(command) {
                Ok(result) => record_command(state, call, &result, is_test, now),
                Err(err) => failed(state, call, format!("{err:#}")),
            }
        }
        ToolCall::WebRequest { url } => {
            if let Some(message) = consume(state, ResourceKind::WebRequest, None, now) {
                return ToolRecord::rejected(call, message);
            }
            match tools.fetch(url) {
                Ok(body) => ToolRecord {
                    message: format!("{} bytes", body.len()),
                    ..ToolRecord::new(call, ToolStatus::Ok)
                },
                Err(err) => ToolRecord {
                    message: format!("{err:#}"),
                    ..ToolRecord::new(call, ToolStatus::Failed)
                },
            }
        }
        ToolCall::ApplyPatch { path, diff } => match tools.apply_patch(path, diff) {
            Ok(applied) => {
                let marker = if applied.created {
                    ChangeMarker::Created
                } else {
                    ChangeMarker::Modified
                };
                state.file_changes.insert(change_key(workdir, &applied.path), marker);
                ToolRecord {
                    message: format!("applied ({:?})", applied.mode).to_lowercase(),
                    ..ToolRecord::new(call, ToolStatus::Ok)
                }
            }
            Err(err) => {
                warn!(path = %path, err = %err, "patch failed");
                ToolRecord {
                    message: err.to_string(),
                    ..ToolRecord::new(call, ToolStatus::Failed)
                }
            }
        },
    }
}

/// Spend one unit of `kind`, returning the rejection message when exhausted.
fn consume(
    state: &mut RunState,
    kind: ResourceKind,
    command: Option<&str>,
    now: DateTime<Utc>,
) -> Option<String> {
    match state.budget.check_and_consume(kind, command, now) {
        BudgetDecision::Allowed => None,
        BudgetDecision::Exhausted { kind, used, max } => {
            warn!(kind = kind.as_str(), used, max, "budget ceiling met, call rejected");
            Some(format!("Budget exhausted: {} {used}/{max}", kind.as_str()))
        }
    }
}

fn record_command(
    state: &mut RunState,
    call: &ToolCall,
    result: &CommandResult,
    is_test: bool,
    now: DateTime<Utc>,
) -> ToolRecord {
    let output = result.combined_output();
    if is_test {
        state.last_test_signature = Some(test_signature(&output));
    }
    let mut record = ToolRecord {
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
        ..ToolRecord::new(call, ToolStatus::Ok)
    };
    if result.success() {
        return record;
    }

    let kind = classify(&output, result.exit_code, result.timed_out);
    debug!(kind = kind.as_str(), exit_code = ?result.exit_code, "command failed");
    state.record_failure(kind);
    let source = if is_test {
        DiagnosticSource::Test
    } else {
        DiagnosticSource::Runtime
    };
    state.merge_diagnostics(&output, source, now);
    record.status = ToolStatus::Failed;
    record.failure_kind = Some(kind);
    if result.timed_out {
        record.message = "timed out".to_string();
    }
    record
}

fn failed(state: &mut RunState, call: &ToolCall, message: String) -> ToolRecord {
    state.record_failure(FailureKind::Unknown);
    ToolRecord {
        failure_kind: Some(FailureKind::Unknown),
        message,
        ..ToolRecord::new(call, ToolStatus::Failed)
    }
}

/// Workspace-relative, `/`-separated key for a patched file.
fn change_key(workdir: &Path, resolved: &Path) -> String {
    resolved
        .strip_prefix(workdir)
        .unwrap_or(resolved)
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn outcome(state: &RunState, step: u32, role: Option<Role>, invoked: bool) -> StepOutcome {
    StepOutcome {
        step,
        role,
        invoked,
        deadline_passed: false,
        next: state.current,
        terminal: state.terminal_status,
    }
}

fn log_step(
    config: &StepConfig,
    state: &RunState,
    step: u32,
    role: Role,
    update: Option<&RoleUpdate>,
    now: DateTime<Utc>,
    started: Instant,
) -> Result<()> {
    let Some(dir) = config.iterations_dir.as_deref() else {
        return Ok(());
    };
    let elapsed = started.elapsed();
    let ended_at = now + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
    let meta = IterationMeta {
        run_id: state.run_id.clone(),
        step,
        role,
        next: state.current,
        revision: state.revision,
        terminal_status: state.terminal_status,
        started_at: now.to_rfc3339(),
        ended_at: ended_at.to_rfc3339(),
        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    };
    let paths = IterationPaths::new(dir, &state.run_id, step);
    // Records belong to the previous step unless the role ran.
    let tools: &[ToolRecord] = if update.is_some() {
        &state.tool_records
    } else {
        &[]
    };
    write_iteration(&IterationWriteRequest {
        paths: &paths,
        meta: &meta,
        update,
        tools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::Profile;
    use crate::core::state::ToolStatus;
    use crate::test_support::{
        ScriptedRoleExecutor, ScriptedToolRunner, command_result, run_state, step_config,
    };
    use chrono::TimeZone;

    fn at(step: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + step, 0).unwrap()
    }

    fn planner_to(next: impl Into<Next>) -> RoleUpdate {
        RoleUpdate::new(next, "next move")
    }

    #[test]
    fn terminal_state_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.terminate(Terminal::AskHuman, "need input");
        let executor = ScriptedRoleExecutor::new([planner_to(Role::Coder)]);

        let out = run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert!(!out.invoked);
        assert_eq!(out.terminal, Some(Terminal::AskHuman));
        assert!(executor.invoked_roles().is_empty());
        assert_eq!(state.total_steps, 0);
    }

    /// Verifies a state at the step ceiling aborts regardless of `next`.
    #[test]
    fn step_ceiling_aborts_without_invoking() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.total_steps = MAX_STEPS;
        let executor = ScriptedRoleExecutor::new([planner_to(Terminal::Done)]);

        let out = run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert!(!out.invoked);
        assert_eq!(state.terminal_status, Some(Terminal::AbortedStuck));
        assert_eq!(state.terminal_reason.as_deref(), Some("Max steps limit reached"));
        assert!(executor.invoked_roles().is_empty());
    }

    #[test]
    fn loop_ceiling_names_the_edge() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.previous = Some(Role::Verifier);
        state.current = Next::Role(Role::Coder);
        state
            .loop_counters
            .insert(edge_name(Role::Verifier, Role::Coder), LOOP_THRESHOLD);
        state.tool_records = vec![ToolRecord::new(
            &ToolCall::RunCommand {
                command: "ls".to_string(),
            },
            ToolStatus::Ok,
        )];
        let executor = ScriptedRoleExecutor::new([RoleUpdate::new(Role::Verifier, "patched")]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(state.terminal_status, Some(Terminal::AbortedStuck));
        assert_eq!(
            state.terminal_reason.as_deref(),
            Some("Loop limit exceeded on edge verifier→coder (6/5)")
        );
        assert!(executor.invoked_roles().is_empty());

        let iter_dir = temp.path().join(".agent/iterations").join(&state.run_id).join("1");
        assert!(iter_dir.join("meta.json").is_file());
        assert!(!iter_dir.join("tools.json").exists());
    }

    #[test]
    fn expired_deadline_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        let executor = ScriptedRoleExecutor::new([planner_to(Role::Coder)]);
        let mut cfg = step_config(temp.path());
        cfg.deadline = Some(Instant::now());

        let out = run_step(&mut state, &executor, &ScriptedToolRunner::default(), &cfg, at(0))
            .expect("step");
        assert!(out.deadline_passed);
        assert!(!out.invoked);
        assert!(executor.invoked_roles().is_empty());
        assert_eq!(state.total_steps, 0);
        assert!(state.terminal_status.is_none());
    }

    #[test]
    fn successful_step_updates_engine_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        let executor = ScriptedRoleExecutor::new([planner_to(Role::Coder)]);

        let out = run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert!(out.invoked);
        assert_eq!(out.next, Next::Role(Role::Coder));
        assert_eq!(state.total_steps, 1);
        assert_eq!(state.revision, 1);
        assert_eq!(state.previous, Some(Role::Planner));
        assert_eq!(state.progress_history.len(), 1);
        assert_eq!(state.progress_history[0].node, "planner");
        assert!(state.loop_counters.is_empty());
        assert!(state.terminal_status.is_none());

        let iter_dir = temp.path().join(".agent/iterations").join(&state.run_id).join("1");
        assert!(iter_dir.join("meta.json").is_file());
        assert!(iter_dir.join("update.json").is_file());
    }

    #[test]
    fn loop_eligible_edge_is_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        let executor = ScriptedRoleExecutor::new([
            planner_to(Role::Coder),
            RoleUpdate::new(Role::Verifier, "patched"),
            RoleUpdate::new(Role::Coder, "tests fail"),
            RoleUpdate::new(Role::Verifier, "patched again"),
        ]);
        let tools = ScriptedToolRunner::default();
        let mut cfg = step_config(temp.path());
        cfg.stuck_window = 10;

        for i in 0..4 {
            run_step(&mut state, &executor, &tools, &cfg, at(i)).expect("step");
        }
        // planner→coder once; verifier→coder once; coder→verifier is not eligible.
        assert_eq!(state.loop_counters.get("planner→coder"), Some(&1));
        assert_eq!(state.loop_counters.get("verifier→coder"), Some(&1));
        assert_eq!(state.loop_counters.len(), 2);
    }

    #[test]
    fn executor_error_routes_to_planner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.current = Next::Role(Role::Researcher);
        state.previous = Some(Role::Planner);
        let executor = ScriptedRoleExecutor::from_results([Err("role crashed".to_string())]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(state.current, Next::Role(Role::Planner));
        assert_eq!(state.last_error.as_deref(), Some("role crashed"));
        assert!(state.last_reason.starts_with("researcher failed"));
        assert!(state.terminal_status.is_none());
    }

    #[test]
    fn disallowed_transition_routes_to_planner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.current = Next::Role(Role::Coder);
        state.previous = Some(Role::Planner);
        // coder → janitor is not in the table.
        let executor = ScriptedRoleExecutor::new([RoleUpdate::new(Role::Janitor, "cleanup")]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(state.current, Next::Role(Role::Planner));
        assert!(
            state
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("not allowed"))
        );
    }

    #[test]
    fn reported_error_overrides_next() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.current = Next::Role(Role::Coder);
        state.previous = Some(Role::Planner);
        let mut update = RoleUpdate::new(Role::Verifier, "tried");
        update.error = Some("could not open file".to_string());
        let executor = ScriptedRoleExecutor::new([update]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(state.current, Next::Role(Role::Planner));
        assert_eq!(state.last_error.as_deref(), Some("could not open file"));
    }

    #[test]
    fn terminal_next_finishes_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        let executor = ScriptedRoleExecutor::new([planner_to(Terminal::Done)]);

        let out = run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(out.terminal, Some(Terminal::Done));
        assert_eq!(state.terminal_reason.as_deref(), Some("next move"));
    }

    #[test]
    fn rejected_commands_are_not_executed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Smoke);
        let mut update = planner_to(Role::Coder);
        update.tool_calls = vec![
            ToolCall::RunCommand {
                command: "npm install left-pad".to_string(),
            },
            ToolCall::RunCommand {
                command: "npm run dev".to_string(),
            },
            ToolCall::RunCommand {
                command: "ls".to_string(),
            },
        ];
        let executor = ScriptedRoleExecutor::new([update]);
        let tools = ScriptedToolRunner::default();

        run_step(&mut state, &executor, &tools, &step_config(temp.path()), at(0)).expect("step");
        assert_eq!(tools.executed(), vec!["ls".to_string()]);
        let statuses: Vec<ToolStatus> = state.tool_records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ToolStatus::Rejected, ToolStatus::Rejected, ToolStatus::Ok]
        );
        assert_eq!(state.budget.commands_used, 1);
    }

    /// Verifies a failing test run is classified, counted, parsed into
    /// diagnostics and fingerprinted.
    #[test]
    fn failed_test_run_feeds_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Strict);
        let mut update = planner_to(Role::Verifier);
        update.tool_calls = vec![ToolCall::RunTests {
            command: "npx jest".to_string(),
        }];
        let executor = ScriptedRoleExecutor::new([update]);
        let tools = ScriptedToolRunner::with_results([command_result(
            "npx jest",
            Some(1),
            "FAIL src/app.test.ts\n  ● App › renders title\nTests: 1 failed, 3 passed",
        )]);

        run_step(&mut state, &executor, &tools, &step_config(temp.path()), at(0)).expect("step");
        let record = &state.tool_records[0];
        assert_eq!(record.status, ToolStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::TestFailure));
        assert_eq!(state.failure_counts.get(&FailureKind::TestFailure), Some(&1));
        assert_eq!(state.diagnostics_log.len(), 2);
        assert!(state.last_test_signature.is_some());
        assert_eq!(state.same_error_count, 1);
        assert_eq!(state.budget.test_runs_used, 1);
    }

    #[test]
    fn applied_patch_marks_file_changed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.current = Next::Role(Role::Coder);
        state.previous = Some(Role::Planner);
        let mut update = RoleUpdate::new(Role::Verifier, "patched");
        update.tool_calls = vec![ToolCall::ApplyPatch {
            path: "./src/lib.rs".to_string(),
            diff: "@@ -1 +1 @@\n-a\n+b\n".to_string(),
        }];
        let executor = ScriptedRoleExecutor::new([update]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(
            state.file_changes.get("src/lib.rs"),
            Some(&ChangeMarker::Modified)
        );
        assert_eq!(state.tool_records[0].status, ToolStatus::Ok);
    }

    #[test]
    fn equivalent_patch_paths_count_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        state.current = Next::Role(Role::Coder);
        state.previous = Some(Role::Planner);
        let diff = "@@ -1 +1 @@\n-a\n+b\n".to_string();
        let mut update = RoleUpdate::new(Role::Verifier, "patched");
        update.tool_calls = ["src/lib.rs", "src/../src/lib.rs", "./src//lib.rs"]
            .into_iter()
            .map(|path| ToolCall::ApplyPatch {
                path: path.to_string(),
                diff: diff.clone(),
            })
            .collect();
        let executor = ScriptedRoleExecutor::new([update]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(state.file_changes.len(), 1);
        assert!(state.file_changes.contains_key("src/lib.rs"));
    }

    #[test]
    fn change_key_strips_the_workspace_root() {
        let root = Path::new("/work");
        assert_eq!(change_key(root, Path::new("/work/src/lib.rs")), "src/lib.rs");
        assert_eq!(change_key(root, Path::new("src/lib.rs")), "src/lib.rs");
    }

    #[test]
    fn web_request_spends_budget_then_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        let mut update = planner_to(Role::Researcher);
        update.tool_calls = vec![ToolCall::WebRequest {
            url: "https://docs.rs".to_string(),
        }];
        let executor = ScriptedRoleExecutor::new([update]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(state.budget.web_requests_used, 1);
        assert_eq!(state.tool_records[0].status, ToolStatus::Failed);
    }

    #[test]
    fn coder_receives_turn_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Smoke);
        state.current = Next::Role(Role::Coder);
        state.previous = Some(Role::Planner);
        let executor = ScriptedRoleExecutor::new([RoleUpdate::new(Role::Verifier, "done")]);

        run_step(
            &mut state,
            &executor,
            &ScriptedToolRunner::default(),
            &step_config(temp.path()),
            at(0),
        )
        .expect("step");
        assert_eq!(executor.max_turns_seen(), vec![Some(5)]);
    }

    #[test]
    fn repeated_identical_steps_are_stuck() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = run_state(Profile::Fast);
        let executor = ScriptedRoleExecutor::new([
            planner_to(Role::Researcher),
            RoleUpdate::new(Role::Planner, "found nothing"),
            planner_to(Role::Researcher),
        ]);
        let tools = ScriptedToolRunner::default();
        let cfg = step_config(temp.path());

        for i in 0..3 {
            run_step(&mut state, &executor, &tools, &cfg, at(i)).expect("step");
        }
        assert_eq!(state.terminal_status, Some(Terminal::AbortedStuck));
        assert!(
            state
                .terminal_reason
                .as_deref()
                .is_some_and(|r| r.starts_with("No progress in last 3 steps"))
        );
    }
}
