//! Multi-step driver for `agent run` and `agent resume`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::state::RunState;
use crate::core::types::Terminal;
use crate::exit_codes;
use crate::io::config::load_config;
use crate::io::executor::RoleExecutor;
use crate::io::init::AgentPaths;
use crate::io::report::write_report;
use crate::io::run_state::{load_run_state, write_run_state};
use crate::io::tools::ToolRunner;
use crate::step::{StepConfig, StepOutcome, run_step};

/// Reason why `run_workflow` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStop {
    /// The run reached a terminal status.
    Terminal(Terminal),
    /// The wall-clock budget ran out before a terminal status was reached.
    Cancelled,
}

impl WorkflowStop {
    pub fn exit_code(self) -> i32 {
        match self {
            WorkflowStop::Terminal(Terminal::Done) => exit_codes::OK,
            WorkflowStop::Terminal(Terminal::AbortedStuck) => exit_codes::ABORTED_STUCK,
            WorkflowStop::Terminal(Terminal::AbortedConstraint) => exit_codes::ABORTED_CONSTRAINT,
            WorkflowStop::Terminal(Terminal::AskHuman) => exit_codes::ASK_HUMAN,
            WorkflowStop::Cancelled => exit_codes::CANCELLED,
        }
    }
}

/// Summary of a workflow invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutcome {
    pub run_id: String,
    pub steps_executed: u32,
    pub stop: WorkflowStop,
    pub report_path: PathBuf,
    pub state: RunState,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowOptions {
    /// Replaces `max_run_seconds` from the config.
    pub max_run: Option<Duration>,
}

/// Drive the persisted run in `root` until it reaches a terminal status or
/// the wall-clock budget runs out.
///
/// State is persisted after every step and a report is written on exit, also
/// when a step fails with an I/O error. Only such failures are returned as
/// errors; aborts are reported via [`WorkflowStop`].
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_workflow<E, T, F>(
    root: &Path,
    executor: &E,
    tools: &T,
    options: &WorkflowOptions,
    mut on_step: F,
) -> Result<WorkflowOutcome>
where
    E: RoleExecutor + ?Sized,
    T: ToolRunner + ?Sized,
    F: FnMut(&StepOutcome),
{
    let paths = AgentPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let mut state = load_run_state(&paths.run_state_path)
        .with_context(|| format!("load {} (run `agent run` first)", paths.run_state_path.display()))?;

    let max_run = options
        .max_run
        .unwrap_or(Duration::from_secs(config.max_run_seconds));
    let deadline = Instant::now() + max_run;
    let mut step_config = StepConfig::from_config(&config, &paths);
    step_config.deadline = Some(deadline);
    info!(run_id = %state.run_id, max_run_secs = max_run.as_secs(), "workflow started");

    let mut steps_executed = 0u32;
    let stop = loop {
        if let Some(terminal) = state.terminal_status {
            break WorkflowStop::Terminal(terminal);
        }
        if remaining_budget(deadline).is_err() {
            warn!(run_id = %state.run_id, "run deadline passed");
            break WorkflowStop::Cancelled;
        }

        let outcome = match run_step(&mut state, executor, tools, &step_config, Utc::now())
            .and_then(|outcome| write_run_state(&paths.run_state_path, &state).map(|()| outcome))
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(persist_after_failure(&paths, &state, err)),
        };
        if outcome.deadline_passed {
            break WorkflowStop::Cancelled;
        }
        if outcome.invoked {
            steps_executed += 1;
        }
        on_step(&outcome);
    };

    let report_path = paths.report_path(&state.run_id);
    write_report(&report_path, &state, Utc::now())?;
    info!(run_id = %state.run_id, steps_executed, stop = ?stop, "workflow finished");
    Ok(WorkflowOutcome {
        run_id: state.run_id.clone(),
        steps_executed,
        stop,
        report_path,
        state,
    })
}

/// Best-effort write of state and report after a failed step.
///
/// The step may already have run tools and spent budget, so the state is
/// saved before the original error is handed back.
fn persist_after_failure(paths: &AgentPaths, state: &RunState, err: anyhow::Error) -> anyhow::Error {
    warn!(run_id = %state.run_id, err = %format!("{err:#}"), "step failed, persisting run");
    if let Err(write_err) = write_run_state(&paths.run_state_path, state) {
        warn!(err = %format!("{write_err:#}"), "could not persist run state");
    }
    if let Err(write_err) = write_report(&paths.report_path(&state.run_id), state, Utc::now()) {
        warn!(err = %format!("{write_err:#}"), "could not write report");
    }
    err
}
