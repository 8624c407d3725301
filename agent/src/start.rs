//! Orchestration for starting a new run.
//!
//! A "run" is a single workflow execution identified by a stable `run_id`.
//! Starting a run resolves the profile and budget, creates a fresh
//! [`RunState`] positioned at the planner and persists it so later steps (or
//! `agent resume`) can pick it up.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info};

use crate::core::budget::{BudgetState, Profile, resolve_profile};
use crate::core::state::RunState;
use crate::io::config::{AgentConfig, load_config};
use crate::io::init::{AgentPaths, InitOptions, init_agent};
use crate::io::run_state::write_run_state;

/// Inputs for `agent run`.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub goal: String,
    pub ticket: Option<String>,
    /// Profile name that wins over the configured one.
    pub profile: Option<String>,
}

/// Outcome of starting a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub state: RunState,
    pub config: AgentConfig,
}

/// Create and persist a new run in `root`.
///
/// Scaffolds `.agent/` when missing. Any previous run state is replaced.
pub fn start_run(root: &Path, request: &StartRequest, now: DateTime<Utc>) -> Result<StartOutcome> {
    debug!(root = %root.display(), "starting run");
    if request.goal.trim().is_empty() {
        return Err(anyhow!("goal must not be empty"));
    }

    let paths = AgentPaths::new(root);
    if !paths.agent_dir.exists() {
        init_agent(root, &InitOptions { force: false }).context("agent init")?;
    }
    let config = load_config(&paths.config_path)?;

    let declared = request
        .profile
        .as_deref()
        .or(config.profile.as_deref());
    let profile = resolve_profile(declared);
    if let Some(name) = declared
        && Profile::parse(name).is_none()
    {
        info!(declared = %name, fallback = %profile, "unknown profile, using fallback");
    }
    let budget = BudgetState::from_profile(profile, &config.budget);

    let run_id = generate_run_id(now);
    let state = RunState::new(
        run_id.clone(),
        request.goal.trim(),
        request.ticket.clone(),
        profile,
        budget,
        now,
    );
    write_run_state(&paths.run_state_path, &state)?;

    info!(run_id = %run_id, profile = %profile, "run started");
    Ok(StartOutcome { state, config })
}

/// `run-<yyyymmddThhmmss>-<4 hex>`; name order follows start time.
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().r#gen();
    format!("run-{}-{suffix:04x}", now.format("%Y%m%dT%H%M%S"))
}
