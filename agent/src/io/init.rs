//! Initialization helpers for `.agent/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{AgentConfig, write_config};

/// All canonical paths within `.agent/` for a project root.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub root: PathBuf,
    pub agent_dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let agent_dir = root.join(".agent");
        let state_dir = agent_dir.join("state");
        Self {
            root: root.clone(),
            agent_dir: agent_dir.clone(),
            state_dir: state_dir.clone(),
            iterations_dir: agent_dir.join("iterations"),
            reports_dir: agent_dir.join("reports"),
            gitignore_path: agent_dir.join(".gitignore"),
            config_path: agent_dir.join("config.toml"),
            run_state_path: state_dir.join("run_state.json"),
        }
    }

    pub fn report_path(&self, run_id: &str) -> PathBuf {
        self.reports_dir.join(format!("{run_id}.md"))
    }
}

/// Options for `init_agent`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing agent-owned files.
    pub force: bool,
}

/// Create `.agent/` scaffolding in `root`.
///
/// Fails if `.agent/` already exists unless `options.force` is set.
pub fn init_agent(root: &Path, options: &InitOptions) -> Result<AgentPaths> {
    let paths = AgentPaths::new(root);
    if paths.agent_dir.exists() && !paths.agent_dir.is_dir() {
        return Err(anyhow!("agent init: .agent exists but is not a directory"));
    }
    if paths.agent_dir.exists() && !options.force {
        return Err(anyhow!(
            "agent init: .agent already exists (use --force to overwrite)"
        ));
    }

    for dir in [
        &paths.agent_dir,
        &paths.state_dir,
        &paths.iterations_dir,
        &paths.reports_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, AGENT_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &AgentConfig::default())?;

    Ok(paths)
}

const AGENT_GITIGNORE: &str = "state/\niterations/\n";
