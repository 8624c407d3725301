//! Side-effecting tool backends invoked on behalf of roles.
//!
//! The [`ToolRunner`] trait decouples the engine from real processes and the
//! filesystem. Budget gating happens in the engine before any method here is
//! called; implementations only execute.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::AgentConfig;
use crate::io::patch_file::{ApplyError, FileApplyOutcome, PatchLimits, apply_patch_file};
use crate::io::process::{CommandResult, CommandSpec, run_command};

pub trait ToolRunner {
    /// Run a shell command line in the workspace.
    fn run_shell(&self, command: &str) -> Result<CommandResult>;

    /// Fetch a URL and return the response body.
    fn fetch(&self, url: &str) -> Result<String>;

    /// Apply a unified diff to a workspace file.
    fn apply_patch(&self, path: &str, diff: &str) -> Result<FileApplyOutcome, ApplyError>;
}

/// [`ToolRunner`] that shells out via `sh -c` inside the workspace root.
#[derive(Debug, Clone)]
pub struct ProcessToolRunner {
    pub root: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub patch_limits: PatchLimits,
}

impl ProcessToolRunner {
    pub fn from_config(cfg: &AgentConfig, root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            timeout: Duration::from_secs(cfg.command_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            patch_limits: PatchLimits {
                max_file_bytes: cfg.max_file_bytes,
                thresholds: cfg.patch,
            },
        }
    }
}

impl ToolRunner for ProcessToolRunner {
    #[instrument(skip_all, fields(command = %command))]
    fn run_shell(&self, command: &str) -> Result<CommandResult> {
        let args = vec!["-c".to_string(), command.to_string()];
        let mut result = run_command(&CommandSpec {
            program: "sh",
            args: &args,
            workdir: &self.root,
            stdin: None,
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })?;
        // Report the command line the role asked for rather than the shell wrapper.
        result.command = command.to_string();
        result.args = Vec::new();
        debug!(exit_code = ?result.exit_code, "shell command finished");
        Ok(result)
    }

    fn fetch(&self, url: &str) -> Result<String> {
        Err(anyhow!("web requests are not supported by this runner: {url}"))
    }

    fn apply_patch(&self, path: &str, diff: &str) -> Result<FileApplyOutcome, ApplyError> {
        apply_patch_file(&self.root, path, diff, &self.patch_limits)
    }
}
