//! Role invocation backends.
//!
//! The [`RoleExecutor`] trait decouples step orchestration from how a role is
//! actually run. The default backend spawns a configured command, feeds it the
//! [`RoleInput`] as JSON on stdin and reads a role update from stdout. Tests use
//! scripted executors that return predetermined updates without spawning
//! processes.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::role_output::parse_role_update;
use crate::core::state::{RoleInput, RoleUpdate};
use crate::core::types::Role;
use crate::io::process::{CommandSpec, run_command};

/// Parameters for one role invocation.
#[derive(Debug, Clone)]
pub struct RoleRequest {
    pub role: Role,
    pub input: RoleInput,
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Where to write the role's stdout/stderr, if anywhere.
    pub log_path: Option<PathBuf>,
}

/// Abstraction over role backends.
pub trait RoleExecutor {
    /// Run the role and return its decoded update.
    fn invoke(&self, request: &RoleRequest) -> Result<RoleUpdate>;
}

/// Executor that spawns `request.argv` as a child process.
pub struct ProcessRoleExecutor;

impl RoleExecutor for ProcessRoleExecutor {
    #[instrument(skip_all, fields(role = %request.role, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &RoleRequest) -> Result<RoleUpdate> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("no command configured for role {}", request.role))?;
        info!(program = %program, "starting role");

        let payload = serde_json::to_vec(&request.input).context("serialize role input")?;
        let result = run_command(&CommandSpec {
            program,
            args,
            workdir: &request.workdir,
            stdin: Some(&payload),
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
        })
        .with_context(|| format!("run role {}", request.role))?;

        if let Some(path) = &request.log_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create role log dir {}", parent.display()))?;
            }
            fs::write(path, result.log_text())
                .with_context(|| format!("write role log {}", path.display()))?;
        }

        if result.timed_out {
            warn!("role timed out");
            return Err(anyhow!(
                "role {} timed out after {:?}",
                request.role,
                request.timeout
            ));
        }
        if !result.success() {
            warn!(exit_code = ?result.exit_code, "role exited with failure");
            return Err(anyhow!(
                "role {} exited with status {:?}",
                request.role,
                result.exit_code
            ));
        }

        let update = parse_role_update(&result.stdout)
            .with_context(|| format!("decode {} output", request.role))?;
        debug!(next = %update.next, "role update decoded");
        Ok(update)
    }
}
