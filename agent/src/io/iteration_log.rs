//! Per-step logs under `.agent/iterations/<run_id>/<step>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::state::{RoleUpdate, ToolRecord};
use crate::core::types::{Next, Role, Terminal};

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub step: u32,
    pub role: Role,
    pub next: Next,
    pub revision: u64,
    pub terminal_status: Option<Terminal>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub update_path: PathBuf,
    pub tools_path: PathBuf,
    pub role_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, run_id: &str, step: u32) -> Self {
        let dir = iterations_dir.join(run_id).join(step.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            update_path: dir.join("update.json"),
            tools_path: dir.join("tools.json"),
            role_log_path: dir.join("role.log"),
        }
    }
}

pub struct IterationWriteRequest<'a> {
    pub paths: &'a IterationPaths,
    pub meta: &'a IterationMeta,
    /// Absent when the step never reached the role (ceilings).
    pub update: Option<&'a RoleUpdate>,
    pub tools: &'a [ToolRecord],
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<()> {
    let paths = request.paths;
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    if let Some(update) = request.update {
        write_json(&paths.update_path, update)?;
    }
    if !request.tools.is_empty() {
        write_json(&paths.tools_path, &request.tools)?;
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
