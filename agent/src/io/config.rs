//! Agent configuration stored under `.agent/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetOverrides;
use crate::core::patch::PatchThresholds;
use crate::core::progress::DEFAULT_STUCK_WINDOW;
use crate::core::types::Role;

/// Agent configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults and a
/// missing file is equivalent to an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Declared profile name; unknown names resolve to `fast`.
    pub profile: Option<String>,

    /// Wall-clock ceiling for a whole run.
    pub max_run_seconds: u64,

    /// Number of identical trailing snapshots that count as stuck.
    pub stuck_window: usize,

    /// Coder turn budget; non-positive values mean "profile default".
    pub coder_max_turns: Option<i64>,

    pub command_timeout_secs: u64,

    pub role_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Refuse to patch files larger than this.
    pub max_file_bytes: u64,

    pub budget: BudgetOverrides,

    pub patch: PatchThresholds,

    pub roles: RolesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RolesConfig {
    /// Command used to invoke a role; the role name is appended as the last argument.
    pub command: Vec<String>,

    /// Per-role argv replacing `command` entirely (keyed by role name).
    pub overrides: BTreeMap<String, Vec<String>>,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            command: vec!["agent-role".to_string()],
            overrides: BTreeMap::new(),
        }
    }
}

impl RolesConfig {
    /// Argv for `role`, with the role name appended unless overridden.
    pub fn argv_for(&self, role: Role) -> Vec<String> {
        if let Some(argv) = self.overrides.get(role.as_str()) {
            return argv.clone();
        }
        let mut argv = self.command.clone();
        argv.push(role.as_str().to_string());
        argv
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            profile: None,
            max_run_seconds: 30 * 60,
            stuck_window: DEFAULT_STUCK_WINDOW,
            coder_max_turns: None,
            command_timeout_secs: 300,
            role_timeout_secs: 900,
            output_limit_bytes: 100_000,
            max_file_bytes: 1_000_000,
            budget: BudgetOverrides::default(),
            patch: PatchThresholds::default(),
            roles: RolesConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_run_seconds == 0 {
            return Err(anyhow!("max_run_seconds must be > 0"));
        }
        if self.stuck_window < 2 {
            return Err(anyhow!("stuck_window must be >= 2"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.role_timeout_secs == 0 {
            return Err(anyhow!("role_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_file_bytes == 0 {
            return Err(anyhow!("max_file_bytes must be > 0"));
        }
        for (name, value) in [
            ("patch.match_threshold", self.patch.match_threshold),
            ("patch.delete_threshold", self.patch.delete_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{name} must be within 0.0..=1.0"));
            }
        }
        if self.roles.command.is_empty() || self.roles.command[0].trim().is_empty() {
            return Err(anyhow!("roles.command must be a non-empty array"));
        }
        for (role, argv) in &self.roles.overrides {
            if Role::parse(role).is_none() {
                return Err(anyhow!("roles.overrides: unknown role {role}"));
            }
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(anyhow!("roles.overrides.{role} must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = AgentConfig {
            profile: Some("smoke".to_string()),
            coder_max_turns: Some(12),
            ..AgentConfig::default()
        };
        cfg.budget.max_commands = Some(4);
        cfg.roles
            .overrides
            .insert("coder".to_string(), vec!["./coder.sh".to_string()]);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "profile = \"strict\"\n\n[patch]\nmatch_threshold = 0.3\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.profile.as_deref(), Some("strict"));
        assert_eq!(cfg.patch.match_threshold, 0.3);
        assert_eq!(cfg.patch.delete_threshold, 0.5);
        assert_eq!(cfg.max_run_seconds, 1800);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "stuck_window = 1\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("stuck_window"));

        fs::write(&path, "[roles.overrides]\nreviewer = [\"x\"]\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn role_argv_appends_role_name() {
        let mut roles = RolesConfig::default();
        assert_eq!(roles.argv_for(Role::Coder), vec!["agent-role", "coder"]);
        roles
            .overrides
            .insert("planner".to_string(), vec!["plan".to_string(), "--fast".to_string()]);
        assert_eq!(roles.argv_for(Role::Planner), vec!["plan", "--fast"]);
    }
}
