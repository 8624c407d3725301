//! Execution profiles and per-run resource ceilings.
//!
//! A profile fixes how many commands, test runs and web requests a run may
//! spend, and which command classes it may execute at all. Ceilings are fixed
//! at run start; counters only move through [`BudgetState::check_and_consume`].

use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Global clamp for every configured ceiling and for coder turns.
pub const SAFETY_CEILING: u32 = 500;

/// Web-request ceiling shared by every profile unless overridden.
pub const DEFAULT_MAX_WEB_REQUESTS: u32 = 10;

/// Named policy bundle for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Strict,
    Fast,
    Smoke,
    Yolo,
}

/// Default limits attached to a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileLimits {
    pub max_commands: u32,
    pub max_test_runs: u32,
    pub allow_installs: bool,
    pub allow_app_run: bool,
    pub coder_turns: u32,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Strict => "strict",
            Profile::Fast => "fast",
            Profile::Smoke => "smoke",
            Profile::Yolo => "yolo",
        }
    }

    pub fn parse(value: &str) -> Option<Profile> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Profile::Strict),
            "fast" => Some(Profile::Fast),
            "smoke" => Some(Profile::Smoke),
            "yolo" => Some(Profile::Yolo),
            _ => None,
        }
    }

    pub fn limits(self) -> ProfileLimits {
        match self {
            Profile::Strict => ProfileLimits {
                max_commands: 20,
                max_test_runs: 5,
                allow_installs: true,
                allow_app_run: true,
                coder_turns: 30,
            },
            Profile::Fast => ProfileLimits {
                max_commands: 8,
                max_test_runs: 3,
                allow_installs: false,
                allow_app_run: true,
                coder_turns: 15,
            },
            Profile::Smoke => ProfileLimits {
                max_commands: 3,
                max_test_runs: 1,
                allow_installs: false,
                allow_app_run: false,
                coder_turns: 5,
            },
            Profile::Yolo => ProfileLimits {
                max_commands: 15,
                max_test_runs: 4,
                allow_installs: true,
                allow_app_run: true,
                coder_turns: 40,
            },
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Return the declared profile when valid, else `fast`.
pub fn resolve_profile(declared: Option<&str>) -> Profile {
    declared.and_then(Profile::parse).unwrap_or(Profile::Fast)
}

/// Resolve a configured value against a default.
///
/// Positive values override (clamped to [`SAFETY_CEILING`]); zero, negative
/// and absent values fall back to the default.
pub fn resolve_ceiling(default: u32, configured: Option<i64>) -> u32 {
    let value = match configured {
        Some(v) if v > 0 => u32::try_from(v).unwrap_or(u32::MAX),
        _ => default,
    };
    value.min(SAFETY_CEILING)
}

/// Effective turn budget for the coder role.
pub fn effective_turns(profile: Profile, configured: Option<i64>) -> u32 {
    resolve_ceiling(profile.limits().coder_turns, configured)
}

/// Explicit ceiling overrides from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetOverrides {
    pub max_commands: Option<i64>,
    pub max_test_runs: Option<i64>,
    pub max_web_requests: Option<i64>,
}

/// Budgeted resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Command,
    Test,
    WebRequest,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Command => "command",
            ResourceKind::Test => "test",
            ResourceKind::WebRequest => "web_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a governor check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    Allowed,
    Exhausted {
        kind: ResourceKind,
        used: u32,
        max: u32,
    },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allowed)
    }
}

/// Ceilings and counters for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub max_commands: u32,
    pub max_test_runs: u32,
    pub max_web_requests: u32,
    pub commands_used: u32,
    pub test_runs_used: u32,
    pub web_requests_used: u32,
    pub allow_installs: bool,
    pub allow_app_run: bool,
    pub command_history: Vec<CommandRecord>,
}

impl BudgetState {
    pub fn from_profile(profile: Profile, overrides: &BudgetOverrides) -> Self {
        let limits = profile.limits();
        Self {
            max_commands: resolve_ceiling(limits.max_commands, overrides.max_commands),
            max_test_runs: resolve_ceiling(limits.max_test_runs, overrides.max_test_runs),
            max_web_requests: resolve_ceiling(DEFAULT_MAX_WEB_REQUESTS, overrides.max_web_requests),
            commands_used: 0,
            test_runs_used: 0,
            web_requests_used: 0,
            allow_installs: limits.allow_installs,
            allow_app_run: limits.allow_app_run,
            command_history: Vec::new(),
        }
    }

    fn counter(&self, kind: ResourceKind) -> (u32, u32) {
        match kind {
            ResourceKind::Command => (self.commands_used, self.max_commands),
            ResourceKind::Test => (self.test_runs_used, self.max_test_runs),
            ResourceKind::WebRequest => (self.web_requests_used, self.max_web_requests),
        }
    }

    /// Consume one unit of `kind` if the ceiling allows it.
    ///
    /// A met ceiling leaves every counter and the history untouched.
    pub fn check_and_consume(
        &mut self,
        kind: ResourceKind,
        command: Option<&str>,
        now: DateTime<Utc>,
    ) -> BudgetDecision {
        let (used, max) = self.counter(kind);
        if used >= max {
            return BudgetDecision::Exhausted { kind, used, max };
        }
        match kind {
            ResourceKind::Command => self.commands_used += 1,
            ResourceKind::Test => self.test_runs_used += 1,
            ResourceKind::WebRequest => self.web_requests_used += 1,
        }
        if let (ResourceKind::Command | ResourceKind::Test, Some(command)) = (kind, command) {
            self.command_history.push(CommandRecord {
                command: command.to_string(),
                timestamp: now,
            });
        }
        BudgetDecision::Allowed
    }

    /// True once any counter has reached its ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted_reason().is_some()
    }

    /// Human-readable description of the first exhausted resource.
    pub fn exhausted_reason(&self) -> Option<String> {
        [
            ResourceKind::Command,
            ResourceKind::Test,
            ResourceKind::WebRequest,
        ]
        .into_iter()
        .find_map(|kind| {
            let (used, max) = self.counter(kind);
            (used >= max).then(|| format!("Budget exhausted: {} {used}/{max}", kind.as_str()))
        })
    }

    /// Reject commands the profile does not permit, before any budget is spent.
    pub fn gate_command(&self, command: &str) -> Option<String> {
        if !self.allow_installs && is_install_command(command) {
            return Some(format!("package installs are not allowed: {command}"));
        }
        if !self.allow_app_run && is_heavy_command(command) {
            return Some(format!("long-running processes are not allowed: {command}"));
        }
        None
    }
}

static INSTALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(npm\s+(install|i|add)\b|pnpm\s+(install|i|add)\b|yarn\s+(add|install)\b|pip3?\s+install\b|python3?\s+-m\s+pip\s+install\b|poetry\s+(add|install)\b|go\s+(get|install)\b|cargo\s+(add|install)\b)",
    )
    .unwrap()
});

static HEAVY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(npx\s+playwright\s+install\b|playwright\s+install\b|(npm|pnpm|yarn)\s+(run\s+)?(dev|start|serve|preview)\b|npx\s+(vite|next\s+dev)\b|vite(\s|$)|next\s+dev\b|cargo\s+watch\b|python3?\s+-m\s+http\.server\b|flask\s+run\b|uvicorn\b|docker(-|\s+)compose\s+up\b)",
    )
    .unwrap()
});

/// Whether `command` invokes a package-manager install.
pub fn is_install_command(command: &str) -> bool {
    INSTALL_RE.is_match(command)
}

/// Whether `command` starts a long-lived interactive or dev process.
pub fn is_heavy_command(command: &str) -> bool {
    HEAVY_RE.is_match(command)
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("run timed out"));
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_budget() -> BudgetState {
        BudgetState::from_profile(Profile::Fast, &BudgetOverrides::default())
    }

    #[test]
    fn unknown_profile_resolves_to_fast() {
        assert_eq!(resolve_profile(Some("turbo")), Profile::Fast);
        assert_eq!(resolve_profile(None), Profile::Fast);
        assert_eq!(resolve_profile(Some("STRICT")), Profile::Strict);
    }

    #[test]
    fn profile_defaults_match_table() {
        let smoke = BudgetState::from_profile(Profile::Smoke, &BudgetOverrides::default());
        assert_eq!((smoke.max_commands, smoke.max_test_runs), (3, 1));
        assert!(!smoke.allow_installs && !smoke.allow_app_run);

        let strict = BudgetState::from_profile(Profile::Strict, &BudgetOverrides::default());
        assert_eq!((strict.max_commands, strict.max_test_runs), (20, 5));
        assert_eq!(strict.max_web_requests, DEFAULT_MAX_WEB_REQUESTS);
    }

    #[test]
    fn check_and_consume_stops_at_ceiling_without_mutation() {
        let mut budget = fast_budget();
        let now = Utc::now();
        for i in 0..8 {
            let decision = budget.check_and_consume(ResourceKind::Command, Some("ls"), now);
            assert!(decision.is_allowed(), "command {i} should be allowed");
        }
        let before = budget.clone();
        let decision = budget.check_and_consume(ResourceKind::Command, Some("ls"), now);
        assert_eq!(
            decision,
            BudgetDecision::Exhausted {
                kind: ResourceKind::Command,
                used: 8,
                max: 8
            }
        );
        assert_eq!(budget, before);
        assert_eq!(budget.command_history.len(), 8);
    }

    #[test]
    fn web_requests_do_not_touch_history() {
        let mut budget = fast_budget();
        let decision = budget.check_and_consume(ResourceKind::WebRequest, None, Utc::now());
        assert!(decision.is_allowed());
        assert_eq!(budget.web_requests_used, 1);
        assert!(budget.command_history.is_empty());
    }

    #[test]
    fn exhaustion_is_reported_once_any_counter_is_full() {
        let mut budget = BudgetState::from_profile(Profile::Smoke, &BudgetOverrides::default());
        assert!(!budget.is_exhausted());
        budget.check_and_consume(ResourceKind::Test, Some("npm test"), Utc::now());
        assert!(budget.is_exhausted());
        assert_eq!(
            budget.exhausted_reason().as_deref(),
            Some("Budget exhausted: test 1/1")
        );
    }

    #[test]
    fn effective_turns_resolution() {
        assert_eq!(effective_turns(Profile::Fast, None), 15);
        assert_eq!(effective_turns(Profile::Fast, Some(0)), 15);
        assert_eq!(effective_turns(Profile::Fast, Some(-4)), 15);
        assert_eq!(effective_turns(Profile::Fast, Some(42)), 42);
        assert_eq!(effective_turns(Profile::Fast, Some(10_000)), SAFETY_CEILING);
    }

    #[test]
    fn overrides_replace_profile_ceilings() {
        let overrides = BudgetOverrides {
            max_commands: Some(2),
            max_test_runs: Some(-1),
            max_web_requests: Some(900),
        };
        let budget = BudgetState::from_profile(Profile::Strict, &overrides);
        assert_eq!(budget.max_commands, 2);
        assert_eq!(budget.max_test_runs, 5);
        assert_eq!(budget.max_web_requests, SAFETY_CEILING);
    }

    #[test]
    fn install_detection_is_prefix_anchored() {
        assert!(is_install_command("npm install left-pad"));
        assert!(is_install_command("  PIP install requests"));
        assert!(is_install_command("go get example.com/mod"));
        assert!(is_install_command("cargo add serde"));
        assert!(is_install_command("poetry add httpx"));
        assert!(!is_install_command("echo npm install"));
        assert!(!is_install_command("npm test"));
    }

    #[test]
    fn heavy_detection_covers_dev_servers() {
        assert!(is_heavy_command("npm run dev"));
        assert!(is_heavy_command("npx playwright install chromium"));
        assert!(is_heavy_command("docker compose up"));
        assert!(!is_heavy_command("npm run build"));
        assert!(!is_heavy_command("cargo test"));
    }

    #[test]
    fn gate_respects_profile_flags() {
        let fast = fast_budget();
        assert!(fast.gate_command("npm install").is_some());
        assert!(fast.gate_command("npm run dev").is_none());

        let smoke = BudgetState::from_profile(Profile::Smoke, &BudgetOverrides::default());
        assert!(smoke.gate_command("npm run dev").is_some());

        let yolo = BudgetState::from_profile(Profile::Yolo, &BudgetOverrides::default());
        assert!(yolo.gate_command("npm install").is_none());
    }
}
