//! Autonomous code-modification agent.
//!
//! Drives a workflow of specialized roles (planner, coder, verifier, ...)
//! against the codebase in the current directory, under budget and progress
//! limits, and records every step under `.agent/`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use agent::core::classifier::classify;
use agent::core::diagnostics::{self, DiagnosticSource};
use agent::core::role_output::{RoleOutputError, parse_role_update};
use agent::core::tolerant_json;
use agent::exit_codes;
use agent::io::config::load_config;
use agent::io::executor::ProcessRoleExecutor;
use agent::io::init::{AgentPaths, InitOptions, init_agent};
use agent::io::patch_file::{PatchLimits, apply_patch_file};
use agent::io::tools::ProcessToolRunner;
use agent::logging;
use agent::looping::{WorkflowOptions, run_workflow};
use agent::start::{StartRequest, start_run};
use agent::step::StepOutcome;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "agent",
    version,
    about = "Budgeted multi-role code-modification agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.agent/` with a default config.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run and drive it to a terminal status.
    Run {
        /// What the run should achieve.
        #[arg(long)]
        goal: String,
        /// Ticket the run works on.
        #[arg(long)]
        ticket: Option<String>,
        /// Execution profile (strict, fast, smoke, yolo).
        #[arg(long)]
        profile: Option<String>,
    },
    /// Continue the persisted run.
    Resume,
    /// Extract JSON from noisy text (FILE or stdin).
    Parse {
        file: Option<PathBuf>,
        /// Validate the result as a role update.
        #[arg(long)]
        role_update: bool,
    },
    /// Apply a unified diff to a file under the current directory.
    Apply {
        path: String,
        /// File holding the diff.
        #[arg(long)]
        diff: PathBuf,
    },
    /// Parse tool output (FILE or stdin) into diagnostics entries.
    Diagnose {
        /// build, test, lint, lsp or runtime.
        #[arg(long, value_parser = parse_source)]
        source: DiagnosticSource,
        file: Option<PathBuf>,
    },
    /// Classify a failed command's output (FILE or stdin).
    Classify {
        #[arg(long, allow_hyphen_values = true)]
        exit_code: Option<i32>,
        #[arg(long)]
        timed_out: bool,
        file: Option<PathBuf>,
    },
}

fn parse_source(value: &str) -> Result<DiagnosticSource, String> {
    DiagnosticSource::parse(value).ok_or_else(|| format!("unknown diagnostic source {value}"))
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run {
            goal,
            ticket,
            profile,
        } => cmd_run(
            &root,
            &StartRequest {
                goal,
                ticket,
                profile,
            },
        ),
        Command::Resume => cmd_resume(&root),
        Command::Parse { file, role_update } => cmd_parse(file.as_deref(), role_update),
        Command::Apply { path, diff } => cmd_apply(&root, &path, &diff),
        Command::Diagnose { source, file } => cmd_diagnose(source, file.as_deref()),
        Command::Classify {
            exit_code,
            timed_out,
            file,
        } => cmd_classify(exit_code, timed_out, file.as_deref()),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_agent(root, &InitOptions { force })?;
    println!("initialized {}", paths.agent_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, request: &StartRequest) -> Result<i32> {
    let started = start_run(root, request, Utc::now())?;
    println!(
        "run {} started (profile {})",
        started.state.run_id, started.state.profile
    );
    drive(root)
}

fn cmd_resume(root: &Path) -> Result<i32> {
    drive(root)
}

fn drive(root: &Path) -> Result<i32> {
    let paths = AgentPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let tools = ProcessToolRunner::from_config(&config, root);
    let outcome = run_workflow(
        root,
        &ProcessRoleExecutor,
        &tools,
        &WorkflowOptions::default(),
        print_step,
    )?;
    println!(
        "run {} finished: {} ({} steps, report {})",
        outcome.run_id,
        outcome
            .state
            .terminal_status
            .map_or("cancelled", |t| t.as_str()),
        outcome.steps_executed,
        outcome.report_path.display()
    );
    if let Some(reason) = &outcome.state.terminal_reason {
        println!("reason: {reason}");
    }
    Ok(outcome.stop.exit_code())
}

fn print_step(step: &StepOutcome) {
    if let Some(role) = step.role {
        println!("step {}: {role} → {}", step.step, step.next);
    }
}

fn cmd_parse(file: Option<&Path>, role_update: bool) -> Result<i32> {
    let raw = read_input(file)?;
    if role_update {
        return match parse_role_update(&raw) {
            Ok(update) => {
                println!("{}", serde_json::to_string_pretty(&update)?);
                Ok(exit_codes::OK)
            }
            Err(RoleOutputError::Parse(failure)) => {
                eprintln!("{}", serde_json::to_string_pretty(&failure)?);
                Ok(exit_codes::INVALID)
            }
            Err(err) => {
                eprintln!("{err}");
                Ok(exit_codes::INVALID)
            }
        };
    }
    match tolerant_json::parse(&raw) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(exit_codes::OK)
        }
        Err(failure) => {
            eprintln!("{}", serde_json::to_string_pretty(&failure)?);
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_apply(root: &Path, path: &str, diff_path: &Path) -> Result<i32> {
    let diff = fs::read_to_string(diff_path)
        .with_context(|| format!("read diff {}", diff_path.display()))?;
    let config = load_config(&AgentPaths::new(root).config_path)?;
    let limits = PatchLimits {
        max_file_bytes: config.max_file_bytes,
        thresholds: config.patch,
    };
    let outcome = apply_patch_file(root, path, &diff, &limits)?;
    println!(
        "{} {} ({:?})",
        if outcome.created { "created" } else { "patched" },
        path,
        outcome.mode
    );
    Ok(exit_codes::OK)
}

fn cmd_diagnose(source: DiagnosticSource, file: Option<&Path>) -> Result<i32> {
    let raw = read_input(file)?;
    let entries = diagnostics::merge(Vec::new(), diagnostics::parse(&raw, source, Utc::now()));
    println!("{}", diagnostics::summarize(&entries, entries.len().max(1)));
    Ok(exit_codes::OK)
}

fn cmd_classify(exit_code: Option<i32>, timed_out: bool, file: Option<&Path>) -> Result<i32> {
    let raw = read_input(file)?;
    println!("{}", classify(&raw, exit_code, timed_out));
    Ok(exit_codes::OK)
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            Ok(buf)
        }
    }
}
