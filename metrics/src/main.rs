mod cli;
mod report;

use std::path::PathBuf;

use agent::io::init::AgentPaths;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metrics", version, about = "Aggregate agent run reports")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize recent run reports.
    Report {
        /// Reports directory; defaults to `.agent/reports` under the current directory.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Number of most recent reports to include.
        #[arg(long, default_value_t = report::DEFAULT_WINDOW)]
        window: usize,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Report { dir, window, json } => {
            if window == 0 {
                bail!("--window must be at least 1");
            }
            let dir = match dir {
                Some(dir) => dir,
                None => {
                    let root = std::env::current_dir().context("resolve current directory")?;
                    AgentPaths::new(root).reports_dir
                }
            };
            cli::report(&dir, window, json)
        }
    }
}
