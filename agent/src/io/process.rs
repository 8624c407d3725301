//! Child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured result of one command.
///
/// A killed child (timeout) has `exit_code == None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub killed: bool,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout and stderr joined for classification and diagnostics.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Human-readable dump used for `role.log`.
    pub fn log_text(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout);
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        if self.timed_out {
            buf.push_str("\n[timed out]\n");
        }
        buf
    }
}

/// What to run and how.
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub workdir: &'a Path,
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds what is kept
/// per stream; the rest is drained and replaced by a truncation notice. On timeout the child is
/// killed and the result reports `timed_out` and `killed`.
#[instrument(skip_all, fields(program = spec.program, timeout_secs = spec.timeout.as_secs()))]
pub fn run_command(spec: &CommandSpec<'_>) -> Result<CommandResult> {
    let mut cmd = Command::new(spec.program);
    cmd.args(spec.args).current_dir(spec.workdir);
    if spec.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", spec.program));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = spec.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    if let Some(input) = spec.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin closes the pipe; that is not our failure.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(spec.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let exit_code = if timed_out { None } else { status.code() };
    debug!(?exit_code, timed_out, duration_ms, "command finished");
    Ok(CommandResult {
        command: spec.program.to_string(),
        args: spec.args.to_vec(),
        exit_code,
        stdout: render_stream(&stdout, stdout_truncated, "stdout"),
        stderr: render_stream(&stderr, stderr_truncated, "stderr"),
        timed_out,
        killed: timed_out,
        duration_ms,
    })
}

fn render_stream(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
