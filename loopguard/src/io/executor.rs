//! Executor abstraction for the coding-agent subprocess.
//!
//! The [`Executor`] trait is a capability with three operations so the
//! controller can poll for completion, honour deadlines and cancel. Tests use
//! scripted executors that never spawn processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::TokenUsage;
use crate::io::process::{CommandOutput, RunningCommand, spawn_command};

/// Placeholder replaced with the model name in the agent argv.
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Rendered instruction, fed on stdin.
    pub instruction: String,
    pub model: String,
}

/// What the agent left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Token usage reported on stdout, if any.
    pub usage: Option<TokenUsage>,
}

/// Abstraction over agent backends.
pub trait Executor {
    type Handle;

    /// Launch the agent. Errors mean it never started.
    fn start(&self, request: &ExecRequest) -> Result<Self::Handle>;

    /// Wait up to `slice`; `Some` once the agent has exited.
    fn wait(&self, handle: &mut Self::Handle, slice: Duration) -> Result<Option<ExecOutput>>;

    /// Terminate the agent and collect what it produced.
    fn kill(&self, handle: Self::Handle) -> Result<ExecOutput>;
}

/// Executor that spawns the configured agent command.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl ProcessExecutor {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }

    /// The agent argv with the model substituted.
    pub fn argv(&self, model: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(MODEL_PLACEHOLDER, model))
            .collect()
    }
}

/// A running agent. Emptied once the process has been reaped.
#[derive(Debug)]
pub struct ProcessHandle {
    running: Option<RunningCommand>,
}

impl Executor for ProcessExecutor {
    type Handle = ProcessHandle;

    #[instrument(skip_all, fields(workdir = %request.workdir.display(), model = %request.model))]
    fn start(&self, request: &ExecRequest) -> Result<ProcessHandle> {
        let argv = self.argv(&request.model);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let running = spawn_command(
            cmd,
            Some(request.instruction.clone().into_bytes()),
            self.output_limit_bytes,
        )?;
        info!(pid = running.id(), program = %program, "agent started");
        Ok(ProcessHandle {
            running: Some(running),
        })
    }

    fn wait(&self, handle: &mut ProcessHandle, slice: Duration) -> Result<Option<ExecOutput>> {
        let running = handle
            .running
            .as_mut()
            .ok_or_else(|| anyhow!("agent already reaped"))?;
        let Some(status) = running.wait_for(slice)? else {
            return Ok(None);
        };
        let running = handle
            .running
            .take()
            .ok_or_else(|| anyhow!("agent already reaped"))?;
        let output = running.finish(status, false)?;
        debug!(exit_code = ?output.exit_code(), "agent exited");
        Ok(Some(exec_output(&output)))
    }

    fn kill(&self, mut handle: ProcessHandle) -> Result<ExecOutput> {
        let running = handle
            .running
            .take()
            .ok_or_else(|| anyhow!("agent already reaped"))?;
        warn!(pid = running.id(), "killing agent");
        let output = running.kill()?;
        Ok(exec_output(&output))
    }
}

fn exec_output(output: &CommandOutput) -> ExecOutput {
    let mut stdout = output.stdout_text();
    stdout.push_str(&output.stdout_truncated_notice("agent"));
    let mut stderr = output.stderr_text();
    stderr.push_str(&output.stderr_truncated_notice("agent"));
    let usage = TokenUsage::scan(&stdout);
    ExecOutput {
        exit_code: output.exit_code(),
        stdout,
        stderr,
        timed_out: output.timed_out,
        usage,
    }
}

/// Write the agent transcript for one attempt.
pub fn write_executor_log(path: &Path, output: &ExecOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str(&format!("exit code: {:?}\n", output.exit_code));
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout);
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr);
    if output.timed_out {
        buf.push_str("\n[executor timed out]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        fs::write(path, truncated)
            .with_context(|| format!("write executor log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}
