//! Child processes with hard timeouts and bounded output.
//!
//! Output is drained by reader threads while the child runs, so a chatty
//! child can never deadlock on a full pipe. Bytes beyond the output limit are
//! discarded (but still drained) and counted.

use std::env;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} {stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// Why a child could not be started.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command not found: {program}")]
    NotFound { program: String },
    #[error("permission denied: {program}")]
    PermissionDenied { program: String },
    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{stream} was not piped")]
    NotPiped { stream: &'static str },
}

type ReaderHandle = JoinHandle<Result<(Vec<u8>, usize)>>;

/// A spawned child whose output is being drained in the background.
#[derive(Debug)]
pub struct RunningCommand {
    child: Child,
    stdout: Option<ReaderHandle>,
    stderr: Option<ReaderHandle>,
    stdin: Option<JoinHandle<()>>,
}

/// Spawn `cmd` with piped stdio, feeding `stdin` (if any) from a writer thread.
pub fn spawn_command(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    output_limit_bytes: usize,
) -> Result<RunningCommand, SpawnError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Own process group, so a kill reaches `sh -c` grandchildren too.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = %program, "spawning child process");
    let mut child = cmd.spawn().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => SpawnError::NotFound {
            program: program.clone(),
        },
        io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
            program: program.clone(),
        },
        _ => SpawnError::Io {
            program: program.clone(),
            source,
        },
    })?;

    let stdin_handle = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .ok_or(SpawnError::NotPiped { stream: "stdin" })?;
            Some(thread::spawn(move || {
                // A child that exits without reading its input closes the pipe.
                if let Err(err) = pipe.write_all(&input)
                    && err.kind() != io::ErrorKind::BrokenPipe
                {
                    warn!(err = %err, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::NotPiped { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::NotPiped { stream: "stderr" })?;

    Ok(RunningCommand {
        child,
        stdout: Some(thread::spawn(move || read_stream_limited(stdout, output_limit_bytes))),
        stderr: Some(thread::spawn(move || read_stream_limited(stderr, output_limit_bytes))),
        stdin: stdin_handle,
    })
}

impl RunningCommand {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait up to `slice` for the child to exit.
    pub fn wait_for(&mut self, slice: Duration) -> Result<Option<ExitStatus>> {
        self.child.wait_timeout(slice).context("wait for command")
    }

    /// Kill the child with its process group and collect whatever it
    /// produced.
    pub fn kill(mut self) -> Result<CommandOutput> {
        self.kill_group();
        if let Err(err) = self.child.kill() {
            // Already exited between the last poll and now.
            debug!(err = %err, "kill failed");
        }
        let status = self.child.wait().context("wait command after kill")?;
        self.finish(status, true)
    }

    /// Join the reader threads after the child exited. Processes the child
    /// left behind in its group are killed first; they would otherwise hold
    /// the pipes open.
    pub fn finish(mut self, status: ExitStatus, timed_out: bool) -> Result<CommandOutput> {
        self.kill_group();
        if let Some(handle) = self.stdin.take()
            && handle.join().is_err()
        {
            warn!("stdin writer thread panicked");
        }
        let (stdout, stdout_truncated) = join_output(self.stdout.take()).context("join stdout")?;
        let (stderr, stderr_truncated) = join_output(self.stderr.take()).context("join stderr")?;

        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }
        debug!(exit_code = ?status.code(), timed_out, "command finished");
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out,
        })
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Ok(pid) = i32::try_from(self.child.id()) else {
            return;
        };
        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => debug!(err = %err, pgid = pid, "killpg failed"),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

/// Run a command to completion under a hard timeout.
///
/// On timeout the child is killed and the output collected so far is
/// returned with `timed_out` set. Spawn failures surface as [`SpawnError`]
/// inside the returned error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut running = spawn_command(cmd, stdin.map(<[u8]>::to_vec), output_limit_bytes)?;
    match running.wait_for(timeout)? {
        Some(status) => running.finish(status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            running.kill()
        }
    }
}

fn join_output(handle: Option<ReaderHandle>) -> Result<(Vec<u8>, usize)> {
    let Some(handle) = handle else {
        return Err(anyhow!("output already collected"));
    };
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
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

/// Last `max_chars` characters of `text`, on a char boundary.
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text.char_indices().nth(skip).map_or(0, |(index, _)| index);
    &text[start..]
}

/// Resolve `program` the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
