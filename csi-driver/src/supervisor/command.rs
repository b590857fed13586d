//! One-shot external commands with a deadline.

use std::ffi::OsStr;
use std::io;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::reaper::{ExitStatus, Reaper};

/// How long to wait for output pipes after the process exited. A daemonized
/// grandchild may keep them open indefinitely; reading stops after this.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("lost track of {program}: reaper stopped")]
    Lost { program: String },
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stderr if the command wrote any, otherwise stdout, trimmed.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs commands as children registered with the [`Reaper`].
#[derive(Debug, Clone)]
pub struct CommandRunner {
    reaper: Reaper,
}

impl CommandRunner {
    pub fn new(reaper: Reaper) -> Self {
        Self { reaper }
    }

    /// Run `program` with `args`, killing it once `timeout` elapses.
    pub async fn run<I, S>(
        &self,
        program: &str,
        args: I,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (mut child, exited) = self
            .reaper
            .spawn(&mut command)
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!(program, pid = pid.as_raw(), "Started command");

        let stdout = child
            .stdout
            .take()
            .and_then(|pipe| async_pipe(program, ChildStdout::from_std(pipe)))
            .map(Drain::start);
        let stderr = child
            .stderr
            .take()
            .and_then(|pipe| async_pipe(program, ChildStderr::from_std(pipe)))
            .map(Drain::start);

        let status = match tokio::time::timeout(timeout, exited).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                return Err(CommandError::Lost {
                    program: program.to_string(),
                });
            }
            Err(_) => {
                warn!(program, pid = pid.as_raw(), ?timeout, "Command timed out, killing it");
                if let Err(e) = kill(pid, Signal::SIGKILL) {
                    warn!(program, error = %e, "Failed to kill timed out command");
                }
                for pipe in [stdout, stderr].into_iter().flatten() {
                    pipe.stop();
                }
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                });
            }
        };

        Ok(CommandOutput {
            status,
            stdout: Drain::finish(stdout).await,
            stderr: Drain::finish(stderr).await,
        })
    }
}

fn async_pipe<P>(program: &str, pipe: io::Result<P>) -> Option<P> {
    pipe.inspect_err(|e| warn!(program, error = %e, "Cannot capture command output"))
        .ok()
}

/// Background reader of one output pipe.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Drain {
    fn start<R>(mut pipe: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, task }
    }

    /// Stop reading; dropping the read end releases the pipe.
    fn stop(self) {
        self.task.abort();
    }

    /// Output read until EOF or [`PIPE_DRAIN_TIMEOUT`], whichever is first.
    async fn finish(drain: Option<Self>) -> String {
        let Some(mut drain) = drain else {
            return String::new();
        };
        if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut drain.task)
            .await
            .is_err()
        {
            drain.task.abort();
        }
        let buf = drain.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}
