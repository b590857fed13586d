//! Process-wide child reaper.
//!
//! The driver marks itself as child subreaper, so helpers that daemonize
//! (mount helpers start tunnel processes) are re-parented to it. One
//! background task collects every exited child with `waitpid(-1, WNOHANG)`
//! on SIGCHLD and on a periodic tick. Children spawned through
//! [`Reaper::spawn`] get their exit status delivered; everything else is
//! discarded.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::metrics;

/// Fallback interval in case SIGCHLD deliveries coalesce or get lost.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self == ExitStatus::Code(0)
    }
}

impl Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal(sig) => write!(f, "signal {}", sig),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    waiters: Mutex<HashMap<i32, oneshot::Sender<ExitStatus>>>,
}

impl Inner {
    fn waiters(&self) -> MutexGuard<'_, HashMap<i32, oneshot::Sender<ExitStatus>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collect every exited child. Returns how many were reaped.
    fn reap_all(&self) -> usize {
        // Holding the waiter lock keeps `spawn` from registering a pid
        // between fork and insert while we collect it.
        let mut waiters = self.waiters();
        let mut reaped = 0;

        loop {
            let (pid, status) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => (pid, ExitStatus::Code(code)),
                Ok(WaitStatus::Signaled(pid, sig, _)) => (pid, ExitStatus::Signal(sig as i32)),
                Ok(other) => {
                    trace!(status = ?other, "Ignoring non-terminal wait status");
                    continue;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            };

            reaped += 1;
            match waiters.remove(&pid.as_raw()) {
                Some(tx) => {
                    debug!(pid = pid.as_raw(), %status, "Child exited");
                    // Receiver may have given up (timeout); nothing to do then
                    let _ = tx.send(status);
                }
                None => {
                    debug!(pid = pid.as_raw(), %status, "Reaped orphaned child");
                    metrics::record_orphan_reaped();
                }
            }
        }

        reaped
    }
}

/// Handle to the process-wide reaper. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Reaper {
    inner: Arc<Inner>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` and register it for exit notification.
    ///
    /// The returned [`Child`] must not be waited on; its exit status arrives
    /// on the receiver once the reaper collects it.
    pub fn spawn(&self, command: &mut Command) -> io::Result<(Child, oneshot::Receiver<ExitStatus>)> {
        let mut waiters = self.inner.waiters();
        let child = command.spawn()?;
        let (tx, rx) = oneshot::channel();
        waiters.insert(child.id() as i32, tx);
        Ok((child, rx))
    }

    /// Number of spawned children whose exit has not been collected yet.
    pub fn pending(&self) -> usize {
        self.inner.waiters().len()
    }

    /// Become child subreaper and start the reaping loop.
    ///
    /// The loop runs until `shutdown` flips to true.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> io::Result<JoinHandle<()>> {
        #[cfg(target_os = "linux")]
        if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
            warn!(error = %e, "Could not become child subreaper; only direct children will be reaped");
        }

        let mut sigchld = signal(SignalKind::child())?;
        let inner = self.inner.clone();

        info!("Starting child reaper");
        Ok(tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sigchld.recv() => {}
                    _ = tick.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                inner.reap_all();
            }

            // Collect whatever exited during shutdown
            inner.reap_all();
            info!("Child reaper stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::Code(1).success());
        assert!(!ExitStatus::Signal(9).success());
        assert_eq!(ExitStatus::Code(32).to_string(), "exit code 32");
        assert_eq!(ExitStatus::Signal(15).to_string(), "signal 15");
    }
}
