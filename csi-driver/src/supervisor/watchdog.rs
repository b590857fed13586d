//! Supervision of the mount tunnel helper.
//!
//! The helper keeps TLS tunnels of active mounts alive, so it has to run for
//! as long as the node service does. A crashed helper is restarted with
//! exponential backoff; the current state is published on a `watch` channel
//! that the identity and node services read.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::reaper::{ExitStatus, Reaper};
use crate::config::EFS_UTILS_CONFIG_FILE;
use crate::metrics;

/// Helper binary shipped with efs-utils.
pub const WATCHDOG_PROGRAM: &str = "amazon-efs-mount-watchdog";

/// Consecutive failed restarts after which the helper counts as failing.
pub const FAILING_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Crashed,
    Stopped,
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogStatus {
    pub state: ProcessState,
    /// Restarts since the watchdog was started
    pub restarts: u64,
    /// Crashes or failed spawns since the helper last ran healthy
    pub consecutive_failures: u32,
}

impl WatchdogStatus {
    const fn new(state: ProcessState) -> Self {
        Self {
            state,
            restarts: 0,
            consecutive_failures: 0,
        }
    }

    /// True when restarting keeps failing and mounts should not be attempted.
    pub fn is_failing(&self) -> bool {
        self.state == ProcessState::Stopped || self.consecutive_failures >= FAILING_THRESHOLD
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited during startup with {status}")]
    ExitedDuringStartup { program: String, status: ExitStatus },

    #[error("failed to seed {path}: {source}")]
    Seed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub program: String,
    pub args: Vec<String>,
    /// efs-utils configuration directory the helper reads
    pub config_dir: PathBuf,
    /// Pristine copies of the efs-utils configuration files
    pub static_files_dir: PathBuf,
    /// The helper must stay up this long for the first start to count
    pub startup_grace: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Uptime after which backoff and failure count reset
    pub healthy_after: Duration,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_timeout: Duration,
}

impl WatchdogConfig {
    pub fn new(config_dir: PathBuf, static_files_dir: PathBuf) -> Self {
        Self {
            program: WATCHDOG_PROGRAM.to_string(),
            args: Vec::new(),
            config_dir,
            static_files_dir,
            startup_grace: Duration::from_secs(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            healthy_after: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Copy the static efs-utils configuration into the config directory unless
/// one is already there. Returns true when a file was copied.
pub fn seed_config(config_dir: &Path, static_files_dir: &Path) -> Result<bool, WatchdogError> {
    let target = config_dir.join(EFS_UTILS_CONFIG_FILE);
    if target.exists() {
        return Ok(false);
    }

    let source = static_files_dir.join(EFS_UTILS_CONFIG_FILE);
    if !source.exists() {
        warn!(path = %source.display(), "No static efs-utils configuration to seed from");
        return Ok(false);
    }

    std::fs::create_dir_all(config_dir).map_err(|source| WatchdogError::Seed {
        path: config_dir.to_path_buf(),
        source,
    })?;
    std::fs::copy(&source, &target).map_err(|source| WatchdogError::Seed {
        path: target.clone(),
        source,
    })?;

    info!(path = %target.display(), "Seeded efs-utils configuration");
    Ok(true)
}

struct Running {
    pid: Pid,
    exited: oneshot::Receiver<ExitStatus>,
    since: Instant,
}

/// Handle to the supervised helper.
pub struct Watchdog {
    status: watch::Receiver<WatchdogStatus>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Start the helper and its supervision loop.
    ///
    /// Fails if the helper cannot be spawned or exits within the startup
    /// grace period; later crashes are handled by restarting.
    pub async fn start(config: WatchdogConfig, reaper: Reaper) -> Result<Self, WatchdogError> {
        seed_config(&config.config_dir, &config.static_files_dir)?;

        let mut child = spawn(&config, &reaper)?;
        if let Ok(status) = tokio::time::timeout(config.startup_grace, &mut child.exited).await {
            let status = status.unwrap_or(ExitStatus::Signal(0));
            error!(program = %config.program, %status, "Helper exited during startup");
            return Err(WatchdogError::ExitedDuringStartup {
                program: config.program.clone(),
                status,
            });
        }

        info!(program = %config.program, pid = child.pid.as_raw(), "Helper running");
        let (status_tx, status_rx) = watch::channel(WatchdogStatus::new(ProcessState::Running));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(supervise(config, reaper, child, status_tx, stop_rx));

        Ok(Self {
            status: status_rx,
            stop: stop_tx,
            task,
        })
    }

    /// Receiver for state changes.
    pub fn subscribe(&self) -> watch::Receiver<WatchdogStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> WatchdogStatus {
        *self.status.borrow()
    }

    /// Stop the helper. `Stopped` is terminal.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Watchdog task failed");
        }
    }
}

fn spawn(config: &WatchdogConfig, reaper: &Reaper) -> Result<Running, WatchdogError> {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let (child, exited) = reaper
        .spawn(&mut command)
        .map_err(|source| WatchdogError::Spawn {
            program: config.program.clone(),
            source,
        })?;

    Ok(Running {
        pid: Pid::from_raw(child.id() as i32),
        exited,
        since: Instant::now(),
    })
}

/// Wait for `rx` to flip to true. Returns on sender drop too.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn supervise(
    config: WatchdogConfig,
    reaper: Reaper,
    first: Running,
    status_tx: watch::Sender<WatchdogStatus>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut status = WatchdogStatus::new(ProcessState::Running);
    let mut backoff = config.initial_backoff;
    let mut current = Some(first);

    loop {
        if let Some(mut running) = current.take() {
            let healthy = tokio::time::sleep(config.healthy_after);
            tokio::pin!(healthy);
            let mut healthy_reported = false;

            let exit = loop {
                tokio::select! {
                    exit = &mut running.exited => break exit.unwrap_or(ExitStatus::Signal(0)),
                    _ = &mut healthy, if !healthy_reported => {
                        healthy_reported = true;
                        if status.consecutive_failures > 0 {
                            info!(program = %config.program, "Helper healthy again");
                        }
                        backoff = config.initial_backoff;
                        status.consecutive_failures = 0;
                        let _ = status_tx.send(status);
                    }
                    _ = stopped(&mut stop_rx) => {
                        terminate(&config, running).await;
                        status.state = ProcessState::Stopped;
                        let _ = status_tx.send(status);
                        info!(program = %config.program, "Helper stopped");
                        return;
                    }
                }
            };

            if running.since.elapsed() < config.healthy_after {
                status.consecutive_failures += 1;
            }
            warn!(
                program = %config.program,
                %exit,
                consecutive_failures = status.consecutive_failures,
                "Helper exited unexpectedly"
            );
        }

        status.state = ProcessState::Crashed;
        let _ = status_tx.send(status);

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stopped(&mut stop_rx) => {
                status.state = ProcessState::Stopped;
                let _ = status_tx.send(status);
                info!(program = %config.program, "Helper stopped while waiting to restart");
                return;
            }
        }
        backoff = (backoff * 2).min(config.max_backoff);

        status.state = ProcessState::Starting;
        let _ = status_tx.send(status);

        match spawn(&config, &reaper) {
            Ok(running) => {
                status.restarts += 1;
                status.state = ProcessState::Running;
                let _ = status_tx.send(status);
                metrics::record_watchdog_restart(true);
                info!(
                    program = %config.program,
                    pid = running.pid.as_raw(),
                    restarts = status.restarts,
                    "Helper restarted"
                );
                current = Some(running);
            }
            Err(e) => {
                status.consecutive_failures += 1;
                metrics::record_watchdog_restart(false);
                error!(
                    error = %e,
                    consecutive_failures = status.consecutive_failures,
                    "Failed to restart helper"
                );
            }
        }
    }
}

/// SIGTERM, then SIGKILL if the helper does not exit in time.
async fn terminate(config: &WatchdogConfig, mut running: Running) {
    if let Err(e) = kill(running.pid, Signal::SIGTERM) {
        warn!(error = %e, "Failed to signal helper");
        return;
    }

    if tokio::time::timeout(config.stop_timeout, &mut running.exited)
        .await
        .is_err()
    {
        warn!(program = %config.program, "Helper ignored SIGTERM, killing it");
        let _ = kill(running.pid, Signal::SIGKILL);
        let _ = tokio::time::timeout(config.stop_timeout, running.exited).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_failing() {
        let mut status = WatchdogStatus::new(ProcessState::Running);
        assert!(!status.is_failing());

        status.consecutive_failures = FAILING_THRESHOLD - 1;
        assert!(!status.is_failing());

        status.consecutive_failures = FAILING_THRESHOLD;
        assert!(status.is_failing());

        assert!(WatchdogStatus::new(ProcessState::Stopped).is_failing());
    }

    #[test]
    fn test_seed_config() {
        let tmp = TempDir::new().unwrap();
        let static_dir = tmp.path().join("static");
        let config_dir = tmp.path().join("config");
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(static_dir.join(EFS_UTILS_CONFIG_FILE), "[mount]\nstunnel_debug_enabled = false\n").unwrap();

        assert!(seed_config(&config_dir, &static_dir).unwrap());
        let seeded = std::fs::read_to_string(config_dir.join(EFS_UTILS_CONFIG_FILE)).unwrap();
        assert!(seeded.contains("stunnel_debug_enabled"));

        // Existing configuration is never overwritten
        std::fs::write(config_dir.join(EFS_UTILS_CONFIG_FILE), "custom").unwrap();
        assert!(!seed_config(&config_dir, &static_dir).unwrap());
        assert_eq!(
            std::fs::read_to_string(config_dir.join(EFS_UTILS_CONFIG_FILE)).unwrap(),
            "custom"
        );
    }

    #[test]
    fn test_seed_config_without_static_files() {
        let tmp = TempDir::new().unwrap();
        assert!(!seed_config(&tmp.path().join("config"), &tmp.path().join("missing")).unwrap());
    }
}
