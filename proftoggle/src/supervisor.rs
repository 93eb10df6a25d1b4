//! # Process Supervisor
//!
//! `proftoggle run -- <program>` launches one child with the controller
//! configuration in its environment and stays in front of it:
//!
//! ```text
//! SIGUSR2 ──────────────► relayed to child (toggle)
//! SIGINT / SIGTERM ─────► forwarded, wait grace window ──► SIGKILL
//! child exits ──────────► supervisor exits with the same code
//! ```
//!
//! A terminal Ctrl+C reaches the child directly as well; the agent's exit
//! guard absorbs the duplicate.

#![allow(unsafe_code)] // kill() requires unsafe

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::process::{Child, Command};

use crate::config::ControllerConfig;
use crate::domain::{Pid, Signal};

/// How long a child gets to exit after a forwarded SIGINT/SIGTERM.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Conventional status of a process killed by SIGKILL.
const KILLED_EXIT_CODE: i32 = 128 + 9;

pub struct ProcessSupervisor {
    config: ControllerConfig,
    extra_env: Vec<(String, String)>,
    kill_grace: Duration,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        Self { config, extra_env: Vec::new(), kill_grace: DEFAULT_KILL_GRACE }
    }

    /// Extra `KEY=VALUE` runtime settings passed through to the child.
    #[must_use]
    pub fn with_env(mut self, extra_env: Vec<(String, String)>) -> Self {
        self.extra_env = extra_env;
        self
    }

    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// The child command with the configuration in its environment.
    #[must_use]
    pub fn build_command(&self, program: &str, args: &[String]) -> Command {
        let mut command = Command::new(program);
        command.args(args).envs(self.config.to_env()).envs(self.extra_env.iter().map(|(k, v)| (k, v)));
        command
    }

    /// Launch `program` and supervise it until it exits.
    ///
    /// Returns the child's exit code, or 128 + signal when it was killed by
    /// a signal.
    ///
    /// # Errors
    /// Fails when the child cannot be spawned or signal handlers cannot be
    /// registered.
    #[cfg(unix)]
    pub async fn run(&self, program: &str, args: &[String]) -> Result<i32> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut usr2 = signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2 handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

        let mut child =
            self.build_command(program, args).spawn().with_context(|| format!("Failed to launch {program}"))?;
        let Some(pid) = child.id().map(Pid::from) else {
            // Already reaped
            return Ok(exit_code(child.wait().await?));
        };
        info!("Launched {program} ({pid})");

        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = exit_code(status.context("Failed to wait for child")?);
                    debug!("{program} exited with {code}");
                    return Ok(code);
                }
                Some(()) = usr2.recv() => {
                    debug!("Relaying SIGUSR2 to {pid}");
                    if let Err(e) = send_signal(pid, Signal::Toggle) {
                        warn!("Failed to relay SIGUSR2 to {pid}: {e}");
                    }
                }
                Some(()) = sigint.recv() => {
                    return stop_child(&mut child, Signal::Interrupt, self.kill_grace).await.map_err(Into::into);
                }
                Some(()) = sigterm.recv() => {
                    return stop_child(&mut child, Signal::Terminate, self.kill_grace).await.map_err(Into::into);
                }
            }
        }
    }

    /// Launch `program` and wait for it; only Ctrl+C is forwarded off Unix.
    ///
    /// # Errors
    /// Fails when the child cannot be spawned.
    #[cfg(not(unix))]
    pub async fn run(&self, program: &str, args: &[String]) -> Result<i32> {
        let mut child =
            self.build_command(program, args).spawn().with_context(|| format!("Failed to launch {program}"))?;
        tokio::select! {
            status = child.wait() => Ok(exit_code(status?)),
            _ = tokio::signal::ctrl_c() => {
                child.kill().await?;
                Ok(exit_code(child.wait().await?))
            }
        }
    }
}

/// Deliver `signal` to `pid`, wait up to `grace` for it to exit, then kill.
///
/// Returns the exit code the supervisor should report.
///
/// # Errors
/// Fails when waiting on or killing the child fails.
pub async fn stop_child(child: &mut Child, signal: Signal, grace: Duration) -> io::Result<i32> {
    if let Some(pid) = child.id().map(Pid::from) {
        info!("Forwarding {signal} to {pid}");
        if let Err(e) = send_signal(pid, signal) {
            warn!("Failed to forward {signal} to {pid}: {e}");
        }
    }

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return Ok(exit_code(status?));
    }

    warn!("Child still running {}ms after {signal}, killing it", grace.as_millis());
    child.kill().await?;
    let code = child.wait().await.map_or(KILLED_EXIT_CODE, exit_code);
    Ok(code)
}

/// Send `signal` to `pid`.
///
/// # Errors
/// Returns the OS error when `kill(2)` fails, e.g. the process is gone.
#[cfg(unix)]
pub fn send_signal(pid: Pid, signal: Signal) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions; failures are
    // reported through errno.
    let rc = unsafe { libc::kill(pid.0, signal.number()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: Pid, signal: Signal) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, format!("{signal} is not available on this platform")))
}

/// Exit code of the child, or 128 + signal when it was killed by one.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
