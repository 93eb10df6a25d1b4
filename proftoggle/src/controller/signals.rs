//! Signal delivery into the agent's control channel.
//!
//! Handlers never touch the controller. Each signal becomes a
//! [`ControlMessage`] and the agent loop handles it in order with everything
//! else.

use std::sync::mpsc as std_mpsc;

use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use super::session::SessionState;
use crate::domain::{Artifact, Signal};

/// Reply channel for requests that wait on the agent.
pub type Reply = std_mpsc::Sender<Vec<Artifact>>;

#[derive(Debug)]
pub enum ControlMessage {
    /// Start both sub-profilers, or stop and write them if either runs.
    Toggle { reply: Option<Reply> },
    /// A delivered signal.
    Signal(Signal),
    /// Graceful exit: stop, write, render and wait for the renders.
    Exit { done: Reply },
    /// Report the session state.
    Status { reply: std_mpsc::Sender<SessionState> },
}

impl ControlMessage {
    #[must_use]
    pub fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::Toggle => ControlMessage::Toggle { reply: None },
            other => ControlMessage::Signal(other),
        }
    }
}

/// Register SIGUSR2, SIGINT and SIGTERM and forward them to `tx`.
///
/// Must be called from inside the agent runtime.
///
/// # Errors
/// Fails when a handler cannot be registered.
#[cfg(unix)]
pub fn spawn_signal_listener(tx: UnboundedSender<ControlMessage>) -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr2 = signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2 handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = usr2.recv() => Signal::Toggle,
                Some(()) = sigint.recv() => Signal::Interrupt,
                Some(()) = sigterm.recv() => Signal::Terminate,
                else => break,
            };
            debug!("Received {received}");
            if tx.send(ControlMessage::from_signal(received)).is_err() {
                break;
            }
        }
    });
    Ok(())
}

/// Ctrl+C only; there is no SIGUSR2 off Unix.
///
/// # Errors
/// Never fails; the signature matches the Unix version.
#[cfg(not(unix))]
pub fn spawn_signal_listener(tx: UnboundedSender<ControlMessage>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("Received Ctrl+C");
            if tx.send(ControlMessage::Signal(Signal::Interrupt)).is_err() {
                break;
            }
        }
    });
    Ok(())
}

/// Hand SIGINT and SIGTERM back to the OS default and ignore SIGUSR2.
///
/// Used once the agent can no longer consume the registered streams, so
/// Ctrl+C and SIGTERM end the process again and a stray toggle is harmless.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn restore_default_handlers() {
    for (signal, disposition) in [
        (libc::SIGINT, libc::SIG_DFL),
        (libc::SIGTERM, libc::SIG_DFL),
        (libc::SIGUSR2, libc::SIG_IGN),
    ] {
        // SAFETY: installs one of the predefined dispositions; no handler
        // code of ours runs in signal context.
        if unsafe { libc::signal(signal, disposition) } == libc::SIG_ERR {
            log::warn!("Failed to restore disposition of signal {signal}");
        }
    }
}

#[cfg(not(unix))]
pub fn restore_default_handlers() {}
