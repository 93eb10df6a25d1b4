//! # In-process Agent
//!
//! [`install`] spawns a dedicated thread that owns a current-thread tokio
//! runtime and the [`ProfilerController`]. Everything else talks to it
//! through a [`ControlMessage`] channel:
//!
//! ```text
//! SIGUSR2/SIGINT/SIGTERM ──► signal task ─┐
//! ProfilerHandle::{toggle, exit, drop} ───┴──► mpsc ──► agent loop ──► controller
//! ```
//!
//! ## Auto-start
//!
//! With `PROFTOGGLE_AUTOSTART` set the agent starts capture exactly once,
//! after the source map index is built:
//!
//! - `none`: before `install()` returns
//! - `until-started`: after `install()` returned and two scheduling rounds
//! - `<ms>`: after sleeping that long, without blocking signal handling
//!
//! ## Exit
//!
//! Dropping the [`ProfilerHandle`], calling [`ProfilerHandle::exit`],
//! SIGINT and SIGTERM all race for one [`ExitGuard`]. The winner flushes;
//! the others do nothing.
//!
//! A panic on the agent thread ends profiling for the process. The OS
//! dispositions of SIGINT and SIGTERM are restored so the program stays
//! killable, and a signal exit that was already under way still terminates
//! with its code.

use std::future::Future;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use proftoggle_common::DelayPolicy;
use tokio::sync::{mpsc, oneshot};

use super::exit_guard::ExitGuard;
use super::host::{HostRuntime, ProcessHost};
use super::session::SessionState;
use super::signals::{restore_default_handlers, spawn_signal_listener, ControlMessage};
use super::ProfilerController;
use crate::config::ControllerConfig;
use crate::domain::{Artifact, Signal};
use crate::sampling::Sampler;
use crate::sourcemap::SourcemapIndex;

const AGENT_THREAD_NAME: &str = "proftoggle-agent";

const NO_PENDING_EXIT: i32 = i32::MIN;

/// Overrides for [`install_with`].
pub struct AgentOptions {
    /// How the agent ends the process after SIGINT/SIGTERM or
    /// [`ProfilerHandle::exit`].
    pub host: Arc<dyn HostRuntime>,
    /// Replacement CPU and heap samplers.
    pub samplers: Option<(Box<dyn Sampler>, Box<dyn Sampler>)>,
    /// Register OS signal handlers.
    pub listen_for_signals: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self { host: Arc::new(ProcessHost), samplers: None, listen_for_signals: true }
    }
}

/// Install the profiler agent configured from `PROFTOGGLE_*` variables.
///
/// Call it first thing in `main` and keep the handle alive until `main`
/// returns; dropping it stops and saves a running capture.
///
/// ```no_run
/// fn main() -> anyhow::Result<()> {
///     let _profiler = proftoggle::install()?;
///     // ... the program ...
///     Ok(())
/// }
/// ```
///
/// # Errors
/// Returns an error for invalid configuration or when the agent thread or
/// its signal handlers cannot be set up.
pub fn install() -> Result<ProfilerHandle> {
    // A host that already configured logging keeps its logger
    let _ = env_logger::try_init();
    let config = ControllerConfig::from_env().context("Invalid profiler configuration")?;
    install_with(config, AgentOptions::default())
}

/// Install the agent with an explicit configuration.
///
/// # Errors
/// Same as [`install`], minus environment parsing.
pub fn install_with(config: ControllerConfig, options: AgentOptions) -> Result<ProfilerHandle> {
    let AgentOptions { host, samplers, listen_for_signals } = options;

    let controller = match samplers {
        Some((cpu, heap)) => ProfilerController::with_samplers(&config, cpu, heap),
        None => ProfilerController::new(&config),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std_mpsc::channel();
    let (installed_tx, installed_rx) = oneshot::channel();

    let agent = Agent {
        controller,
        config,
        rx,
        signal_tx: listen_for_signals.then(|| tx.clone()),
        host: Arc::clone(&host),
        exit_guard: Arc::new(ExitGuard::new()),
        pending_exit: Arc::new(AtomicI32::new(NO_PENDING_EXIT)),
    };

    let thread = std::thread::Builder::new()
        .name(AGENT_THREAD_NAME.to_string())
        .spawn(move || agent.run(ready_tx, installed_rx))
        .context("Failed to spawn profiler agent thread")?;

    let setup = ready_rx
        .recv()
        .map_err(|_| anyhow::anyhow!("Profiler agent exited during startup"))
        .and_then(|result| result);
    if let Err(e) = setup {
        if thread.join().is_err() {
            warn!("Profiler agent thread panicked");
        }
        return Err(e);
    }

    // Wakes an `until-started` auto-start
    let _ = installed_tx.send(());
    Ok(ProfilerHandle { tx, agent: Some(thread), host })
}

/// Keeps the agent alive. Dropping it runs the graceful exit flush.
pub struct ProfilerHandle {
    tx: mpsc::UnboundedSender<ControlMessage>,
    agent: Option<JoinHandle<()>>,
    host: Arc<dyn HostRuntime>,
}

impl ProfilerHandle {
    /// Same as delivering SIGUSR2, but waits for the result.
    ///
    /// Returns the `.pb` artifacts written when this toggle stopped capture.
    /// Blocks the calling thread.
    pub fn toggle(&self) -> Vec<Artifact> {
        let (reply, rx) = std_mpsc::channel();
        if self.tx.send(ControlMessage::Toggle { reply: Some(reply) }).is_err() {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    /// Deliver `signal` as if the OS had, without waiting.
    pub fn signal(&self, signal: Signal) {
        if self.tx.send(ControlMessage::from_signal(signal)).is_err() {
            debug!("Profiler agent is gone, dropping {signal}");
        }
    }

    /// Current session state, `Idle` once the agent has exited.
    #[must_use]
    pub fn state(&self) -> SessionState {
        let (reply, rx) = std_mpsc::channel();
        if self.tx.send(ControlMessage::Status { reply }).is_err() {
            return SessionState::Idle;
        }
        rx.recv().unwrap_or_default()
    }

    /// Stop, save and render, then end the process with `code`.
    pub fn exit(mut self, code: i32) {
        self.shutdown();
        self.host.terminate(code);
    }

    /// Run the graceful flush now instead of on drop and return what it
    /// wrote.
    pub fn finish(mut self) -> Vec<Artifact> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Vec<Artifact> {
        let Some(agent) = self.agent.take() else {
            return Vec::new();
        };

        let (done, rx) = std_mpsc::channel();
        let written = if self.tx.send(ControlMessage::Exit { done }).is_ok() {
            rx.recv().unwrap_or_default()
        } else {
            Vec::new()
        };
        if agent.join().is_err() {
            warn!("Profiler agent thread panicked");
        }
        written
    }
}

impl Drop for ProfilerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type Delay = Pin<Box<dyn Future<Output = ()>>>;

struct Agent {
    controller: ProfilerController,
    config: ControllerConfig,
    rx: mpsc::UnboundedReceiver<ControlMessage>,
    signal_tx: Option<mpsc::UnboundedSender<ControlMessage>>,
    host: Arc<dyn HostRuntime>,
    exit_guard: Arc<ExitGuard>,
    /// Exit code of a signal-driven exit in progress, kept outside the agent
    /// so it survives a panic in the flush
    pending_exit: Arc<AtomicI32>,
}

impl Agent {
    fn run(self, ready: std_mpsc::Sender<Result<()>>, installed: oneshot::Receiver<()>) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(anyhow::Error::new(e).context("Failed to build agent runtime")));
                return;
            }
        };

        let host = Arc::clone(&self.host);
        let pending_exit = Arc::clone(&self.pending_exit);
        let owns_signals = self.signal_tx.is_some();

        let served = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(self.serve(ready, installed))));
        if served.is_ok() {
            return;
        }

        // The controller and its samplers were dropped by the unwind, which
        // stops any capture; nothing reads the signal streams any more
        error!("Profiler agent panicked; profiling is disabled for the rest of the process");
        if owns_signals {
            restore_default_handlers();
        }
        match pending_exit.load(Ordering::Acquire) {
            NO_PENDING_EXIT => {}
            code => host.terminate(code),
        }
    }

    async fn serve(mut self, ready: std_mpsc::Sender<Result<()>>, installed: oneshot::Receiver<()>) {
        if let Some(tx) = self.signal_tx.take() {
            if let Err(e) = spawn_signal_listener(tx) {
                let _ = ready.send(Err(e));
                return;
            }
        }

        // `none` holds install() until capture runs; everything else lets
        // the program continue while source maps are indexed
        let start_now = self.config.autostart && self.config.delay == DelayPolicy::None;
        if !start_now {
            let _ = ready.send(Ok(()));
        }

        if self.config.wants_sourcemaps() {
            let index = SourcemapIndex::build(&self.config.sourcemap_dirs, &self.config.sourcemap_packages);
            self.controller.set_sourcemaps(Arc::new(index));
        }

        let mut autostart: Option<Delay> = None;
        if self.config.autostart {
            match self.config.delay {
                DelayPolicy::None => {
                    self.controller.start_if_idle();
                    let _ = ready.send(Ok(()));
                }
                DelayPolicy::UntilStarted => {
                    autostart = Some(Box::pin(async move {
                        let _ = installed.await;
                        tokio::task::yield_now().await;
                        tokio::task::yield_now().await;
                    }));
                }
                DelayPolicy::Millis(ms) => {
                    autostart = Some(Box::pin(tokio::time::sleep(Duration::from_millis(ms))));
                }
            }
        }

        loop {
            let received = match autostart.as_mut() {
                Some(delay) => tokio::select! {
                    () = delay => None,
                    message = self.rx.recv() => Some(message),
                },
                None => Some(self.rx.recv().await),
            };
            let Some(message) = received else {
                autostart = None;
                debug!("Auto-start delay elapsed");
                self.controller.start_if_idle();
                continue;
            };

            let Some(message) = message else {
                debug!("All profiler handles dropped");
                break;
            };
            if self.handle(message).await.is_break() {
                break;
            }
        }
    }

    async fn handle(&mut self, message: ControlMessage) -> ControlFlow<()> {
        match message {
            ControlMessage::Toggle { reply } => {
                let written = self.controller.toggle();
                if let Some(reply) = reply {
                    let _ = reply.send(written);
                }
                ControlFlow::Continue(())
            }
            ControlMessage::Status { reply } => {
                let _ = reply.send(self.controller.state());
                ControlFlow::Continue(())
            }
            ControlMessage::Signal(Signal::Toggle) => {
                self.controller.toggle();
                ControlFlow::Continue(())
            }
            ControlMessage::Signal(signal) => {
                if !self.exit_guard.try_fire() {
                    debug!("Exit already in progress, ignoring {signal}");
                    return ControlFlow::Continue(());
                }
                info!("Received {signal}, saving profiles before exit");
                self.pending_exit.store(signal.exit_code(), Ordering::Release);
                self.controller.quick_stop();
                self.controller.drain_renders(self.config.exit_grace).await;
                self.host.terminate(signal.exit_code());
                ControlFlow::Break(())
            }
            ControlMessage::Exit { done } => {
                let written = if self.exit_guard.try_fire() {
                    let written = self.controller.stop_and_save(true).await;
                    self.controller.drain_renders(self.config.exit_grace).await;
                    written
                } else {
                    Vec::new()
                };
                let _ = done.send(written);
                ControlFlow::Break(())
            }
        }
    }
}
