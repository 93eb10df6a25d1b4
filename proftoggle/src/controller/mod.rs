//! # Profiler Controller
//!
//! The state machine behind every toggle. It owns the [`ProfilerSession`],
//! both sub-profilers, the optional [`SourcemapIndex`], the [`ProfileWriter`]
//! and the [`FlamegraphBridge`].
//!
//! ## Stop Semantics
//!
//! One stop event produces at most one `.pb` per sub-profiler, all sharing a
//! single timestamp. Each sub-profiler is handled on its own (CPU first), so
//! a failure in one is logged and the other is still written:
//!
//! ```text
//! begin_stop ──► cpu:  stop → rewrite → encode → write ──► clear flag
//!            └─► heap: stop → rewrite → encode → write ──► clear flag
//!                                                          finish_stop
//! ```
//!
//! The controller only runs on the agent thread. Signals and API calls reach
//! it as [`ControlMessage`]s, never directly.

pub mod agent;
pub mod exit_guard;
pub mod host;
pub mod session;
pub mod signals;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use proftoggle_common::ArtifactKind;
use tokio::task::JoinHandle;

use crate::config::ControllerConfig;
use crate::domain::{Artifact, SamplerError};
use crate::export::{now_timestamp, ProfileWriter};
use crate::render::{FlamegraphBridge, RenderReport};
use crate::sampling::{CpuSampler, HeapSampler, Sampler};
use crate::sourcemap::SourcemapIndex;

pub use agent::{install, install_with, AgentOptions, ProfilerHandle};
pub use exit_guard::ExitGuard;
pub use host::{HostRuntime, ProcessHost};
pub use session::{ProfilerSession, SessionState};
pub use signals::ControlMessage;

pub struct ProfilerController {
    session: ProfilerSession,
    cpu: Box<dyn Sampler>,
    heap: Box<dyn Sampler>,
    sourcemaps: Option<Arc<SourcemapIndex>>,
    writer: ProfileWriter,
    bridge: FlamegraphBridge,
    /// Fire-and-forget renders started by [`ProfilerController::quick_stop`]
    pending_renders: Vec<JoinHandle<RenderReport>>,
    heap_unavailable_warned: bool,
}

impl ProfilerController {
    /// Controller with the real CPU and heap samplers.
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_samplers(
            config,
            Box::new(CpuSampler::new(config.cpu_frequency)),
            Box::new(HeapSampler::new(config.heap)),
        )
    }

    #[must_use]
    pub fn with_samplers(config: &ControllerConfig, cpu: Box<dyn Sampler>, heap: Box<dyn Sampler>) -> Self {
        Self {
            session: ProfilerSession::new(),
            cpu,
            heap,
            sourcemaps: None,
            writer: ProfileWriter::new(&config.out_dir),
            bridge: FlamegraphBridge::from_config(config),
            pending_renders: Vec::new(),
            heap_unavailable_warned: false,
        }
    }

    /// Frames of every later capture are rewritten through `index`.
    pub fn set_sourcemaps(&mut self, index: Arc<SourcemapIndex>) {
        self.sourcemaps = Some(index);
    }

    #[must_use]
    pub fn session(&self) -> &ProfilerSession {
        &self.session
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Start both sub-profilers when idle, otherwise stop and write them.
    ///
    /// A manual toggle never renders; the returned artifacts are the `.pb`
    /// files written by this call (empty on a start).
    pub fn toggle(&mut self) -> Vec<Artifact> {
        if self.session.any_running() {
            self.stop_and_write()
        } else {
            self.start_if_idle();
            Vec::new()
        }
    }

    /// Start both sub-profilers unless one is already running.
    ///
    /// Returns whether capture is now running. A heap sampler without its
    /// allocator installed is skipped with a one-time warning; any other
    /// start failure discards what was started and leaves the session idle.
    pub fn start_if_idle(&mut self) -> bool {
        if self.session.any_running() {
            debug!("Profiler already {}, ignoring start", self.session.state());
            return false;
        }

        if let Err(e) = self.cpu.start() {
            warn!("Failed to start profiling: {e}");
            self.session.reset();
            return false;
        }
        self.session.mark_started(ArtifactKind::Cpu);

        match self.heap.start() {
            Ok(()) => self.session.mark_started(ArtifactKind::Heap),
            Err(SamplerError::AllocatorNotInstalled) => {
                if !self.heap_unavailable_warned {
                    warn!("{}; profiling CPU only", SamplerError::AllocatorNotInstalled);
                    self.heap_unavailable_warned = true;
                }
            }
            Err(e) => {
                warn!("Failed to start profiling: {e}");
                if let Err(stop_err) = self.cpu.stop() {
                    debug!("Discarding CPU samples failed: {stop_err}");
                }
                self.session.reset();
                return false;
            }
        }

        info!(
            "Profiling started (cpu: {}, heap: {})",
            self.session.is_running(ArtifactKind::Cpu),
            self.session.is_running(ArtifactKind::Heap)
        );
        true
    }

    /// Stop and write every running sub-profiler. With `generate`, render the
    /// HTML and markdown siblings of each written profile and wait for them.
    ///
    /// Rendering failures are logged by the bridge and never returned.
    pub async fn stop_and_save(&mut self, generate: bool) -> Vec<Artifact> {
        let written = self.stop_and_write();
        if !generate || written.is_empty() {
            return written;
        }

        let renders: Vec<_> = written
            .iter()
            .cloned()
            .map(|artifact| {
                let bridge = self.bridge.clone();
                tokio::spawn(async move { bridge.render(&artifact).await })
            })
            .collect();
        for render in renders {
            if let Err(e) = render.await {
                warn!("Render task failed: {e}");
            }
        }
        written
    }

    /// Synchronous stop used on SIGINT/SIGTERM. Renders are spawned on the
    /// current runtime, if any, and tracked for [`Self::drain_renders`].
    pub fn quick_stop(&mut self) -> Vec<Artifact> {
        let written = self.stop_and_write();
        if written.is_empty() {
            return written;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                for artifact in written.iter().cloned() {
                    let bridge = self.bridge.clone();
                    self.pending_renders.push(runtime.spawn(async move { bridge.render(&artifact).await }));
                }
            }
            Err(_) => debug!("No runtime available, skipping flamegraph rendering"),
        }
        written
    }

    /// Wait up to `grace` for renders started by [`Self::quick_stop`].
    ///
    /// Returns how many renders finished in time.
    pub async fn drain_renders(&mut self, grace: Duration) -> usize {
        let pending = std::mem::take(&mut self.pending_renders);
        if pending.is_empty() {
            return 0;
        }

        let total = pending.len();
        let mut finished = 0;
        let wait = async {
            for render in pending {
                if render.await.is_ok() {
                    finished += 1;
                }
            }
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!("Exiting with renders still running after {}ms", grace.as_millis());
        }
        debug!("{finished}/{total} renders finished before exit");
        finished
    }

    /// Number of quick-stop renders not yet drained.
    #[must_use]
    pub fn pending_renders(&self) -> usize {
        self.pending_renders.len()
    }

    fn stop_and_write(&mut self) -> Vec<Artifact> {
        if !self.session.begin_stop() {
            debug!("Nothing to stop");
            return Vec::new();
        }

        let timestamp = now_timestamp();
        let mut written = Vec::new();
        for kind in [ArtifactKind::Cpu, ArtifactKind::Heap] {
            if !self.session.is_running(kind) {
                continue;
            }
            match self.stop_one(kind, &timestamp) {
                Ok(artifact) => {
                    println!("{}", artifact.path.display());
                    written.push(artifact);
                }
                Err(e) => warn!("{kind} profile not saved: {e:#}"),
            }
            self.session.mark_stopped(kind);
        }
        self.session.finish_stop();

        info!("Profiling stopped, {} profile(s) written", written.len());
        written
    }

    fn stop_one(&mut self, kind: ArtifactKind, timestamp: &str) -> anyhow::Result<Artifact> {
        let sampler = match kind {
            ArtifactKind::Cpu => &mut self.cpu,
            ArtifactKind::Heap => &mut self.heap,
        };

        let mut profile = sampler.stop()?;
        if let Some(index) = &self.sourcemaps {
            let rewritten = index.rewrite_profile(&mut profile);
            debug!("Rewrote {rewritten} {kind} frames through source maps");
        }
        let bytes = sampler.encode(&profile)?;
        self.writer
            .write(kind, &bytes, timestamp)
            .with_context(|| format!("writing into {}", self.writer.out_dir().display()))
    }
}
