//! Profiler session state: one lifecycle state plus a running flag per
//! sub-profiler.
//!
//! ```text
//!          start            stop requested
//!   Idle ─────────► Running ──────────────► Stopping
//!    ▲                                         │
//!    └─────────────── all flags cleared ───────┘
//! ```

use std::fmt;

use proftoggle_common::ArtifactKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubProfiler {
    pub kind: ArtifactKind,
    pub running: bool,
}

#[derive(Debug)]
pub struct ProfilerSession {
    state: SessionState,
    cpu: SubProfiler,
    heap: SubProfiler,
    /// Completed start → stop cycles
    cycles: u64,
}

impl Default for ProfilerSession {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            cpu: SubProfiler { kind: ArtifactKind::Cpu, running: false },
            heap: SubProfiler { kind: ArtifactKind::Heap, running: false },
            cycles: 0,
        }
    }
}

impl ProfilerSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn sub(&self, kind: ArtifactKind) -> &SubProfiler {
        match kind {
            ArtifactKind::Cpu => &self.cpu,
            ArtifactKind::Heap => &self.heap,
        }
    }

    fn sub_mut(&mut self, kind: ArtifactKind) -> &mut SubProfiler {
        match kind {
            ArtifactKind::Cpu => &mut self.cpu,
            ArtifactKind::Heap => &mut self.heap,
        }
    }

    #[must_use]
    pub fn is_running(&self, kind: ArtifactKind) -> bool {
        self.sub(kind).running
    }

    /// Whether either sub-profiler is capturing.
    #[must_use]
    pub fn any_running(&self) -> bool {
        self.cpu.running || self.heap.running
    }

    pub fn mark_started(&mut self, kind: ArtifactKind) {
        self.sub_mut(kind).running = true;
        self.state = SessionState::Running;
    }

    /// Enter `Stopping`. Returns `false` when nothing is running.
    pub fn begin_stop(&mut self) -> bool {
        if !self.any_running() {
            return false;
        }
        self.state = SessionState::Stopping;
        true
    }

    pub fn mark_stopped(&mut self, kind: ArtifactKind) {
        self.sub_mut(kind).running = false;
    }

    /// Leave `Stopping` once every flag is cleared.
    pub fn finish_stop(&mut self) {
        debug_assert!(!self.any_running());
        self.cpu.running = false;
        self.heap.running = false;
        self.state = SessionState::Idle;
        self.cycles += 1;
    }

    /// Force both flags off after a failed start.
    pub fn reset(&mut self) {
        self.cpu.running = false;
        self.heap.running = false;
        self.state = SessionState::Idle;
    }
}
