//! CPU sampling through the `pprof` crate's SIGPROF profiler.

use log::debug;
use pprof::protos::Profile;
use pprof::{ProfilerGuard, ProfilerGuardBuilder};
use proftoggle_common::ArtifactKind;

use super::Sampler;
use crate::domain::SamplerError;

/// Frames from these libraries are dropped while unwinding.
const BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

/// Owns the process-wide `pprof` profiler while running. Only one guard can
/// exist per process; a second start from anywhere fails.
pub struct CpuSampler {
    frequency: i32,
    guard: Option<ProfilerGuard<'static>>,
}

impl CpuSampler {
    #[must_use]
    pub fn new(frequency: i32) -> Self {
        Self { frequency, guard: None }
    }
}

impl Sampler for CpuSampler {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Cpu
    }

    fn start(&mut self) -> Result<(), SamplerError> {
        if self.guard.is_some() {
            return Err(SamplerError::AlreadyRunning(ArtifactKind::Cpu));
        }
        // pprof divides by the frequency when arming the timer
        if self.frequency <= 0 {
            return Err(SamplerError::StartFailed {
                kind: ArtifactKind::Cpu,
                reason: format!("sampling frequency must be positive, got {}", self.frequency),
            });
        }
        let guard = ProfilerGuardBuilder::default()
            .frequency(self.frequency)
            .blocklist(BLOCKLIST)
            .build()
            .map_err(|e| SamplerError::StartFailed { kind: ArtifactKind::Cpu, reason: e.to_string() })?;
        debug!("CPU sampling at {} Hz", self.frequency);
        self.guard = Some(guard);
        Ok(())
    }

    fn stop(&mut self) -> Result<Profile, SamplerError> {
        let guard = self.guard.take().ok_or(SamplerError::NotRunning(ArtifactKind::Cpu))?;
        let collect_failed =
            |e: pprof::Error| SamplerError::CollectFailed { kind: ArtifactKind::Cpu, reason: e.to_string() };

        let report = guard.report().build().map_err(collect_failed)?;
        // Dropping the guard stops the SIGPROF timer
        drop(guard);
        report.pprof().map_err(collect_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_without_start_is_not_running() {
        let mut sampler = CpuSampler::new(100);
        assert!(matches!(sampler.stop(), Err(SamplerError::NotRunning(ArtifactKind::Cpu))));
    }

    #[test]
    fn test_zero_frequency_fails_to_start() {
        let mut sampler = CpuSampler::new(0);
        assert!(matches!(sampler.start(), Err(SamplerError::StartFailed { kind: ArtifactKind::Cpu, .. })));
        assert!(matches!(sampler.stop(), Err(SamplerError::NotRunning(ArtifactKind::Cpu))));
    }
}
