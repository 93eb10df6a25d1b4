//! # Sub-profilers
//!
//! A [`Sampler`] is one capture stream the controller starts and stops as a
//! unit. Two ship with the crate:
//!
//! - **`cpu`**: SIGPROF-driven stack sampling through the `pprof` crate
//! - **`heap`**: allocation sampling through [`SamplingAllocator`], which the
//!   profiled program installs as its `#[global_allocator]`
//!
//! Both hand back a `pprof::protos::Profile`, so everything downstream
//! (source map rewriting, encoding, rendering) is shared.

pub mod cpu;
pub mod heap;

use pprof::protos::Profile;
use proftoggle_common::ArtifactKind;

use crate::domain::SamplerError;
use crate::export::encode_profile;

pub use cpu::CpuSampler;
pub use heap::{HeapSampler, SamplingAllocator};

/// One independently started and stopped capture stream.
pub trait Sampler: Send {
    fn kind(&self) -> ArtifactKind;

    /// Begin capturing.
    ///
    /// # Errors
    /// [`SamplerError::AlreadyRunning`] or a start failure specific to the
    /// sampler.
    fn start(&mut self) -> Result<(), SamplerError>;

    /// Stop capturing and return what was collected.
    ///
    /// # Errors
    /// [`SamplerError::NotRunning`] or a collection failure.
    fn stop(&mut self) -> Result<Profile, SamplerError>;

    /// Serialise a collected profile to pprof protobuf.
    ///
    /// # Errors
    /// [`SamplerError::EncodeFailed`] when the profile cannot be encoded.
    fn encode(&self, profile: &Profile) -> Result<Vec<u8>, SamplerError> {
        Ok(encode_profile(profile))
    }
}

/// Intern `s` into a pprof string table, returning its index.
pub(crate) fn intern(strings: &mut Vec<String>, index: &mut std::collections::HashMap<String, i64>, s: &str) -> i64 {
    if let Some(&id) = index.get(s) {
        return id;
    }
    let id = i64::try_from(strings.len()).unwrap_or(i64::MAX);
    strings.push(s.to_string());
    index.insert(s.to_string(), id);
    id
}
