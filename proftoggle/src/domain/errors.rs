//! Structured error types for proftoggle
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::path::PathBuf;

use proftoggle_common::{ArtifactKind, ParseError};
use thiserror::Error;

/// Fatal problems with the operator's configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {source}")]
    InvalidValue {
        key: &'static str,
        #[source]
        source: ParseError,
    },

    #[error("Invalid setting for {key}: {value:?}")]
    InvalidSetting { key: &'static str, value: String },

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(&'static str),
}

/// Start, stop or encode failures of one sub-profiler.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("{0} profiler is already running")]
    AlreadyRunning(ArtifactKind),

    #[error("{0} profiler is not running")]
    NotRunning(ArtifactKind),

    #[error("Failed to start {kind} profiler: {reason}")]
    StartFailed { kind: ArtifactKind, reason: String },

    #[error("Failed to collect {kind} profile: {reason}")]
    CollectFailed { kind: ArtifactKind, reason: String },

    #[error("Failed to encode {kind} profile: {reason}")]
    EncodeFailed { kind: ArtifactKind, reason: String },

    #[error("Heap sampling requires proftoggle::SamplingAllocator as the #[global_allocator]")]
    AllocatorNotInstalled,
}

/// Persisting or loading a profile failed.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Failed to write profile {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode profile: {0}")]
    DecodeFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// HTML or markdown generation failed. Never escalated past the bridge.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to load profile for rendering: {0}")]
    Load(#[from] WriteError),

    #[error("Profile has no samples to render")]
    EmptyProfile,

    #[error("Failed to run {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    CommandFailed { program: String, status: std::process::ExitStatus },

    #[error("HTML rendering is disabled")]
    Disabled,

    #[error("Unknown HTML renderer {0:?} (expected builtin, none or command:<template>)")]
    UnknownRenderer(String),

    #[error("Render task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Source map parsing and lookup errors
#[derive(Error, Debug)]
pub enum SourcemapError {
    #[error("Invalid source map JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid VLQ encoding: {0}")]
    InvalidVlq(String),

    #[error("Unsupported source map version {0}")]
    UnsupportedVersion(u32),

    #[error("No mapping found for position")]
    MappingNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
