//! # Shared Configuration Protocol (Supervisor ↔ Agent)
//!
//! Defines the vocabulary shared between the `proftoggle` supervisor and the
//! in-process agent it configures. The two sides never share memory: the
//! supervisor serialises its options into the child's environment and the
//! agent parses them back at `install()` time. Keeping both halves of that
//! round trip in one crate is what keeps them in sync.
//!
//! ## Key Types
//!
//! - [`DelayPolicy`] - When auto-start profiling begins
//! - [`MarkdownFormat`] - Verbosity of the markdown summary
//! - [`ArtifactKind`] / [`ArtifactFormat`] - What an output file contains
//! - [`artifact_timestamp`] / [`artifact_file_name`] - Output naming scheme

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Environment Variable Names
// ============================================================================

/// `1`/`true` starts profiling without waiting for SIGUSR2.
pub const ENV_AUTOSTART: &str = "PROFTOGGLE_AUTOSTART";

/// Auto-start delay: `none`, `until-started` or a number of milliseconds.
pub const ENV_DELAY: &str = "PROFTOGGLE_DELAY";

/// Directories scanned for source maps, joined with the OS path-list separator.
pub const ENV_SOURCEMAP_DIRS: &str = "PROFTOGGLE_SOURCEMAP_DIRS";

/// Package names scanned for source maps, comma separated.
pub const ENV_SOURCEMAP_PACKAGES: &str = "PROFTOGGLE_SOURCEMAP_PACKAGES";

/// Markdown summary verbosity: `summary`, `detailed` or `adaptive`.
pub const ENV_MD_FORMAT: &str = "PROFTOGGLE_MD_FORMAT";

/// Directory that receives `.pb`, `.html` and `.md` artifacts.
pub const ENV_OUT_DIR: &str = "PROFTOGGLE_OUT_DIR";

/// CPU sampling frequency in Hz.
pub const ENV_CPU_FREQUENCY: &str = "PROFTOGGLE_CPU_FREQUENCY";

/// Average number of allocated bytes between two heap samples.
pub const ENV_HEAP_INTERVAL: &str = "PROFTOGGLE_HEAP_INTERVAL";

/// Maximum number of frames recorded per heap sample.
pub const ENV_HEAP_DEPTH: &str = "PROFTOGGLE_HEAP_DEPTH";

/// HTML renderer: `builtin`, `none` or `command:<template>`.
pub const ENV_HTML: &str = "PROFTOGGLE_HTML";

/// Milliseconds the agent waits for renders after SIGINT/SIGTERM.
pub const ENV_EXIT_GRACE_MS: &str = "PROFTOGGLE_EXIT_GRACE_MS";

/// Every variable the supervisor may set, in the order it sets them.
pub const ALL_ENV_KEYS: &[&str] = &[
    ENV_AUTOSTART,
    ENV_DELAY,
    ENV_SOURCEMAP_DIRS,
    ENV_SOURCEMAP_PACKAGES,
    ENV_MD_FORMAT,
    ENV_OUT_DIR,
    ENV_CPU_FREQUENCY,
    ENV_HEAP_INTERVAL,
    ENV_HEAP_DEPTH,
    ENV_HTML,
    ENV_EXIT_GRACE_MS,
];

/// Separator for [`ENV_SOURCEMAP_PACKAGES`].
pub const PACKAGE_LIST_SEPARATOR: char = ',';

/// Separator for [`ENV_SOURCEMAP_DIRS`] (same as `PATH`).
#[cfg(windows)]
pub const DIR_LIST_SEPARATOR: char = ';';
/// Separator for [`ENV_SOURCEMAP_DIRS`] (same as `PATH`).
#[cfg(not(windows))]
pub const DIR_LIST_SEPARATOR: char = ':';

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid delay {0:?}: expected 'none', 'until-started' or milliseconds")]
    InvalidDelay(String),

    #[error("invalid markdown format {0:?}: expected 'summary', 'detailed' or 'adaptive'")]
    InvalidMarkdownFormat(String),

    #[error("invalid boolean {0:?}")]
    InvalidFlag(String),
}

// ============================================================================
// Delay Policy
// ============================================================================

/// When auto-start profiling begins relative to process bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayPolicy {
    /// Start before `install()` returns.
    #[default]
    None,
    /// Start once the program's own startup code has had a chance to run.
    UntilStarted,
    /// Start after a fixed delay.
    Millis(u64),
}

impl DelayPolicy {
    /// The fixed delay, if this policy has one.
    #[must_use]
    pub fn duration(self) -> Option<Duration> {
        match self {
            DelayPolicy::Millis(ms) => Some(Duration::from_millis(ms)),
            DelayPolicy::None | DelayPolicy::UntilStarted => None,
        }
    }
}

impl FromStr for DelayPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "none" => Ok(DelayPolicy::None),
            "until-started" => Ok(DelayPolicy::UntilStarted),
            other => other
                .parse::<u64>()
                .map(DelayPolicy::Millis)
                .map_err(|_| ParseError::InvalidDelay(s.to_string())),
        }
    }
}

impl fmt::Display for DelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayPolicy::None => f.write_str("none"),
            DelayPolicy::UntilStarted => f.write_str("until-started"),
            DelayPolicy::Millis(ms) => write!(f, "{ms}"),
        }
    }
}

// ============================================================================
// Markdown Format
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkdownFormat {
    #[default]
    Summary,
    Detailed,
    Adaptive,
}

impl FromStr for MarkdownFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "summary" => Ok(MarkdownFormat::Summary),
            "detailed" => Ok(MarkdownFormat::Detailed),
            "adaptive" => Ok(MarkdownFormat::Adaptive),
            _ => Err(ParseError::InvalidMarkdownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for MarkdownFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MarkdownFormat::Summary => "summary",
            MarkdownFormat::Detailed => "detailed",
            MarkdownFormat::Adaptive => "adaptive",
        })
    }
}

// ============================================================================
// Artifacts
// ============================================================================

/// Which sub-profiler produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Cpu,
    Heap,
}

impl ArtifactKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Cpu => "cpu",
            ArtifactKind::Heap => "heap",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactFormat {
    Pb,
    Html,
    Md,
}

impl ArtifactFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Pb => "pb",
            ArtifactFormat::Html => "html",
            ArtifactFormat::Md => "md",
        }
    }
}

/// Turn an ISO-8601 timestamp into a filename-safe one.
///
/// `2024-05-01T10:20:30.123Z` becomes `2024-05-01T10-20-30-123Z`.
#[must_use]
pub fn artifact_timestamp(iso8601: &str) -> String {
    iso8601.replace([':', '.'], "-")
}

/// `<kind>-profile-<timestamp>.pb`
#[must_use]
pub fn artifact_file_name(kind: ArtifactKind, timestamp: &str) -> String {
    format!("{kind}-profile-{timestamp}.{}", ArtifactFormat::Pb.extension())
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse the boolean flags the supervisor writes (`1`, `true`, `yes`, `on`).
///
/// # Errors
/// Returns [`ParseError::InvalidFlag`] for anything that is not a known
/// truthy or falsy spelling.
pub fn parse_flag(value: &str) -> Result<bool, ParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ParseError::InvalidFlag(value.to_string())),
    }
}

/// Split a delimiter-separated list, dropping empty entries.
#[must_use]
pub fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
