//! Domain types providing compile-time safety and self-documentation

use std::fmt;
use std::path::{Path, PathBuf};

use proftoggle_common::{ArtifactFormat, ArtifactKind};

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<u32> for Pid {
    #[allow(clippy::cast_possible_wrap)]
    fn from(pid: u32) -> Self {
        Pid(pid as i32)
    }
}

/// The lifecycle signals proftoggle reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGUSR2 - toggle profiling
    Toggle,
    /// SIGINT - quick stop and exit
    Interrupt,
    /// SIGTERM - quick stop and exit
    Terminate,
}

impl Signal {
    /// Raw signal number on this platform.
    #[must_use]
    pub fn number(self) -> i32 {
        match self {
            #[cfg(unix)]
            Signal::Toggle => libc::SIGUSR2,
            #[cfg(not(unix))]
            Signal::Toggle => 12,
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
        }
    }

    /// Conventional shell exit status of a process ended by this signal.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        128 + self.number()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Toggle => "SIGUSR2",
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        })
    }
}

/// A file produced by a stop event or by rendering one.
///
/// All artifacts of one stop event carry the same `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub format: ArtifactFormat,
    pub timestamp: String,
    pub path: PathBuf,
}

impl Artifact {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a sibling output with the same stem, e.g. `.html` next to `.pb`.
    #[must_use]
    pub fn sibling(&self, format: ArtifactFormat) -> Artifact {
        Artifact {
            kind: self.kind,
            format,
            timestamp: self.timestamp.clone(),
            path: self.path.with_extension(format.extension()),
        }
    }

    /// Name shown in reports, e.g. `cpu-profile-2024-05-01T10-20-30-123Z`.
    #[must_use]
    pub fn profile_name(&self) -> String {
        self.path
            .file_stem()
            .map_or_else(|| self.kind.to_string(), |s| s.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_shares_stem_and_timestamp() {
        let pb = Artifact {
            kind: ArtifactKind::Cpu,
            format: ArtifactFormat::Pb,
            timestamp: "2024-05-01T10-20-30-123Z".to_string(),
            path: PathBuf::from("/tmp/cpu-profile-2024-05-01T10-20-30-123Z.pb"),
        };
        let html = pb.sibling(ArtifactFormat::Html);
        assert_eq!(html.path, PathBuf::from("/tmp/cpu-profile-2024-05-01T10-20-30-123Z.html"));
        assert_eq!(html.timestamp, pb.timestamp);
        assert_eq!(pb.profile_name(), "cpu-profile-2024-05-01T10-20-30-123Z");
    }

    #[test]
    fn test_signal_exit_codes() {
        assert_eq!(Signal::Interrupt.exit_code(), 130);
        assert_eq!(Signal::Terminate.exit_code(), 143);
    }
}
