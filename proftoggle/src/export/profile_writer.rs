//! Persisting encoded profiles under collision-free names.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use log::debug;
use pprof::protos::{Message, Profile};
use proftoggle_common::{artifact_file_name, artifact_timestamp, ArtifactFormat, ArtifactKind};

use crate::domain::{Artifact, WriteError};

/// Give up on suffixes after this many collisions in one directory.
const MAX_SUFFIX: u32 = 10_000;

/// Current time as a filename-safe artifact timestamp, e.g.
/// `2024-05-01T10-20-30-123Z`.
#[must_use]
pub fn now_timestamp() -> String {
    artifact_timestamp(&Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Encode a profile as pprof protobuf.
#[must_use]
pub fn encode_profile(profile: &Profile) -> Vec<u8> {
    profile.encode_to_vec()
}

/// Writes `<kind>-profile-<timestamp>.pb` files into one directory.
#[derive(Debug, Clone)]
pub struct ProfileWriter {
    out_dir: PathBuf,
}

impl ProfileWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into() }
    }

    #[must_use]
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Write `bytes` as the `kind` profile stamped `timestamp`.
    ///
    /// An existing file is never overwritten: `-1`, `-2`, ... is appended to
    /// the stem until the name is free.
    ///
    /// # Errors
    /// Returns [`WriteError::WriteFailed`] when the directory cannot be
    /// created or the file cannot be written.
    pub fn write(&self, kind: ArtifactKind, bytes: &[u8], timestamp: &str) -> Result<Artifact, WriteError> {
        fs::create_dir_all(&self.out_dir)
            .map_err(|source| WriteError::WriteFailed { path: self.out_dir.clone(), source })?;

        let file_name = artifact_file_name(kind, timestamp);
        let base = self.out_dir.join(&file_name);
        let stem = base.with_extension("");

        let mut path = base;
        let mut suffix = 0;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    fill_new_file(&path, file, bytes)?;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && suffix < MAX_SUFFIX => {
                    suffix += 1;
                    path = PathBuf::from(format!(
                        "{}-{suffix}.{}",
                        stem.display(),
                        ArtifactFormat::Pb.extension()
                    ));
                    debug!("{file_name} exists, trying {}", path.display());
                }
                Err(source) => return Err(WriteError::WriteFailed { path, source }),
            }
        }

        Ok(Artifact {
            kind,
            format: ArtifactFormat::Pb,
            timestamp: timestamp.to_string(),
            path,
        })
    }
}

/// Write `bytes` into the just-created `path`, removing it again when the
/// write fails so no truncated profile is left behind.
fn fill_new_file(path: &Path, mut file: impl Write, bytes: &[u8]) -> Result<(), WriteError> {
    let written = file.write_all(bytes).and_then(|()| file.flush());
    drop(file);
    written.map_err(|source| {
        if let Err(e) = fs::remove_file(path) {
            debug!("Could not remove partial {}: {e}", path.display());
        }
        WriteError::WriteFailed { path: path.to_path_buf(), source }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Accepts a few bytes, then fails like a full disk.
    struct FullDisk {
        room: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-profile-ts.pb");
        fs::write(&path, b"par").unwrap();

        let err = fill_new_file(&path, FullDisk { room: 3 }, b"profile bytes").unwrap_err();
        assert!(matches!(err, WriteError::WriteFailed { .. }));
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_uses_kind_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ProfileWriter::new(dir.path());
        let artifact = writer.write(ArtifactKind::Heap, b"abc", "2024-05-01T10-20-30-123Z").unwrap();

        assert_eq!(
            artifact.path,
            dir.path().join("heap-profile-2024-05-01T10-20-30-123Z.pb")
        );
        assert_eq!(fs::read(&artifact.path).unwrap(), b"abc");
        assert_eq!(artifact.format, ArtifactFormat::Pb);
    }

    #[test]
    fn test_collision_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ProfileWriter::new(dir.path());
        let first = writer.write(ArtifactKind::Cpu, b"1", "ts").unwrap();
        let second = writer.write(ArtifactKind::Cpu, b"2", "ts").unwrap();
        let third = writer.write(ArtifactKind::Cpu, b"3", "ts").unwrap();

        assert_eq!(first.path, dir.path().join("cpu-profile-ts.pb"));
        assert_eq!(second.path, dir.path().join("cpu-profile-ts-1.pb"));
        assert_eq!(third.path, dir.path().join("cpu-profile-ts-2.pb"));
        assert_eq!(fs::read(&first.path).unwrap(), b"1");
        assert_eq!(second.timestamp, "ts");
    }

    #[test]
    fn test_creates_missing_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let artifact = ProfileWriter::new(&nested).write(ArtifactKind::Cpu, b"", "ts").unwrap();
        assert!(artifact.path.starts_with(&nested));
    }

    #[test]
    fn test_now_timestamp_is_filename_safe() {
        let ts = now_timestamp();
        assert!(!ts.contains(':'));
        assert!(!ts.contains('.'));
        assert!(ts.ends_with('Z'));
    }
}
