//! Pre-flight checks for the supervisor
//!
//! Validates the launch request before a child is spawned so mistakes fail
//! fast with an actionable message instead of a half-started session.

use std::path::{Path, PathBuf};

use crate::domain::{ConfigError, Pid};

/// Resolve `program` to an executable file.
///
/// A name containing a path separator is checked as given; a bare name is
/// looked up on `$PATH`.
///
/// # Errors
/// [`ConfigError::ProgramNotFound`] when nothing executable matches.
pub fn resolve_program(program: &str) -> Result<PathBuf, ConfigError> {
    if program.is_empty() {
        return Err(ConfigError::MissingArgument("program"));
    }

    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        let path = PathBuf::from(program);
        return if is_executable(&path) { Ok(path) } else { Err(ConfigError::ProgramNotFound(program.to_string())) };
    }

    std::env::var_os("PATH")
        .and_then(|paths| std::env::split_paths(&paths).map(|dir| dir.join(program)).find(|c| is_executable(c)))
        .ok_or_else(|| ConfigError::ProgramNotFound(program.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata().is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Make sure profiles can be written before the child starts producing them.
///
/// # Errors
/// [`ConfigError::InvalidSetting`] when the directory cannot be created.
pub fn check_out_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::InvalidSetting {
        key: proftoggle_common::ENV_OUT_DIR,
        value: format!("{} ({e})", dir.display()),
    })?;
    if !dir.is_dir() {
        return Err(ConfigError::InvalidSetting {
            key: proftoggle_common::ENV_OUT_DIR,
            value: format!("{} is not a directory", dir.display()),
        });
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error naming the PID when `/proc/<pid>` is missing.
pub fn check_process_exists(pid: Pid) -> anyhow::Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        anyhow::bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}
