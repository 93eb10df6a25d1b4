//! Find a running process by name for `proftoggle toggle`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::domain::Pid;

/// Result of process lookup.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub command: String,
}

/// Find a process by name.
///
/// Searches `/proc`, matching the command name from `/proc/<pid>/stat` and
/// the executable basename from `/proc/<pid>/exe`. This process itself is
/// never a match.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    let own_pid = std::process::id();
    let mut matches: Vec<ProcessInfo> = Vec::new();

    let proc_dir = fs::read_dir("/proc").context("Failed to read /proc")?;

    for entry in proc_dir.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        // Kernel threads and other users' processes have no readable exe
        let Ok(exe_path) = fs::read_link(format!("/proc/{pid}/exe")) else {
            continue;
        };
        let Ok(stat_content) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Ok(command) = extract_comm(&stat_content) else {
            continue;
        };

        if is_match(&command, &exe_path, name) {
            matches.push(ProcessInfo { pid: Pid::from(pid), command });
        }
    }

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> = matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.command)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: proftoggle toggle --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

/// Exact match on the command or exe basename, or a substring of either.
fn is_match(command: &str, exe_path: &Path, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let pattern_basename = Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    command == pattern_basename
        || exe_basename == pattern_basename
        || command.contains(pattern)
        || exe_basename.contains(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_comm_with_parens() {
        let stat = "1234 (worker (v2)) S 1 1234";
        assert_eq!(extract_comm(stat).unwrap(), "worker (v2)");
        assert!(extract_comm("1234 S 1").is_err());
    }

    #[test]
    fn test_is_match_by_path_or_substring() {
        let exe = Path::new("/srv/bin/render-worker");
        assert!(is_match("render-worker", exe, "./target/release/render-worker"));
        assert!(is_match("render-worker", exe, "worker"));
        assert!(!is_match("render-worker", exe, "api"));
    }
}
