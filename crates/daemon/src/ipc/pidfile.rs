//! PID file utilities for daemon running detection.
//!
//! The daemon writes its pid to `{data_dir}/daemon.pid` on start and removes
//! it on stop. A pid file whose process is gone is stale and is cleaned up
//! when read.

use std::fs;
use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Writes the current process id to `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Removes the pid file if it still names this process.
pub fn remove_pid_file(path: &Path) {
    if read_pid(path) == Some(std::process::id()) {
        let _ = fs::remove_file(path);
    }
}

/// Get the PID of the running daemon, if any.
///
/// Returns `None` when the file is missing, unparsable, or names a process
/// that is no longer running; the last two remove the file.
pub fn get_daemon_pid(path: &Path) -> Option<u32> {
    let pid = read_pid(path);
    match pid {
        Some(pid) if is_process_running(pid) => Some(pid),
        _ => {
            if path.exists() {
                tracing::debug!("Removing stale pid file {:?}", path);
                let _ = fs::remove_file(path);
            }
            None
        }
    }
}

/// Returns `true` if the pid file names a live process.
pub fn is_daemon_running(path: &Path) -> bool {
    get_daemon_pid(path).is_some()
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check if a process with the given PID is running.
///
/// Signal 0 probes for existence without delivering anything; `EPERM` means
/// the process exists but belongs to someone else.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}
