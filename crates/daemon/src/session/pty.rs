//! PTY process wrapper.
//!
//! Owns one pseudo-terminal and the shell process attached to it. All
//! operations here are synchronous; callers in async code run the blocking
//! ones (`spawn`, `write`, `terminate`, reads) on the blocking pool.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::error::SessionError;

/// Interval between exit checks while waiting out the terminate grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Parameters for starting a shell under a new PTY.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell command line. The first word is the program, the rest are arguments.
    pub shell: String,
    /// Initial terminal rows.
    pub rows: u16,
    /// Initial terminal columns.
    pub cols: u16,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory for the shell.
    pub cwd: Option<PathBuf>,
}

impl SpawnOptions {
    /// Options for `shell` at the given geometry with no extra environment.
    pub fn new(shell: impl Into<String>, rows: u16, cols: u16) -> Self {
        Self {
            shell: shell.into(),
            rows,
            cols,
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// A shell process running under a pseudo-terminal.
///
/// The writer, master and child handles each sit behind their own lock so a
/// blocked write never stalls a resize or a terminate.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    pid: Option<u32>,
    exited: AtomicBool,
}

impl PtyProcess {
    /// Opens a PTY and starts the shell on its slave side.
    pub fn spawn(options: &SpawnOptions) -> Result<Self, SessionError> {
        let mut words = options.shell.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| SessionError::Spawn("empty shell command".to_string()))?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(words);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{}: {}", program, e)))?;
        // The slave side must not outlive the spawn, or reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        tracing::debug!(
            shell = %options.shell,
            pid = ?pid,
            rows = options.rows,
            cols = options.cols,
            "Spawned PTY process"
        );

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            reader: Mutex::new(Some(reader)),
            pid,
            exited: AtomicBool::new(false),
        })
    }

    /// Returns the OS process id of the shell, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns true once the process has been observed to exit.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Writes all of `data` to the PTY and returns the byte count.
    ///
    /// Blocks while the terminal's input queue is full.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.has_exited() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "PTY process has exited",
            ));
        }

        let mut writer = lock(&self.writer);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    /// Takes the output stream. Returns `None` after the first call.
    ///
    /// The stream yields byte chunks until the process exits or the PTY is
    /// released; it cannot be restarted.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        lock(&self.reader).take()
    }

    /// Changes the terminal geometry.
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        if self.has_exited() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "PTY process has exited",
            ));
        }

        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::other(e.to_string()))
    }

    /// Checks for process exit without blocking. Returns the exit code if exited.
    pub fn try_wait(&self) -> io::Result<Option<u32>> {
        let status = lock(&self.child).try_wait()?;
        if let Some(ref status) = status {
            self.exited.store(true, Ordering::SeqCst);
            return Ok(Some(status.exit_code()));
        }
        Ok(None)
    }

    /// Stops the process: SIGHUP, then SIGKILL once `grace` has elapsed.
    ///
    /// Blocks until the child is reaped. Safe to call more than once.
    /// Returns the exit code when one could be collected.
    pub fn terminate(&self, grace: Duration) -> Option<u32> {
        if let Ok(Some(code)) = self.try_wait() {
            return Some(code);
        }

        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                tracing::debug!(pid = pid, error = %e, "SIGHUP failed");
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Ok(Some(code)) = self.try_wait() {
                return Some(code);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let mut child = lock(&self.child);
        let code = match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to reap PTY process");
                None
            }
        };
        self.exited.store(true, Ordering::SeqCst);
        code
    }
}

impl Drop for PtyProcess {
    /// Kills a still-running child without waiting for it here; the reap
    /// happens on the blocking pool, or on a helper thread outside a runtime.
    fn drop(&mut self) {
        if self.has_exited() {
            return;
        }
        let Some(pid) = self.pid.map(|pid| Pid::from_raw(pid as i32)) else {
            return;
        };
        tracing::debug!(pid = %pid, "Dropping live PTY process");
        let _ = kill(pid, Signal::SIGKILL);

        let reap = move || {
            if let Err(e) = waitpid(pid, None) {
                tracing::debug!(pid = %pid, error = %e, "Failed to reap dropped PTY process");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(reap);
            }
            Err(_) => {
                if let Err(e) = std::thread::Builder::new()
                    .name("pty-reap".to_string())
                    .spawn(reap)
                {
                    tracing::warn!(pid = %pid, error = %e, "Failed to start reap thread");
                }
            }
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves the shell command for a new session.
///
/// Preference: the requested command, then the configured default, then
/// `$SHELL`, then `/bin/sh`.
pub fn resolve_shell(requested: Option<&str>, default_shell: &str) -> String {
    if let Some(s) = requested.map(str::trim).filter(|s| !s.is_empty()) {
        return s.to_string();
    }
    if !default_shell.trim().is_empty() {
        return default_shell.to_string();
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
