//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a shell with a given size and working
//! directory. The reader and writer halves are handed to the caller so they
//! can be driven from dedicated worker threads; the handle keeps the master
//! (for resize) and the child (for wait/terminate).

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use ptyhub_core::{PtyError, PtyResult};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Everything needed to start a shell on a fresh pty.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub rows: u16,
    pub cols: u16,
    pub cwd: PathBuf,
    pub shell: String,
    /// Start a bare `bash` or `zsh` without reading startup files.
    pub skip_shell_rc: bool,
}

/// A freshly spawned pty plus its I/O halves.
pub struct SpawnedPty {
    pub handle: PtyHandle,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// A managed PTY instance.
pub struct PtyHandle {
    /// Master side, kept for resize. `None` once released.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn a shell attached to a new pty.
    ///
    /// Every failure here is a `CreationFailed`: nothing outlives an error.
    pub fn spawn(opts: &SpawnOptions) -> PtyResult<SpawnedPty> {
        check_cwd(&opts.cwd)?;
        let mut cmd = build_command(&opts.shell, opts.skip_shell_rc)?;
        cmd.cwd(&opts.cwd);
        cmd.env("TERM", "xterm-256color");

        let pair = native_pty_system()
            .openpty(pty_size(opts.rows, opts.cols))
            .map_err(|e| PtyError::CreationFailed(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::CreationFailed(format!("failed to spawn {}: {e}", opts.shell)))?;
        // Only the child should hold the slave, so EOF reaches the reader on exit.
        drop(pair.slave);

        let pid = child.process_id();
        let handle = Self {
            master: Mutex::new(None),
            child: Mutex::new(child),
            pid,
        };

        // From here on `handle` owns the child, and dropping it kills the shell.
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::CreationFailed(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::CreationFailed(format!("failed to take PTY writer: {e}")))?;
        *lock(&handle.master) = Some(pair.master);

        info!(
            shell = %opts.shell,
            cwd = %opts.cwd.display(),
            rows = opts.rows,
            cols = opts.cols,
            pid = ?pid,
            "PTY spawned"
        );

        Ok(SpawnedPty {
            handle,
            reader,
            writer,
        })
    }

    /// Resize the PTY window.
    pub fn resize(&self, rows: u16, cols: u16) -> PtyResult<()> {
        let master = lock(&self.master);
        let master = master
            .as_ref()
            .ok_or_else(|| PtyError::Conflict("PTY already released".into()))?;
        master
            .resize(pty_size(rows, cols))
            .map_err(|e| PtyError::Other(format!("PTY resize failed: {e}")))?;
        debug!(rows, cols, "PTY resized");
        Ok(())
    }

    /// Poll the child without blocking. `Some(code)` once it has exited.
    pub fn try_wait(&self) -> PtyResult<Option<i32>> {
        let status = lock(&self.child).try_wait()?;
        Ok(status.map(|s| i32::try_from(s.exit_code()).unwrap_or(-1)))
    }

    /// Ask every process in the shell's session to hang up.
    ///
    /// Interactive shells ignore SIGTERM, so a terminal hangup is the polite
    /// request here. Returns how many targets were signalled.
    pub fn hangup(&self) -> usize {
        #[cfg(unix)]
        {
            self.signal_session(libc::SIGHUP)
        }
        #[cfg(not(unix))]
        {
            0
        }
    }

    /// Forcefully kill the shell and everything left in its session.
    pub fn kill(&self) -> PtyResult<()> {
        #[cfg(unix)]
        {
            if self.leader_pid().is_some() {
                self.signal_session(libc::SIGKILL);
                return Ok(());
            }
        }
        lock(&self.child).kill()?;
        Ok(())
    }

    /// Whether any process of the shell's session is still running.
    ///
    /// Background jobs live in their own process groups but stay in the
    /// session, and keep the pty slave open after the shell is gone.
    pub fn session_alive(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            if let Some(sid) = self.leader_pid() {
                return !session_members(sid).is_empty();
            }
        }
        matches!(self.try_wait(), Ok(None))
    }

    /// portable-pty makes the child a session leader, so its pid is both the
    /// session id and its own process group id.
    #[cfg(unix)]
    fn leader_pid(&self) -> Option<i32> {
        let pid = self.pid?;
        match i32::try_from(pid) {
            Ok(pid) if pid > 0 => Some(pid),
            _ => {
                warn!(pid, "PID out of range, cannot signal");
                None
            }
        }
    }

    /// Signal the leader's process group and every other session member.
    /// Still works after the leader has been reaped.
    #[cfg(unix)]
    fn signal_session(&self, signal: libc::c_int) -> usize {
        let Some(sid) = self.leader_pid() else {
            return 0;
        };
        let mut delivered = usize::from(send_signal(-sid, signal));
        #[cfg(target_os = "linux")]
        {
            for pid in session_members(sid) {
                delivered += usize::from(send_signal(pid, signal));
            }
        }
        delivered
    }

    /// Drop the master side. Idempotent.
    pub fn release(&self) {
        if lock(&self.master).take().is_some() {
            debug!(pid = ?self.pid, "PTY master released");
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if matches!(self.try_wait(), Ok(None)) || self.session_alive() {
            debug!(pid = ?self.pid, "killing orphaned PTY session");
            let _ = self.kill();
        }
    }
}

/// Build the shell command line.
///
/// A bare `bash`/`zsh` can be started without rc files; anything else is
/// split on whitespace into program and arguments.
pub fn build_command(shell: &str, skip_shell_rc: bool) -> PtyResult<CommandBuilder> {
    let parts: Vec<&str> = shell.split_whitespace().collect();
    let Some((program, args)) = parts.split_first() else {
        return Err(PtyError::CreationFailed("empty shell command".into()));
    };

    let mut builder = CommandBuilder::new(program);
    for arg in args {
        builder.arg(arg);
    }
    if skip_shell_rc && args.is_empty() {
        match *program {
            "bash" => {
                builder.arg("--norc");
                builder.arg("--noprofile");
            }
            "zsh" => builder.arg("--no-rcs"),
            _ => {}
        }
    }
    Ok(builder)
}

/// `kill(2)` wrapper. ESRCH means the target is already gone.
#[cfg(unix)]
fn send_signal(target: i32, signal: libc::c_int) -> bool {
    if unsafe { libc::kill(target, signal) } == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        warn!(target, signal, error = %err, "signal delivery failed");
    }
    false
}

/// Live (non-zombie) processes whose session id is `sid`.
#[cfg(target_os = "linux")]
fn session_members(sid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter(|&pid| unsafe { libc::getsid(pid) } == sid && !is_zombie(pid))
        .collect()
}

/// A process that has exited but not been reaped, or has vanished.
#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with(|c: char| c == 'Z' || c == 'X'))
        })
        .unwrap_or(true)
}

fn check_cwd(cwd: &Path) -> PtyResult<()> {
    match std::fs::metadata(cwd) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(PtyError::CreationFailed(format!(
            "working directory {} is not a directory",
            cwd.display()
        ))),
        Err(e) => Err(PtyError::CreationFailed(format!(
            "working directory {}: {e}",
            cwd.display()
        ))),
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
