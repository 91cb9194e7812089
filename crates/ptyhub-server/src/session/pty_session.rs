//! One shell process on a pty, with its output buffer and lifecycle.
//!
//! State machine: `Created → Running → {Exited, Closed}`, and `Exited → Closed`.
//! The reader task is the only caller of [`PtySession::append_output`];
//! everything else may be called concurrently.

use super::buffer::OutputBuffer;
use super::pty::{PtyHandle, SpawnOptions, SpawnedPty};
use ptyhub_core::{OutputDelta, PtyError, PtyResult, SessionState, SessionStatus, SessionSummary};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How often the child is polled while waiting for it to exit.
pub(crate) const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on waiting for the kernel to reap a SIGKILLed child.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

struct SessionInner {
    lifecycle: SessionState,
    buffer: OutputBuffer,
    exit_code: Option<i32>,
    rows: u16,
    cols: u16,
    last_activity: Instant,
    /// Feeds the input writer thread. Dropped on close.
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// A live shell session.
pub struct PtySession {
    id: String,
    user: String,
    shell: String,
    cwd: PathBuf,
    created_at: SystemTime,
    close_grace: Duration,
    pty: PtyHandle,
    inner: Mutex<SessionInner>,
    /// Carries the tail sequence; bumped on every append and state change.
    tail_tx: watch::Sender<u64>,
}

impl PtySession {
    /// Spawn the shell and its input writer.
    ///
    /// Returns the session (in `Created`) and the pty's output half, which the
    /// caller hands to a reader task. On error nothing is left running.
    pub fn spawn(
        id: String,
        user: String,
        opts: &SpawnOptions,
        buffer_chunks: usize,
        close_grace: Duration,
    ) -> PtyResult<(Arc<Self>, Box<dyn Read + Send>)> {
        let SpawnedPty {
            handle,
            reader,
            writer,
        } = PtyHandle::spawn(opts)?;
        let input = spawn_input_writer(&id, writer)?;

        let (tail_tx, _) = watch::channel(0);
        let session = Arc::new(Self {
            id,
            user,
            shell: opts.shell.clone(),
            cwd: opts.cwd.clone(),
            created_at: SystemTime::now(),
            close_grace,
            pty: handle,
            inner: Mutex::new(SessionInner {
                lifecycle: SessionState::Created,
                buffer: OutputBuffer::new(buffer_chunks),
                exit_code: None,
                rows: opts.rows,
                cols: opts.cols,
                last_activity: Instant::now(),
                input: Some(input),
            }),
            tail_tx,
        });
        Ok((session, reader))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.lock().lifecycle
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Forward raw bytes to the shell.
    ///
    /// Fails with `Conflict` once the process has exited or the session is
    /// closed. Otherwise the bytes are queued and this returns immediately.
    pub fn write_input(&self, data: &[u8]) -> PtyResult<()> {
        {
            let inner = self.lock();
            if inner.lifecycle.is_terminal() || inner.exit_code.is_some() {
                return Err(PtyError::Conflict(format!(
                    "session {} is {}",
                    self.id, inner.lifecycle
                )));
            }
        }
        // The reader may not have noticed the exit yet.
        if let Some(code) = self.reaped_exit() {
            self.mark_exited(Some(code));
            return Err(PtyError::Conflict(format!(
                "session {} process exited with {code}",
                self.id
            )));
        }
        let inner = self.lock();
        let Some(input) = inner.input.as_ref() else {
            return Err(PtyError::Conflict(format!("session {} input closed", self.id)));
        };
        input
            .send(data.to_vec())
            .map_err(|_| PtyError::Conflict(format!("session {} input closed", self.id)))
    }

    /// Update the window geometry. A no-op once the process has exited.
    pub fn resize(&self, rows: u16, cols: u16) -> PtyResult<()> {
        let mut inner = self.lock();
        if inner.lifecycle.is_terminal() || inner.exit_code.is_some() {
            debug!(session_id = %self.id, rows, cols, "resize ignored, session not running");
            return Ok(());
        }
        match self.pty.resize(rows, cols) {
            Ok(()) => {
                inner.rows = rows;
                inner.cols = cols;
                Ok(())
            }
            Err(_) if matches!(self.pty.try_wait(), Ok(Some(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Everything buffered after `seq`, the new tail, and the exit status.
    pub fn output_since(&self, seq: u64) -> OutputDelta {
        let inner = self.lock();
        let (data, seq) = inner.buffer.since(seq);
        OutputDelta {
            data,
            seq,
            exit_code: inner.exit_code,
        }
    }

    /// Append a chunk read from the pty. `None` once the session is closed.
    ///
    /// Output still queued when the exit is noticed is accepted, so the
    /// reader can drain it after the session turned `Exited`.
    pub(crate) fn append_output(&self, chunk: Vec<u8>) -> Option<u64> {
        let seq = {
            let mut inner = self.lock();
            if inner.lifecycle == SessionState::Closed {
                return None;
            }
            inner.buffer.push(chunk)
        };
        self.tail_tx.send_replace(seq);
        Some(seq)
    }

    pub(crate) fn mark_running(&self) {
        let mut inner = self.lock();
        if inner.lifecycle == SessionState::Created {
            inner.lifecycle = SessionState::Running;
        }
    }

    /// Record process exit. Leaves a closed session closed; repeat calls
    /// keep the first status.
    pub(crate) fn mark_exited(&self, code: Option<i32>) {
        let (changed, code) = {
            let mut inner = self.lock();
            inner.exit_code = inner.exit_code.or(code);
            let changed = matches!(
                inner.lifecycle,
                SessionState::Created | SessionState::Running
            );
            if changed {
                inner.lifecycle = SessionState::Exited;
            }
            (changed, inner.exit_code)
        };
        if changed {
            info!(session_id = %self.id, exit_code = ?code, "shell exited");
            self.tail_tx.send_modify(|_| {});
        }
    }

    /// Exit status of the shell if it has already been reaped. Never blocks.
    pub(crate) fn reaped_exit(&self) -> Option<i32> {
        match self.pty.try_wait() {
            Ok(code) => code,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "wait on shell failed");
                None
            }
        }
    }

    /// Wait until the child has been reaped, polling without blocking.
    ///
    /// Gives up and returns the recorded status if the session gets closed.
    pub(crate) async fn await_exit(&self) -> Option<i32> {
        loop {
            match self.pty.try_wait() {
                Ok(Some(code)) => return Some(code),
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "wait on shell failed");
                    return None;
                }
            }
            if self.state() == SessionState::Closed {
                return self.exit_code();
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Time since the last client activity.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Receiver that changes whenever output is appended or the state moves.
    pub fn watch_tail(&self) -> watch::Receiver<u64> {
        self.tail_tx.subscribe()
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.lock();
        SessionSummary {
            session_id: self.id.clone(),
            status: inner.lifecycle,
            created_at: unix_millis(self.created_at),
            last_activity: wall_clock_millis(inner.last_activity),
        }
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.lock();
        SessionStatus {
            session_id: self.id.clone(),
            user: self.user.clone(),
            status: inner.lifecycle,
            alive: !inner.lifecycle.is_terminal(),
            exit_code: inner.exit_code,
            rows: inner.rows,
            cols: inner.cols,
            cwd: self.cwd.display().to_string(),
            shell: self.shell.clone(),
            created_at: unix_millis(self.created_at),
            last_activity: wall_clock_millis(inner.last_activity),
            output_seq: inner.buffer.tail_seq(),
            oldest_seq: inner.buffer.oldest_seq(),
            buffered_chunks: inner.buffer.retained_chunks(),
        }
    }

    /// Tear the session down: hang up, wait out the grace period, kill if
    /// needed, release the pty.
    ///
    /// Also runs for an already exited shell, since its background jobs may
    /// still hold the pty. Returns false if the session was already closed.
    pub async fn close(&self) -> bool {
        let previous = {
            let mut inner = self.lock();
            if inner.lifecycle == SessionState::Closed {
                return false;
            }
            let previous = inner.lifecycle;
            inner.lifecycle = SessionState::Closed;
            inner.input = None;
            previous
        };

        self.terminate().await;
        self.pty.release();
        self.tail_tx.send_modify(|_| {});
        info!(session_id = %self.id, from = %previous, exit_code = ?self.exit_code(), "session closed");
        true
    }

    async fn terminate(&self) {
        let signalled = self.pty.hangup();
        debug!(session_id = %self.id, signalled, "hangup sent");
        if self.wait_session_gone(self.close_grace).await {
            return;
        }

        warn!(session_id = %self.id, grace_ms = self.close_grace.as_millis() as u64, "session ignored hangup, killing");
        if let Err(e) = self.pty.kill() {
            warn!(session_id = %self.id, error = %e, "kill failed");
        }
        if !self.wait_session_gone(KILL_REAP_TIMEOUT).await {
            warn!(session_id = %self.id, pid = ?self.pty.pid(), "session not reaped after kill");
        }
    }

    /// Poll until the shell is reaped and nothing else runs in its session.
    async fn wait_session_gone(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            let leader_gone = match self.pty.try_wait() {
                Ok(Some(code)) => {
                    self.record_exit(code);
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "wait on shell failed");
                    true
                }
            };
            if leader_gone && !self.pty.session_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    fn record_exit(&self, code: i32) {
        let mut inner = self.lock();
        inner.exit_code.get_or_insert(code);
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drain queued input into the pty on a dedicated thread.
///
/// Writes to a pty can block when the shell stops reading, so they never
/// happen on the async runtime. The thread exits when the sender is dropped.
fn spawn_input_writer(
    id: &str,
    mut writer: Box<dyn Write + Send>,
) -> PtyResult<mpsc::UnboundedSender<Vec<u8>>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let session_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-input-{}", short_id(id)))
        .spawn(move || {
            while let Some(data) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    warn!(session_id = %session_id, error = %e, "PTY input write failed");
                    break;
                }
            }
            debug!(session_id = %session_id, "input writer stopped");
        })
        .map_err(|e| PtyError::CreationFailed(format!("failed to start input writer: {e}")))?;
    Ok(tx)
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn wall_clock_millis(at: Instant) -> u64 {
    let now = SystemTime::now();
    unix_millis(now.checked_sub(at.elapsed()).unwrap_or(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sh() -> Arc<PtySession> {
        let opts = SpawnOptions {
            rows: 24,
            cols: 80,
            cwd: PathBuf::from("/tmp"),
            shell: "/bin/sh".into(),
            skip_shell_rc: true,
        };
        let (session, _reader) = PtySession::spawn(
            "0123456789abcdef".into(),
            "alice".into(),
            &opts,
            4,
            Duration::from_millis(300),
        )
        .unwrap();
        session
    }

    #[tokio::test]
    async fn new_session_is_created_and_empty() {
        let session = spawn_sh();
        assert_eq!(session.state(), SessionState::Created);
        session.mark_running();
        assert_eq!(session.state(), SessionState::Running);

        let delta = session.output_since(0);
        assert!(delta.is_empty());
        assert_eq!(delta.seq, 0);
        assert_eq!(delta.exit_code, None);
        assert!(session.close().await);
    }

    #[tokio::test]
    async fn appends_are_numbered_and_bounded() {
        let session = spawn_sh();
        session.mark_running();
        for i in 1..=6u64 {
            assert_eq!(session.append_output(format!("{i};").into_bytes()), Some(i));
        }
        let delta = session.output_since(0);
        assert_eq!(delta.text(), "3;4;5;6;");
        assert_eq!(delta.seq, 6);
        assert_eq!(session.output_since(6).seq, 6);
        assert_eq!(session.output_since(9).seq, 9);
        session.close().await;
    }

    #[tokio::test]
    async fn exited_session_rejects_input_and_ignores_resize() {
        let session = spawn_sh();
        session.mark_running();
        session.mark_exited(Some(0));

        assert_eq!(session.state(), SessionState::Exited);
        assert!(matches!(
            session.write_input(b"ls\n"),
            Err(PtyError::Conflict(_))
        ));
        assert!(session.resize(40, 120).is_ok());
        // Output drained after the exit is still kept, until close.
        assert_eq!(session.append_output(b"tail".to_vec()), Some(1));
        assert_eq!(session.output_since(0).exit_code, Some(0));
        session.close().await;
        assert_eq!(session.append_output(b"late".to_vec()), None);
        assert_eq!(session.output_since(0).text(), "tail");
    }

    #[tokio::test]
    async fn input_after_real_exit_marks_the_session_exited() {
        let session = spawn_sh();
        session.mark_running();
        session.write_input(b"exit 6\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut last = Ok(());
        while Instant::now() < deadline {
            last = session.write_input(b"true\n");
            if last.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(last, Err(PtyError::Conflict(_))));
        // Both views agree once input has been refused.
        assert_eq!(session.state(), SessionState::Exited);
        assert_eq!(session.output_since(u64::MAX).exit_code, Some(6));
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let session = spawn_sh();
        session.mark_running();
        assert!(session.close().await);
        assert!(!session.close().await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.write_input(b"x"),
            Err(PtyError::Conflict(_))
        ));
        // Exit status is recorded once the shell is reaped.
        assert!(session.exit_code().is_some());
    }

    #[tokio::test]
    async fn status_reports_geometry_and_identity() {
        let session = spawn_sh();
        session.mark_running();
        session.resize(30, 100).unwrap();
        let status = session.status();
        assert_eq!(status.session_id, "0123456789abcdef");
        assert_eq!(status.user, "alice");
        assert_eq!((status.rows, status.cols), (30, 100));
        assert_eq!(status.shell, "/bin/sh");
        assert_eq!(status.cwd, "/tmp");
        assert!(status.alive);
        assert_eq!((status.oldest_seq, status.buffered_chunks), (None, 0));

        session.append_output(b"x".to_vec());
        let status = session.status();
        assert_eq!((status.oldest_seq, status.buffered_chunks), (Some(1), 1));
        session.close().await;
    }

    #[test]
    fn short_id_handles_short_strings() {
        assert_eq!(short_id("abcdef0123456789"), "abcdef01");
        assert_eq!(short_id("abc"), "abc");
    }
}
