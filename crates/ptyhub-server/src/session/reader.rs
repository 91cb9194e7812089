//! Per-session output reader.
//!
//! portable-pty only offers blocking reads, so a dedicated thread reads the
//! master and forwards chunks over a bounded channel. The async
//! [`ReaderTask`] drains that channel into the session buffer and records
//! the exit status once the pty reports EOF.

use super::pty_session::{short_id, PtySession, EXIT_POLL_INTERVAL};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Chunks in flight between the blocking reader and the async task.
const SOURCE_CHANNEL_DEPTH: usize = 64;

/// Quiet period after the shell exits before its output counts as complete.
const EXIT_SETTLE: Duration = Duration::from_millis(50);

/// Receiving end of a pty byte source.
pub type ByteSource = mpsc::Receiver<io::Result<Vec<u8>>>;

/// How a reader task ended.
#[derive(Debug)]
pub enum ReaderExit {
    /// The shell exited; carries its status if it could be reaped.
    Exited(Option<i32>),
    /// The session stopped accepting output (it was closed).
    Stopped,
    /// Reading failed unexpectedly.
    Failed(io::Error),
}

/// Outcome of one [`ReaderTask::read_available`] step.
#[derive(Debug)]
pub enum ReadStep {
    /// A chunk was appended under this sequence number.
    Appended(u64),
    /// Bytes arrived but end mid-character; held until the rest arrives.
    Pending,
    Eof,
    Stopped,
    Failed(io::Error),
}

/// Start a thread that reads `reader` until EOF and forwards each chunk.
pub fn spawn_blocking_source(
    session_id: &str,
    mut reader: Box<dyn Read + Send>,
    chunk_size: usize,
) -> io::Result<ByteSource> {
    let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_DEPTH);
    let id = session_id.to_string();
    let chunk_size = chunk_size.max(1);

    std::thread::Builder::new()
        .name(format!("pty-read-{}", short_id(session_id)))
        .spawn(move || {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_hangup(&e) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
            debug!(session_id = %id, "PTY reader thread finished");
        })?;

    Ok(rx)
}

/// Linux reports EIO on the master once every slave fd is closed.
fn is_hangup(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

/// Async half of the reader: the sole writer to a session's buffer.
pub struct ReaderTask {
    session: Arc<PtySession>,
    source: ByteSource,
    /// Incomplete trailing UTF-8 sequence from the previous chunk.
    carry: Vec<u8>,
}

impl ReaderTask {
    pub fn new(session: Arc<PtySession>, source: ByteSource) -> Self {
        Self {
            session,
            source,
            carry: Vec::new(),
        }
    }

    /// Wait for the next chunk from the source and append it.
    pub async fn read_available(&mut self) -> ReadStep {
        match self.source.recv().await {
            None => ReadStep::Eof,
            Some(Err(e)) => ReadStep::Failed(e),
            Some(Ok(bytes)) => self.ingest(bytes),
        }
    }

    fn ingest(&mut self, bytes: Vec<u8>) -> ReadStep {
        let mut chunk = std::mem::take(&mut self.carry);
        chunk.extend_from_slice(&bytes);
        let cut = utf8_boundary(&chunk);
        self.carry = chunk.split_off(cut);
        if chunk.is_empty() {
            return ReadStep::Pending;
        }
        match self.session.append_output(chunk) {
            Some(seq) => {
                trace!(session_id = %self.session.id(), seq, "output appended");
                ReadStep::Appended(seq)
            }
            None => ReadStep::Stopped,
        }
    }

    /// Drain the pty until the shell exits, then record the exit status.
    ///
    /// EOF is not enough on its own: a background job that inherited the
    /// slave keeps the pty open after the shell is gone, so the child is
    /// also polled for exit.
    pub async fn run(mut self) -> ReaderExit {
        let mut exit_check = tokio::time::interval(EXIT_POLL_INTERVAL);
        exit_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let code = loop {
            tokio::select! {
                step = self.read_available() => match step {
                    ReadStep::Appended(_) | ReadStep::Pending => {}
                    ReadStep::Eof => break self.session.await_exit().await,
                    ReadStep::Stopped => return ReaderExit::Stopped,
                    ReadStep::Failed(e) => return self.fail(e),
                },
                _ = exit_check.tick() => {
                    if let Some(code) = self.session.reaped_exit() {
                        if let Err(exit) = self.drain_after_exit().await {
                            return exit;
                        }
                        break Some(code);
                    }
                }
            }
        };

        if !self.carry.is_empty() {
            let rest = std::mem::take(&mut self.carry);
            if self.session.append_output(rest).is_none() {
                return ReaderExit::Stopped;
            }
        }

        self.session.mark_exited(code);
        ReaderExit::Exited(code)
    }

    /// Take whatever the shell wrote before exiting: keep reading until the
    /// source has been quiet for [`EXIT_SETTLE`] or reaches EOF.
    async fn drain_after_exit(&mut self) -> Result<(), ReaderExit> {
        loop {
            match tokio::time::timeout(EXIT_SETTLE, self.read_available()).await {
                Err(_) => return Ok(()),
                Ok(ReadStep::Appended(_) | ReadStep::Pending) => {}
                Ok(ReadStep::Eof) => return Ok(()),
                Ok(ReadStep::Stopped) => return Err(ReaderExit::Stopped),
                Ok(ReadStep::Failed(e)) => return Err(self.fail(e)),
            }
        }
    }

    fn fail(&self, e: io::Error) -> ReaderExit {
        warn!(session_id = %self.session.id(), error = %e, "PTY read failed");
        ReaderExit::Failed(e)
    }
}

/// Index where an incomplete trailing UTF-8 sequence starts, or `buf.len()`.
///
/// Only a truncated multi-byte character is held back; invalid bytes pass
/// through untouched.
pub fn utf8_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let i = len - back;
        let b = buf[i];
        if b & 0xC0 == 0x80 {
            // Continuation byte, keep looking for the lead.
            continue;
        }
        let width = match b {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { i } else { len };
    }
    len
}
