//! Push-style output subscription on top of the polling buffer.

use super::pty_session::PtySession;
use ptyhub_core::{SessionState, StreamEvent};
use std::sync::Arc;
use tokio::sync::watch;

/// Follows one session's output from a starting sequence.
///
/// Yields every new slice as soon as the reader appends it, then a single
/// `Exit` event once the shell has exited. A closed session ends the stream
/// without an `Exit` event.
pub struct OutputStream {
    session: Arc<PtySession>,
    tail: watch::Receiver<u64>,
    seq: u64,
    done: bool,
}

impl OutputStream {
    pub fn new(session: Arc<PtySession>, from_seq: u64) -> Self {
        let tail = session.watch_tail();
        Self {
            session,
            tail,
            seq: from_seq,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        while !self.done {
            // Mark the current version seen before reading, so an append
            // racing with this read still wakes `changed()` below.
            let _ = self.tail.borrow_and_update();

            let delta = self.session.output_since(self.seq);
            if !delta.is_empty() {
                self.seq = delta.seq;
                self.session.touch();
                return Some(StreamEvent::Output {
                    data: delta.data,
                    seq: delta.seq,
                });
            }

            match self.session.state() {
                SessionState::Exited => {
                    self.done = true;
                    return Some(StreamEvent::Exit {
                        code: delta.exit_code,
                    });
                }
                SessionState::Closed => {
                    self.done = true;
                    return None;
                }
                SessionState::Created | SessionState::Running => {}
            }

            if self.tail.changed().await.is_err() {
                self.done = true;
            }
        }
        None
    }
}
