//! Session contract types shared between the session core and its façades.
//!
//! The in-process types (`OutputDelta`, `StreamEvent`) carry raw bytes; the
//! control-channel types (`Request`, `Response`) carry text and are encoded
//! one JSON object per line by [`crate::codec`].

use crate::error::{ErrorKind, PtyError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Exited,
    Closed,
}

impl SessionState {
    /// Whether the session can no longer accept input.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Exited | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Exited => "exited",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Incremental slice of a session's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDelta {
    /// Concatenated chunks newer than the requested sequence.
    pub data: Vec<u8>,
    /// Sequence to pass on the next poll.
    pub seq: u64,
    /// Exit status, `None` while the process is running.
    pub exit_code: Option<i32>,
}

impl OutputDelta {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Output decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Event yielded by an output subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Output { data: Vec<u8>, seq: u64 },
    Exit { code: Option<i32> },
}

/// Listing entry for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionState,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    /// Unix epoch milliseconds.
    pub last_activity: u64,
}

/// Detailed status of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub user: String,
    pub status: SessionState,
    pub alive: bool,
    pub exit_code: Option<i32>,
    pub rows: u16,
    pub cols: u16,
    pub cwd: String,
    pub shell: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub output_seq: u64,
    /// Oldest sequence still retained; polls from before it have lost output.
    pub oldest_seq: Option<u64>,
    pub buffered_chunks: usize,
}

// ── Control channel ─────────────────────────────────────────────────

/// One request on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Create {
        #[serde(default)]
        user: Option<String>,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        shell: Option<String>,
    },
    Input {
        session_id: String,
        data: InputData,
    },
    Output {
        session_id: String,
        #[serde(default)]
        seq: u64,
    },
    Resize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    Close {
        session_id: String,
    },
    List {
        #[serde(default)]
        user: Option<String>,
    },
    Status {
        session_id: String,
    },
}

/// Bytes for an `input` request: a JSON string for text, or an array of
/// byte values for input that is not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputData {
    Text(String),
    Bytes(Vec<u8>),
}

impl InputData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            InputData::Text(text) => text.as_bytes(),
            InputData::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for InputData {
    fn from(text: &str) -> Self {
        InputData::Text(text.to_string())
    }
}

fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

/// Request plus an optional caller-chosen correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub status: SessionState,
}

/// Text rendition of an [`OutputDelta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputResponse {
    pub output: String,
    pub seq: u64,
    pub exit_code: Option<i32>,
}

impl From<OutputDelta> for OutputResponse {
    fn from(delta: OutputDelta) -> Self {
        Self {
            output: delta.text(),
            seq: delta.seq,
            exit_code: delta.exit_code,
        }
    }
}

/// One response on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Created(SessionCreated),
    Output(OutputResponse),
    Ok,
    Sessions { sessions: Vec<SessionSummary> },
    Status(SessionStatus),
    Error { kind: ErrorKind, message: String },
}

impl From<&PtyError> for Response {
    fn from(e: &PtyError) -> Self {
        Response::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub response: Response,
}
