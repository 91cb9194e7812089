//! ptyhub-core: shared types for the PTY session multiplexer.
//!
//! Provides the error taxonomy, the session contract messages exchanged
//! with façades, and the newline-delimited JSON codec for the control channel.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_line, encode_line};
pub use error::{ErrorKind, PtyError, PtyResult, QuotaScope};
pub use messages::{
    InputData, OutputDelta, OutputResponse, Request, RequestEnvelope, Response, ResponseEnvelope,
    SessionCreated, SessionState, SessionStatus, SessionSummary, StreamEvent,
};
