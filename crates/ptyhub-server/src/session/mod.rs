//! Session management: PTY lifecycle, output buffering, idle reaping.

pub mod buffer;
pub mod manager;
pub mod pty;
pub mod pty_session;
pub mod quota;
pub mod reader;
pub mod stream;

pub use buffer::OutputBuffer;
pub use manager::{ManagerConfig, PtyManager};
pub use pty::{PtyHandle, SpawnOptions};
pub use pty_session::PtySession;
pub use quota::{QuotaLedger, QuotaPermit};
pub use reader::{ReaderExit, ReaderTask};
pub use stream::OutputStream;
