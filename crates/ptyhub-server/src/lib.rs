//! ptyhub-server: interactive shell sessions behind an incremental polling contract.
//!
//! [`session::PtyManager`] owns every session; [`control`] exposes it as a
//! newline-delimited JSON channel and [`config`] resolves its settings.

pub mod config;
pub mod control;
pub mod session;
