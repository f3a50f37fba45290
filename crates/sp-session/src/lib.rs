//! Stateful command sessions to a network device.
//!
//! A [`session::Session`] owns one interactive channel (normally an SSH
//! client running in a PTY) and drives it line by line, using a
//! [`prompt::PromptDetector`] to tell when the device has finished talking.
//!
//! Key components:
//! - Prompt detection over streamed output
//! - The [`transport::Transport`] byte-stream seam and its PTY implementation
//! - Session lifecycle: login, commands, privilege escalation, logout
//! - [`opener::SessionOpener`] for handing new sessions to a pool
//! - [`fake`], an in-memory simulated router for tests

pub mod error;
pub mod fake;
pub mod opener;
pub mod prompt;
pub mod pty;
pub mod session;
pub mod transport;

pub use error::{Result, SessionError};
pub use opener::SessionOpener;
pub use prompt::{PromptDetector, PromptState};
pub use session::{Reply, Session, SessionOptions, SessionState};
pub use transport::Transport;
