use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start transport: {0}")]
    Spawn(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed by the device")]
    Eof,

    #[error("no prompt after {0:?}")]
    Timeout(Duration),

    #[error("session is closed")]
    Closed,

    #[error("session is unusable after an interrupted exchange")]
    Poisoned,

    #[error("unexpected prompt `{0}`")]
    UnexpectedPrompt(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("invalid prompt pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl SessionError {
    /// Rejections by the device, as opposed to transport trouble.
    pub fn is_authentication(&self) -> bool {
        matches!(self, SessionError::AuthenticationFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
