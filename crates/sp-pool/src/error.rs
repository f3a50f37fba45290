use std::fmt;
use std::time::Duration;

use sp_core::sanitize::sanitize_command;
use sp_session::SessionError;
use thiserror::Error;

// ---------------------------------------------------------------------------
// PoolError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session became available within {waited:?}")]
    AcquireTimeout { waited: Duration },

    #[error("failed to create session: {0}")]
    Creation(#[source] SessionError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("session pool is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Coarse classification used for retry decisions and by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AcquireTimeout,
    SessionCreation,
    CommandExecution,
    Authentication,
    Cancelled,
    PoolClosed,
}

impl ErrorKind {
    /// Only transient channel trouble is worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::SessionCreation | ErrorKind::CommandExecution)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AcquireTimeout => "acquire timeout",
            ErrorKind::SessionCreation => "session creation failure",
            ErrorKind::CommandExecution => "command execution failure",
            ErrorKind::Authentication => "authentication failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::PoolClosed => "pool closed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ExecError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no session became available within {waited:?}")]
    AcquireTimeout { waited: Duration },

    #[error("failed to create session: {0}")]
    SessionCreation(#[source] SessionError),

    #[error("command `{command}` failed: {source}")]
    CommandExecution {
        command: String,
        #[source]
        source: SessionError,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("session pool is closed")]
    PoolClosed,

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<ExecError>,
    },
}

impl ExecError {
    /// The kind of the underlying failure; exhausted retries report the
    /// kind of the last attempt.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            ExecError::SessionCreation(_) => ErrorKind::SessionCreation,
            ExecError::CommandExecution { .. } => ErrorKind::CommandExecution,
            ExecError::Authentication(_) => ErrorKind::Authentication,
            ExecError::Cancelled => ErrorKind::Cancelled,
            ExecError::PoolClosed => ErrorKind::PoolClosed,
            ExecError::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ExecError::RetriesExhausted { .. } => false,
            other => other.kind().is_retryable(),
        }
    }

    /// Attempts made before giving up, if retries were exhausted.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ExecError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Classify a failure that happened while driving `command`.
    pub(crate) fn during(command: &str, error: SessionError) -> Self {
        if error.is_authentication() {
            ExecError::Authentication(error.to_string())
        } else {
            ExecError::CommandExecution {
                command: sanitize_command(command).into_owned(),
                source: error,
            }
        }
    }
}

impl From<PoolError> for ExecError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::AcquireTimeout { waited } => ExecError::AcquireTimeout { waited },
            PoolError::Creation(e) if e.is_authentication() => {
                ExecError::Authentication(e.to_string())
            }
            PoolError::Creation(e) => ExecError::SessionCreation(e),
            PoolError::Cancelled => ExecError::Cancelled,
            PoolError::Closed => ExecError::PoolClosed,
        }
    }
}
