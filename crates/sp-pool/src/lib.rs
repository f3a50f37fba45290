//! Bounded session pool and command executor for one network device.
//!
//! Key components:
//! - [`pool::SessionPool`]: capacity-bounded pool with exclusive leases,
//!   acquire timeout, cancellation and an idle reaper
//! - [`executor::Executor`]: run commands with elevation and bounded retry
//! - [`dialog`]: the interactive secret-change exchange
//! - [`error`]: the failure taxonomy shared by both

pub mod dialog;
pub mod error;
pub mod executor;
pub mod pool;
pub mod retry;

pub use error::{ErrorKind, ExecError, PoolError};
pub use executor::{Executor, ExecutorOptions};
pub use pool::{PoolStats, PooledSession, SessionPool};
pub use retry::RetryPolicy;
