use std::sync::{Arc, Mutex, MutexGuard};

use sp_core::config::{Config, SessionConfig};
use sp_core::sanitize::sanitize_command;
use sp_core::secret::Secret;
use sp_session::Session;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dialog::{change_secret, SecretChange};
use crate::error::ExecError;
use crate::pool::SessionPool;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// ExecutorOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub retry: RetryPolicy,
    pub session: SessionConfig,
    /// Used to enter privileged mode.
    pub privileged_secret: Option<Secret>,
    /// Current login secret, offered when a secret change asks for it.
    pub primary_secret: Option<Secret>,
}

impl ExecutorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from(&config.retry),
            session: config.session.clone(),
            privileged_secret: None,
            primary_secret: None,
        }
    }

    pub fn with_privileged_secret(mut self, secret: Secret) -> Self {
        self.privileged_secret = Some(secret);
        self
    }

    pub fn with_primary_secret(mut self, secret: Secret) -> Self {
        self.primary_secret = Some(secret);
        self
    }
}

#[derive(Default)]
struct Secrets {
    privileged: Option<Secret>,
    primary: Option<Secret>,
}

enum Work<'a> {
    Commands(&'a [String]),
    ChangeSecret(SecretChange<'a>),
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs commands on pooled sessions with elevation and bounded retry.
///
/// Every operation acquires one session, elevates it if needed and not
/// already elevated, does its work, and releases it. A failed session is
/// discarded and the whole cycle retried on a fresh one, pausing
/// `base_delay * attempt` between attempts. Authentication failures,
/// acquire timeouts and cancellation are returned immediately.
#[derive(Clone)]
pub struct Executor {
    pool: SessionPool,
    retry: RetryPolicy,
    session: Arc<SessionConfig>,
    secrets: Arc<Mutex<Secrets>>,
}

impl Executor {
    pub fn new(pool: SessionPool, options: ExecutorOptions) -> Self {
        Self {
            pool,
            retry: options.retry,
            session: Arc::new(options.session),
            secrets: Arc::new(Mutex::new(Secrets {
                privileged: options.privileged_secret,
                primary: options.primary_secret,
            })),
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run one command and return its output.
    pub async fn run(
        &self,
        command: &str,
        privileged: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ExecError> {
        let commands = [command.to_string()];
        self.execute("run", &Work::Commands(&commands), privileged, None, cancel)
            .await
    }

    /// Run several commands on one session, in order, with at most one
    /// elevation. Outputs are joined with `\n`.
    pub async fn run_batch(
        &self,
        commands: &[String],
        privileged: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ExecError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.execute("run_batch", &Work::Commands(commands), privileged, None, cancel)
            .await
    }

    /// Change the secret that guards privileged mode.
    ///
    /// `old` may be empty when the device has no privileged secret yet; it
    /// is still offered as-is to the elevation prompt and to the device's
    /// old-secret prompt. Elevation prefers the configured privileged secret
    /// and falls back to `old`. On success the new secret is used for later
    /// elevations.
    pub async fn set_privileged_secret(
        &self,
        old: &Secret,
        new: &Secret,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let change = SecretChange {
            command: &self.session.privileged_secret_command,
            current: Some(old),
            new,
        };
        self.execute(
            "set_privileged_secret",
            &Work::ChangeSecret(change),
            true,
            Some(old),
            cancel,
        )
        .await?;
        self.lock_secrets().privileged = Some(new.clone());
        info!("privileged secret changed");
        Ok(())
    }

    /// Change the login secret. The current one is offered only if the
    /// device asks for it.
    pub async fn set_primary_secret(
        &self,
        new: &Secret,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let current = self.lock_secrets().primary.clone();
        let change = SecretChange {
            command: &self.session.primary_secret_command,
            current: current.as_ref(),
            new,
        };
        self.execute(
            "set_primary_secret",
            &Work::ChangeSecret(change),
            true,
            None,
            cancel,
        )
        .await?;
        self.lock_secrets().primary = Some(new.clone());
        info!("primary secret changed");
        Ok(())
    }

    // ----- helpers -----

    fn lock_secrets(&self) -> MutexGuard<'_, Secrets> {
        self.secrets.lock().unwrap_or_else(|e| {
            warn!("executor secret lock was poisoned, recovering");
            e.into_inner()
        })
    }

    async fn execute(
        &self,
        operation: &str,
        work: &Work<'_>,
        privileged: bool,
        fallback_secret: Option<&Secret>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ExecError> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .attempt(work, privileged, fallback_secret, cancel)
                .await
            {
                Ok(output) => {
                    if attempt > 1 {
                        info!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(e) if !e.is_retryable() => {
                    debug!(operation, attempt, error = %e, "not retrying");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "attempt failed"
                    );
                    if attempt >= attempts {
                        return Err(ExecError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        work: &Work<'_>,
        privileged: bool,
        fallback_secret: Option<&Secret>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ExecError> {
        let mut lease = self.pool.acquire(cancel).await?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            result = self.drive(&mut lease, work, privileged, fallback_secret) => result,
        };

        match result {
            Ok(output) => {
                self.pool.release(lease).await;
                Ok(output)
            }
            Err(e) => {
                self.pool.discard(lease).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        work: &Work<'_>,
        privileged: bool,
        fallback_secret: Option<&Secret>,
    ) -> Result<Vec<u8>, ExecError> {
        if privileged && !session.is_elevated() {
            let secret = self
                .lock_secrets()
                .privileged
                .clone()
                .or_else(|| fallback_secret.cloned())
                .ok_or_else(|| {
                    ExecError::Authentication("no privileged secret configured".into())
                })?;
            let deadline = Instant::now() + self.session.elevate_timeout();
            session
                .elevate(&secret, deadline)
                .await
                .map_err(|e| ExecError::during(&self.session.elevate_command, e))?;
        }

        match work {
            Work::Commands(commands) => {
                let mut output = Vec::new();
                for (i, command) in commands.iter().enumerate() {
                    let deadline = Instant::now() + self.session.timeout_for(command);
                    let out = session
                        .send(command, deadline)
                        .await
                        .map_err(|e| ExecError::during(command, e))?;
                    if i > 0 {
                        output.push(b'\n');
                    }
                    output.extend_from_slice(&out);
                }
                Ok(output)
            }
            Work::ChangeSecret(change) => {
                let deadline = Instant::now() + self.session.timeout_for(change.command);
                change_secret(session, change, deadline)
                    .await
                    .map_err(|e| ExecError::during(change.command, e))?;
                debug!(
                    session_id = session.id(),
                    command = %sanitize_command(change.command),
                    "secret change accepted"
                );
                Ok(Vec::new())
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish()
    }
}
