pub mod config;
pub mod run;
pub mod secret;

use std::sync::Arc;

use anyhow::Context;
use sp_core::config::Config;
use sp_core::secret::Secret;
use sp_pool::{Executor, ExecutorOptions, SessionPool};
use sp_session::opener::PtyOpener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Build an executor for the configured device, reading secrets from the
/// environment variables the config names.
pub fn connect(config: &Config) -> anyhow::Result<Executor> {
    if config.device.host.is_empty() {
        anyhow::bail!("device.host is not configured");
    }

    let login_secret = Secret::from_optional_env(config.device.login_secret_env.as_deref())
        .context("failed to read login secret")?;
    let admin_secret = Secret::from_optional_env(config.device.admin_secret_env.as_deref())
        .context("failed to read privileged secret")?;

    let opener = PtyOpener::new(
        config.device.clone(),
        config.session.clone(),
        login_secret.clone(),
    )
    .context("invalid session configuration")?;
    let pool = SessionPool::new(config.pool.clone(), Arc::new(opener));

    let mut options = ExecutorOptions::from_config(config);
    options.privileged_secret = admin_secret;
    options.primary_secret = login_secret;
    Ok(Executor::new(pool, options))
}

/// A token cancelled on Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

/// Log pool usage and log out of every session.
pub async fn shutdown(executor: &Executor) {
    executor.pool().log_stats();
    executor.pool().close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_requires_a_host() {
        let err = connect(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("device.host"));
    }

    #[tokio::test]
    async fn connect_reports_missing_secret_variable() {
        let mut config = Config::default();
        config.device.host = "192.168.100.1".into();
        config.device.admin_secret_env = Some("SP_TEST_SECRET_THAT_IS_NOT_SET".into());
        let err = connect(&config).unwrap_err();
        assert!(format!("{err:#}").contains("SP_TEST_SECRET_THAT_IS_NOT_SET"));
    }

    #[tokio::test]
    async fn connect_builds_an_idle_pool() {
        let mut config = Config::default();
        config.device.host = "192.168.100.1".into();
        let executor = connect(&config).unwrap();
        let stats = executor.pool().stats();
        assert_eq!(stats.capacity, config.pool.capacity);
        assert_eq!(stats.total_created, 0);
        shutdown(&executor).await;
    }
}
