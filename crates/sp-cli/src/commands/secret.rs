use anyhow::Context;
use sp_core::config::Config;
use sp_core::secret::Secret;
use tracing::info;

use super::{cancel_on_ctrl_c, connect, shutdown};

/// Run the `set-privileged-secret` subcommand.
pub async fn set_privileged(
    config: &Config,
    old_env: Option<&str>,
    new_env: &str,
) -> anyhow::Result<()> {
    let old = Secret::from_optional_env(old_env)
        .context("failed to read current secret")?
        .unwrap_or_else(|| Secret::new(""));
    let new = Secret::from_env(new_env).context("failed to read new secret")?;

    let executor = connect(config)?;
    let cancel = cancel_on_ctrl_c();
    let result = executor.set_privileged_secret(&old, &new, &cancel).await;
    shutdown(&executor).await;

    result.context("failed to change privileged secret")?;
    info!(host = %config.device.host, "privileged secret updated");
    println!("privileged secret updated");
    Ok(())
}

/// Run the `set-primary-secret` subcommand.
pub async fn set_primary(config: &Config, new_env: &str) -> anyhow::Result<()> {
    let new = Secret::from_env(new_env).context("failed to read new secret")?;

    let executor = connect(config)?;
    let cancel = cancel_on_ctrl_c();
    let result = executor.set_primary_secret(&new, &cancel).await;
    shutdown(&executor).await;

    result.context("failed to change login secret")?;
    info!(host = %config.device.host, "login secret updated");
    println!("login secret updated");
    Ok(())
}
