use std::io::Write;

use sp_core::config::Config;

use super::{cancel_on_ctrl_c, connect, shutdown};

/// Run the `run` subcommand: one command, output to stdout.
pub async fn run(config: &Config, command: &str, privileged: bool) -> anyhow::Result<()> {
    let executor = connect(config)?;
    let cancel = cancel_on_ctrl_c();

    let result = executor.run(command, privileged, &cancel).await;
    shutdown(&executor).await;

    print_output(&result?)
}

/// Run the `batch` subcommand: every command on one session.
pub async fn batch(config: &Config, commands: &[String], privileged: bool) -> anyhow::Result<()> {
    let executor = connect(config)?;
    let cancel = cancel_on_ctrl_c();

    let result = executor.run_batch(commands, privileged, &cancel).await;
    shutdown(&executor).await;

    print_output(&result?)
}

fn print_output(output: &[u8]) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output)?;
    if !output.ends_with(b"\n") {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}
