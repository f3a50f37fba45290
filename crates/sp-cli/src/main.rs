mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sp_core::config::Config;

/// shellpool CLI -- run commands on a network device over pooled sessions.
#[derive(Parser)]
#[command(name = "sp", version, about)]
struct Cli {
    /// Configuration file (default: ~/.shellpool/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON instead of human-readable lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command and print its output.
    Run {
        /// Command line to send.
        command: String,
        /// Enter privileged mode first.
        #[arg(long)]
        privileged: bool,
    },

    /// Run several commands on one session.
    Batch {
        /// Command lines to send, in order.
        #[arg(required = true)]
        commands: Vec<String>,
        /// Enter privileged mode first.
        #[arg(long)]
        privileged: bool,
    },

    /// Change the privileged-mode secret.
    SetPrivilegedSecret {
        /// Environment variable holding the current secret (omit if none is set).
        #[arg(long)]
        old_env: Option<String>,
        /// Environment variable holding the new secret.
        #[arg(long)]
        new_env: String,
    },

    /// Change the login secret.
    SetPrimarySecret {
        /// Environment variable holding the new secret.
        #[arg(long)]
        new_env: String,
    },

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    if cli.json_logs {
        config.logging.json = true;
    }
    sp_telemetry::logging::init_from_config("sp", &config.logging);

    match cli.command {
        Commands::Run {
            command,
            privileged,
        } => commands::run::run(&config, &command, privileged).await?,
        Commands::Batch {
            commands,
            privileged,
        } => commands::run::batch(&config, &commands, privileged).await?,
        Commands::SetPrivilegedSecret { old_env, new_env } => {
            commands::secret::set_privileged(&config, old_env.as_deref(), &new_env).await?
        }
        Commands::SetPrimarySecret { new_env } => {
            commands::secret::set_primary(&config, &new_env).await?
        }
        Commands::Config => commands::config::run(&config)?,
    }

    Ok(())
}
