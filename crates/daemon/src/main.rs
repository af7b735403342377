//! WebTerm Daemon
//!
//! Serves interactive shell sessions to browsers over WebSocket.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::auth::{hash_password, TokenAuthority};
use daemon::config::{default_config_path, Config};
use daemon::logging::init_logging;
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};

/// WebTerm Daemon - remote interactive shells over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "webterm-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve until SIGINT or SIGTERM
    Start,

    /// Mint an access token for a configured user
    Token {
        /// Username from the [auth] section
        username: String,
    },

    /// Print the SHA-256 digest to store as a user's password_sha256
    HashPassword {
        /// Password to hash
        password: String,
    },

    /// Validate the configuration and exit
    CheckConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    let _log_guard = init_logging(
        &config.daemon.log_level,
        cli.verbose,
        config.daemon.log_dir.as_deref(),
    );
    tracing::debug!("Using config file: {:?}", config_path);

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Start => {
            tracing::info!("WebTerm daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Token { username } => {
            if config.auth.secret.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!(
                    "auth.secret is not configured; a token minted now would not be accepted by a running daemon"
                );
            }
            let authority = TokenAuthority::from_config(&config.auth)?;
            let issued = authority.issue(&username)?;
            println!("{}", issued.token);
        }
        Commands::HashPassword { password } => {
            println!("{}", hash_password(&password));
        }
        Commands::CheckConfig { print } => {
            println!("Configuration OK ({})", config_path.display());
            if print {
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}

/// Run the daemon until a shutdown signal arrives.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!("Accepting WebSocket connections on ws://{}/terminal", addr);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
