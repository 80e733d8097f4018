//! Termshare
//!
//! Share a terminal with remote viewers, join someone else's, or run the
//! signaling relay both sides meet through.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use termshare::config::{default_config_path, Config};
use termshare::host::{run_share, ShareOptions};
use termshare::relay::RelayServer;
use termshare::viewer::{run_join, JoinOptions};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Termshare - share a terminal session peer-to-peer.
#[derive(Parser, Debug)]
#[command(name = "termshare")]
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

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Share a new shell with remote viewers
    Share {
        /// Signaling relay URL
        #[arg(long, value_name = "URL")]
        server: Option<String>,

        /// Do not offer the TURN fallback relays to viewers
        #[arg(long)]
        no_turn: bool,

        /// Shell to run instead of the configured one
        #[arg(long)]
        shell: Option<String>,
    },

    /// Join a shared session
    Join {
        /// Session ID printed by `termshare share`
        session_id: String,

        /// Signaling relay URL
        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },

    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    let overrides = config.apply_env_overrides();
    config.validate()?;

    let to_file = !matches!(cli.command, Commands::Relay { .. });
    let _log_guard = init_logging(&config, cli.verbose, to_file)?;
    tracing::debug!(path = %config_path.display(), "Configuration loaded");
    for note in overrides {
        tracing::info!("{}", note);
    }

    match cli.command {
        Commands::Share {
            server,
            no_turn,
            shell,
        } => {
            if let Some(shell) = shell {
                config.host.shell = shell;
            }
            config.validate_shell()?;

            let reason = run_share(
                &config,
                ShareOptions {
                    signaling_url: server,
                    disable_turn: no_turn,
                },
            )
            .await?;
            println!("\r\n{}", reason);
        }
        Commands::Join { session_id, server } => {
            // The viewer prints its own reason while tearing the screen down.
            run_join(
                &config,
                JoinOptions {
                    session_id,
                    signaling_url: server,
                },
            )
            .await?;
        }
        Commands::Relay { listen } => {
            let listen = listen.unwrap_or_else(|| config.relay.listen_addr.clone());
            let server = RelayServer::bind(&listen, config.server_relay_config())
                .await
                .with_context(|| format!("Failed to listen on {}", listen))?;
            println!("Relay listening on {}", server.local_addr()?);
            server.run(wait_for_shutdown_signal()).await?;
        }
    }

    // Stdin readers hold a blocking thread the runtime would otherwise wait on.
    std::process::exit(0);
}

/// Sets up tracing. `share` and `join` own the terminal, so they log to a file.
fn init_logging(
    config: &Config,
    verbose: bool,
    to_file: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.general.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if !to_file {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let log_dir = &config.general.data_dir;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::never(log_dir, "termshare.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
    }
}

/// Wait for a shutdown signal (Ctrl-C).
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl-C");
}
