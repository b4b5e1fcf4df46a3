use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info};

use mcp_mrtr::commands;
use mcp_mrtr::config::{self, Config};
use mcp_mrtr::logging;
use mcp_mrtr::mrtr::Principal;
use mcp_mrtr::server::RequestHandler;
use mcp_mrtr::state::AppState;
use mcp_mrtr::transport::StdioServer;

#[derive(Parser, Debug)]
#[command(name = "mcp-mrtr")]
#[command(about = "Multi round-trip request server for the Model Context Protocol", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve JSON-RPC over stdin/stdout (default)
    Serve,
    /// Load and validate the configuration, then print a summary
    Check,
    /// Print a fresh base64 AES-256 key for `token.key`
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Serve);

    if let Command::Keygen = command {
        println!("{}", commands::run_keygen());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file()
            .await
            .context("Failed to load configuration")?,
    };

    logging::init(&config.logging, args.debug)?;
    match &args.config {
        Some(path) => info!("Configuration loaded successfully from {}", path.display()),
        None => info!("Configuration loaded successfully"),
    }

    match command {
        Command::Check => commands::run_config_check(config).await?,
        Command::Serve => run_stdio_mode(config).await?,
        Command::Keygen => {}
    }

    Ok(())
}

async fn run_stdio_mode(config: Config) -> anyhow::Result<()> {
    info!(
        "Starting {} {} in stdio mode",
        config.server.name, config.server.version
    );

    let (state, _shutdown_rx) = AppState::new(config)?;
    let reaper = state.spawn_reaper();

    let principal = Principal::new(state.config.server.principal.clone());
    let handler = Arc::new(RequestHandler::new(state.clone()));
    let server = StdioServer::new(handler, principal);

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => {}
    }

    state.shutdown().await;
    if let Err(e) = reaper.await {
        debug!("Reaper task ended abnormally: {}", e);
    }

    info!("Final metrics:\n{}", state.metrics.render());
    info!("Stdio mode exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
