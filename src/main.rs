mod bridge;
mod cli;
mod host;
mod proto;
mod transport;

use std::sync::Arc;

use clap::Parser;
use cli::Cli;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use bridge::BridgeError;
use host::x11::X11Clipboard;
use host::{HostClipboard, HostError};
use transport::udscs::ClientConfig;

/// Startup and runtime errors of the agent process.
#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("Daemon mode is not implemented, please run with '-x'.")]
    UnimplementedDaemon,
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "agent failed");
        eprintln!("clipbridge: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AgentError> {
    if !cli.foreground {
        return Err(AgentError::UnimplementedDaemon);
    }

    let host: Arc<dyn HostClipboard> = Arc::new(X11Clipboard::connect()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = sighup.recv() => tracing::info!("received SIGHUP, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let client = ClientConfig {
        socket_path: cli.vdagentd_socket,
        ..ClientConfig::default()
    };
    bridge::run(bridge::Config::default(), client, host, shutdown_rx).await?;
    Ok(())
}
