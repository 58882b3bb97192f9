/*!
 * Bluewire Bluetooth Integration Daemon
 * Pairing, discovery and transfer sessions without the desktop stack
 */

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use bluewire_daemon::bluetooth::BluezService;
use bluewire_daemon::config::DaemonConfig;
use bluewire_daemon::ipc::{send_request, IpcServer};
use bluewire_daemon::protocol::{Request, Response};
use bluewire_daemon::Daemon;

#[derive(Parser)]
#[command(name = "bluewired")]
#[command(about = "Bluewire Bluetooth Integration Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/bluewire/bluewired.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Check daemon status
    Status,
    /// Stop the daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("bluewire_daemon={},bluewired={}", log_level, log_level))
        .init();

    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
        Commands::Stop => stop_daemon(&config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("Bluewire daemon starting...");

    let service = Arc::new(BluezService::new(config.obex.save_path.clone()));
    let socket_path = config.socket_path.clone();
    let (daemon, handle) = Daemon::new(service, config);

    let ipc_server = IpcServer::bind(&socket_path, handle.clone())?;
    info!("Bluewire daemon ready on socket: {}", socket_path);

    let daemon = tokio::spawn(daemon.run());
    tokio::select! {
        result = ipc_server.run() => {
            if let Err(e) = result {
                error!("IPC server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = handle.closed() => {}
    }

    handle.shutdown();
    if let Err(e) = daemon.await {
        error!("Daemon task failed: {}", e);
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!("Could not remove socket {}: {}", socket_path, e);
    }
    Ok(())
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    match send_request(&config.socket_path, &Request::IsOnline).await? {
        Response::Online {
            online,
            obex_online,
            discovering,
        } => {
            println!("bluetooth: {}", if online { "online" } else { "offline" });
            println!("obex:      {}", if obex_online { "online" } else { "offline" });
            println!("discovery: {}", if discovering { "active" } else { "idle" });
        }
        other => println!("Unexpected response: {:?}", other),
    }
    Ok(())
}

async fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    match send_request(&config.socket_path, &Request::Shutdown).await? {
        Response::Success { message } => println!("{}", message),
        Response::Error { message } => println!("Error: {}", message),
        other => println!("Unexpected response: {:?}", other),
    }
    Ok(())
}
