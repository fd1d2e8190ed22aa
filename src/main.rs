//! LANrage entry binary.
//!
//! `--mode=client` (default) runs the mesh node; the management API
//! collaborator drives party operations against it. `--mode=relay` runs
//! the stateless UDP forwarder, announcing itself to the control server
//! when one is configured.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;

use lanrage::config::{Mode, Settings};
use lanrage::control::remote::RemoteControlPlane;
use lanrage::error::LanRageError;
use lanrage::model::{epoch_secs, RelayInfo};
use lanrage::node::Node;
use lanrage::relay::RelayServer;

/// LANrage - virtual LAN party mesh VPN
#[derive(Parser, Debug)]
#[command(name = "lanrage")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Operating mode; overrides the settings store
    #[arg(long, value_parser = ["client", "relay"])]
    mode: Option<String>,

    /// Configuration directory (default: ~/.lanrage)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    lanrage::logging::init(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), LanRageError> {
    let config_dir = args
        .config_dir
        .clone()
        .unwrap_or_else(default_config_dir);
    let mut settings = Settings::load(&config_dir)?;

    if let Some(mode) = &args.mode {
        settings.mode = mode.parse()?;
    }

    match settings.mode {
        Mode::Client => run_client(settings).await,
        Mode::Relay => run_relay(settings).await,
    }
}

async fn run_client(settings: Settings) -> Result<(), LanRageError> {
    tracing::info!("LANrage client starting");
    let node = Node::new(settings);
    node.initialize().await?;

    wait_for_signal().await;
    node.shutdown().await;
    Ok(())
}

async fn run_relay(settings: Settings) -> Result<(), LanRageError> {
    tracing::info!(port = settings.relay_port, "LANrage relay starting");
    let public_ip = settings.require_relay_public_ip()?;

    let mut relay = RelayServer::bind(settings.relay_port).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Announce this relay to the directory when a central server exists.
    let _control = if settings.control_server != "local" {
        let control = RemoteControlPlane::connect(
            settings.control_server.clone(),
            settings.control_token.clone(),
            shutdown_rx.clone(),
        );
        let info = RelayInfo {
            relay_id: format!("relay-{public_ip}-{}", settings.relay_port),
            endpoint: std::net::SocketAddr::from((public_ip, settings.relay_port)),
            region: "default".to_string(),
            capacity: settings.max_clients as u32,
            last_seen: epoch_secs(),
        };
        if let Err(e) = control.register_relay(info).await {
            tracing::warn!(error = %e, "relay registration failed, continuing anyway");
        }
        Some(control)
    } else {
        None
    };

    tokio::select! {
        result = relay.run(shutdown_rx) => result?,
        _ = wait_for_signal() => {
            tracing::info!("shutting down relay");
            let _ = shutdown_tx.send(true);
        }
    }
    Ok(())
}

/// Block until Ctrl+C or (on Unix) SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

fn default_config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".lanrage"))
        .unwrap_or_else(|| PathBuf::from(".lanrage"))
}
