//! Central control server deployment.
//!
//! Runs the party registry / signaling hub that remote clients connect to
//! over WebSocket. Deployed separately from clients and relays.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;

use lanrage::control::server::ControlServer;

/// LANrage control server
#[derive(Parser, Debug)]
#[command(name = "lanrage-control")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8666")]
    listen: SocketAddr,

    /// Path of the persisted registry state
    #[arg(long, default_value = "control_state.json")]
    state_file: PathBuf,

    /// Bearer token clients must present; omit to disable auth
    #[arg(long)]
    token: Option<String>,

    /// Maximum peers per party
    #[arg(long, default_value = "255")]
    max_clients: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    lanrage::logging::init(args.verbose);

    let server = match ControlServer::new(args.state_file, args.token, args.max_clients).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = tokio::spawn(server.run(args.listen, shutdown_rx));

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutting down control server");
        let _ = shutdown_tx.send(true);
    }

    match serve.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::FAILURE
        }
        Err(_) => ExitCode::FAILURE,
    }
}
