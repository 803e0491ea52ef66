//! relay-tcp - TCP relay entry point

use clap::Parser;
use netrelay::config::{CommonArgs, TcpArgs, TcpRelayConfig};
use netrelay::error::RelayError;
use netrelay::tcp::TcpRelayServer;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// TCP relay with address filtering, target balancing and optional TLS on
/// either leg
#[derive(Parser, Debug)]
#[command(name = "relay-tcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tcp: TcpArgs,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logging(args.common.verbose);

    let config = match TcpRelayConfig::from_args(&args.common, &args.tcp) {
        Ok(config) => config,
        Err(RelayError::Config(errors)) => {
            for error in &errors {
                eprintln!("relay-tcp: {}", error);
            }
            std::process::exit(1);
        }
    };

    let server = match TcpRelayServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("relay-tcp: {:#}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    spawn_signal_handler(shutdown_tx);

    match server.run(shutdown_rx).await {
        Ok(()) => std::process::exit(130),
        Err(e) => {
            eprintln!("relay-tcp: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle Ctrl+C and termination signals (cross-platform)
fn spawn_signal_handler(shutdown_tx: broadcast::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx.send(true);
    });
}

/// Verbose mode traces the full connection lifecycle; default is the
/// startup summary and errors only
fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
