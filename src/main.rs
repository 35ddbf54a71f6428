use std::net::SocketAddrV4;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use peer_time_sync::network::control;
use peer_time_sync::{Config, ConnectionManager, Result, SyncLevel};

#[derive(Parser)]
#[command(name = "peer-time-sync", version, about = "Peer-to-peer clock synchronization node")]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node
    Run {
        /// IPv4 address to bind to
        #[arg(short = 'b', long = "bind")]
        bind_addr: Option<String>,

        /// UDP port to bind to (0 picks a free port)
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Host of the peer to join through
        #[arg(short = 'a', long = "peer-address", requires = "peer_port")]
        peer_address: Option<String>,

        /// Port of the peer to join through
        #[arg(
            short = 'r',
            long = "peer-port",
            requires = "peer_address",
            value_parser = clap::value_parser!(u16).range(1..)
        )]
        peer_port: Option<u16>,
    },

    /// Query a node's time
    Time {
        /// Node address, e.g. 127.0.0.1:4000
        node: SocketAddrV4,

        /// How long to wait for the answer
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },

    /// Make a node the root, or revoke its root role
    Leader {
        /// Node address, e.g. 127.0.0.1:4000
        node: SocketAddrV4,

        /// Step down instead of becoming root
        #[arg(long)]
        resign: bool,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

/// Cancels `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}

async fn run_node(
    bind_addr: Option<String>,
    port: Option<u16>,
    peer_address: Option<String>,
    peer_port: Option<u16>,
) -> Result<()> {
    let config = Config::from_cli_parts(bind_addr.as_deref(), port, peer_address, peer_port)?;
    let mut node = ConnectionManager::bind(&config).await?;
    info!(local_addr = %node.local_addr(), "node started");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    node.run(shutdown).await
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run {
            bind_addr,
            port,
            peer_address,
            peer_port,
        } => run_node(bind_addr, port, peer_address, peer_port).await,
        Command::Time { node, timeout_ms } => {
            let reading = control::query_time(node, Duration::from_millis(timeout_ms)).await?;
            println!("level {} time {}", reading.level, reading.timestamp);
            Ok(())
        }
        Command::Leader { node, resign } => {
            let level = if resign {
                SyncLevel::UNSYNCED
            } else {
                SyncLevel::LEADER
            };
            control::send_leader(node, level).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
