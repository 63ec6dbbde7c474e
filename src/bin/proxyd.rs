//! relay-fabric/src/bin/proxyd.rs
//! Proxy binary: loads configuration, builds the fabric state, and runs the proxy's
//! three listeners (client-serve, inter-proxy transfer, UDP ping).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};

use relay_fabric::config::ProxyConfig;
use relay_fabric::directory::InMemoryDirectory;
use relay_fabric::discovery::StaticRegistry;
use relay_fabric::session;
use relay_fabric::spool::InMemorySpool;
use relay_fabric::state::FabricState;
use relay_fabric::transport;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cross-cluster relay fabric proxy")]
struct Opt {
    /// Path to a TOML config file. Falls back to defaults plus RELAY_FABRIC_* env vars.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();
    let config = ProxyConfig::load(opt.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("failed to load config: {e}");
        std::process::exit(1);
    });

    relay_fabric::logging::init_logging(&config.log_filter);

    let bind_ip = config.bind_addr.clone();
    let client_addr: SocketAddr = format!("{}:{}", bind_ip, config.client_port).parse().unwrap();
    let transfer_addr: SocketAddr = format!("{}:{}", bind_ip, config.transfer_port).parse().unwrap();
    let ping_addr: SocketAddr = format!("{}:{}", bind_ip, config.ping_port).parse().unwrap();

    let peers = config.peers.clone();
    let state = FabricState::new(
        Arc::new(InMemoryDirectory::new()),
        Arc::new(InMemorySpool::new()),
        Arc::new(StaticRegistry::new(peers)),
        config,
    );

    let client_listener = match transport::bind_listener(client_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %client_addr, error = %e, "failed to bind client listener");
            std::process::exit(1);
        }
    };
    let transfer_listener = match transport::bind_listener(transfer_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %transfer_addr, error = %e, "failed to bind transfer listener");
            std::process::exit(1);
        }
    };
    let ping_socket = match UdpSocket::bind(ping_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!(addr = %ping_addr, error = %e, "failed to bind ping socket");
            std::process::exit(1);
        }
    };

    info!(%client_addr, %transfer_addr, %ping_addr, "proxy listening");

    let client_task = tokio::spawn(serve_clients(client_listener, state.clone()));
    let transfer_task = tokio::spawn(session::transfer::serve(transfer_listener, state.clone()));
    let ping_task = tokio::spawn(transport::run_ping_responder(ping_socket));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = client_task => {}
        _ = transfer_task => {}
        _ = ping_task => {}
    }
}

async fn serve_clients(listener: TcpListener, state: Arc<FabricState>) {
    loop {
        let (conn, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "client listener accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = session::handle_client(conn, state).await {
                error!(peer = %peer_addr, error = %e, "client session ended with an error");
            }
        });
    }
}
