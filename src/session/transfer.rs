//! relay-fabric/src/session/transfer.rs
//! Inter-proxy transfer session: the accept-side dispatcher for
//! `FetchOldData`/`SendFreshData` streams, plus the dial-side helpers a client session
//! uses to open one.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::codec::{self, Command};
use crate::discovery::PeerProxy;
use crate::error::{FabricError, Result};
use crate::state::FabricState;

/// Resolves `cluster_ip` to a dialable transfer-port address via the service registry.
pub(crate) async fn peer_transfer_addr(state: &FabricState, cluster_ip: &str) -> Result<SocketAddr> {
    let peers: Vec<PeerProxy> = state.service_registry.peers().await;
    let peer = peers
        .into_iter()
        .find(|p| p.cluster_ip == cluster_ip)
        .ok_or_else(|| FabricError::protocol(format!("no known peer for cluster ip {cluster_ip}")))?;
    format!("{}:{}", peer.cluster_ip, peer.transfer_port)
        .parse()
        .map_err(|e| FabricError::protocol(format!("bad peer transfer address: {e}")))
}

/// Accepts inter-proxy transfer connections forever, spawning one task per connection.
pub async fn serve(listener: TcpListener, state: Arc<FabricState>) {
    loop {
        let (conn, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "transfer listener accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_incoming(conn, state).await {
                error!(peer = %peer_addr, error = %e, "transfer session ended with an error");
            }
        });
    }
}

async fn handle_incoming(mut conn: TcpStream, state: Arc<FabricState>) -> Result<()> {
    let (mode_cmd, _) = codec::recv(&mut conn).await?;
    let (id_cmd, client_id) = codec::recv(&mut conn).await?;
    if id_cmd != Command::ClientId {
        return Err(FabricError::protocol("expected ClientId frame after transfer mode"));
    }

    match mode_cmd {
        Command::FetchOldData => handle_fetch_old_data(conn, state, client_id).await,
        Command::SendFreshData => handle_send_fresh_data(conn, state, client_id).await,
        other => Err(FabricError::protocol(format!(
            "unexpected transfer mode frame {other:?}"
        ))),
    }
}

async fn handle_fetch_old_data(mut conn: TcpStream, state: Arc<FabricState>, client_id: String) -> Result<()> {
    let records = state.spool.drain(&client_id).await;
    info!(client = %client_id, count = records.len(), "serving FetchOldData");
    for record in &records {
        codec::send(&mut conn, Command::TransferData, record).await?;
    }
    codec::send(&mut conn, Command::TransferEnd, "").await?;
    Ok(())
}

async fn handle_send_fresh_data(mut conn: TcpStream, state: Arc<FabricState>, client_id: String) -> Result<()> {
    loop {
        let (cmd, payload) = codec::recv(&mut conn).await?;
        match cmd {
            Command::ClientData => {
                state
                    .registry
                    .forward_to_receiver(&client_id, Command::ClientData, &payload)
                    .await?;
                state.spool.append(&client_id, &payload).await?;
            }
            Command::TransferEnd => {
                let _ = state
                    .registry
                    .forward_to_receiver(&client_id, Command::TransferEnd, &client_id)
                    .await;
                state.registry.signal_completion(&client_id).await;
                return Ok(());
            }
            other => {
                return Err(FabricError::protocol(format!(
                    "unexpected frame {other:?} during SendFreshData"
                )))
            }
        }
    }
}

/// A lazily-opened, reused connection a sender session forwards live records through
/// once it learns its receiver lives at a different proxy; subsequent forwards reuse
/// the same connection instead of redialing.
pub struct FreshDataLink {
    conn: TcpStream,
}

impl FreshDataLink {
    pub async fn open(addr: SocketAddr, client_id: &str) -> Result<Self> {
        let mut conn = crate::transport::dial(addr)
            .await
            .map_err(|source| FabricError::Dial { addr: addr.to_string(), source })?;
        codec::send(&mut conn, Command::SendFreshData, "").await?;
        codec::send(&mut conn, Command::ClientId, client_id).await?;
        Ok(FreshDataLink { conn })
    }

    pub async fn send_data(&mut self, record: &str) -> Result<()> {
        codec::send(&mut self.conn, Command::ClientData, record).await
    }

    pub async fn end(mut self) -> Result<()> {
        codec::send(&mut self.conn, Command::TransferEnd, "").await
    }
}

/// Drains a remote proxy's spool for `client_id`. Used both for migration and for the
/// `FetchClientData` steady-state request.
pub async fn fetch_old_data(addr: SocketAddr, client_id: &str) -> Result<Vec<String>> {
    let mut conn = crate::transport::dial(addr)
        .await
        .map_err(|source| FabricError::Dial { addr: addr.to_string(), source })?;
    codec::send(&mut conn, Command::FetchOldData, "").await?;
    codec::send(&mut conn, Command::ClientId, client_id).await?;

    let mut records = Vec::new();
    loop {
        let (cmd, payload) = codec::recv(&mut conn).await?;
        match cmd {
            Command::TransferData => records.push(payload),
            Command::TransferEnd => return Ok(records),
            other => {
                return Err(FabricError::protocol(format!(
                    "unexpected frame {other:?} during FetchOldData"
                )))
            }
        }
    }
}
