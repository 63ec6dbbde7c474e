//! relay-fabric/src/session/client.rs
//! Client session: one task per accepted client connection, running the common
//! handshake then branching into the sender or receiver state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::arbiter;
use crate::codec::{self, Command, ROLE_RECEIVER, ROLE_SENDER};
use crate::error::{FabricError, Result};
use crate::session::transfer::{self, FreshDataLink};
use crate::state::FabricState;

/// How often the discovery task polls the directory for the receiver's location
/// (roughly every 300ms).
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Spin interval the receive loop uses to wait for the drain task to empty
/// `pending` before an in-line forward, to preserve FIFO ordering.
const PENDING_DRAIN_SPIN: Duration = Duration::from_millis(10);

/// Runs one accepted client connection end to end: handshake, optional migration,
/// then the role-specific steady state.
pub async fn handle_client(mut conn: TcpStream, state: Arc<FabricState>) -> Result<()> {
    let client_id = expect_frame(&mut conn, Command::ClientId).await?;
    let role = expect_frame(&mut conn, Command::ClientType).await?;
    let priority_s = expect_frame(&mut conn, Command::ClientPriority).await?;
    let current_ip = expect_frame(&mut conn, Command::ClusterIp).await?;
    let previous_ip = expect_frame(&mut conn, Command::ClusterIp).await?;

    let priority: i64 = priority_s
        .parse()
        .map_err(|e| FabricError::protocol(format!("bad ClientPriority {priority_s:?}: {e}")))?;

    let my_ip = state.cluster_ip_or_latch(&current_ip).await;
    info!(client = %client_id, role = %role, %priority, %my_ip, "client attached");

    if !previous_ip.is_empty() && previous_ip != my_ip {
        migrate_spool(&state, &client_id, &previous_ip).await?;
    }

    if let Err(e) = state.directory.put(&client_id, &my_ip).await {
        warn!(client = %client_id, error = %e, "failed to publish directory binding on attach");
    }

    codec::send(&mut conn, Command::TransferFinished, "").await?;

    let result = match role.as_str() {
        ROLE_SENDER => run_sender(conn, state.clone(), client_id.clone(), priority).await,
        ROLE_RECEIVER => run_receiver(conn, state.clone(), client_id.clone()).await,
        other => Err(FabricError::protocol(format!("unknown ClientType {other:?}"))),
    };

    if let Err(e) = state.directory.delete(&client_id).await {
        warn!(client = %client_id, error = %e, "failed to clear directory binding on teardown");
    }

    result
}

async fn expect_frame(conn: &mut TcpStream, expected: Command) -> Result<String> {
    let (cmd, payload) = codec::recv(conn).await?;
    if cmd != expected {
        return Err(FabricError::protocol(format!(
            "expected {expected:?} frame, got {cmd:?}"
        )));
    }
    Ok(payload)
}

async fn migrate_spool(state: &FabricState, client_id: &str, previous_ip: &str) -> Result<()> {
    let addr = transfer::peer_transfer_addr(state, previous_ip).await?;
    let records = transfer::fetch_old_data(addr, client_id).await?;
    debug!(client = %client_id, count = records.len(), previous = %previous_ip, "migrated spool");
    for record in records {
        state.spool.append(client_id, &record).await?;
    }
    Ok(())
}

/// State shared by a sender session's discovery task, drain task, and receive loop.
struct SenderShared {
    sender_id: String,
    receiver_id: String,
    my_cluster_ip: String,
    state: Arc<FabricState>,
    receiver_cluster_ip: Mutex<Option<String>>,
    pending: Mutex<Vec<String>>,
    transfer_link: Mutex<Option<FreshDataLink>>,
}

async fn run_sender(mut conn: TcpStream, state: Arc<FabricState>, sender_id: String, priority: i64) -> Result<()> {
    let receiver_id = expect_frame(&mut conn, Command::ClientId).await?;
    let my_cluster_ip = state.cluster_ip().unwrap_or_default().to_string();

    let shared = Arc::new(SenderShared {
        sender_id: sender_id.clone(),
        receiver_id: receiver_id.clone(),
        my_cluster_ip,
        state: state.clone(),
        receiver_cluster_ip: Mutex::new(None),
        pending: Mutex::new(Vec::new()),
        transfer_link: Mutex::new(None),
    });

    let (trigger_tx, trigger_rx) = arbiter::trigger_channel();
    let (exit_tx, exit_rx) = watch::channel(false);
    let (fatal_tx, fatal_rx) = watch::channel(false);
    let (exit_wait_tx, exit_wait_rx) = oneshot::channel::<()>();

    state
        .arbiter
        .register(&sender_id, priority, &receiver_id, trigger_tx.clone())
        .await;

    let discovery_handle = tokio::spawn(spawn_discovery(shared.clone(), trigger_tx.clone(), exit_rx.clone()));
    let drain_handle = tokio::spawn(spawn_drain(shared.clone(), trigger_rx, exit_rx.clone(), exit_wait_tx, fatal_tx));

    let result = receive_loop(&mut conn, &shared, &exit_tx, exit_wait_rx, fatal_rx).await;

    state.arbiter.remove(&sender_id).await;
    state.arbiter.trigger_next_priority(&receiver_id).await;
    discovery_handle.abort();
    let _ = drain_handle.await;

    result
}

async fn spawn_discovery(shared: Arc<SenderShared>, trigger_tx: mpsc::Sender<()>, mut exit_rx: watch::Receiver<bool>) {
    loop {
        let ip = shared
            .state
            .directory
            .get(&shared.receiver_id)
            .await
            .unwrap_or_default();
        if !ip.is_empty() {
            *shared.receiver_cluster_ip.lock().await = Some(ip);
            arbiter::pulse(&trigger_tx);
            return;
        }
        tokio::select! {
            _ = exit_rx.changed() => return,
            _ = tokio::time::sleep(DISCOVERY_POLL_INTERVAL) => {}
        }
    }
}

async fn spawn_drain(
    shared: Arc<SenderShared>,
    mut trigger_rx: mpsc::Receiver<()>,
    mut exit_rx: watch::Receiver<bool>,
    exit_wait_tx: oneshot::Sender<()>,
    fatal_tx: watch::Sender<bool>,
) {
    let mut exit_wait_tx = Some(exit_wait_tx);
    loop {
        tokio::select! {
            _ = trigger_rx.recv() => {}
            _ = exit_rx.changed() => {}
        }

        let receiver_known = shared.receiver_cluster_ip.lock().await.is_some();
        if receiver_known && shared.state.arbiter.is_first_priority(&shared.sender_id).await {
            // Hold the lock across the whole flush, not just a snapshot-then-release:
            // a `ClientData` arriving in `receive_loop` meanwhile must still see
            // `pending` non-empty until every queued record has actually been sent,
            // or it could jump the still-in-flight ones and break FIFO order.
            let mut pending = shared.pending.lock().await;
            while !pending.is_empty() {
                let record = pending[0].clone();
                if let Err(e) = forward_one(&shared, &record).await {
                    warn!(sender = %shared.sender_id, error = %e, "inter-proxy forward failed, aborting sender session");
                    let _ = fatal_tx.send(true);
                    return;
                }
                pending.remove(0);
            }
        }

        if *exit_rx.borrow() {
            let done = !receiver_known || shared.pending.lock().await.is_empty();
            if done {
                if let Some(tx) = exit_wait_tx.take() {
                    let _ = tx.send(());
                }
                return;
            }
        }
    }
}

async fn forward_one(shared: &SenderShared, record: &str) -> Result<()> {
    let receiver_ip = shared
        .receiver_cluster_ip
        .lock()
        .await
        .clone()
        .ok_or_else(|| FabricError::invariant("forward_one called with unknown receiver location"))?;

    if receiver_ip == shared.my_cluster_ip {
        shared
            .state
            .registry
            .forward_to_receiver(&shared.sender_id, Command::ClientData, record)
            .await
    } else {
        let mut link_guard = shared.transfer_link.lock().await;
        if link_guard.is_none() {
            let addr = transfer::peer_transfer_addr(&shared.state, &receiver_ip).await?;
            *link_guard = Some(FreshDataLink::open(addr, &shared.sender_id).await?);
        }
        link_guard.as_mut().unwrap().send_data(record).await
    }
}

/// Sends the terminal `TransferEnd` down whichever path the receiver lives on.
/// Tolerates an unknown receiver location by skipping rather than treating it as a
/// fatal invariant violation.
async fn end_transfer(shared: &SenderShared) -> Result<()> {
    let receiver_ip = shared.receiver_cluster_ip.lock().await.clone();
    let Some(receiver_ip) = receiver_ip else {
        return Ok(());
    };

    if receiver_ip == shared.my_cluster_ip {
        let _ = shared
            .state
            .registry
            .forward_to_receiver(&shared.sender_id, Command::TransferEnd, &shared.sender_id)
            .await;
        shared.state.registry.signal_completion(&shared.sender_id).await;
        Ok(())
    } else {
        let link = shared.transfer_link.lock().await.take();
        let link = match link {
            Some(link) => link,
            None => {
                let addr = transfer::peer_transfer_addr(&shared.state, &receiver_ip).await?;
                FreshDataLink::open(addr, &shared.sender_id).await?
            }
        };
        link.end().await
    }
}

async fn receive_loop(
    conn: &mut TcpStream,
    shared: &Arc<SenderShared>,
    exit_tx: &watch::Sender<bool>,
    exit_wait_rx: oneshot::Receiver<()>,
    mut fatal_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let (cmd, payload) = tokio::select! {
            frame = codec::recv(conn) => frame?,
            _ = fatal_rx.changed() => {
                return Err(FabricError::protocol(
                    "inter-proxy forward failed; aborting sender session",
                ));
            }
        };
        match cmd {
            Command::ClientData => {
                let receiver_known = shared.receiver_cluster_ip.lock().await.is_some();
                if !receiver_known {
                    shared.pending.lock().await.push(payload);
                    continue;
                }
                if shared.state.arbiter.is_first_priority(&shared.sender_id).await {
                    loop {
                        if shared.pending.lock().await.is_empty() {
                            break;
                        }
                        tokio::time::sleep(PENDING_DRAIN_SPIN).await;
                    }
                    forward_one(shared, &payload).await?;
                } else {
                    shared.pending.lock().await.push(payload);
                }
            }
            Command::ClientExit => {
                let _ = exit_tx.send(true);
                let has_pending = !shared.pending.lock().await.is_empty();
                let receiver_known = shared.receiver_cluster_ip.lock().await.is_some();
                if has_pending && receiver_known {
                    let _ = exit_wait_rx.await;
                }
                end_transfer(shared).await?;
                return Ok(());
            }
            Command::FetchClientData => {
                let target = payload;
                let ip = expect_frame(conn, Command::ClusterIp).await?;
                let my_ip = shared.my_cluster_ip.as_str();
                let records = if ip.is_empty() || ip == my_ip {
                    shared.state.spool.drain(&target).await
                } else {
                    let addr = transfer::peer_transfer_addr(&shared.state, &ip).await?;
                    transfer::fetch_old_data(addr, &target).await?
                };
                for record in &records {
                    codec::send(conn, Command::TransferData, record).await?;
                }
                codec::send(conn, Command::TransferEnd, "").await?;
            }
            Command::CreateConnBetweenServerAndNode => {
                debug!(sender = %shared.sender_id, "side channel opened");
            }
            Command::ClientDataToLocal => {
                let producer_id = expect_frame(conn, Command::ClientId).await?;
                shared.state.spool.append(&producer_id, &payload).await?;
            }
            Command::DisconnBetweenServerAndNode => {
                debug!(sender = %shared.sender_id, "side channel closed");
            }
            other => {
                return Err(FabricError::protocol(format!(
                    "unexpected frame {other:?} in sender steady state"
                )))
            }
        }
    }
}

async fn run_receiver(mut conn: TcpStream, state: Arc<FabricState>, receiver_id: String) -> Result<()> {
    let n_s = expect_frame(&mut conn, Command::RecvfromNum).await?;
    let n: usize = n_s
        .parse()
        .map_err(|e| FabricError::protocol(format!("bad RecvfromNum {n_s:?}: {e}")))?;

    let mut sender_ids = Vec::with_capacity(n);
    for _ in 0..n {
        sender_ids.push(expect_frame(&mut conn, Command::ClientId).await?);
    }
    info!(receiver = %receiver_id, senders = n, "receiver attached");

    let conn = Arc::new(Mutex::new(conn));
    let mut handles = Vec::with_capacity(sender_ids.len());
    for sender_id in sender_ids {
        let conn = conn.clone();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let completion_rx = state.registry.register(&sender_id, conn).await;
            let _ = completion_rx.await;
            state.registry.deregister(&sender_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::discovery::StaticRegistry;
    use crate::spool::InMemorySpool;
    use crate::config::ProxyConfig;
    use tokio::net::TcpListener;

    fn test_state(cluster_ip: &str) -> Arc<FabricState> {
        let mut config = ProxyConfig::default();
        config.cluster_ip = Some(cluster_ip.to_string());
        FabricState::new(
            Arc::new(InMemoryDirectory::new()),
            Arc::new(InMemorySpool::new()),
            Arc::new(StaticRegistry::new(vec![])),
            config,
        )
    }

    async fn dial_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    async fn do_handshake(client: &mut TcpStream, id: &str, role: &str, priority: i64, cluster_ip: &str) {
        codec::send(client, Command::ClientId, id).await.unwrap();
        codec::send(client, Command::ClientType, role).await.unwrap();
        codec::send(client, Command::ClientPriority, &priority.to_string())
            .await
            .unwrap();
        codec::send(client, Command::ClusterIp, cluster_ip).await.unwrap();
        codec::send(client, Command::ClusterIp, "").await.unwrap();
        let (cmd, _) = codec::recv(client).await.unwrap();
        assert_eq!(cmd, Command::TransferFinished);
    }

    #[tokio::test]
    async fn local_relay_single_sender_single_receiver() {
        let state = test_state("10.0.0.1");
        state.directory.put("rx", "10.0.0.1").await.unwrap();

        let (receiver_server, mut receiver_client) = dial_pair().await;
        let receiver_server_task = tokio::spawn(handle_client(receiver_server, state.clone()));

        do_handshake(&mut receiver_client, "rx", ROLE_RECEIVER, 0, "10.0.0.1").await;
        codec::send(&mut receiver_client, Command::RecvfromNum, "1").await.unwrap();
        codec::send(&mut receiver_client, Command::ClientId, "sx").await.unwrap();

        // Let the receiver register itself in C7 before the sender attaches.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (sender_server, mut sender_client) = dial_pair().await;
        let sender_server_task = tokio::spawn(handle_client(sender_server, state.clone()));

        do_handshake(&mut sender_client, "sx", ROLE_SENDER, 1, "10.0.0.1").await;
        codec::send(&mut sender_client, Command::ClientId, "rx").await.unwrap();

        // Let the discovery task resolve "rx"'s location before data starts flowing,
        // so the test doesn't race the 300ms poll loop.
        tokio::time::sleep(Duration::from_millis(50)).await;

        codec::send(&mut sender_client, Command::ClientData, "a").await.unwrap();
        codec::send(&mut sender_client, Command::ClientData, "b").await.unwrap();
        codec::send(&mut sender_client, Command::ClientExit, "").await.unwrap();

        let frame1 = codec::recv(&mut receiver_client).await.unwrap();
        assert_eq!(frame1, (Command::ClientData, "a".to_string()));
        let frame2 = codec::recv(&mut receiver_client).await.unwrap();
        assert_eq!(frame2, (Command::ClientData, "b".to_string()));
        let frame3 = codec::recv(&mut receiver_client).await.unwrap();
        assert_eq!(frame3, (Command::TransferEnd, "sx".to_string()));

        sender_server_task.await.unwrap().unwrap();
        receiver_server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn higher_priority_sender_drains_first_lower_priority_waits() {
        let state = test_state("10.0.0.1");
        state.directory.put("rx", "10.0.0.1").await.unwrap();

        let (receiver_server, mut receiver_client) = dial_pair().await;
        let receiver_server_task = tokio::spawn(handle_client(receiver_server, state.clone()));
        do_handshake(&mut receiver_client, "rx", ROLE_RECEIVER, 0, "10.0.0.1").await;
        codec::send(&mut receiver_client, Command::RecvfromNum, "2").await.unwrap();
        codec::send(&mut receiver_client, Command::ClientId, "sH").await.unwrap();
        codec::send(&mut receiver_client, Command::ClientId, "sL").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (sh_server, mut sh_client) = dial_pair().await;
        let sh_server_task = tokio::spawn(handle_client(sh_server, state.clone()));
        do_handshake(&mut sh_client, "sH", ROLE_SENDER, 5, "10.0.0.1").await;
        codec::send(&mut sh_client, Command::ClientId, "rx").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        codec::send(&mut sh_client, Command::ClientData, "h").await.unwrap();

        let frame = codec::recv(&mut receiver_client).await.unwrap();
        assert_eq!(frame, (Command::ClientData, "h".to_string()));

        let (sl_server, mut sl_client) = dial_pair().await;
        let sl_server_task = tokio::spawn(handle_client(sl_server, state.clone()));
        do_handshake(&mut sl_client, "sL", ROLE_SENDER, 1, "10.0.0.1").await;
        codec::send(&mut sl_client, Command::ClientId, "rx").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        codec::send(&mut sl_client, Command::ClientData, "l").await.unwrap();
        codec::send(&mut sl_client, Command::ClientExit, "").await.unwrap();

        // sL's record must not arrive while sH is still attached.
        tokio::time::sleep(Duration::from_millis(50)).await;

        codec::send(&mut sh_client, Command::ClientExit, "").await.unwrap();

        let frame = codec::recv(&mut receiver_client).await.unwrap();
        assert_eq!(frame, (Command::TransferEnd, "sH".to_string()));
        let frame = codec::recv(&mut receiver_client).await.unwrap();
        assert_eq!(frame, (Command::ClientData, "l".to_string()));
        let frame = codec::recv(&mut receiver_client).await.unwrap();
        assert_eq!(frame, (Command::TransferEnd, "sL".to_string()));

        sh_server_task.await.unwrap().unwrap();
        sl_server_task.await.unwrap().unwrap();
        receiver_server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sender_exit_with_receiver_never_discovered_is_clean_but_loses_buffered_data() {
        // "rx" is deliberately never published to the directory and no receiver ever
        // connects: the sender's records have nowhere to go. The session must still end
        // cleanly (no panic, no hang), with the buffered records simply dropped.
        let state = test_state("10.0.0.1");

        let (sender_server, mut sender_client) = dial_pair().await;
        let sender_server_task = tokio::spawn(handle_client(sender_server, state.clone()));

        do_handshake(&mut sender_client, "sx", ROLE_SENDER, 1, "10.0.0.1").await;
        codec::send(&mut sender_client, Command::ClientId, "rx").await.unwrap();

        codec::send(&mut sender_client, Command::ClientData, "a").await.unwrap();
        codec::send(&mut sender_client, Command::ClientExit, "").await.unwrap();

        sender_server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn migration_carries_spool_from_the_previous_proxy() {
        // Proxy A holds a spool for "sx" accumulated before this test (simulating
        // records relayed while the receiver lived elsewhere); proxy B is where the
        // client reattaches. A real deployment runs these as separate processes — here
        // they share an in-process transfer listener instead of a second OS process.
        // Loopback-only test sandbox: "previous proxy" is identified by the literal
        // address the transfer listener is actually reachable at, not a synthetic IP.
        let state_a = test_state("127.0.0.1");
        state_a.spool.append("sx", "1").await.unwrap();
        state_a.spool.append("sx", "2").await.unwrap();

        let transfer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transfer_addr = transfer_listener.local_addr().unwrap();
        tokio::spawn(transfer::serve(transfer_listener, state_a.clone()));

        let peer = crate::discovery::PeerProxy {
            cluster_ip: "127.0.0.1".to_string(),
            client_port: 0,
            transfer_port: transfer_addr.port(),
            ping_port: 0,
        };
        let state_b = {
            let mut config = ProxyConfig::default();
            config.cluster_ip = Some("10.0.0.2".to_string());
            FabricState::new(
                Arc::new(InMemoryDirectory::new()),
                Arc::new(InMemorySpool::new()),
                Arc::new(StaticRegistry::new(vec![peer])),
                config,
            )
        };
        state_b.directory.put("rx", "10.0.0.2").await.unwrap();

        let (receiver_server, mut receiver_client) = dial_pair().await;
        let receiver_server_task = tokio::spawn(handle_client(receiver_server, state_b.clone()));
        do_handshake(&mut receiver_client, "rx", ROLE_RECEIVER, 0, "10.0.0.2").await;
        codec::send(&mut receiver_client, Command::RecvfromNum, "1").await.unwrap();
        codec::send(&mut receiver_client, Command::ClientId, "sx").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (sx_server, mut sx_client) = dial_pair().await;
        let sx_server_task = tokio::spawn(handle_client(sx_server, state_b.clone()));
        codec::send(&mut sx_client, Command::ClientId, "sx").await.unwrap();
        codec::send(&mut sx_client, Command::ClientType, ROLE_SENDER).await.unwrap();
        codec::send(&mut sx_client, Command::ClientPriority, "1").await.unwrap();
        codec::send(&mut sx_client, Command::ClusterIp, "10.0.0.2").await.unwrap();
        codec::send(&mut sx_client, Command::ClusterIp, "127.0.0.1").await.unwrap();
        let (cmd, _) = codec::recv(&mut sx_client).await.unwrap();
        assert_eq!(cmd, Command::TransferFinished);

        assert!(state_a.spool.range("sx").await.is_empty());
        assert_eq!(state_b.spool.range("sx").await, vec!["1", "2"]);

        codec::send(&mut sx_client, Command::ClientId, "rx").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        codec::send(&mut sx_client, Command::ClientExit, "").await.unwrap();

        sx_server_task.await.unwrap().unwrap();
        receiver_server_task.await.unwrap().unwrap();
    }
}
