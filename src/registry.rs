//! relay-fabric/src/registry.rs
//! Receiver registry: process-wide mapping senderId -> live receiver session
//! Writers are receiver sessions; readers are a draining sender or an
//! inter-proxy transfer session relaying fresh data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

/// Binding for one sender: the live receiver connection to forward onto, plus a
/// one-shot completion signal pulsed when that sender's transfer ends.
pub struct SenderRecord {
    pub conn: Arc<Mutex<TcpStream>>,
    pub completion: oneshot::Sender<()>,
}

#[derive(Default)]
pub struct ReceiverRegistry {
    senders: Mutex<HashMap<String, SenderRecord>>,
}

/// Sleep interval for the spin-wait in `wait_for_conn`.
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `sender_id`, returning the completion receiver the caller
    /// should await. Overwrites any stale prior registration for the same id.
    pub async fn register(
        &self,
        sender_id: &str,
        conn: Arc<Mutex<TcpStream>>,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.senders.lock().await.insert(
            sender_id.to_string(),
            SenderRecord {
                conn,
                completion: tx,
            },
        );
        rx
    }

    pub async fn deregister(&self, sender_id: &str) {
        self.senders.lock().await.remove(sender_id);
    }

    /// Forwards one `ClientData` payload to the registered receiver connection for
    /// `sender_id`, spinning until a registration appears (the sender is attached and
    /// knows the receiver will register imminently).
    pub async fn forward_to_receiver(
        &self,
        sender_id: &str,
        cmd: crate::codec::Command,
        payload: &str,
    ) -> crate::error::Result<()> {
        let conn = self.wait_for_conn(sender_id).await;
        let mut guard = conn.lock().await;
        crate::codec::send(&mut *guard, cmd, payload).await
    }

    /// Signals transfer completion for `sender_id` and removes its registration.
    /// No-op if nobody is registered (the receiver may never have appeared).
    pub async fn signal_completion(&self, sender_id: &str) {
        if let Some(record) = self.senders.lock().await.remove(sender_id) {
            let _ = record.completion.send(());
        }
    }

    async fn wait_for_conn(&self, sender_id: &str) -> Arc<Mutex<TcpStream>> {
        loop {
            if let Some(record) = self.senders.lock().await.get(sender_id) {
                return record.conn.clone();
            }
            tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Command};
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn register_then_forward_delivers_frame() {
        let registry = ReceiverRegistry::new();
        let (server_side, mut client_side) = loopback_pair().await;
        let _rx = registry
            .register("sx", Arc::new(Mutex::new(server_side)))
            .await;

        registry
            .forward_to_receiver("sx", Command::ClientData, "hello")
            .await
            .unwrap();

        let (cmd, payload) = codec::recv(&mut client_side).await.unwrap();
        assert_eq!(cmd, Command::ClientData);
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn signal_completion_wakes_the_receiver() {
        let registry = ReceiverRegistry::new();
        let (server_side, _client_side) = loopback_pair().await;
        let rx = registry
            .register("sx", Arc::new(Mutex::new(server_side)))
            .await;

        registry.signal_completion("sx").await;
        rx.await.expect("completion channel should fire");
    }

    #[tokio::test]
    async fn deregister_removes_the_binding() {
        let registry = ReceiverRegistry::new();
        let (server_side, _client_side) = loopback_pair().await;
        let _rx = registry
            .register("sx", Arc::new(Mutex::new(server_side)))
            .await;
        registry.deregister("sx").await;
        assert!(registry.senders.lock().await.get("sx").is_none());
    }
}
