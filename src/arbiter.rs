//! relay-fabric/src/arbiter.rs
//! Priority arbiter: for a given receiver, only the highest-priority attached
//! sender drains; others park until it exits.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

/// Capacity-1, drop-if-full signal: a later pulse while one is already pending is a
/// harmless no-op, since the drain task only ever needs to know "wake up", not "how
/// many times".
pub fn trigger_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

pub fn pulse(tx: &mpsc::Sender<()>) {
    let _ = tx.try_send(());
}

struct SenderBuffer {
    priority: i64,
    receiver_id: String,
    trigger_tx: mpsc::Sender<()>,
}

/// One entry per attached sender at this proxy.
#[derive(Default)]
pub struct Arbiter {
    buffers: Mutex<HashMap<String, SenderBuffer>>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sender_id: &str, priority: i64, receiver_id: &str, trigger_tx: mpsc::Sender<()>) {
        self.buffers.lock().await.insert(
            sender_id.to_string(),
            SenderBuffer {
                priority,
                receiver_id: receiver_id.to_string(),
                trigger_tx,
            },
        );
    }

    pub async fn remove(&self, sender_id: &str) {
        self.buffers.lock().await.remove(sender_id);
    }

    /// A sender is first-priority iff no *other* attached sender targeting the same
    /// receiver has strictly greater priority. Ties go through (`>=`, not `>`), so
    /// multiple equal-priority senders can all drain concurrently.
    pub async fn is_first_priority(&self, sender_id: &str) -> bool {
        let buffers = self.buffers.lock().await;
        let Some(me) = buffers.get(sender_id) else {
            // No live SenderBuffer: the caller is racing its own teardown. Treat as
            // "not first" so it parks rather than forwards into a closed session.
            return false;
        };
        let max_other = buffers
            .iter()
            .filter(|(id, bf)| id.as_str() != sender_id && bf.receiver_id == me.receiver_id)
            .map(|(_, bf)| bf.priority)
            .max()
            .unwrap_or(0);
        me.priority >= max_other
    }

    /// On a sender's exit, pulse the remaining highest-priority (`> 0`) sender
    /// targeting the same receiver, if any. A priority-0 sender is never selected here
    /// (an intentional asymmetry with `is_first_priority`'s `>=`: a floor of 0 here
    /// means priority 0 is never auto-promoted, only ever "first" among equals).
    pub async fn trigger_next_priority(&self, receiver_id: &str) {
        let buffers = self.buffers.lock().await;
        let next = buffers
            .values()
            .filter(|bf| bf.receiver_id == receiver_id)
            .max_by_key(|bf| bf.priority);
        if let Some(bf) = next {
            if bf.priority > 0 {
                pulse(&bf.trigger_tx);
            }
        }
    }
}
