//! relay-fabric/src/spool.rs
//! Spool: per-client ordered append log. Records relayed cross-proxy are appended
//! here so a later receiver migration can still recover them.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

#[async_trait]
pub trait Spool: Send + Sync {
    async fn append(&self, client_id: &str, record: &str) -> Result<()>;

    /// Reads all entries for `client_id`, in append order. On a spool I/O error this
    /// returns an empty vec rather than propagating, since callers use this to drive
    /// migration, which must proceed with no carried data rather than abort.
    async fn range(&self, client_id: &str) -> Vec<String>;

    async fn delete(&self, client_id: &str) -> Result<()>;

    /// Atomically transfers ownership: reads all entries then deletes them.
    async fn drain(&self, client_id: &str) -> Vec<String> {
        let records = self.range(client_id).await;
        if let Err(e) = self.delete(client_id).await {
            warn!(client = client_id, error = %e, "spool delete failed during drain");
        }
        records
    }
}

#[derive(Default)]
pub struct InMemorySpool {
    entries: DashMap<String, Mutex<Vec<String>>>,
}

impl InMemorySpool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Spool for InMemorySpool {
    async fn append(&self, client_id: &str, record: &str) -> Result<()> {
        let entry = self
            .entries
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()));
        entry.lock().await.push(record.to_string());
        Ok(())
    }

    async fn range(&self, client_id: &str) -> Vec<String> {
        match self.entries.get(client_id) {
            Some(entry) => entry.lock().await.clone(),
            None => Vec::new(),
        }
    }

    async fn delete(&self, client_id: &str) -> Result<()> {
        self.entries.remove(client_id);
        Ok(())
    }
}
