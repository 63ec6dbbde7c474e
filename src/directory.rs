//! relay-fabric/src/directory.rs
//! Directory client: publish/lookup/remove client -> proxy-location bindings.
//!
//! The fabric-wide directory is a deliberately external collaborator; this
//! module defines the trait it is used through plus an in-memory reference
//! implementation suitable for single-process tests and small deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Last-writer-wins string-keyed key/value store. `get` on an absent key
/// returns `Ok(String::new())`, not an error — absence is not a failure mode here.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<String>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// `DashMap`-backed directory. No versioning, no watch.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: DashMap<String, String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        Ok(self
            .entries
            .get(key)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
