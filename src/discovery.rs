//! relay-fabric/src/discovery.rs
//! Service discovery: enumerate peer proxies and their endpoints. Deliberately an
//! external collaborator; the static implementation here exists so the fabric can run
//! without a real service mesh wired in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A peer proxy's reachable endpoints: the client, transfer, and ping ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProxy {
    pub cluster_ip: String,
    pub client_port: u16,
    pub transfer_port: u16,
    pub ping_port: u16,
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn peers(&self) -> Vec<PeerProxy>;
}

/// A fixed, config-supplied peer list. Stands in for a real service-mesh enumeration,
/// which is out of scope here.
pub struct StaticRegistry {
    peers: Vec<PeerProxy>,
}

impl StaticRegistry {
    pub fn new(peers: Vec<PeerProxy>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn peers(&self) -> Vec<PeerProxy> {
        self.peers.clone()
    }
}
