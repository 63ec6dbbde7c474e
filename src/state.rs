//! relay-fabric/src/state.rs
//! Fabric-wide context object, bundling the receiver registry, buffer map, and
//! first-cluster-IP latch that would otherwise live as process-wide singletons, and
//! handing them to sessions as `Arc<FabricState>` instead.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::arbiter::Arbiter;
use crate::config::ProxyConfig;
use crate::directory::Directory;
use crate::discovery::ServiceRegistry;
use crate::registry::ReceiverRegistry;
use crate::spool::Spool;

pub struct FabricState {
    pub directory: Arc<dyn Directory>,
    pub spool: Arc<dyn Spool>,
    pub registry: ReceiverRegistry,
    pub arbiter: Arbiter,
    pub service_registry: Arc<dyn ServiceRegistry>,
    pub config: ProxyConfig,
    /// First-writer-wins latch for this proxy's advertised ClusterIp: set from config
    /// if present, otherwise latched from the first client handshake's `current`
    /// ClusterIp.
    my_cluster_ip: OnceCell<String>,
}

impl FabricState {
    pub fn new(
        directory: Arc<dyn Directory>,
        spool: Arc<dyn Spool>,
        service_registry: Arc<dyn ServiceRegistry>,
        config: ProxyConfig,
    ) -> Arc<Self> {
        let my_cluster_ip = OnceCell::new();
        if let Some(ip) = &config.cluster_ip {
            let _ = my_cluster_ip.set(ip.clone());
        }

        Arc::new(FabricState {
            directory,
            spool,
            registry: ReceiverRegistry::new(),
            arbiter: Arbiter::new(),
            service_registry,
            config,
            my_cluster_ip,
        })
    }

    /// Returns this proxy's ClusterIp, latching `candidate` in as first-writer-wins if
    /// nothing has been recorded yet.
    pub async fn cluster_ip_or_latch(&self, candidate: &str) -> String {
        self.my_cluster_ip
            .get_or_init(|| async { candidate.to_string() })
            .await
            .clone()
    }

    /// The latched ClusterIp, if any client has attached (or config set one) yet.
    pub fn cluster_ip(&self) -> Option<&str> {
        self.my_cluster_ip.get().map(|s| s.as_str())
    }
}
