//! relay-fabric/src/config.rs
//! Proxy configuration: ports, this proxy's advertised cluster IP, and the static peer
//! list used by the service registry when no external registry is wired in.

use serde::{Deserialize, Serialize};

use crate::discovery::PeerProxy;

/// Default TCP/UDP ports for the three listeners a proxy runs.
pub const DEFAULT_CLIENT_PORT: u16 = 8081;
pub const DEFAULT_TRANSFER_PORT: u16 = 8082;
pub const DEFAULT_PING_PORT: u16 = 8083;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Bind address for the client-serve listener.
    pub bind_addr: String,
    pub client_port: u16,
    pub transfer_port: u16,
    pub ping_port: u16,
    /// This proxy's advertised ClusterIp. When unset, the first client handshake's
    /// `current` ClusterIp latches in as first-writer-wins.
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerProxy>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            bind_addr: "0.0.0.0".to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            ping_port: DEFAULT_PING_PORT,
            cluster_ip: None,
            peers: Vec::new(),
            log_filter: default_log_filter(),
        }
    }
}

impl ProxyConfig {
    /// Loads a TOML config file at `path`, then applies `RELAY_FABRIC_*` environment
    /// overrides for the handful of scalar fields that commonly vary per-deployment.
    pub fn load(path: Option<&std::path::Path>) -> crate::error::Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)
                    .map_err(|e| crate::error::FabricError::protocol(format!("bad config: {e}")))?
            }
            None => ProxyConfig::default(),
        };

        if let Ok(ip) = std::env::var("RELAY_FABRIC_CLUSTER_IP") {
            cfg.cluster_ip = Some(ip);
        }
        if let Ok(port) = std::env::var("RELAY_FABRIC_CLIENT_PORT") {
            if let Ok(p) = port.parse() {
                cfg.client_port = p;
            }
        }
        if let Ok(filter) = std::env::var("RELAY_FABRIC_LOG") {
            cfg.log_filter = filter;
        }

        Ok(cfg)
    }
}
