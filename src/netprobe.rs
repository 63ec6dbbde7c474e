//! relay-fabric/src/netprobe.rs
//! Network condition probes. Kept as a trait outside the core relay engine: nothing in
//! `session` or `arbiter` depends on these, they only inform operator-facing
//! diagnostics and the reference client's `.service` command.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as ProcessCommand;
use tracing::warn;

#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Round-trip time to `host`, if reachable.
    async fn ping_rtt(&self, host: &str) -> crate::error::Result<Duration>;

    /// Fraction of probe packets lost to `host`, in `[0.0, 1.0]`.
    async fn packet_loss(&self, host: &str) -> crate::error::Result<f64>;
}

/// Shells out to the system `ping`(1) and parses its summary line rather than timing
/// individual replies.
pub struct ShellPingProbe {
    pub probe_count: u32,
}

impl Default for ShellPingProbe {
    fn default() -> Self {
        ShellPingProbe { probe_count: 4 }
    }
}

#[async_trait]
impl NetworkProbe for ShellPingProbe {
    async fn ping_rtt(&self, host: &str) -> crate::error::Result<Duration> {
        let output = ProcessCommand::new("ping")
            .arg("-c")
            .arg(self.probe_count.to_string())
            .arg(host)
            .output()
            .await?;

        let text = String::from_utf8_lossy(&output.stdout);
        parse_avg_rtt(&text).ok_or_else(|| {
            warn!(%host, "could not parse ping output for rtt");
            crate::error::FabricError::protocol(format!("no rtt in ping output for {host}"))
        })
    }

    async fn packet_loss(&self, host: &str) -> crate::error::Result<f64> {
        let output = ProcessCommand::new("ping")
            .arg("-c")
            .arg(self.probe_count.to_string())
            .arg(host)
            .output()
            .await?;

        let text = String::from_utf8_lossy(&output.stdout);
        parse_packet_loss(&text).ok_or_else(|| {
            warn!(%host, "could not parse ping output for packet loss");
            crate::error::FabricError::protocol(format!("no packet loss in ping output for {host}"))
        })
    }
}

/// Looks for the `rtt min/avg/max/mdev = a/b/c/d ms` summary line emitted by
/// iputils-ping and extracts `b`.
fn parse_avg_rtt(ping_output: &str) -> Option<Duration> {
    let line = ping_output.lines().find(|l| l.contains("min/avg/max"))?;
    let values = line.split('=').nth(1)?;
    let avg = values.trim().split_whitespace().next()?.split('/').nth(1)?;
    let millis: f64 = avg.parse().ok()?;
    Some(Duration::from_secs_f64(millis / 1000.0))
}

/// Looks for `N% packet loss` and extracts `N`.
fn parse_packet_loss(ping_output: &str) -> Option<f64> {
    let line = ping_output.lines().find(|l| l.contains("packet loss"))?;
    let pct = line.split(',').find(|segment| segment.contains("packet loss"))?;
    let digits = pct.split('%').next()?.trim().rsplit(' ').next()?;
    let pct: f64 = digits.parse().ok()?;
    Some(pct / 100.0)
}
