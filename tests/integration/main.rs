//! peerlink integration test harness.
//!
//! Everything runs in-process: discovery and provisioning go through the
//! loopback medium or the manual provisioner, data goes over real loopback
//! TCP.
//!
//!   cargo test --test integration

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use peerlink_core::config::PeerlinkConfig;
use peerlink_core::PeerHandle;

mod registry;
mod session;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any single condition may take before a test gives up.
pub const DEADLINE: Duration = Duration::from_secs(5);

/// Config bound to loopback with a fast write cadence.
pub fn test_config() -> PeerlinkConfig {
    let mut config = PeerlinkConfig::default();
    config.reactor.bind_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.client.write_interval_ms = 10;
    config
}

/// Poll `check` until it holds or the deadline passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < DEADLINE {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Collect sink output until at least `len` bytes arrived from one peer.
pub async fn collect_bytes(
    rx: &mut mpsc::UnboundedReceiver<(PeerHandle, Bytes)>,
    len: usize,
) -> anyhow::Result<(PeerHandle, Vec<u8>)> {
    let mut from = None;
    let mut received = Vec::new();
    while received.len() < len {
        let (peer, bytes) = tokio::time::timeout(DEADLINE, rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("sink closed after {} bytes", received.len()))?;
        if *from.get_or_insert(peer) != peer {
            anyhow::bail!("bytes from {peer} interleaved with another peer");
        }
        received.extend_from_slice(&bytes);
    }
    let peer = from.ok_or_else(|| anyhow::anyhow!("no bytes received"))?;
    Ok((peer, received))
}
