//! Data sinks: where bytes read by the reactor end up.

use bytes::Bytes;
use tokio::sync::mpsc;

use peerlink_core::PeerHandle;

/// Receives every chunk of bytes read from a peer's data channel.
///
/// Called on the reactor thread. Must not block: a slow sink stalls every
/// peer, not just the one being delivered.
pub trait DataSink: Send + Sync {
    fn on_bytes_received(&self, peer: &PeerHandle, bytes: &[u8]);
}

/// Forwards received bytes into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(PeerHandle, Bytes)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(PeerHandle, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DataSink for ChannelSink {
    fn on_bytes_received(&self, peer: &PeerHandle, bytes: &[u8]) {
        if self.tx.send((*peer, Bytes::copy_from_slice(bytes))).is_err() {
            tracing::trace!(peer = %peer, "sink receiver dropped, discarding bytes");
        }
    }
}

/// Logs received bytes as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DataSink for LogSink {
    fn on_bytes_received(&self, peer: &PeerHandle, bytes: &[u8]) {
        tracing::info!(
            peer = %peer,
            len = bytes.len(),
            data = %String::from_utf8_lossy(bytes),
            "received"
        );
    }
}
