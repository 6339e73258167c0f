//! Hand-driven provisioner.
//!
//! Records every provisioning request and lets the caller decide what the
//! network does next. Used wherever a test needs to script `Available` and
//! `Lost` reports, including duplicate and out-of-order ones.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use peerlink_core::{NetworkToken, PeerHandle};

use crate::provision::{LinkProvisioner, NetworkEvent, NetworkEvents, ProvisionRequest, ProvisionedNetwork};

struct Pending {
    request: ProvisionRequest,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

#[derive(Clone, Default)]
pub struct ManualProvisioner {
    pending: Arc<DashMap<PeerHandle, Pending>>,
    requests: Arc<AtomicUsize>,
}

impl ManualProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total provisioning requests seen, across all peers.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Latest request for `peer`, if any is still open.
    pub fn request(&self, peer: &PeerHandle) -> Option<ProvisionRequest> {
        self.pending.get(peer).map(|p| p.request.clone())
    }

    /// Report the network for `peer` as available. Returns false if nobody
    /// is listening for it any more.
    pub fn available(&self, peer: &PeerHandle, endpoint: SocketAddr, token: NetworkToken) -> bool {
        self.send(
            peer,
            NetworkEvent::Available(ProvisionedNetwork { endpoint, token }),
        )
    }

    pub fn lost(&self, peer: &PeerHandle) -> bool {
        self.send(peer, NetworkEvent::Lost)
    }

    /// End the request without ever reporting a network.
    pub fn fail(&self, peer: &PeerHandle) {
        self.pending.remove(peer);
    }

    fn send(&self, peer: &PeerHandle, event: NetworkEvent) -> bool {
        self.pending
            .get(peer)
            .map(|p| p.events.send(event).is_ok())
            .unwrap_or(false)
    }
}

impl LinkProvisioner for ManualProvisioner {
    fn provision(&self, request: ProvisionRequest) -> NetworkEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.requests.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(peer = %request.peer, role = ?request.role, port = ?request.port, "provision requested");
        self.pending.insert(request.peer, Pending { request, events: tx });
        rx
    }
}
