//! Link provisioning contract.
//!
//! Given a discovered peer, the provisioner sets up a point-to-point network
//! and reports it, possibly more than once, until the network goes away.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use peerlink_core::{DiscoverySession, NetworkToken, PeerHandle, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Discovery session the peer was seen on.
    pub session: DiscoverySession,
    pub peer: PeerHandle,
    pub role: Role,
    /// Responder only: port the initiator should connect to.
    pub port: Option<u16>,
    /// Shared secret, passed through untouched.
    pub passphrase: String,
}

/// A network that became usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedNetwork {
    /// Initiator: the responder's address. Responder: our own address on
    /// the new network.
    pub endpoint: SocketAddr,
    pub token: NetworkToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(ProvisionedNetwork),
    Lost,
}

/// Events for one provisioning request. The stream ending before any
/// `Available` means provisioning failed.
pub type NetworkEvents = mpsc::UnboundedReceiver<NetworkEvent>;

pub trait LinkProvisioner: Send + Sync {
    fn provision(&self, request: ProvisionRequest) -> NetworkEvents;
}
