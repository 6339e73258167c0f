//! Opaque identities handed out by the discovery and provisioning layers.
//!
//! None of these are meaningful outside the process that received them.
//! Peer handles in particular are scoped to one attach epoch: a handle
//! issued before a detach never equals a handle issued after the next
//! attach, even if the provider happens to reuse the raw token.

use std::fmt;

/// Attach generation. Every successful attach starts a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(pub u64);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a discovered peer, valid for one discovery session.
///
/// Used as the primary key for every piece of per-peer bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    epoch: Epoch,
    token: u32,
}

impl PeerHandle {
    /// Wrap a provider-issued token observed during `epoch`.
    pub fn new(epoch: Epoch, token: u32) -> Self {
        Self { epoch, token }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Raw provider token. Only the issuing provider can interpret it.
    pub fn token(&self) -> u32 {
        self.token
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}.{}", self.epoch, self.token)
    }
}

/// A successful attachment to the discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachSession {
    epoch: Epoch,
}

impl AttachSession {
    pub fn new(epoch: Epoch) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

/// Which side of service discovery a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    Publish,
    Subscribe,
}

/// An active publish or subscribe registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoverySession {
    id: u64,
    epoch: Epoch,
    role: SessionRole,
}

impl DiscoverySession {
    pub fn new(id: u64, epoch: Epoch, role: SessionRole) -> Self {
        Self { id, epoch, role }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }
}

impl fmt::Display for DiscoverySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            SessionRole::Publish => "publish",
            SessionRole::Subscribe => "subscribe",
        };
        write!(f, "{role}-{}.{}", self.epoch, self.id)
    }
}

/// Role of this process on a provisioned point-to-point link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Connects out to the responder's advertised port.
    Initiator,
    /// Listens on a port advertised through the provisioning request.
    Responder,
}

/// Opaque identity of a provisioned underlying network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkToken(u64);

impl NetworkToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NetworkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net-{:x}", self.0)
    }
}
