//! Discovery service contract.
//!
//! The discovery service is push-style: every outcome arrives later as an
//! event. Outcomes are handed back through a oneshot (attach) or through an
//! ordered event channel whose first meaningful event is `Started` or
//! `ConfigFailed` (publish/subscribe). Events on one channel are delivered
//! in submission order.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use peerlink_core::{AttachSession, DiscoverySession, PeerHandle};

/// Parameters of a publish or subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub service_name: String,
    /// Opaque bytes advertised alongside a published service.
    pub service_info: Bytes,
}

impl ServiceConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_info: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery service is unavailable")]
    Unavailable,
    #[error("attach rejected by discovery service")]
    AttachRejected,
}

/// Notifications for one publish or subscribe session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The registration is live.
    Started(DiscoverySession),
    /// The registration was rejected. No further events follow.
    ConfigFailed,
    /// Publish side: a subscriber sent us a message.
    PeerRequested { peer: PeerHandle, payload: Bytes },
    /// Subscribe side: a matching publisher was seen.
    PeerFound { peer: PeerHandle, advertisement: Bytes },
    /// A `send_message` with this id reached the peer.
    MessageSent { message_id: u32 },
    MessageFailed { message_id: u32 },
    /// The service ended the session on its own.
    Terminated,
}

pub type AttachReply = oneshot::Receiver<Result<AttachSession, DiscoveryError>>;
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// The proximity discovery service.
///
/// Implementations must never block: every method returns immediately and
/// reports through the returned receiver or the session's event channel.
pub trait DiscoveryService: Send + Sync {
    /// Whether the radio is currently usable at all.
    fn is_available(&self) -> bool;

    fn attach(&self) -> AttachReply;

    fn publish(&self, attach: &AttachSession, config: &ServiceConfig) -> SessionEvents;

    fn subscribe(&self, attach: &AttachSession, config: &ServiceConfig) -> SessionEvents;

    /// Send a small message to a peer seen on `session`. The outcome arrives
    /// as `MessageSent`/`MessageFailed` on that session's event channel.
    fn send_message(
        &self,
        session: &DiscoverySession,
        peer: &PeerHandle,
        message_id: u32,
        payload: &[u8],
    );

    fn close_session(&self, session: &DiscoverySession);

    /// Release the attachment and every session opened under it.
    fn detach(&self, attach: &AttachSession);
}
