//! In-process proximity medium.
//!
//! Implements both the discovery and the provisioning contract inside one
//! process. Publishers and subscribers meet by service name, messages are
//! routed to the other side's session, and a responder/initiator pair of
//! provisioning requests resolves to a loopback endpoint on the responder's
//! advertised port.
//!
//! Every observer sees its own peer handles: the subscriber's handle for a
//! publisher is unrelated to the publisher's handle for that subscriber.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use peerlink_core::{
    AttachSession, DiscoverySession, Epoch, NetworkToken, PeerHandle, Role, SessionRole,
};

use crate::discovery::{
    AttachReply, DiscoveryError, DiscoveryService, ServiceConfig, SessionEvent, SessionEvents,
};
use crate::provision::{LinkProvisioner, NetworkEvent, NetworkEvents, ProvisionRequest, ProvisionedNetwork};

/// A live publish or subscribe registration.
struct Registration {
    session: DiscoverySession,
    service_name: String,
    service_info: Bytes,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// One side of a provisioning pair, keyed on (local session, remote session).
struct LinkSide {
    role: Role,
    port: Option<u16>,
    passphrase: String,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

#[derive(Default)]
struct Inner {
    unavailable: AtomicBool,
    reject_attach: AtomicBool,
    reject_publish: AtomicBool,
    reject_subscribe: AtomicBool,
    next_id: AtomicU64,
    next_token: AtomicU32,
    attach_requests: AtomicUsize,
    sessions: DashMap<u64, Registration>,
    // (observer session, remote session) -> token the observer knows it by
    handles: DashMap<(u64, u64), u32>,
    // (observer session, token) -> remote session
    remotes: DashMap<(u64, u32), u64>,
    links: DashMap<(u64, u64), LinkSide>,
}

/// Shared in-process medium. Clones refer to the same medium.
#[derive(Clone, Default)]
pub struct LoopbackMedium {
    inner: Arc<Inner>,
}

impl LoopbackMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip radio availability. Attach fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn reject_attach(&self, reject: bool) {
        self.inner.reject_attach.store(reject, Ordering::SeqCst);
    }

    pub fn reject_publish(&self, reject: bool) {
        self.inner.reject_publish.store(reject, Ordering::SeqCst);
    }

    pub fn reject_subscribe(&self, reject: bool) {
        self.inner.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    /// Attach requests received so far, including refused ones.
    pub fn attach_requests(&self) -> usize {
        self.inner.attach_requests.load(Ordering::SeqCst)
    }

    /// Number of live publish/subscribe sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Report every provisioned or pending network as lost.
    pub fn lose_links(&self) {
        let keys: Vec<(u64, u64)> = self.inner.links.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, side)) = self.inner.links.remove(&key) {
                let _ = side.events.send(NetworkEvent::Lost);
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The handle `observer` uses for the session `remote`.
    fn handle_for(&self, observer: &DiscoverySession, remote: u64) -> PeerHandle {
        let token = *self
            .inner
            .handles
            .entry((observer.id(), remote))
            .or_insert_with(|| self.inner.next_token.fetch_add(1, Ordering::SeqCst).wrapping_add(1));
        self.inner.remotes.insert((observer.id(), token), remote);
        PeerHandle::new(observer.epoch(), token)
    }

    fn resolve(&self, observer: &DiscoverySession, peer: &PeerHandle) -> Option<u64> {
        if peer.epoch() != observer.epoch() {
            return None;
        }
        self.inner
            .remotes
            .get(&(observer.id(), peer.token()))
            .map(|r| *r)
    }

    fn open(
        &self,
        attach: &AttachSession,
        config: &ServiceConfig,
        role: SessionRole,
        reject: bool,
    ) -> SessionEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        if reject {
            tracing::debug!(service = %config.service_name, ?role, "rejecting session");
            let _ = tx.send(SessionEvent::ConfigFailed);
            return rx;
        }

        let session = DiscoverySession::new(self.next_id(), attach.epoch(), role);
        let _ = tx.send(SessionEvent::Started(session));

        let matches: Vec<(DiscoverySession, Bytes, mpsc::UnboundedSender<SessionEvent>)> = self
            .inner
            .sessions
            .iter()
            .filter(|r| {
                r.service_name == config.service_name
                    && r.session.role() != role
                    && r.session.epoch() != attach.epoch()
            })
            .map(|r| (r.session, r.service_info.clone(), r.events.clone()))
            .collect();

        self.inner.sessions.insert(
            session.id(),
            Registration {
                session,
                service_name: config.service_name.clone(),
                service_info: config.service_info.clone(),
                events: tx.clone(),
            },
        );

        for (other, other_info, other_events) in matches {
            match role {
                // We are the subscriber: we discover existing publishers.
                SessionRole::Subscribe => {
                    let peer = self.handle_for(&session, other.id());
                    let _ = tx.send(SessionEvent::PeerFound {
                        peer,
                        advertisement: other_info,
                    });
                }
                // We are the publisher: existing subscribers discover us.
                SessionRole::Publish => {
                    let peer = self.handle_for(&other, session.id());
                    let _ = other_events.send(SessionEvent::PeerFound {
                        peer,
                        advertisement: config.service_info.clone(),
                    });
                }
            }
        }

        tracing::debug!(session = %session, service = %config.service_name, "session opened");
        rx
    }
}

impl DiscoveryService for LoopbackMedium {
    fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::SeqCst)
    }

    fn attach(&self) -> AttachReply {
        self.inner.attach_requests.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let outcome = if !self.is_available() {
            Err(DiscoveryError::Unavailable)
        } else if self.inner.reject_attach.load(Ordering::SeqCst) {
            Err(DiscoveryError::AttachRejected)
        } else {
            Ok(AttachSession::new(Epoch(self.next_id())))
        };
        let _ = tx.send(outcome);
        rx
    }

    fn publish(&self, attach: &AttachSession, config: &ServiceConfig) -> SessionEvents {
        let reject = self.inner.reject_publish.load(Ordering::SeqCst);
        self.open(attach, config, SessionRole::Publish, reject)
    }

    fn subscribe(&self, attach: &AttachSession, config: &ServiceConfig) -> SessionEvents {
        let reject = self.inner.reject_subscribe.load(Ordering::SeqCst);
        self.open(attach, config, SessionRole::Subscribe, reject)
    }

    fn send_message(
        &self,
        session: &DiscoverySession,
        peer: &PeerHandle,
        message_id: u32,
        payload: &[u8],
    ) {
        let Some(sender) = self.inner.sessions.get(&session.id()).map(|r| r.events.clone()) else {
            tracing::debug!(session = %session, "send on closed session");
            return;
        };

        let target = self.resolve(session, peer).and_then(|remote| {
            self.inner
                .sessions
                .get(&remote)
                .map(|r| (r.session, r.events.clone()))
        });

        let delivered = match target {
            Some((remote_session, events)) => {
                let from = self.handle_for(&remote_session, session.id());
                events
                    .send(SessionEvent::PeerRequested {
                        peer: from,
                        payload: Bytes::copy_from_slice(payload),
                    })
                    .is_ok()
            }
            None => false,
        };

        let outcome = if delivered {
            SessionEvent::MessageSent { message_id }
        } else {
            SessionEvent::MessageFailed { message_id }
        };
        let _ = sender.send(outcome);
    }

    fn close_session(&self, session: &DiscoverySession) {
        let Some((_, registration)) = self.inner.sessions.remove(&session.id()) else {
            return;
        };
        let _ = registration.events.send(SessionEvent::Terminated);

        let id = session.id();
        let keys: Vec<(u64, u64)> = self
            .inner
            .links
            .iter()
            .map(|e| *e.key())
            .filter(|(local, remote)| *local == id || *remote == id)
            .collect();
        for key in keys {
            if let Some((_, side)) = self.inner.links.remove(&key) {
                let _ = side.events.send(NetworkEvent::Lost);
            }
        }
        tracing::debug!(session = %session, "session closed");
    }

    fn detach(&self, attach: &AttachSession) {
        let sessions: Vec<DiscoverySession> = self
            .inner
            .sessions
            .iter()
            .filter(|r| r.session.epoch() == attach.epoch())
            .map(|r| r.session)
            .collect();
        for session in sessions {
            self.close_session(&session);
        }
    }
}

impl LinkProvisioner for LoopbackMedium {
    fn provision(&self, request: ProvisionRequest) -> NetworkEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = request.session.id();

        let Some(remote) = self.resolve(&request.session, &request.peer) else {
            tracing::debug!(peer = %request.peer, "provision request for unknown peer");
            return rx;
        };

        let counterpart = self
            .inner
            .links
            .get(&(remote, local))
            .map(|side| (side.role, side.port, side.passphrase.clone(), side.events.clone()));

        self.inner.links.insert(
            (local, remote),
            LinkSide {
                role: request.role,
                port: request.port,
                passphrase: request.passphrase.clone(),
                events: tx.clone(),
            },
        );

        let Some((role, port, passphrase, events)) = counterpart else {
            tracing::debug!(peer = %request.peer, role = ?request.role, "waiting for counterpart");
            return rx;
        };

        if passphrase != request.passphrase {
            tracing::warn!(peer = %request.peer, "passphrase mismatch, no network formed");
            return rx;
        }
        if role == request.role {
            tracing::warn!(peer = %request.peer, role = ?role, "both sides requested the same role");
            return rx;
        }

        let port = match request.role {
            Role::Responder => request.port,
            Role::Initiator => port,
        };
        let Some(port) = port else {
            tracing::warn!(peer = %request.peer, "responder advertised no port");
            return rx;
        };

        let network = ProvisionedNetwork {
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            token: NetworkToken::new(self.next_id()),
        };
        tracing::debug!(peer = %request.peer, endpoint = %network.endpoint, token = %network.token, "network formed");
        let _ = events.send(NetworkEvent::Available(network.clone()));
        let _ = tx.send(NetworkEvent::Available(network));
        rx
    }
}
