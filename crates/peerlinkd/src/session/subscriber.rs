//! Subscribe-side event pump.
//!
//! For every newly found publisher, send the connect request and create a
//! peer link only once the discovery service confirms delivery. Publishers
//! already linked, or with a request in flight, are not asked again.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use peerlink_core::config::PeerlinkConfig;
use peerlink_core::wire::CONNECT_PAYLOAD;
use peerlink_core::{DiscoverySession, PeerHandle};
use peerlink_services::{DiscoveryService, LinkProvisioner, SessionEvent, SessionEvents};

use crate::link::PeerLink;

/// Links created by a subscribe session, keyed by publisher.
pub type LinkTable = Arc<DashMap<PeerHandle, PeerLink>>;

pub struct SubscribePump {
    session: DiscoverySession,
    events: SessionEvents,
    discovery: Arc<dyn DiscoveryService>,
    provisioner: Arc<dyn LinkProvisioner>,
    config: PeerlinkConfig,
    links: LinkTable,
    pending: HashMap<u32, PeerHandle>,
    next_message_id: u32,
}

impl SubscribePump {
    pub fn new(
        session: DiscoverySession,
        events: SessionEvents,
        discovery: Arc<dyn DiscoveryService>,
        provisioner: Arc<dyn LinkProvisioner>,
        config: PeerlinkConfig,
        links: LinkTable,
    ) -> Self {
        Self {
            session,
            events,
            discovery,
            provisioner,
            config,
            links,
            pending: HashMap::new(),
            next_message_id: 0,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::PeerFound { peer, .. } => self.on_peer_found(peer),
                SessionEvent::MessageSent { message_id } => self.on_message_sent(message_id),
                SessionEvent::MessageFailed { message_id } => {
                    if let Some(peer) = self.pending.remove(&message_id) {
                        tracing::warn!(peer = %peer, message_id, "connect request failed");
                    }
                }
                SessionEvent::Terminated => {
                    tracing::info!(session = %self.session, "subscribe session terminated");
                    return;
                }
                other => {
                    tracing::debug!(session = %self.session, event = ?other, "ignoring subscribe event");
                }
            }
        }
        tracing::debug!(session = %self.session, "subscribe event stream closed");
    }

    fn on_peer_found(&mut self, peer: PeerHandle) {
        if self.links.contains_key(&peer) || self.pending.values().any(|p| *p == peer) {
            tracing::debug!(peer = %peer, "peer already linked, ignoring rediscovery");
            return;
        }

        self.next_message_id = self.next_message_id.wrapping_add(1);
        let message_id = self.next_message_id;
        self.pending.insert(message_id, peer);

        tracing::debug!(peer = %peer, message_id, "sending connect request");
        self.discovery
            .send_message(&self.session, &peer, message_id, CONNECT_PAYLOAD);
    }

    fn on_message_sent(&mut self, message_id: u32) {
        let Some(peer) = self.pending.remove(&message_id) else {
            tracing::debug!(message_id, "delivery confirmation for unknown message");
            return;
        };

        let link = PeerLink::spawn(self.session, peer, self.provisioner.clone(), &self.config);
        self.links.insert(peer, link);
        tracing::info!(peer = %peer, links = self.links.len(), "peer linked");
    }
}
