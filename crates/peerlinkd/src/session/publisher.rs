//! Publish-side event pump.
//!
//! Every subscriber that messages us is admitted to the connection registry,
//! which opens a listening socket for it and asks for a network.

use std::sync::Arc;

use peerlink_core::wire::is_connect_request;
use peerlink_core::DiscoverySession;
use peerlink_services::{SessionEvent, SessionEvents};

use crate::registry::ConnectionRegistry;

pub struct PublishPump {
    session: DiscoverySession,
    events: SessionEvents,
    registry: Arc<ConnectionRegistry>,
}

impl PublishPump {
    pub fn new(
        session: DiscoverySession,
        events: SessionEvents,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            session,
            events,
            registry,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::PeerRequested { peer, payload } => {
                    tracing::debug!(
                        peer = %peer,
                        connect = is_connect_request(&payload),
                        len = payload.len(),
                        "peer requested pairing"
                    );
                    if !self.registry.admit_peer(&self.session, peer).await {
                        tracing::warn!(peer = %peer, "failed to admit peer");
                    }
                }
                SessionEvent::Terminated => {
                    tracing::info!(session = %self.session, "publish session terminated");
                    return;
                }
                other => {
                    tracing::debug!(session = %self.session, event = ?other, "ignoring publish event");
                }
            }
        }
        tracing::debug!(session = %self.session, "publish event stream closed");
    }
}
