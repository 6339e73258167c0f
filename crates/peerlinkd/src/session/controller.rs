use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use peerlink_core::config::PeerlinkConfig;
use peerlink_core::{AttachSession, DiscoverySession, PeerHandle};
use peerlink_services::{
    DataSink, DiscoveryService, LinkProvisioner, ServiceConfig, SessionEvent, SessionEvents,
};

use super::publisher::PublishPump;
use super::state::ControllerState;
use super::subscriber::{LinkTable, SubscribePump};
use crate::registry::ConnectionRegistry;

enum Active {
    Publish {
        session: DiscoverySession,
        registry: Arc<ConnectionRegistry>,
        pump: JoinHandle<()>,
    },
    Subscribe {
        session: DiscoverySession,
        links: LinkTable,
        pump: JoinHandle<()>,
    },
}

impl Active {
    fn session(&self) -> &DiscoverySession {
        match self {
            Active::Publish { session, .. } | Active::Subscribe { session, .. } => session,
        }
    }

    fn abort_pump(&self) {
        match self {
            Active::Publish { pump, .. } | Active::Subscribe { pump, .. } => pump.abort(),
        }
    }
}

#[derive(Default)]
struct Inner {
    attach: Option<AttachSession>,
    active: Option<Active>,
}

/// Outcome of waiting for a publish/subscribe confirmation.
enum Confirmation {
    Started(DiscoverySession),
    Rejected,
    Vanished,
}

/// Drives attach → publish/subscribe against a discovery service.
///
/// Every operation takes the controller's async lock for its whole duration,
/// so concurrent callers are applied one at a time.
pub struct PeerSessionController {
    discovery: Arc<dyn DiscoveryService>,
    provisioner: Arc<dyn LinkProvisioner>,
    sink: Arc<dyn DataSink>,
    config: PeerlinkConfig,
    inner: Mutex<Inner>,
    state: watch::Sender<ControllerState>,
}

impl PeerSessionController {
    pub fn new(
        discovery: Arc<dyn DiscoveryService>,
        provisioner: Arc<dyn LinkProvisioner>,
        sink: Arc<dyn DataSink>,
        config: PeerlinkConfig,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Detached);
        Self {
            discovery,
            provisioner,
            sink,
            config,
            inner: Mutex::new(Inner::default()),
            state,
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Follow state changes.
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    pub async fn is_publishing(&self) -> bool {
        matches!(self.inner.lock().await.active, Some(Active::Publish { .. }))
    }

    pub async fn is_subscribing(&self) -> bool {
        matches!(self.inner.lock().await.active, Some(Active::Subscribe { .. }))
    }

    /// The registry of the live publish session.
    pub async fn registry(&self) -> Option<Arc<ConnectionRegistry>> {
        match &self.inner.lock().await.active {
            Some(Active::Publish { registry, .. }) => Some(registry.clone()),
            _ => None,
        }
    }

    /// Publishers the live subscribe session has created links for.
    pub async fn linked_peers(&self) -> Vec<PeerHandle> {
        match &self.inner.lock().await.active {
            Some(Active::Subscribe { links, .. }) => links.iter().map(|e| *e.key()).collect(),
            _ => Vec::new(),
        }
    }

    /// Attach to the discovery service. A controller that is already attached
    /// returns true without asking again.
    pub async fn attach(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.attach.is_some() {
            return true;
        }
        let current = self.state();
        if !current.can_attach() {
            tracing::debug!(state = %current, "attach not allowed");
            return false;
        }
        if !self.discovery.is_available() {
            tracing::warn!("discovery service unavailable, not attaching");
            return false;
        }

        self.set_state(ControllerState::Attaching);
        match self.discovery.attach().await {
            Ok(Ok(attach)) => {
                inner.attach = Some(attach);
                self.set_state(ControllerState::Attached);
                tracing::info!(epoch = %attach.epoch(), "attached");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "attach failed");
                self.set_state(ControllerState::Failed);
                false
            }
            Err(_) => {
                tracing::warn!("discovery service dropped the attach request");
                self.set_state(ControllerState::Failed);
                false
            }
        }
    }

    /// Publish `service_name` and admit every subscriber that messages us.
    pub async fn publish(&self, service_name: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(attach) = self.ready_for_session(&inner) else {
            return false;
        };

        self.set_state(ControllerState::Publishing);
        let service = ServiceConfig::new(service_name);
        let mut events = self.discovery.publish(&attach, &service);
        let session = match self.confirm(&mut events).await {
            Confirmation::Started(session) => session,
            Confirmation::Rejected => {
                tracing::warn!(service = %service_name, "publish rejected");
                self.set_state(ControllerState::Attached);
                return false;
            }
            Confirmation::Vanished => {
                tracing::warn!(service = %service_name, "publish never confirmed");
                self.release_attach(&mut inner);
                self.set_state(ControllerState::Failed);
                return false;
            }
        };

        let registry =
            match ConnectionRegistry::start(&self.config, self.provisioner.clone(), self.sink.clone()) {
                Ok(registry) => Arc::new(registry),
                Err(e) => {
                    tracing::error!(error = %e, "failed to start connection registry");
                    self.discovery.close_session(&session);
                    self.set_state(ControllerState::Attached);
                    return false;
                }
            };

        let pump = tokio::spawn(PublishPump::new(session, events, registry.clone()).run());
        inner.active = Some(Active::Publish {
            session,
            registry,
            pump,
        });
        self.set_state(ControllerState::Active);
        tracing::info!(session = %session, service = %service_name, "publishing");
        true
    }

    /// Subscribe to `service_name` and link to every publisher found.
    pub async fn subscribe(&self, service_name: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(attach) = self.ready_for_session(&inner) else {
            return false;
        };

        self.set_state(ControllerState::Subscribing);
        let service = ServiceConfig::new(service_name);
        let mut events = self.discovery.subscribe(&attach, &service);
        let session = match self.confirm(&mut events).await {
            Confirmation::Started(session) => session,
            Confirmation::Rejected => {
                tracing::warn!(service = %service_name, "subscribe rejected");
                self.set_state(ControllerState::Attached);
                return false;
            }
            Confirmation::Vanished => {
                tracing::warn!(service = %service_name, "subscribe never confirmed");
                self.release_attach(&mut inner);
                self.set_state(ControllerState::Failed);
                return false;
            }
        };

        let links: LinkTable = Arc::new(DashMap::new());
        let pump = SubscribePump::new(
            session,
            events,
            self.discovery.clone(),
            self.provisioner.clone(),
            self.config.clone(),
            links.clone(),
        );
        let pump = tokio::spawn(pump.run());
        inner.active = Some(Active::Subscribe {
            session,
            links,
            pump,
        });
        self.set_state(ControllerState::Active);
        tracing::info!(session = %session, service = %service_name, "subscribing");
        true
    }

    /// Tear down the live session, its registry or links, and the attachment.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        self.set_state(ControllerState::Closed);
    }

    /// The discovery service became usable or unusable. Sessions do not
    /// survive either transition.
    pub async fn availability_changed(&self) {
        tracing::info!(
            available = self.discovery.is_available(),
            "discovery availability changed"
        );
        self.close().await;
    }

    fn ready_for_session(&self, inner: &Inner) -> Option<AttachSession> {
        let current = self.state();
        if current != ControllerState::Attached || inner.active.is_some() {
            tracing::debug!(state = %current, "session request not allowed");
            return None;
        }
        inner.attach
    }

    async fn confirm(&self, events: &mut SessionEvents) -> Confirmation {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Started(session) => return Confirmation::Started(session),
                SessionEvent::ConfigFailed => return Confirmation::Rejected,
                other => tracing::debug!(event = ?other, "event before confirmation"),
            }
        }
        Confirmation::Vanished
    }

    async fn teardown(&self, inner: &mut Inner) {
        if let Some(active) = inner.active.take() {
            active.abort_pump();
            self.discovery.close_session(active.session());
            match active {
                Active::Publish { registry, .. } => {
                    if let Err(e) = tokio::task::spawn_blocking(move || registry.stop()).await {
                        tracing::error!(error = %e, "registry stop task failed");
                    }
                }
                Active::Subscribe { links, .. } => {
                    let peers: Vec<PeerHandle> = links.iter().map(|e| *e.key()).collect();
                    for peer in peers {
                        if let Some((_, link)) = links.remove(&peer) {
                            link.stop().await;
                        }
                    }
                }
            }
        }
        self.release_attach(inner);
    }

    fn release_attach(&self, inner: &mut Inner) {
        if let Some(attach) = inner.attach.take() {
            self.discovery.detach(&attach);
            tracing::info!(epoch = %attach.epoch(), "detached");
        }
    }

    fn set_state(&self, next: ControllerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "controller state");
        }
    }
}

impl Drop for PeerSessionController {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(active) = inner.active.take() {
            active.abort_pump();
            self.discovery.close_session(active.session());
        }
        if let Some(attach) = inner.attach.take() {
            self.discovery.detach(&attach);
        }
    }
}
