//! Initiator side of a peer link.
//!
//! Waits for the provisioner to report the responder's endpoint, then opens
//! the configured number of outbound streams and writes the rotating counter
//! to each of them on a fixed cadence until stopped. A failed connect or
//! write ends the worker; nothing reconnects on its own.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use peerlink_core::config::PeerlinkConfig;
use peerlink_core::wire::CounterPayload;
use peerlink_core::{DiscoverySession, NetworkToken, PeerHandle, Role};
use peerlink_services::{LinkProvisioner, NetworkEvent, NetworkEvents, ProvisionRequest};

#[derive(Debug, Clone)]
struct WorkerSettings {
    streams: usize,
    write_interval: std::time::Duration,
    counter_modulus: u32,
}

#[derive(Default)]
struct LinkState {
    endpoint: Option<SocketAddr>,
    network_token: Option<NetworkToken>,
    worker: Option<JoinHandle<()>>,
    /// Set by `stop`; a stopped link never starts again.
    stopped: bool,
}

struct LinkInner {
    peer: PeerHandle,
    settings: WorkerSettings,
    cancel: broadcast::Sender<()>,
    state: Mutex<LinkState>,
}

pub struct PeerLink {
    inner: Arc<LinkInner>,
    watcher: JoinHandle<()>,
}

impl PeerLink {
    /// Ask for an initiator network to `peer` and start writing once it is
    /// available. Must be called from within a tokio runtime.
    pub fn spawn(
        session: DiscoverySession,
        peer: PeerHandle,
        provisioner: Arc<dyn LinkProvisioner>,
        config: &PeerlinkConfig,
    ) -> Self {
        let (cancel, _) = broadcast::channel(1);
        let inner = Arc::new(LinkInner {
            peer,
            settings: WorkerSettings {
                streams: config.client.streams.max(1),
                write_interval: config.client.write_interval(),
                counter_modulus: config.client.counter_modulus,
            },
            cancel,
            state: Mutex::new(LinkState::default()),
        });

        let events = provisioner.provision(ProvisionRequest {
            session,
            peer,
            role: Role::Initiator,
            port: None,
            passphrase: config.link.passphrase.clone(),
        });
        let watcher = tokio::spawn(watch_network(inner.clone(), events));

        tracing::debug!(peer = %peer, session = %session, "peer link created");
        Self { inner, watcher }
    }

    pub fn peer(&self) -> PeerHandle {
        self.inner.peer
    }

    /// The responder endpoint, once provisioned.
    pub async fn endpoint(&self) -> Option<SocketAddr> {
        self.inner.state.lock().await.endpoint
    }

    pub async fn network_token(&self) -> Option<NetworkToken> {
        self.inner.state.lock().await.network_token
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .worker
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Spawn the worker. Returns false without doing anything if a worker
    /// is already running, no endpoint is known yet, or the link was stopped.
    pub async fn start(&self) -> bool {
        self.inner.start().await
    }

    /// Signal the worker to exit and wait until it has released its streams.
    /// Network reports arriving afterwards are ignored.
    pub async fn stop(&self) {
        self.inner.stop().await;
        self.watcher.abort();
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        let _ = self.inner.cancel.send(());
        self.watcher.abort();
    }
}

impl LinkInner {
    async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.stopped {
            tracing::debug!(peer = %self.peer, "link stopped, not starting");
            return false;
        }
        if state.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return false;
        }
        let Some(endpoint) = state.endpoint else {
            tracing::debug!(peer = %self.peer, "no endpoint yet, not starting");
            return false;
        };

        let peer = self.peer;
        let settings = self.settings.clone();
        let cancel = self.cancel.subscribe();
        state.worker = Some(tokio::spawn(async move {
            match run_worker(endpoint, settings, cancel).await {
                Ok(()) => tracing::info!(peer = %peer, "peer link worker stopped"),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "peer link worker failed"),
            }
        }));
        tracing::info!(peer = %self.peer, endpoint = %endpoint, "peer link started");
        true
    }

    async fn stop(&self) {
        let worker = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            state.worker.take()
        };
        if let Some(worker) = worker {
            let _ = self.cancel.send(());
            let _ = worker.await;
        }
    }
}

async fn watch_network(inner: Arc<LinkInner>, mut events: NetworkEvents) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::Available(network) => {
                {
                    let mut state = inner.state.lock().await;
                    if state.stopped {
                        return;
                    }
                    if let Some(current) = state.network_token {
                        tracing::debug!(
                            peer = %inner.peer,
                            current = %current,
                            ignored = %network.token,
                            "network already known, ignoring report"
                        );
                        continue;
                    }
                    state.endpoint = Some(network.endpoint);
                    state.network_token = Some(network.token);
                }
                tracing::info!(
                    peer = %inner.peer,
                    endpoint = %network.endpoint,
                    token = %network.token,
                    "network available"
                );
                inner.start().await;
            }
            NetworkEvent::Lost => {
                tracing::info!(peer = %inner.peer, "network lost, stopping link");
                inner.stop().await;
                return;
            }
        }
    }
    tracing::debug!(peer = %inner.peer, "provisioning stream closed");
}

async fn run_worker(
    endpoint: SocketAddr,
    settings: WorkerSettings,
    mut cancel: broadcast::Receiver<()>,
) -> Result<()> {
    let mut streams = Vec::with_capacity(settings.streams);
    for _ in 0..settings.streams {
        let stream = tokio::select! {
            _ = cancel.recv() => return Ok(()),
            r = TcpStream::connect(endpoint) => r.with_context(|| format!("connect to {endpoint}"))?,
        };
        streams.push(stream);
    }
    tracing::debug!(endpoint = %endpoint, streams = streams.len(), "streams connected");

    let mut counter = CounterPayload::new(settings.counter_modulus);
    let mut interval = tokio::time::interval(settings.write_interval);

    loop {
        tokio::select! {
            _ = cancel.recv() => return Ok(()),
            _ = interval.tick() => {}
        }

        let frame = counter.next_frame();
        tokio::select! {
            _ = cancel.recv() => return Ok(()),
            r = write_all_streams(&mut streams, &frame) => r?,
        }
    }
}

async fn write_all_streams(streams: &mut [TcpStream], frame: &[u8]) -> Result<()> {
    for stream in streams.iter_mut() {
        stream.write_all(frame).await.context("write failed")?;
    }
    Ok(())
}
