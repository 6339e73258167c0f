//! Responder-side connection registry.
//!
//! Every admitted peer gets its own listening socket, and every listening and
//! data socket is serviced by one reactor thread. Callers on any thread can
//! admit and drop peers concurrently: operations are submitted to the reactor
//! as commands and answered once the reactor has applied them.

mod connection;
mod reactor;

pub use connection::{PeerSnapshot, PeerState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use peerlink_core::config::PeerlinkConfig;
use peerlink_core::{DiscoverySession, PeerHandle};
use peerlink_services::{DataSink, LinkProvisioner};

use reactor::{Command, Reactor};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to build reactor runtime: {0}")]
    Runtime(std::io::Error),
    #[error("failed to spawn reactor thread: {0}")]
    Spawn(std::io::Error),
}

pub struct ConnectionRegistry {
    commands: mpsc::UnboundedSender<Command>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ConnectionRegistry {
    /// Build the reactor and start it on its own thread.
    pub fn start(
        config: &PeerlinkConfig,
        provisioner: Arc<dyn LinkProvisioner>,
        sink: Arc<dyn DataSink>,
    ) -> Result<Self, RegistryError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RegistryError::Runtime)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(
            config.reactor.bind_addr,
            config.reactor.read_buffer_size,
            config.link.passphrase.clone(),
            provisioner,
            sink,
            rx,
        );

        let handle = std::thread::Builder::new()
            .name("peerlink-reactor".to_string())
            .spawn(move || runtime.block_on(reactor.run()))
            .map_err(RegistryError::Spawn)?;

        Ok(Self {
            commands: tx,
            reactor: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start listening for `peer` and ask for a network to it.
    ///
    /// Returns true if the peer is (or already was) admitted. Returns false
    /// if the registry is stopped or the listening socket could not be opened.
    pub async fn admit_peer(&self, session: &DiscoverySession, peer: PeerHandle) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.request(|reply| Command::Admit {
            session: *session,
            peer,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Close everything belonging to `peer`. Returns false if it was unknown.
    pub async fn drop_peer(&self, peer: &PeerHandle) -> bool {
        self.request(|reply| Command::Drop { peer: *peer, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn snapshot(&self, peer: &PeerHandle) -> Option<PeerSnapshot> {
        self.request(|reply| Command::Snapshot { peer: *peer, reply })
            .await
            .flatten()
    }

    /// Handles of all admitted peers. Empty once stopped.
    pub async fn peers(&self) -> Vec<PeerHandle> {
        self.request(|reply| Command::Peers { reply })
            .await
            .unwrap_or_default()
    }

    /// Do the peer map and the listener map describe the same connections?
    /// A stopped registry is trivially consistent.
    pub async fn check_consistency(&self) -> bool {
        self.request(|reply| Command::CheckConsistency { reply })
            .await
            .unwrap_or(true)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the reactor, drop every peer, and wait for the reactor thread
    /// to exit. Safe to call more than once and from any thread.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Stop);

        let handle = self
            .reactor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("reactor thread panicked");
            }
        }
        tracing::info!("connection registry stopped");
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).ok()?;
        rx.await.ok()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}
