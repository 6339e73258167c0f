//! Per-peer connection state owned by the reactor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::AbortHandle;
use tokio::net::{TcpListener, TcpStream};

use peerlink_core::{DiscoverySession, NetworkToken, PeerHandle};

/// Reactor-local identity of a socket.
pub(super) type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Listening socket registered, no data channel accepted yet.
    Admitted,
    /// At least one data channel accepted and a network token recorded.
    Linked,
}

/// A point-in-time view of one peer's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer: PeerHandle,
    pub state: PeerState,
    /// Port the peer was told to connect to.
    pub listen_port: u16,
    /// Accepted data channels, including closed ones whose reads ended.
    pub data_channels: usize,
    /// Data channels still registered for readability.
    pub armed_channels: usize,
    pub network_token: Option<NetworkToken>,
}

pub(super) struct DataChannel {
    /// `None` once the channel is closed; the entry stays as a tombstone.
    pub stream: Option<Arc<TcpStream>>,
    pub remote: SocketAddr,
    /// `None` once reads on this channel have ended.
    pub registration: Option<AbortHandle>,
}

impl DataChannel {
    /// Stop reading and release the socket. The channel stays counted.
    pub fn close(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.abort();
        }
        self.stream = None;
    }
}

pub(super) struct Connection {
    pub peer: PeerHandle,
    pub session: DiscoverySession,
    pub listener_id: ChannelId,
    pub listener: Arc<TcpListener>,
    pub listen_port: u16,
    pub listener_registration: AbortHandle,
    pub network_registration: AbortHandle,
    pub data_channels: HashMap<ChannelId, DataChannel>,
    pub network_token: Option<NetworkToken>,
}

impl Connection {
    pub fn state(&self) -> PeerState {
        if self.data_channels.is_empty() || self.network_token.is_none() {
            PeerState::Admitted
        } else {
            PeerState::Linked
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer: self.peer,
            state: self.state(),
            listen_port: self.listen_port,
            data_channels: self.data_channels.len(),
            armed_channels: self
                .data_channels
                .values()
                .filter(|c| c.registration.is_some())
                .count(),
            network_token: self.network_token,
        }
    }

    /// Cancel every registration and release every socket this connection
    /// holds. Aborted registrations never touch their socket again.
    pub fn close(mut self) {
        self.listener_registration.abort();
        self.network_registration.abort();
        for (_, mut channel) in self.data_channels.drain() {
            channel.close();
            tracing::trace!(peer = %self.peer, remote = %channel.remote, "data channel closed");
        }
    }
}
