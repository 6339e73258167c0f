//! The reactor loop.
//!
//! Runs on the registry's dedicated thread inside a current-thread runtime,
//! so every socket shares one OS readiness primitive. The reactor is the
//! only owner of the peer maps and of the registration set: callers submit
//! commands, and the loop applies them between readiness cycles. The command
//! queue is always polled first, so a command sent while the loop is parked
//! is applied on the very next wakeup.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use peerlink_core::{DiscoverySession, PeerHandle, Role};
use peerlink_services::{DataSink, LinkProvisioner, NetworkEvent, NetworkEvents, ProvisionRequest};

use super::connection::{ChannelId, Connection, DataChannel, PeerSnapshot};

pub(super) enum Command {
    Admit {
        session: DiscoverySession,
        peer: PeerHandle,
        reply: oneshot::Sender<bool>,
    },
    Drop {
        peer: PeerHandle,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        peer: PeerHandle,
        reply: oneshot::Sender<Option<PeerSnapshot>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerHandle>>,
    },
    CheckConsistency {
        reply: oneshot::Sender<bool>,
    },
    Stop,
}

/// Something a registration became ready with.
enum Readiness {
    Accepted {
        listener: ChannelId,
        result: io::Result<(TcpStream, SocketAddr)>,
    },
    Readable {
        channel: ChannelId,
        result: io::Result<()>,
    },
    Network {
        peer: PeerHandle,
        event: Option<NetworkEvent>,
        events: NetworkEvents,
    },
}

type Registrations = FuturesUnordered<Abortable<BoxFuture<'static, Readiness>>>;

pub(super) struct Reactor {
    bind_addr: IpAddr,
    passphrase: String,
    provisioner: Arc<dyn LinkProvisioner>,
    sink: Arc<dyn DataSink>,
    commands: mpsc::UnboundedReceiver<Command>,
    connections: HashMap<PeerHandle, Connection>,
    listeners: HashMap<ChannelId, PeerHandle>,
    streams: HashMap<ChannelId, PeerHandle>,
    registrations: Registrations,
    next_channel: ChannelId,
    buf: Vec<u8>,
}

impl Reactor {
    pub fn new(
        bind_addr: IpAddr,
        read_buffer_size: usize,
        passphrase: String,
        provisioner: Arc<dyn LinkProvisioner>,
        sink: Arc<dyn DataSink>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            bind_addr,
            passphrase,
            provisioner,
            sink,
            commands,
            connections: HashMap::new(),
            listeners: HashMap::new(),
            streams: HashMap::new(),
            registrations: FuturesUnordered::new(),
            next_channel: 0,
            buf: vec![0u8; read_buffer_size.max(1)],
        }
    }

    pub async fn run(mut self) {
        tracing::info!(bind_addr = %self.bind_addr, "reactor started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Stop) => break,
                    Some(command) => self.apply(command),
                    None => {
                        tracing::error!("command queue closed, reactor exiting");
                        break;
                    }
                },

                Some(ready) = self.registrations.next(), if !self.registrations.is_empty() => {
                    // Err means the registration was cancelled; nothing to do.
                    if let Ok(ready) = ready {
                        self.dispatch(ready);
                    }
                }
            }
        }

        self.drop_all();
        tracing::info!("reactor stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Admit { session, peer, reply } => {
                let _ = reply.send(self.admit(session, peer));
            }
            Command::Drop { peer, reply } => {
                let dropped = self.drop_peer(&peer);
                self.reap_cancelled();
                let _ = reply.send(dropped);
            }
            Command::Snapshot { peer, reply } => {
                let _ = reply.send(self.connections.get(&peer).map(Connection::snapshot));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.connections.keys().copied().collect());
            }
            Command::CheckConsistency { reply } => {
                let _ = reply.send(self.is_consistent());
            }
            Command::Stop => {}
        }
    }

    fn dispatch(&mut self, ready: Readiness) {
        match ready {
            Readiness::Accepted { listener, result } => self.on_accepted(listener, result),
            Readiness::Readable { channel, result } => self.on_readable(channel, result),
            Readiness::Network { peer, event, events } => self.on_network(peer, event, events),
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    fn admit(&mut self, session: DiscoverySession, peer: PeerHandle) -> bool {
        if self.connections.contains_key(&peer) {
            tracing::debug!(peer = %peer, "peer already admitted");
            return true;
        }

        let listener = match open_listener(self.bind_addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to open listening socket");
                return false;
            }
        };
        let listen_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to get listening port");
                return false;
            }
        };

        let listener = Arc::new(listener);
        let listener_id = self.next_channel_id();
        let listener_registration = arm_accept(&mut self.registrations, listener_id, listener.clone());

        let events = self.provisioner.provision(ProvisionRequest {
            session,
            peer,
            role: Role::Responder,
            port: Some(listen_port),
            passphrase: self.passphrase.clone(),
        });
        let network_registration = arm_network(&mut self.registrations, peer, events);

        self.connections.insert(
            peer,
            Connection {
                peer,
                session,
                listener_id,
                listener,
                listen_port,
                listener_registration,
                network_registration,
                data_channels: HashMap::new(),
                network_token: None,
            },
        );
        self.listeners.insert(listener_id, peer);

        tracing::info!(peer = %peer, session = %session, listen_port, "peer admitted");
        true
    }

    /// Cancel the peer's registrations, close its sockets, and forget it.
    fn drop_peer(&mut self, peer: &PeerHandle) -> bool {
        let Some(conn) = self.connections.remove(peer) else {
            return false;
        };
        self.listeners.remove(&conn.listener_id);
        for id in conn.data_channels.keys() {
            self.streams.remove(id);
        }

        tracing::info!(
            peer = %peer,
            session = %conn.session,
            channels = conn.data_channels.len(),
            "peer dropped"
        );
        conn.close();
        true
    }

    fn drop_all(&mut self) {
        let peers: Vec<PeerHandle> = self.connections.keys().copied().collect();
        for peer in peers {
            self.drop_peer(&peer);
        }
        // Release the sockets held by cancelled registrations right away.
        self.registrations = FuturesUnordered::new();
    }

    /// Poll whatever is ready without parking, so cancelled registrations
    /// release their sockets before the caller hears back.
    fn reap_cancelled(&mut self) {
        while let Some(Some(ready)) = self.registrations.next().now_or_never() {
            if let Ok(ready) = ready {
                self.dispatch(ready);
            }
        }
    }

    fn is_consistent(&self) -> bool {
        if self.listeners.len() != self.connections.len() {
            return false;
        }
        let listeners_ok = self.connections.iter().all(|(peer, conn)| {
            conn.peer == *peer && self.listeners.get(&conn.listener_id) == Some(peer)
        });
        let channel_count: usize = self.connections.values().map(|c| c.data_channels.len()).sum();
        let streams_ok = channel_count == self.streams.len()
            && self.streams.iter().all(|(id, peer)| {
                self.connections
                    .get(peer)
                    .is_some_and(|c| c.data_channels.contains_key(id))
            });
        listeners_ok && streams_ok
    }

    // ── Readiness ─────────────────────────────────────────────────────────────

    fn on_accepted(&mut self, listener_id: ChannelId, result: io::Result<(TcpStream, SocketAddr)>) {
        let Some(peer) = self.listeners.get(&listener_id).copied() else {
            return;
        };

        let (stream, remote) = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "accept failed, dropping peer");
                self.drop_peer(&peer);
                return;
            }
        };

        let channel_id = self.next_channel_id();
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };

        let stream = Arc::new(stream);
        let registration = arm_read(&mut self.registrations, channel_id, stream.clone());
        conn.data_channels.insert(
            channel_id,
            DataChannel {
                stream: Some(stream),
                remote,
                registration: Some(registration),
            },
        );
        conn.listener_registration =
            arm_accept(&mut self.registrations, listener_id, conn.listener.clone());
        self.streams.insert(channel_id, peer);

        tracing::info!(
            peer = %peer,
            remote = %remote,
            channels = conn.data_channels.len(),
            "data channel accepted"
        );
    }

    fn on_readable(&mut self, channel_id: ChannelId, result: io::Result<()>) {
        let Some(peer) = self.streams.get(&channel_id).copied() else {
            return;
        };
        let Some(channel) = self
            .connections
            .get_mut(&peer)
            .and_then(|c| c.data_channels.get_mut(&channel_id))
        else {
            return;
        };

        let Some(stream) = channel.stream.clone() else {
            return;
        };

        // A dead channel releases its socket in this step.
        if let Err(e) = result {
            tracing::warn!(peer = %peer, remote = %channel.remote, error = %e, "readiness failed");
            channel.close();
            return;
        }

        match stream.try_read(&mut self.buf) {
            Ok(0) => {
                tracing::debug!(peer = %peer, remote = %channel.remote, "data channel closed by peer");
                channel.close();
            }
            Ok(n) => {
                tracing::trace!(peer = %peer, len = n, "read");
                self.sink.on_bytes_received(&peer, &self.buf[..n]);
                channel.registration = Some(arm_read(&mut self.registrations, channel_id, stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                channel.registration = Some(arm_read(&mut self.registrations, channel_id, stream));
            }
            Err(e) => {
                tracing::warn!(peer = %peer, remote = %channel.remote, error = %e, "read failed");
                channel.close();
            }
        }
    }

    fn on_network(&mut self, peer: PeerHandle, event: Option<NetworkEvent>, events: NetworkEvents) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };

        match event {
            Some(NetworkEvent::Available(network)) => {
                match conn.network_token {
                    None => {
                        conn.network_token = Some(network.token);
                        tracing::info!(
                            peer = %peer,
                            endpoint = %network.endpoint,
                            token = %network.token,
                            "network available"
                        );
                    }
                    // First report wins while the peer is known, even if a
                    // later one carries a different network.
                    Some(current) if current == network.token => {
                        tracing::debug!(peer = %peer, token = %current, "repeated network report");
                    }
                    Some(current) => {
                        tracing::warn!(
                            peer = %peer,
                            current = %current,
                            ignored = %network.token,
                            "network already recorded, ignoring later report"
                        );
                    }
                }
                conn.network_registration = arm_network(&mut self.registrations, peer, events);
            }
            Some(NetworkEvent::Lost) => {
                tracing::info!(peer = %peer, "network lost");
                self.drop_peer(&peer);
            }
            None if conn.network_token.is_none() => {
                tracing::warn!(peer = %peer, "provisioning ended without a network");
                self.drop_peer(&peer);
            }
            None => {
                tracing::debug!(peer = %peer, "provisioning stream closed");
            }
        }
    }

    fn next_channel_id(&mut self) -> ChannelId {
        self.next_channel += 1;
        self.next_channel
    }
}

// ── Registration helpers ──────────────────────────────────────────────────────

fn register(
    registrations: &mut Registrations,
    fut: BoxFuture<'static, Readiness>,
) -> AbortHandle {
    let (handle, abort) = AbortHandle::new_pair();
    registrations.push(Abortable::new(fut, abort));
    handle
}

fn arm_accept(registrations: &mut Registrations, id: ChannelId, listener: Arc<TcpListener>) -> AbortHandle {
    register(
        registrations,
        async move {
            let result = listener.accept().await;
            Readiness::Accepted { listener: id, result }
        }
        .boxed(),
    )
}

fn arm_read(registrations: &mut Registrations, id: ChannelId, stream: Arc<TcpStream>) -> AbortHandle {
    register(
        registrations,
        async move {
            let result = stream.readable().await;
            Readiness::Readable { channel: id, result }
        }
        .boxed(),
    )
}

fn arm_network(registrations: &mut Registrations, peer: PeerHandle, mut events: NetworkEvents) -> AbortHandle {
    register(
        registrations,
        async move {
            let event = events.recv().await;
            Readiness::Network { peer, event, events }
        }
        .boxed(),
    )
}

/// Non-blocking listening socket on an ephemeral port.
fn open_listener(bind_addr: IpAddr) -> io::Result<TcpListener> {
    let addr = SocketAddr::new(bind_addr, 0);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}
