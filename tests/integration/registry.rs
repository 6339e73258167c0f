//! Connection registry against real loopback sockets.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use peerlink_core::{DiscoverySession, Epoch, NetworkToken, PeerHandle, SessionRole};
use peerlink_services::{ChannelSink, ManualProvisioner};
use peerlinkd::registry::{ConnectionRegistry, PeerState};

use crate::*;

struct Fixture {
    registry: ConnectionRegistry,
    provisioner: ManualProvisioner,
    rx: mpsc::UnboundedReceiver<(PeerHandle, Bytes)>,
    session: DiscoverySession,
}

fn fixture() -> Fixture {
    let provisioner = ManualProvisioner::new();
    let (sink, rx) = ChannelSink::new();
    let registry =
        ConnectionRegistry::start(&test_config(), Arc::new(provisioner.clone()), Arc::new(sink))
            .expect("registry should start");
    Fixture {
        registry,
        provisioner,
        rx,
        session: DiscoverySession::new(7, Epoch(3), SessionRole::Publish),
    }
}

fn peer(token: u32) -> PeerHandle {
    PeerHandle::new(Epoch(3), token)
}

async fn connect(registry: &ConnectionRegistry, peer: &PeerHandle) -> TcpStream {
    let snapshot = registry.snapshot(peer).await.expect("peer should be admitted");
    TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, snapshot.listen_port)))
        .await
        .expect("listener should accept")
}

/// Wait until `peer` has `(data channels, armed channels)`.
async fn wait_channels(registry: &ConnectionRegistry, peer: &PeerHandle, want: (usize, usize)) -> bool {
    let peer = *peer;
    eventually(|| async move {
        registry
            .snapshot(&peer)
            .await
            .is_some_and(|s| (s.data_channels, s.armed_channels) == want)
    })
    .await
}

/// Admit, get a network, accept one channel, and see its bytes in order.
#[tokio::test]
async fn delivers_channel_bytes_in_order() {
    let mut f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);

    let ep1 = SocketAddr::from((Ipv4Addr::LOCALHOST, 4000));
    assert!(f.provisioner.available(&p, ep1, NetworkToken::new(1)));

    let mut client = connect(&f.registry, &p).await;
    client.write_all(b"hello").await.unwrap();

    let (from, bytes) = collect_bytes(&mut f.rx, 5).await.unwrap();
    assert_eq!(from, p);
    assert_eq!(bytes, b"hello");

    let snapshot = f.registry.snapshot(&p).await.unwrap();
    assert_eq!(snapshot.state, PeerState::Linked);
    assert_eq!(snapshot.network_token, Some(NetworkToken::new(1)));
}

/// Two different reports: the first token is kept.
#[tokio::test]
async fn first_network_report_wins() {
    let f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);

    let ep1 = SocketAddr::from((Ipv4Addr::LOCALHOST, 4000));
    let ep2 = SocketAddr::from((Ipv4Addr::LOCALHOST, 4001));
    f.provisioner.available(&p, ep1, NetworkToken::new(1));
    f.provisioner.available(&p, ep2, NetworkToken::new(2));

    let registry = &f.registry;
    assert!(
        eventually(|| async move {
            registry
                .snapshot(&p)
                .await
                .is_some_and(|s| s.network_token.is_some())
        })
        .await
    );
    // Let the second report land too.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = f.registry.snapshot(&p).await.unwrap();
    assert_eq!(snapshot.network_token, Some(NetworkToken::new(1)));
}

/// A failed read disarms only that channel; the peer stays admitted.
#[tokio::test]
async fn read_failure_is_isolated_to_its_channel() {
    let mut f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);

    let broken = connect(&f.registry, &p).await;
    let mut healthy = connect(&f.registry, &p).await;
    assert!(wait_channels(&f.registry, &p, (2, 2)).await);

    // Reset instead of a clean close.
    broken.set_linger(Some(Duration::ZERO)).unwrap();
    drop(broken);

    assert!(wait_channels(&f.registry, &p, (2, 1)).await);
    assert!(f.registry.peers().await.contains(&p));
    assert!(f.registry.check_consistency().await);

    healthy.write_all(b"still").await.unwrap();
    let (from, bytes) = collect_bytes(&mut f.rx, 5).await.unwrap();
    assert_eq!(from, p);
    assert_eq!(bytes, b"still");
}

/// A channel the remote closed is closed on our side too; the peer stays.
#[tokio::test]
async fn closed_channel_releases_socket() {
    let f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);

    let mut client = connect(&f.registry, &p).await;
    assert!(wait_channels(&f.registry, &p, (1, 1)).await);

    client.shutdown().await.unwrap();
    assert!(wait_channels(&f.registry, &p, (1, 0)).await);

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(DEADLINE, client.read(&mut buf))
        .await
        .expect("registry should close its end")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(f.registry.peers().await.contains(&p));
    assert!(f.registry.check_consistency().await);
}

/// Lost network removes the peer and closes its channels.
#[tokio::test]
async fn lost_network_removes_peer() {
    let f = fixture();
    let p = peer(1);
    let other = peer(2);
    assert!(f.registry.admit_peer(&f.session, p).await);
    assert!(f.registry.admit_peer(&f.session, other).await);

    let mut client = connect(&f.registry, &p).await;
    assert!(wait_channels(&f.registry, &p, (1, 1)).await);

    assert!(f.provisioner.lost(&p));

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(DEADLINE, client.read(&mut buf))
        .await
        .expect("channel should be closed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    assert!(f.registry.snapshot(&p).await.is_none());
    assert_eq!(f.registry.peers().await, vec![other]);
    assert!(f.registry.check_consistency().await);
}

#[tokio::test]
async fn maps_stay_consistent_across_admit_and_drop() {
    let f = fixture();
    let mut expected = BTreeSet::new();

    // Deterministic interleaving of admits, re-admits and drops.
    for step in 0u32..40 {
        let p = peer(step % 7 + 1);
        if step % 3 == 2 {
            let was_present = expected.remove(&p.token());
            assert_eq!(f.registry.drop_peer(&p).await, was_present);
        } else {
            assert!(f.registry.admit_peer(&f.session, p).await);
            expected.insert(p.token());
        }

        assert!(f.registry.check_consistency().await, "inconsistent at step {step}");
        let actual: BTreeSet<u32> = f.registry.peers().await.iter().map(|p| p.token()).collect();
        assert_eq!(actual, expected, "peer set diverged at step {step}");
    }
}

/// Admits and drops from several threads at once leave the maps consistent.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admit_and_drop_stay_consistent() {
    let f = fixture();
    let registry = Arc::new(f.registry);
    let session = f.session;

    let tasks: Vec<_> = (0u32..4)
        .map(|worker| {
            let registry = registry.clone();
            tokio::spawn(async move {
                // Each worker owns tokens worker*100+1 ..= worker*100+10.
                for round in 0..5u32 {
                    for i in 1..=10 {
                        let p = peer(worker * 100 + i);
                        assert!(registry.admit_peer(&session, p).await);
                        if (i + round) % 2 == 0 {
                            assert!(registry.drop_peer(&p).await);
                        }
                    }
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // The last round (4) drops the even-indexed tokens and keeps the odd ones.
    let expected: BTreeSet<u32> = (0u32..4)
        .flat_map(|worker| (1..=10).filter(|i| i % 2 == 1).map(move |i| worker * 100 + i))
        .collect();
    let actual: BTreeSet<u32> = registry.peers().await.iter().map(|p| p.token()).collect();
    assert_eq!(actual, expected);
    assert!(registry.check_consistency().await);
}

#[tokio::test]
async fn readmission_keeps_listener() {
    let f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);
    let port = f.registry.snapshot(&p).await.unwrap().listen_port;

    for _ in 0..3 {
        assert!(f.registry.admit_peer(&f.session, p).await);
    }
    assert_eq!(f.registry.snapshot(&p).await.unwrap().listen_port, port);
    assert_eq!(f.registry.peers().await.len(), 1);
    assert_eq!(f.provisioner.request_count(), 1);
}

#[tokio::test]
async fn dropping_unknown_peer_changes_nothing() {
    let f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);

    assert!(!f.registry.drop_peer(&peer(99)).await);
    assert_eq!(f.registry.peers().await, vec![p]);
    assert!(f.registry.check_consistency().await);
}

/// A dropped peer's listener stops accepting.
#[tokio::test]
async fn dropped_peer_listener_is_closed() {
    let f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);
    let port = f.registry.snapshot(&p).await.unwrap().listen_port;

    assert!(f.registry.drop_peer(&p).await);
    let refused = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await;
    assert!(refused.is_err());
}

/// Work submitted while the reactor is idle is served straight away.
#[tokio::test]
async fn admission_is_visible_on_next_cycle() {
    let mut f = fixture();
    // Reactor has nothing registered and sits waiting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);
    let mut client = connect(&f.registry, &p).await;
    client.write_all(b"ping").await.unwrap();

    let (_, bytes) = tokio::time::timeout(Duration::from_secs(1), collect_bytes(&mut f.rx, 4))
        .await
        .expect("bytes should arrive without waiting for a timeout")
        .unwrap();
    assert_eq!(bytes, b"ping");
}

#[tokio::test]
async fn many_channels_per_peer() {
    let mut f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(connect(&f.registry, &p).await);
    }
    assert!(wait_channels(&f.registry, &p, (4, 4)).await);

    for client in clients.iter_mut() {
        client.write_all(b"x").await.unwrap();
    }
    let (_, bytes) = collect_bytes(&mut f.rx, 4).await.unwrap();
    assert_eq!(bytes, b"xxxx");
}

#[tokio::test]
async fn stop_empties_registry_and_silences_sink() {
    let mut f = fixture();
    let p = peer(1);
    assert!(f.registry.admit_peer(&f.session, p).await);
    let mut client = connect(&f.registry, &p).await;
    assert!(wait_channels(&f.registry, &p, (1, 1)).await);

    f.registry.stop();
    assert!(f.registry.peers().await.is_empty());
    assert!(f.registry.check_consistency().await);

    // The reactor is gone, so nothing reaches the sink any more.
    let _ = client.write_all(b"late").await;
    let next = tokio::time::timeout(DEADLINE, f.rx.recv()).await.unwrap();
    assert!(next.is_none());
}
