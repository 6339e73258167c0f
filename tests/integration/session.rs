//! Publish/subscribe controllers paired over the loopback medium.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use peerlink_core::PeerHandle;
use peerlink_services::{ChannelSink, LogSink, LoopbackMedium};
use peerlinkd::registry::PeerState;
use peerlinkd::session::{ControllerState, PeerSessionController};

use crate::*;

const SERVICE: &str = "peerlink-it";

fn publisher(
    medium: &LoopbackMedium,
) -> (
    PeerSessionController,
    mpsc::UnboundedReceiver<(PeerHandle, Bytes)>,
) {
    let (sink, rx) = ChannelSink::new();
    let controller = PeerSessionController::new(
        Arc::new(medium.clone()),
        Arc::new(medium.clone()),
        Arc::new(sink),
        test_config(),
    );
    (controller, rx)
}

fn subscriber(medium: &LoopbackMedium) -> PeerSessionController {
    PeerSessionController::new(
        Arc::new(medium.clone()),
        Arc::new(medium.clone()),
        Arc::new(LogSink),
        test_config(),
    )
}

async fn linked_pair(
    medium: &LoopbackMedium,
) -> (
    PeerSessionController,
    PeerSessionController,
    mpsc::UnboundedReceiver<(PeerHandle, Bytes)>,
) {
    let (publ, rx) = publisher(medium);
    let subs = subscriber(medium);
    assert!(publ.attach().await);
    assert!(subs.attach().await);
    assert!(publ.publish(SERVICE).await);
    assert!(subs.subscribe(SERVICE).await);
    (publ, subs, rx)
}

#[tokio::test]
async fn subscriber_streams_counter_to_publisher() {
    let medium = LoopbackMedium::new();
    let (publ, subs, mut rx) = linked_pair(&medium).await;

    let (peer, bytes) = collect_bytes(&mut rx, 4).await.unwrap();
    assert!(bytes.starts_with(b"0123"), "unexpected stream {bytes:?}");

    let registry = publ.registry().await.unwrap();
    assert_eq!(registry.peers().await, vec![peer]);
    let registry = &registry;
    assert!(
        eventually(|| async move {
            registry
                .snapshot(&peer)
                .await
                .is_some_and(|s| s.state == PeerState::Linked && s.network_token.is_some())
        })
        .await
    );

    assert_eq!(subs.linked_peers().await.len(), 1);
    assert_eq!(publ.state(), ControllerState::Active);
    assert_eq!(subs.state(), ControllerState::Active);
}

#[tokio::test]
async fn subscriber_started_first_still_links() {
    let medium = LoopbackMedium::new();
    let (publ, mut rx) = publisher(&medium);
    let subs = subscriber(&medium);
    assert!(subs.attach().await);
    assert!(subs.subscribe(SERVICE).await);
    assert!(publ.attach().await);
    assert!(publ.publish(SERVICE).await);

    let (_, bytes) = collect_bytes(&mut rx, 2).await.unwrap();
    assert!(bytes.starts_with(b"01"));
}

#[tokio::test]
async fn different_service_names_never_pair() {
    let medium = LoopbackMedium::new();
    let (publ, _rx) = publisher(&medium);
    let subs = subscriber(&medium);
    assert!(publ.attach().await);
    assert!(subs.attach().await);
    assert!(publ.publish("one").await);
    assert!(subs.subscribe("two").await);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(subs.linked_peers().await.is_empty());
    assert!(publ.registry().await.unwrap().peers().await.is_empty());
}

#[tokio::test]
async fn closing_subscriber_drops_peer_on_publisher() {
    let medium = LoopbackMedium::new();
    let (publ, subs, mut rx) = linked_pair(&medium).await;
    collect_bytes(&mut rx, 1).await.unwrap();
    let registry = publ.registry().await.unwrap();

    subs.close().await;
    assert_eq!(subs.state(), ControllerState::Closed);
    assert!(subs.linked_peers().await.is_empty());

    let registry = &registry;
    assert!(eventually(|| async move { registry.peers().await.is_empty() }).await);
    assert!(registry.check_consistency().await);
    assert_eq!(publ.state(), ControllerState::Active);
}

#[tokio::test]
async fn lost_links_clear_registry() {
    let medium = LoopbackMedium::new();
    let (publ, _subs, mut rx) = linked_pair(&medium).await;
    collect_bytes(&mut rx, 1).await.unwrap();
    let registry = publ.registry().await.unwrap();

    medium.lose_links();

    let registry = &registry;
    assert!(eventually(|| async move { registry.peers().await.is_empty() }).await);
    // Loss is an I/O event, not a controller transition.
    assert_eq!(publ.state(), ControllerState::Active);
}

#[tokio::test]
async fn closing_publisher_stops_registry() {
    let medium = LoopbackMedium::new();
    let (publ, subs, mut rx) = linked_pair(&medium).await;
    collect_bytes(&mut rx, 1).await.unwrap();
    let registry = publ.registry().await.unwrap();

    publ.close().await;
    publ.close().await;

    assert!(registry.is_stopped());
    assert!(registry.peers().await.is_empty());
    assert_eq!(publ.state(), ControllerState::Closed);
    assert_eq!(subs.state(), ControllerState::Active);
    assert_eq!(medium.session_count(), 1);

    subs.close().await;
    assert_eq!(medium.session_count(), 0);
}

#[tokio::test]
async fn reattach_after_close_starts_new_epoch() {
    let medium = LoopbackMedium::new();
    let (publ, subs, mut rx) = linked_pair(&medium).await;
    let (old_peer, _) = collect_bytes(&mut rx, 1).await.unwrap();

    publ.close().await;
    assert!(publ.attach().await);
    assert!(publ.publish(SERVICE).await);

    // The live subscriber finds the republished service under a new handle.
    let registry = publ.registry().await.unwrap();
    let registry = &registry;
    assert!(eventually(|| async move { registry.peers().await.len() == 1 }).await);
    let new_peer = registry.peers().await[0];
    assert_ne!(new_peer, old_peer);
    assert_ne!(new_peer.epoch(), old_peer.epoch());

    // One link to the closed publication, one to the new one.
    let subs = &subs;
    assert!(eventually(|| async move { subs.linked_peers().await.len() == 2 }).await);
}

#[tokio::test]
async fn availability_flip_closes_both_roles() {
    let medium = LoopbackMedium::new();
    let (publ, subs, mut rx) = linked_pair(&medium).await;
    collect_bytes(&mut rx, 1).await.unwrap();

    medium.set_available(false);
    publ.availability_changed().await;
    subs.availability_changed().await;

    assert_eq!(publ.state(), ControllerState::Closed);
    assert_eq!(subs.state(), ControllerState::Closed);
    assert_eq!(medium.session_count(), 0);
    assert!(!publ.attach().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attach_reaches_medium_once() {
    let medium = LoopbackMedium::new();
    let subs = Arc::new(subscriber(&medium));

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let subs = subs.clone();
            tokio::spawn(async move { subs.attach().await })
        })
        .collect();
    for call in calls {
        assert!(call.await.unwrap());
    }

    assert_eq!(medium.attach_requests(), 1);
    assert_eq!(subs.state(), ControllerState::Attached);
}

#[tokio::test]
async fn rejected_subscribe_leaves_controller_attached() {
    let medium = LoopbackMedium::new();
    medium.reject_subscribe(true);
    let subs = subscriber(&medium);
    assert!(subs.attach().await);

    assert!(!subs.subscribe(SERVICE).await);
    assert_eq!(subs.state(), ControllerState::Attached);
    assert!(!subs.is_subscribing().await);
}
