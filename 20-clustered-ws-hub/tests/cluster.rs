use std::{future::pending, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use clustered_ws_hub::{
    backplane::{Backplane, Bridge, memory::MemoryBackplane},
    config::{BackplaneConfig, HubConfig},
    connection::Peer,
    hub::{Hub, HubHandle},
    message::{Envelope, NodeId},
};
use tokio::{sync::mpsc, time::timeout};

const SHARED: &str = "ws:broadcast";
const QUIET: Duration = Duration::from_millis(150);

async fn start_node(backplane: &Arc<MemoryBackplane>, node: &str) -> HubHandle {
    let bridge = Bridge::new(backplane.clone(), SHARED, NodeId::from(node));
    let hub = Hub::new(bridge, HubConfig::default());
    let handle = hub.handle();
    tokio::spawn(hub.run_until(pending()));
    // The first round trip guarantees the shared listener is subscribed.
    handle.stats().await.expect("hub running");
    handle
}

async fn join(hub: &HubHandle, identity: &str, group: &str) -> mpsc::Receiver<Bytes> {
    let (peer, queue) = Peer::new(identity, group, 64);
    assert!(hub.register(peer).await);
    hub.stats().await.expect("hub running");
    queue
}

async fn next(queue: &mut mpsc::Receiver<Bytes>) -> Result<Bytes> {
    let payload = timeout(Duration::from_secs(1), queue.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("queue closed"))?;
    Ok(payload)
}

async fn assert_silent(queue: &mut mpsc::Receiver<Bytes>) {
    assert!(
        timeout(QUIET, queue.recv()).await.is_err(),
        "unexpected delivery"
    );
}

#[tokio::test]
async fn group_message_crosses_nodes_once() -> Result<()> {
    let backplane = Arc::new(MemoryBackplane::new());
    let node_a = start_node(&backplane, "nodeA").await;
    let node_b = start_node(&backplane, "nodeB").await;
    let node_c = start_node(&backplane, "nodeC").await;

    let mut alice = join(&node_a, "alice", "teamA").await;
    let mut bob = join(&node_b, "bob", "teamA").await;
    let mut carol = join(&node_c, "carol", "teamA").await;

    node_a
        .route(node_a.local_message("teamA", "alice", Bytes::from_static(b"hello team")))
        .await;

    assert_eq!(next(&mut alice).await?, Bytes::from_static(b"hello team"));
    assert_eq!(next(&mut bob).await?, Bytes::from_static(b"hello team"));
    assert_eq!(next(&mut carol).await?, Bytes::from_static(b"hello team"));

    // Receiving nodes must not re-publish, or everyone would see it again.
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
    assert_silent(&mut carol).await;
    Ok(())
}

#[tokio::test]
async fn remote_envelope_is_delivered_but_not_republished() -> Result<()> {
    let backplane = Arc::new(MemoryBackplane::new());
    let node_a = start_node(&backplane, "nodeA").await;
    let mut shared = backplane.subscribe(SHARED);

    let mut alice = join(&node_a, "alice", "teamA").await;
    let mut bob = join(&node_a, "bob", "teamA").await;

    let raw = Envelope::new("", "alice", b"x", &NodeId::from("nodeB")).encode()?;
    backplane.publish(SHARED, raw.clone());

    assert_eq!(next(&mut alice).await?, Bytes::from_static(b"x"));
    assert_silent(&mut bob).await;

    assert_eq!(
        timeout(Duration::from_secs(1), shared.recv()).await?,
        Some(raw)
    );
    assert!(timeout(QUIET, shared.recv()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn send_to_user_reaches_identity_on_every_node() -> Result<()> {
    let backplane = Arc::new(MemoryBackplane::new());
    let node_a = start_node(&backplane, "nodeA").await;
    let node_b = start_node(&backplane, "nodeB").await;

    let mut alice_a = join(&node_a, "alice", "teamA").await;
    let mut bob_a = join(&node_a, "bob", "teamA").await;
    let mut alice_b = join(&node_b, "alice", "teamB").await;

    assert!(node_a.send_to_user("alice", Bytes::from_static(b"hi")).await);

    assert_eq!(next(&mut alice_a).await?, Bytes::from_static(b"hi"));
    assert_eq!(next(&mut alice_b).await?, Bytes::from_static(b"hi"));
    assert_silent(&mut bob_a).await;
    Ok(())
}

#[tokio::test]
async fn identity_publish_skips_local_connections() -> Result<()> {
    let backplane = Arc::new(MemoryBackplane::new());
    let node_a = start_node(&backplane, "nodeA").await;
    let node_b = start_node(&backplane, "nodeB").await;

    let mut alice_a = join(&node_a, "alice", "teamA").await;
    let mut alice_b = join(&node_b, "alice", "teamB").await;
    let mut bob_b = join(&node_b, "bob", "teamB").await;

    let published = node_a.publish_to_identities(["alice", "", "dave"], b"ping");
    assert_eq!(published, 2);

    assert_eq!(next(&mut alice_b).await?, Bytes::from_static(b"ping"));
    assert_silent(&mut alice_a).await;
    assert_silent(&mut bob_b).await;
    Ok(())
}

#[tokio::test]
async fn malformed_envelopes_do_not_break_the_subscription() -> Result<()> {
    let backplane = Arc::new(MemoryBackplane::new());
    let node_a = start_node(&backplane, "nodeA").await;
    let mut alice = join(&node_a, "alice", "teamA").await;

    backplane.publish(SHARED, "{not json".into());
    backplane.publish(
        SHARED,
        r#"{"group":"teamA","identity":"","payload":"%%%","origin":"nodeB"}"#.into(),
    );
    backplane.publish("ws:user:alice", "garbage".into());
    let raw = Envelope::new("teamA", "", b"still alive", &NodeId::from("nodeB")).encode()?;
    backplane.publish(SHARED, raw);

    assert_eq!(next(&mut alice).await?, Bytes::from_static(b"still alive"));
    Ok(())
}

#[tokio::test]
async fn unreachable_backplane_degrades_to_single_node() -> Result<()> {
    let config = BackplaneConfig {
        address: "127.0.0.1:1".into(),
        probe_timeout: Duration::from_millis(500),
        ..BackplaneConfig::default()
    };
    let bridge = Bridge::connect(&config, NodeId::from("nodeA")).await;
    assert!(!bridge.is_enabled());

    let hub = Hub::new(bridge, HubConfig::default());
    let handle = hub.handle();
    tokio::spawn(hub.run_until(pending()));

    let mut alice = join(&handle, "alice", "teamA").await;
    let mut bob = join(&handle, "bob", "teamA").await;
    handle
        .route(handle.local_message("teamA", "alice", Bytes::from_static(b"local only")))
        .await;

    assert_eq!(next(&mut alice).await?, Bytes::from_static(b"local only"));
    assert_eq!(next(&mut bob).await?, Bytes::from_static(b"local only"));
    assert_eq!(handle.publish_to_identities(["alice"], b"nowhere"), 0);

    let stats = handle.stats().await.expect("hub running");
    assert!(!stats.backplane);
    assert_eq!(stats.identity_subscriptions["alice"], 1);
    Ok(())
}
