use std::{future::pending, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use bytes::Bytes;
use clustered_ws_hub::{
    backplane::{Backplane, Bridge, memory::MemoryBackplane},
    config::{ConnectionSettings, HubConfig},
    connection::Peer,
    hub::{Hub, HubHandle},
    message::{Envelope, NodeId},
    server::{self, AppState},
};
use serde_json::Value;
use tokio::time::timeout;
use tower::ServiceExt;

fn app_with(bridge: Bridge) -> (Router, HubHandle) {
    let hub = Hub::new(bridge, HubConfig::default());
    let handle = hub.handle();
    tokio::spawn(hub.run_until(pending()));
    let app = server::router(AppState {
        hub: handle.clone(),
        settings: ConnectionSettings::default(),
    });
    (app, handle)
}

async fn call(app: Router, method: Method, uri: &str) -> Result<(StatusCode, Value)> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&body)?))
}

#[tokio::test]
async fn health_reports_ok() -> Result<()> {
    let (app, _) = app_with(Bridge::disabled(NodeId::from("nodeA")));
    let (status, body) = call(app, Method::GET, "/health").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn notify_user_delivers_to_that_identity() -> Result<()> {
    let (app, hub) = app_with(Bridge::disabled(NodeId::from("nodeA")));
    let (alice, mut alice_queue) = Peer::new("alice", "teamA", 8);
    hub.register(alice).await;

    let uri = "/notify/user?id=alice&message=ship%20it";
    let (status, body) = call(app.clone(), Method::POST, uri).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "sent");
    let delivered = timeout(Duration::from_secs(1), alice_queue.recv()).await?;
    assert_eq!(delivered, Some(Bytes::from_static(b"ship it")));

    call(app, Method::POST, "/notify/user?id=alice").await?;
    let delivered = timeout(Duration::from_secs(1), alice_queue.recv()).await?;
    assert_eq!(delivered, Some(Bytes::from_static(b"notification")));
    Ok(())
}

#[tokio::test]
async fn notify_user_requires_id() -> Result<()> {
    let (app, _) = app_with(Bridge::disabled(NodeId::from("nodeA")));
    let (status, body) = call(app, Method::POST, "/notify/user?message=hi").await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing id");
    Ok(())
}

#[tokio::test]
async fn notify_identities_publishes_per_identity_channels() -> Result<()> {
    let backplane = Arc::new(MemoryBackplane::new());
    let mut alice_channel = backplane.subscribe("ws:user:alice");
    let mut bob_channel = backplane.subscribe("ws:user:bob");
    let bridge = Bridge::new(backplane.clone(), "ws:broadcast", NodeId::from("nodeA"));
    let (app, _) = app_with(bridge);

    let (status, body) = call(app, Method::POST, "/notify/redis?ids=alice,%20bob%20,,").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["published"], 2);

    for channel in [&mut alice_channel, &mut bob_channel] {
        let raw = timeout(Duration::from_secs(1), channel.recv())
            .await?
            .expect("feed open");
        let envelope = Envelope::decode(&raw)?;
        assert_eq!(envelope.payload_bytes()?, Bytes::from_static(b"redis notification"));
        assert_eq!(envelope.origin, "nodeA");
    }
    Ok(())
}

#[tokio::test]
async fn notify_identities_validates_ids() -> Result<()> {
    let (app, _) = app_with(Bridge::disabled(NodeId::from("nodeA")));

    let (status, body) = call(app.clone(), Method::POST, "/notify/redis").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing ids");

    let (status, body) = call(app, Method::POST, "/notify/redis?ids=%20,,").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "no valid ids");
    Ok(())
}

#[tokio::test]
async fn stats_reflect_registrations() -> Result<()> {
    let (app, hub) = app_with(Bridge::disabled(NodeId::from("nodeA")));
    let (alice, _alice_queue) = Peer::new("alice", "teamA", 8);
    let (bob, _bob_queue) = Peer::new("bob", "teamA", 8);
    hub.register(alice).await;
    hub.register(bob).await;

    let (status, body) = call(app, Method::GET, "/stats").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_id"], "nodeA");
    assert_eq!(body["connections"], 2);
    assert_eq!(body["groups"]["teamA"], 2);
    assert_eq!(body["identity_subscriptions"]["alice"], 1);
    assert_eq!(body["backplane"], false);
    Ok(())
}
