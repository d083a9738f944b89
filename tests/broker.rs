use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use media_relay_core::broker;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

mod common;

async fn spawn_broker(allowed_origins: Vec<String>, dev_mode: bool) -> SocketAddr {
    let port = common::pick_port();
    let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = broker::serve(listener, allowed_origins, dev_mode, std::future::pending()).await;
    });
    // Give the server a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let addr = spawn_broker(vec![], true).await;
    let res = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "OK");
}

/// Scenario 1 (spec.md §8): a second client joining triggers a
/// `viewer_connected` notification to the already-connected first client.
#[tokio::test]
async fn second_client_join_notifies_first() {
    let addr = spawn_broker(vec![], true).await;
    let url = format!("ws://{addr}/ws");

    let (mut publisher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut viewer, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _ = &mut viewer;

    let msg = tokio::time::timeout(Duration::from_secs(2), publisher.next())
        .await
        .expect("no message received")
        .expect("stream ended")
        .expect("websocket error");

    let WsMessage::Text(text) = msg else {
        panic!("expected text frame, got {msg:?}");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "viewer_connected");
    assert_eq!(value["clientId"], "client-2");
}

/// Scenario 6 (spec.md §8): a viewer-originated `candidate` with no
/// `clientId` arrives at the publisher stamped with both `clientId` and
/// `fromClientId` set to the sender's own id.
#[tokio::test]
async fn candidate_without_client_id_is_stamped_with_sender() {
    let addr = spawn_broker(vec![], true).await;
    let url = format!("ws://{addr}/ws");

    let (mut publisher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut viewer, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // Drain the viewer_connected notification sent to the publisher.
    let _ = tokio::time::timeout(Duration::from_secs(2), publisher.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let candidate = json!({"type": "candidate", "candidate": {"candidate": "foo"}});
    viewer
        .send(WsMessage::Text(candidate.to_string()))
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), publisher.next())
        .await
        .expect("no message received")
        .expect("stream ended")
        .expect("websocket error");
    let WsMessage::Text(text) = msg else {
        panic!("expected text frame");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "candidate");
    assert_eq!(value["clientId"], "client-2");
    assert_eq!(value["fromClientId"], "client-2");
}

/// A message that already names an explicit target `clientId` keeps it —
/// the broker only fills `clientId` in when it is absent.
#[tokio::test]
async fn explicit_client_id_is_preserved() {
    let addr = spawn_broker(vec![], true).await;
    let url = format!("ws://{addr}/ws");

    let (mut publisher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut viewer, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let _ = tokio::time::timeout(Duration::from_secs(2), publisher.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let offer = json!({"type": "offer", "clientId": "client-2", "offer": {"type": "offer", "sdp": "x"}});
    publisher.send(WsMessage::Text(offer.to_string())).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), viewer.next())
        .await
        .expect("no message received")
        .expect("stream ended")
        .expect("websocket error");
    let WsMessage::Text(text) = msg else {
        panic!("expected text frame");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["clientId"], "client-2");
    assert_eq!(value["fromClientId"], "client-1");
}

#[tokio::test]
async fn disallowed_origin_is_refused() {
    let addr = spawn_broker(vec!["https://allowed.example".to_string()], false).await;

    let client = reqwest::Client::new();
    let res = client
        .get(format!("http://{addr}/ws"))
        .header("Origin", "https://evil.example")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), reqwest::StatusCode::FORBIDDEN);
}
