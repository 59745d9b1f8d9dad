// End-to-end transport behavior against a real listener: long-poll status
// mapping and liveness probing of command-silent subscribers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pylon_broker::Broker;
use pylon_core::PylonConfig;
use pylon_gateway::app::{build_router, AppState};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn serve(config: PylonConfig) -> (String, Broker) {
    let broker = Broker::new(config.broker.clone());
    let state = Arc::new(AppState::new(config, broker.clone()));
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), broker)
}

async fn next_text(ws: &mut Ws) -> Option<String> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .ok()??
        {
            Ok(WsMessage::Text(text)) => return Some(text.to_string()),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn long_poll_hit_returns_200_with_one_delivery() {
    let (addr, broker) = serve(PylonConfig::default()).await;
    broker.post("news".into(), json!({"headline": "hi"}));

    let resp = reqwest::get(format!("http://{addr}/channels/news?last=0"))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 1);
    assert_eq!(body["channel"], "news");
    assert_eq!(body["message"]["headline"], "hi");
}

#[tokio::test]
async fn long_poll_expiry_is_a_504_without_payload() {
    let mut config = PylonConfig::default();
    config.broker.comet_timeout_secs = 1;
    let (addr, _broker) = serve(config).await;

    let resp = reqwest::get(format!("http://{addr}/channels/quiet?last=0"))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    assert!(resp.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn long_poll_bad_channel_is_a_400() {
    let (addr, _broker) = serve(PylonConfig::default()).await;

    let raw = "c".repeat(101);
    let resp = reqwest::get(format!("http://{addr}/channels/{raw}?last=0"))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid-channel");
}

#[tokio::test]
async fn passive_subscriber_outlives_the_liveness_timeout() {
    let mut config = PylonConfig::default();
    config.broker.liveness_timeout_secs = 1;
    let (addr, broker) = serve(config).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws.send(WsMessage::Text(
        r#"{"command":"set-filter","filter":["news"]}"#.into(),
    ))
    .await
    .unwrap();
    let ack = next_text(&mut ws).await.expect("subscribe ack");
    assert!(ack.contains("success"));

    // sit command-silent well past the timeout; polling the socket answers
    // the server's liveness pings
    let deadline = tokio::time::Instant::now() + Duration::from_millis(2500);
    while tokio::time::Instant::now() < deadline {
        let _ = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    }

    broker.post("news".into(), json!("still here"));
    let delivery = next_text(&mut ws).await.expect("subscriber was reaped");
    assert!(delivery.contains("still here"));
}
