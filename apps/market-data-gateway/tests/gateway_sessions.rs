//! Gateway Session Integration Tests
//!
//! Runs the downstream WebSocket server against a mock exchange and real
//! WebSocket clients: shared upstream streams, data delivery, error
//! frames, compression negotiation and heartbeats.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use common::{MockUpstream, WAIT};
use market_data_gateway::application::ports::AllowAll;
use market_data_gateway::infrastructure::codec::{Compression, MessageCodec};
use market_data_gateway::infrastructure::gateway::serve;
use market_data_gateway::infrastructure::heartbeat::HeartbeatConfig;
use market_data_gateway::infrastructure::upstream::ReconnectConfig;
use market_data_gateway::{
    GatewayState, SessionSettings, StreamRegistry, ThresholdConfig, UpstreamConfig,
    UpstreamFeedConnection, pump_feed_events,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    mock: MockUpstream,
    registry: Arc<StreamRegistry>,
    cancel: CancellationToken,
}

impl Harness {
    async fn wait_for_sessions(&self, count: usize) {
        timeout(WAIT, async {
            while self.registry.stats().sessions != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session count did not settle");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn setup(settings: SessionSettings, max_attempts: Option<u32>) -> Harness {
    let mock = MockUpstream::start().await;
    let cancel = CancellationToken::new();

    let upstream_config = UpstreamConfig {
        reconnect: ReconnectConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            max_attempts,
        ),
        heartbeat: HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(30)),
        ..UpstreamConfig::new(&mock.url)
    };
    let (tx, events) = mpsc::channel(256);
    let upstream = UpstreamFeedConnection::new(upstream_config, tx, cancel.child_token());
    let registry = Arc::new(StreamRegistry::new(upstream, ThresholdConfig::default()));
    tokio::spawn(pump_feed_events(events, Arc::clone(&registry), None));

    let state = Arc::new(GatewayState::new(
        Arc::clone(&registry),
        Arc::new(AllowAll),
        settings,
        cancel.clone(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });

    Harness {
        addr,
        mock,
        registry,
        cancel,
    }
}

fn quiet_settings() -> SessionSettings {
    SessionSettings {
        heartbeat_interval: Duration::from_secs(60),
        ..SessionSettings::default()
    }
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws{query}"))
        .await
        .unwrap();
    client
}

async fn recv_json(client: &mut Client) -> Value {
    timeout(WAIT, async {
        loop {
            match client.next().await.expect("socket closed").unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected message: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Connect and consume the welcome frame.
async fn join(addr: SocketAddr) -> Client {
    let mut client = connect(addr, "").await;
    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome["type"], "welcome");
    client
}

fn sorted(mut streams: Vec<String>) -> Vec<String> {
    streams.sort();
    streams
}

#[tokio::test]
async fn test_welcome_frame_reports_subscriber_and_compression() {
    let harness = setup(quiet_settings(), None).await;
    let mut client = connect(harness.addr, "").await;

    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["compression"], "none");
    assert!(welcome["subscriberId"].as_u64().is_some());
}

#[tokio::test]
async fn test_shared_stream_lifecycle_across_two_clients() {
    let mut harness = setup(quiet_settings(), None).await;
    let mut x = join(harness.addr).await;
    let mut y = join(harness.addr).await;

    send_json(&mut x, json!({"method": "SUBSCRIBE", "params": ["BTCUSDT@ticker"], "id": 1})).await;
    assert_eq!(recv_json(&mut x).await, json!({"result": null, "id": 1}));

    let opened = harness.mock.next_request().await;
    assert_eq!(opened.method, "SUBSCRIBE");
    assert_eq!(opened.params, vec!["btcusdt@ticker".to_string()]);

    send_json(
        &mut y,
        json!({"method": "SUBSCRIBE", "params": ["btcusdt@ticker", "ethusdt@ticker"], "id": "y-1"}),
    )
    .await;
    assert_eq!(recv_json(&mut y).await, json!({"result": null, "id": "y-1"}));

    let added = harness.mock.next_request().await;
    assert_eq!(added.method, "SUBSCRIBE");
    assert_eq!(added.params, vec!["ethusdt@ticker".to_string()]);

    harness
        .mock
        .push_tick("btcusdt@ticker", json!({"e": "24hrTicker", "c": "64000.00"}));
    let expected = json!({"stream": "btcusdt@ticker", "data": {"e": "24hrTicker", "c": "64000.00"}});
    assert_eq!(recv_json(&mut x).await, expected);
    assert_eq!(recv_json(&mut y).await, expected);

    send_json(&mut y, json!({"method": "LIST_SUBSCRIPTIONS", "id": 2})).await;
    assert_eq!(
        recv_json(&mut y).await,
        json!({"result": ["btcusdt@ticker", "ethusdt@ticker"], "id": 2})
    );

    // btc is still held by y: nothing goes upstream
    x.close(None).await.unwrap();
    drop(x);
    harness.wait_for_sessions(1).await;

    harness
        .mock
        .push_tick("btcusdt@ticker", json!({"e": "24hrTicker", "c": "65000.00"}));
    assert_eq!(recv_json(&mut y).await["data"]["c"], "65000.00");

    y.close(None).await.unwrap();
    drop(y);

    let released = harness.mock.next_request().await;
    assert_eq!(released.method, "UNSUBSCRIBE");
    assert_eq!(
        sorted(released.params),
        vec!["btcusdt@ticker".to_string(), "ethusdt@ticker".to_string()]
    );
}

#[tokio::test]
async fn test_bad_requests_get_error_frames_and_session_survives() {
    let harness = setup(quiet_settings(), None).await;
    let mut client = join(harness.addr).await;

    client.send(Message::Text("not json".into())).await.unwrap();
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().starts_with("malformed JSON"));

    send_json(&mut client, json!({"method": "SUBSCRIBE", "params": [], "id": 1})).await;
    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "error", "message": "params must list at least one stream"})
    );

    send_json(&mut client, json!({"id": 2})).await;
    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "error", "message": "request has no method"})
    );

    send_json(&mut client, json!({"method": "PING", "id": 7})).await;
    assert_eq!(recv_json(&mut client).await, json!({"result": "pong", "id": 7}));
}

#[tokio::test]
async fn test_stream_limit_is_enforced_per_session() {
    let mut harness = setup(
        SessionSettings {
            max_streams: 2,
            ..quiet_settings()
        },
        None,
    )
    .await;
    let mut client = join(harness.addr).await;

    send_json(
        &mut client,
        json!({"method": "SUBSCRIBE", "params": ["a@trade", "b@trade", "c@trade"], "id": 1}),
    )
    .await;
    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "error", "message": "subscription limit of 2 streams exceeded"})
    );
    harness.mock.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(harness.mock.accepted(), 0);
}

#[tokio::test]
async fn test_gzip_sessions_receive_compressed_binary_frames() {
    let mut harness = setup(quiet_settings(), None).await;
    let mut client = connect(harness.addr, "?compression=gzip").await;

    let welcome = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(bytes) = welcome else {
        panic!("expected a binary frame, got {welcome:?}");
    };
    let mut text = String::new();
    flate2::read::GzDecoder::new(bytes.as_ref())
        .read_to_string(&mut text)
        .unwrap();
    let welcome: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(welcome["compression"], "gzip");

    let codec = MessageCodec::new(Compression::Gzip);
    let request = codec
        .compress(json!({"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1}).to_string().as_bytes())
        .unwrap();
    client.send(Message::Binary(request.into())).await.unwrap();

    let ack = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(bytes) = ack else {
        panic!("expected a binary frame, got {ack:?}");
    };
    let ack: Value = codec.decode_binary(&bytes).unwrap();
    assert_eq!(ack, json!({"result": null, "id": 1}));

    harness.mock.next_request().await;
}

#[tokio::test]
async fn test_unknown_compression_is_rejected_before_upgrade() {
    let harness = setup(quiet_settings(), None).await;

    let result =
        tokio_tungstenite::connect_async(format!("ws://{}/ws?compression=brotli", harness.addr)).await;
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {other:?}"),
    }
}

#[tokio::test]
async fn test_clients_are_pinged_at_the_heartbeat_interval() {
    let harness = setup(
        SessionSettings {
            heartbeat_interval: Duration::from_millis(100),
            ..SessionSettings::default()
        },
        None,
    )
    .await;
    let mut client = connect(harness.addr, "").await;

    let pinged = timeout(WAIT, async {
        while let Some(Ok(message)) = client.next().await {
            if matches!(message, Message::Ping(_)) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(pinged);
}

#[tokio::test]
async fn test_upstream_failure_is_reported_to_clients() {
    let mut harness = setup(quiet_settings(), Some(1)).await;
    let mut client = join(harness.addr).await;

    send_json(&mut client, json!({"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1})).await;
    assert_eq!(recv_json(&mut client).await, json!({"result": null, "id": 1}));
    harness.mock.next_request().await;

    harness.mock.stop().await;

    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "error", "message": "upstream feed unavailable after 1 reconnect attempts"})
    );
}

#[tokio::test]
async fn test_subscribing_to_a_failed_stream_restarts_the_feed() {
    let mut harness = setup(quiet_settings(), Some(1)).await;
    let mut x = join(harness.addr).await;

    send_json(&mut x, json!({"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1})).await;
    assert_eq!(recv_json(&mut x).await, json!({"result": null, "id": 1}));
    harness.mock.next_request().await;

    harness.mock.stop().await;
    let failed = json!({"type": "error", "message": "upstream feed unavailable after 1 reconnect attempts"});
    assert_eq!(recv_json(&mut x).await, failed);

    // btc is already active, yet y's subscribe restarts the feed, which fails again
    let mut y = join(harness.addr).await;
    send_json(&mut y, json!({"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 2})).await;
    assert_eq!(recv_json(&mut y).await, json!({"result": null, "id": 2}));
    assert_eq!(recv_json(&mut y).await, failed);
    assert_eq!(recv_json(&mut x).await, failed);
}
