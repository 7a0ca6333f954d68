//! Mock exchange endpoint shared by the integration tests.
//!
//! Accepts any number of WebSocket connections, records every request it
//! receives tagged with the connection index, answers requests with
//! `{"result": null, "id": ..}`, and can push frames to or drop every live
//! connection.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

/// A request seen by the mock, tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub connection: usize,
    pub method: String,
    pub params: Vec<String>,
}

pub struct MockUpstream {
    pub url: String,
    requests: mpsc::UnboundedReceiver<SeenRequest>,
    push: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
    accepted: Arc<AtomicUsize>,
    acceptor: Option<JoinHandle<()>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel::<String>(64);
        let (kill, _) = broadcast::channel::<()>(4);
        let accepted = Arc::new(AtomicUsize::new(0));

        let acceptor = {
            let push = push.clone();
            let kill = kill.clone();
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    let connection = accepted.fetch_add(1, Ordering::SeqCst);
                    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                        continue;
                    };
                    tokio::spawn(serve_connection(
                        ws,
                        connection,
                        requests_tx.clone(),
                        push.subscribe(),
                        kill.subscribe(),
                    ));
                }
            })
        };

        Self {
            url: format!("ws://{addr}/stream"),
            requests,
            push,
            kill,
            accepted,
            acceptor: Some(acceptor),
        }
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next request received on any connection.
    pub async fn next_request(&mut self) -> SeenRequest {
        timeout(WAIT, self.requests.recv())
            .await
            .expect("timed out waiting for upstream request")
            .expect("mock upstream stopped")
    }

    /// Assert no request arrives within `within`.
    pub async fn expect_silence(&mut self, within: Duration) {
        if let Ok(Some(request)) = timeout(within, self.requests.recv()).await {
            panic!("unexpected upstream request: {request:?}");
        }
    }

    /// Send a combined-stream data frame to every live connection.
    pub fn push_tick(&self, stream: &str, data: Value) {
        let frame = json!({"stream": stream, "data": data}).to_string();
        let _ = self.push.send(frame);
    }

    /// Drop every live connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stop accepting and drop every live connection.
    pub async fn stop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
            let _ = acceptor.await;
        }
        self.drop_connections();
    }
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    connection: usize,
    requests: mpsc::UnboundedSender<SeenRequest>,
    mut push: broadcast::Receiver<String>,
    mut kill: broadcast::Receiver<()>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            _ = kill.recv() => return,
            Ok(frame) = push.recv() => {
                if write.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    let _ = requests.send(SeenRequest {
                        connection,
                        method: request["method"].as_str().unwrap_or_default().to_string(),
                        params: request["params"]
                            .as_array()
                            .map(|p| p.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                            .unwrap_or_default(),
                    });
                    let reply = json!({"result": null, "id": request["id"]}).to_string();
                    if write.send(Message::Text(reply.into())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            }
        }
    }
}
