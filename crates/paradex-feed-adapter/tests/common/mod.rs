/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Local JSON-RPC WebSocket server, fixtures and timing helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for paradex-feed-adapter tests

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use paradex_feed_adapter::{ConnectionConfig, HeartbeatConfig, ReceiverConfig, ReconnectConfig};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

pub const SYMBOL: &str = "BTC-USD-PERP";
pub const BOOK_CHANNEL: &str = "order_book.BTC-USD-PERP.deltas";
pub const TRADES_CHANNEL: &str = "trades.BTC-USD-PERP";

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `future`, failing the test if it takes longer than a few seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, future)
        .await
        .expect("step timed out")
}

/// Local exchange stand-in. Every accepted socket is handed to the test.
pub struct MockExchange {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MockExchange {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConnection { ws }).is_err() {
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{addr}/v1"),
            connections: rx,
        }
    }

    pub async fn next_connection(&mut self) -> ServerConnection {
        within(self.connections.recv())
            .await
            .expect("mock exchange listener stopped")
    }
}

pub struct ServerConnection {
    ws: WebSocketStream<TcpStream>,
}

#[allow(dead_code)]
impl ServerConnection {
    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    /// Next JSON text frame from the client. Control frames are skipped.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let message = within(self.ws.next())
                .await
                .expect("client closed connection")
                .expect("websocket read error");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Close(_) => panic!("client sent close"),
                _ => continue,
            }
        }
    }

    /// Skip frames until one with the given JSON-RPC method arrives.
    pub async fn expect_method(&mut self, method: &str) -> Value {
        loop {
            let frame = self.recv_json().await;
            if frame["method"] == method {
                return frame;
            }
        }
    }

    /// Read one subscribe request, confirm it, and return its channel.
    pub async fn confirm_subscription(&mut self) -> String {
        let request = self.expect_method("subscribe").await;
        let channel = request["params"]["channel"].as_str().unwrap().to_string();
        self.send_json(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": { "channel": channel }
        }))
        .await;
        channel
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Receiver config with timings shrunk for tests.
#[allow(dead_code)]
pub fn test_config(url: &str) -> ReceiverConfig {
    ReceiverConfig {
        connection: ConnectionConfig {
            url: url.to_string(),
            heartbeat: HeartbeatConfig {
                ping_interval: Duration::from_secs(60),
                ping_timeout: Duration::from_secs(5),
                app_ping_interval: Duration::from_secs(60),
                heartbeat_timeout: Duration::from_secs(30),
                watchdog_period: Duration::from_millis(50),
            },
            reconnect: ReconnectConfig {
                interval: Duration::from_millis(50),
                ..ReconnectConfig::default()
            },
            subscribe_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        },
        depth: 1,
        ..ReceiverConfig::default()
    }
}

#[allow(dead_code)]
pub fn book_frame(seq: u64, update_type: &str, data: Value) -> Value {
    let mut payload = json!({
        "market": SYMBOL,
        "seq_no": seq,
        "last_updated_at": 1765418142000i64 + seq as i64,
        "update_type": update_type,
        "inserts": [],
        "updates": [],
        "deletes": []
    });
    if let (Some(target), Some(extra)) = (payload.as_object_mut(), data.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    json!({
        "jsonrpc": "2.0",
        "method": "subscription",
        "params": { "channel": BOOK_CHANNEL, "data": payload }
    })
}

#[allow(dead_code)]
pub fn trade_frame(id: &str, side: &str, size: &str, price: &str, created_at: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "subscription",
        "params": {
            "channel": TRADES_CHANNEL,
            "data": {
                "id": id,
                "market": SYMBOL,
                "side": side,
                "size": size,
                "price": price,
                "created_at": created_at,
                "trade_type": "FILL"
            }
        }
    })
}
