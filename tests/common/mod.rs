//! In-process mock exchange speaking the Kraken v1 WebSocket protocol

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

use orp_flow_stream::{Config, FeedClient, SlashPairs};

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<Value>>,
    current: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reject_pairs: Mutex<Vec<String>>,
    reject_channels: Mutex<Vec<String>>,
    connections: AtomicUsize,
    auto_ack: AtomicBool,
    refuse: AtomicBool,
}

/// Mock exchange endpoint
#[derive(Clone)]
pub struct MockExchange {
    pub url: String,
    state: Arc<MockState>,
}

impl MockExchange {
    /// Start a server that acknowledges every subscription
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Start a server that never acknowledges anything on its own
    pub async fn silent() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(auto_ack: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        state.auto_ack.store(auto_ack, Ordering::SeqCst);

        let server = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if server.refuse.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                tokio::spawn(handle_connection(stream, server.clone()));
            }
        });

        Self {
            url: format!("ws://{}", addr),
            state,
        }
    }

    /// Test configuration pointed at this server, with short timeouts
    pub fn config(&self) -> Config {
        let mut config = Config::default().with_endpoint(self.url.clone());
        config.reconnect_delay_ms = 5;
        config.max_reconnect_attempts = 3;
        config.subscription_timeout_ms = 2_000;
        config.confirmation_poll_ms = 5;
        config.spread_pairing_timeout_ms = 500;
        config.scheduler_idle_ms = 5;
        config
    }

    pub async fn client(&self) -> FeedClient {
        FeedClient::connect(self.config(), Arc::new(SlashPairs))
            .await
            .unwrap()
    }

    /// Push a raw frame to the current connection
    pub async fn send(&self, frame: impl Into<String>) {
        if let Some(tx) = self.state.current.lock().await.as_ref() {
            let _ = tx.send(Message::Text(frame.into()));
        }
    }

    /// Close the current connection from the server side
    pub async fn drop_connection(&self) {
        if let Some(tx) = self.state.current.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Close the socket of every future connection before the handshake
    pub fn refuse_connections(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }

    /// Push a binary frame to the current connection
    pub async fn send_binary(&self, data: Vec<u8>) {
        if let Some(tx) = self.state.current.lock().await.as_ref() {
            let _ = tx.send(Message::Binary(data));
        }
    }

    pub async fn reject_pair(&self, pair: &str) {
        self.state.reject_pairs.lock().await.push(pair.to_string());
    }

    /// Reject every subscribe for a channel name such as `book`
    pub async fn reject_channel(&self, name: &str) {
        self.state.reject_channels.lock().await.push(name.to_string());
    }

    /// Unsubscribe frames received for a channel name
    pub async fn unsubscribes(&self, name: &str) -> usize {
        self.received()
            .await
            .iter()
            .filter(|f| f["event"] == "unsubscribe" && f["subscription"]["name"] == name)
            .count()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Control frames received so far
    pub async fn received(&self) -> Vec<Value> {
        self.state.received.lock().await.clone()
    }

    /// Subscribe frames received for a channel name
    pub async fn subscribes(&self, name: &str) -> usize {
        self.received()
            .await
            .iter()
            .filter(|f| f["event"] == "subscribe" && f["subscription"]["name"] == name)
            .count()
    }

    pub async fn ack(&self, name: &str, pair: &str) {
        let subscription = json!({"name": name});
        self.send(ack_frame("subscribed", &subscription, Some(pair), None).to_string())
            .await;
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<MockState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.current.lock().await = Some(tx.clone());

    let _ = tx.send(Message::Text(
        json!({"connectionID": 1, "event": "systemStatus", "status": "online", "version": "1.9.0"})
            .to_string(),
    ));

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = source.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.received.lock().await.push(frame.clone());

        let reqid = frame["reqid"].as_u64();
        match frame["event"].as_str() {
            Some("ping") => {
                let _ = tx.send(Message::Text(json!({"event": "pong", "reqid": reqid}).to_string()));
            }
            Some(event @ ("subscribe" | "unsubscribe")) => {
                let subscription = &frame["subscription"];
                let name = subscription["name"].as_str().unwrap_or_default().to_string();
                let pairs: Vec<String> = frame["pair"]
                    .as_array()
                    .map(|pairs| {
                        pairs
                            .iter()
                            .filter_map(|p| p.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let rejected = state.reject_pairs.lock().await.clone();
                let channel_rejected = state.reject_channels.lock().await.contains(&name);

                if event == "unsubscribe" {
                    for pair in &pairs {
                        let reply = ack_frame("unsubscribed", subscription, Some(pair), reqid);
                        let _ = tx.send(Message::Text(reply.to_string()));
                    }
                    continue;
                }

                for pair in &pairs {
                    if channel_rejected || rejected.contains(pair) {
                        let mut reply = ack_frame("error", subscription, Some(pair), reqid);
                        reply["errorMessage"] = json!("Currency pair not supported");
                        let _ = tx.send(Message::Text(reply.to_string()));
                    } else if state.auto_ack.load(Ordering::SeqCst) {
                        let reply = ack_frame("subscribed", subscription, Some(pair), reqid);
                        let _ = tx.send(Message::Text(reply.to_string()));
                    }
                }
                if pairs.is_empty() && state.auto_ack.load(Ordering::SeqCst) {
                    let reply = ack_frame("subscribed", subscription, None, reqid);
                    let _ = tx.send(Message::Text(reply.to_string()));
                }
            }
            _ => {}
        }
    }
}

/// Acknowledgement echoing the request's subscription, with the
/// `book-<depth>` / `ohlc-<interval>` channel name the exchange uses
fn ack_frame(status: &str, subscription: &Value, pair: Option<&str>, reqid: Option<u64>) -> Value {
    let name = subscription["name"].as_str().unwrap_or_default();
    let channel_name = match subscription["depth"]
        .as_u64()
        .or_else(|| subscription["interval"].as_u64())
    {
        Some(suffix) => format!("{}-{}", name, suffix),
        None => name.to_string(),
    };
    let mut frame = json!({
        "channelName": channel_name,
        "event": "subscriptionStatus",
        "status": status,
        "subscription": subscription,
    });
    if let Some(pair) = pair {
        frame["pair"] = json!(pair);
    }
    if let Some(reqid) = reqid {
        frame["reqid"] = json!(reqid);
    }
    frame
}

/// Poll `check` until it holds or the deadline passes
pub async fn wait_until<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

pub fn trade_frame(price: &str) -> String {
    format!(
        r#"[0,[["{}","0.10000000","1700000000.000000","b","l",""]],"trade","XBT/USD"]"#,
        price
    )
}
