//! Connection supervisor for the exchange WebSocket
//!
//! Owns the write half of the socket, the cooperative termination token and
//! every background task spawned for the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::SystemStatus;
use crate::error::{FeedError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// One data frame read from the socket
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    /// Binary frame that is not valid UTF-8
    Undecodable(FeedError),
}

/// Read half of an open connection, consumed by the dispatcher
pub struct FrameReader {
    stream: WsSource,
}

impl FrameReader {
    /// Receive the next data frame
    ///
    /// Returns `Ok(None)` for control frames. Pings are answered by the
    /// transport on the next read or write.
    pub async fn recv(&mut self) -> Result<Option<Inbound>> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Ok(Some(Inbound::Text(text)))
            }
            Some(Ok(Message::Binary(data))) => Ok(Some(binary_frame(data))),
            Some(Ok(Message::Ping(_))) => {
                debug!("Received ping");
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                Err(FeedError::ConnectionClosed)
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                Err(e.into())
            }
            None => {
                warn!("WebSocket stream ended");
                Err(FeedError::Connection("Stream ended".to_string()))
            }
        }
    }
}

fn binary_frame(data: Vec<u8>) -> Inbound {
    match String::from_utf8(data) {
        Ok(text) => Inbound::Text(text),
        Err(e) => {
            let raw = String::from_utf8_lossy(e.as_bytes()).into_owned();
            Inbound::Undecodable(FeedError::decode(raw, e.utf8_error()))
        }
    }
}

/// Supervises the single persistent connection to one exchange endpoint
pub struct ConnectionSupervisor {
    url: String,
    sink: Mutex<Option<WsSink>>,
    open: AtomicBool,
    shut_down: AtomicBool,
    cancel: CancellationToken,
    system_status: StdRwLock<Option<SystemStatus>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: Mutex::new(None),
            open: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            system_status: StdRwLock::new(None),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the transport and hand back its read half
    ///
    /// Fails fast with `ConnectionClosed` once the supervisor was shut down.
    pub async fn connect(&self) -> Result<FrameReader> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(FeedError::ConnectionClosed);
        }

        info!(url = %self.url, "Connecting to exchange WebSocket");

        let (ws_stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connection(format!("Failed to connect: {}", e)))?;

        info!(status = ?response.status(), "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        self.open.store(true, Ordering::SeqCst);

        Ok(FrameReader { stream })
    }

    /// Send one text frame
    pub async fn send(&self, text: String) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) || !self.is_open() {
            return Err(FeedError::ConnectionClosed);
        }

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(FeedError::ConnectionClosed)?;

        debug!(len = text.len(), "Sending control frame");
        if let Err(e) = sink.send(Message::Text(text)).await {
            self.open.store(false, Ordering::SeqCst);
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop the current transport, leaving the supervisor reusable
    pub async fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Raise the cooperative termination flag
    pub fn terminate(&self) {
        if !self.cancel.is_cancelled() {
            info!("Termination requested");
            self.cancel.cancel();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by every loop bound to this connection
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Terminate, abort owned tasks and close the transport. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.terminate();

        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in &tasks {
            task.abort();
        }

        self.disconnect().await;
        info!(aborted = tasks.len(), "Connection shut down");
    }

    /// Take ownership of a background task so shutdown can abort it
    pub fn own(&self, task: JoinHandle<()>) {
        if self.shut_down.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        let mut tasks = self.lock_tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Last `systemStatus` announced by the exchange
    pub fn system_status(&self) -> Option<SystemStatus> {
        self.system_status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_status(&self, status: SystemStatus) {
        *self
            .system_status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(status);
    }

    /// Drain connection status frames until termination
    pub async fn watch_status(&self, mut rx: mpsc::UnboundedReceiver<SystemStatus>) {
        loop {
            let status = tokio::select! {
                _ = self.cancel.cancelled() => break,
                status = rx.recv() => match status {
                    Some(status) => status,
                    None => break,
                },
            };

            if status.is_online() {
                info!(
                    status = %status.status,
                    version = ?status.version,
                    connection_id = ?status.connection_id,
                    "Exchange system status"
                );
            } else {
                warn!(status = %status.status, "Exchange is not online");
            }
            self.record_status(status);
        }
        debug!("Connection status watcher stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
