//! ORPflow HFT - Exchange Streaming Feed Library
//!
//! This crate multiplexes one exchange WebSocket connection into typed,
//! per-feed consumer streams and reconstructs full order books from
//! snapshot and delta messages bounded by the live spread.

use std::sync::{Arc, Mutex};

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod feed;
pub mod messages;
pub mod orderbook;
pub mod queues;
pub mod scheduler;
pub mod telemetry;
pub mod websocket;

pub use auth::{fetch_ws_token, AuthToken, RequestSigner};
pub use client::FeedClient;
pub use codec::{CodecTable, Exchange};
pub use config::Config;
pub use consumer::{BookStream, FeedStream};
pub use error::{FeedError, Result};
pub use feed::{Feed, SlashPairs, SubscriptionKey, Symbol, SymbolMap, WireSymbol};
pub use messages::{BookUpdate, Candle, Spread, Trade, UserOrder, UserTrade};
pub use orderbook::{BookReconstructor, FullBook, FullBookView, OrderBookMetrics};
pub use scheduler::TaskScheduler;
pub use telemetry::FeedTelemetry;
pub use websocket::{ConnectionSupervisor, DispatchState, SubscriptionManager};

use crate::queues::{FeedQueues, StatusQueues};

/// Everything owned by one exchange connection, shared across its tasks
pub struct FeedState {
    pub config: Config,
    pub codec: &'static CodecTable,
    pub symbols: Arc<dyn SymbolMap>,
    pub supervisor: ConnectionSupervisor,
    pub queues: FeedQueues,
    pub status: StatusQueues,
    pub subscriptions: SubscriptionManager,
    pub telemetry: FeedTelemetry,
    pub scheduler: TaskScheduler,
    dispatch: Mutex<DispatchState>,
}

impl FeedState {
    /// Build the per-connection state without opening the transport
    pub fn new(config: Config, symbols: Arc<dyn SymbolMap>) -> Result<Self> {
        let codec = config.exchange.codec();
        Ok(Self {
            codec,
            supervisor: ConnectionSupervisor::new(config.ws_endpoint.clone()),
            queues: FeedQueues::new(),
            status: StatusQueues::new(config.heartbeat_queue_capacity),
            subscriptions: SubscriptionManager::new(
                codec,
                symbols.clone(),
                config.confirmation_poll(),
            ),
            telemetry: FeedTelemetry::new()?,
            scheduler: TaskScheduler::new(config.scheduler_idle()),
            symbols,
            config,
            dispatch: Mutex::new(DispatchState::Idle),
        })
    }

    pub(crate) fn lock_dispatch(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
