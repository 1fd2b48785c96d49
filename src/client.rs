//! Feed client: the per-connection entry point
//!
//! Owns one connection supervisor together with its dispatcher, queues,
//! subscription state, scheduler and telemetry. Every consumer created from
//! a client shares that connection.

use std::sync::Arc;

use tracing::info;

use crate::auth::AuthToken;
use crate::codec::{ControlRequest, SystemStatus};
use crate::config::Config;
use crate::consumer::{BookStream, FeedStream};
use crate::error::Result;
use crate::feed::{Feed, SubscriptionKey, Symbol, SymbolMap};
use crate::messages::{Candle, Spread, Trade, UserOrder, UserTrade};
use crate::queues::Heartbeat;
use crate::scheduler::TaskScheduler;
use crate::telemetry::FeedTelemetry;
use crate::websocket::{ensure_started, Ack, DispatchState};
use crate::FeedState;

#[derive(Clone)]
pub struct FeedClient {
    state: Arc<FeedState>,
}

impl FeedClient {
    /// Open the connection and start the status watchers
    ///
    /// The dispatcher itself starts lazily with the first consumer.
    pub async fn connect(config: Config, symbols: Arc<dyn SymbolMap>) -> Result<Self> {
        let state = Arc::new(FeedState::new(config, symbols)?);

        info!(
            exchange = state.codec.name,
            url = %state.supervisor.url(),
            "Opening feed connection"
        );
        let reader = state.supervisor.connect().await?;
        *state.lock_dispatch() = DispatchState::Ready(reader);

        let cancel = state.supervisor.cancellation();

        if let Some(rx) = state.status.connection.take_receiver() {
            let watcher = state.clone();
            state.supervisor.own(tokio::spawn(async move {
                watcher.supervisor.watch_status(rx).await;
            }));
        }

        if let Some(rx) = state.status.subscription.take_receiver() {
            let watcher = state.clone();
            let gauge = state.telemetry.confirmed_subscriptions.clone();
            let watch_cancel = cancel.clone();
            state.supervisor.own(tokio::spawn(async move {
                watcher.subscriptions.watch(rx, watch_cancel, gauge).await;
            }));
        }

        let scheduler = state.clone();
        state.supervisor.own(tokio::spawn(async move {
            scheduler.scheduler.run(cancel).await;
        }));

        Ok(Self { state })
    }

    /// Connect to the authenticated endpoint that carries the private feeds
    pub async fn connect_private(config: Config, symbols: Arc<dyn SymbolMap>) -> Result<Self> {
        let endpoint = config.ws_auth_endpoint.clone();
        Self::connect(config.with_endpoint(endpoint), symbols).await
    }

    pub fn state(&self) -> &Arc<FeedState> {
        &self.state
    }

    /// Start the read loop if it is not running yet
    pub fn ensure_dispatcher(&self) -> Result<bool> {
        ensure_started(&self.state)
    }

    pub async fn subscribe(&self, key: &SubscriptionKey, token: Option<&AuthToken>) -> Result<Ack> {
        self.state
            .subscriptions
            .subscribe(
                &self.state.supervisor,
                key,
                token.map(|t| t.as_str().to_string()),
            )
            .await
    }

    /// Unsubscribe; consumers bound to the key end at their next iteration
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<Ack> {
        self.state
            .subscriptions
            .unsubscribe(&self.state.supervisor, key)
            .await
    }

    /// Send a client ping; the pong lands on the heartbeat queue
    pub async fn ping(&self) -> Result<u64> {
        let reqid = self.state.subscriptions.next_reqid();
        let frame = (self.state.codec.encode)(&ControlRequest::Ping { reqid })?;
        self.state.supervisor.send(frame).await?;
        Ok(reqid)
    }

    pub fn last_heartbeat(&self) -> Option<Heartbeat> {
        self.state.status.heartbeat.latest()
    }

    pub fn system_status(&self) -> Option<SystemStatus> {
        self.state.supervisor.system_status()
    }

    pub async fn is_confirmed(&self, key: &SubscriptionKey) -> bool {
        self.state.subscriptions.is_confirmed(key).await
    }

    pub fn is_open(&self) -> bool {
        self.state.supervisor.is_open()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.state.scheduler
    }

    pub fn telemetry(&self) -> &FeedTelemetry {
        &self.state.telemetry
    }

    /// End every consumer at its next iteration
    pub fn terminate(&self) {
        self.state.supervisor.terminate();
    }

    /// Terminate and release the connection and all background tasks
    ///
    /// The dispatcher is aborted before it can record its own end, so the
    /// state is marked finished here.
    pub async fn shutdown(&self) {
        self.state.scheduler.shutdown();
        self.state.supervisor.shutdown().await;
        *self.state.lock_dispatch() = DispatchState::Finished;
        self.state.queues.close_all();
    }

    pub fn trades(&self, symbol: Symbol) -> FeedStream<Trade> {
        FeedStream::new(
            self.state.clone(),
            SubscriptionKey::new(Feed::Trade, symbol),
            None,
        )
    }

    pub fn spreads(&self, symbol: Symbol) -> FeedStream<Spread> {
        FeedStream::new(
            self.state.clone(),
            SubscriptionKey::new(Feed::Spread, symbol),
            None,
        )
    }

    /// Candles with the given interval in minutes
    pub fn candles(&self, symbol: Symbol, interval: u32) -> FeedStream<Candle> {
        FeedStream::new(
            self.state.clone(),
            SubscriptionKey::new(Feed::Candle, symbol).with_interval(interval),
            None,
        )
    }

    /// Reconstructed book; also subscribes to the symbol's spread feed
    pub fn order_book(&self, symbol: Symbol, depth: u32) -> BookStream {
        BookStream::new(self.state.clone(), symbol, depth)
    }

    pub fn own_trades(&self, token: &AuthToken) -> FeedStream<UserTrade> {
        FeedStream::new(
            self.state.clone(),
            SubscriptionKey::private(Feed::UserTrade),
            Some(token.as_str().to_string()),
        )
    }

    pub fn open_orders(&self, token: &AuthToken) -> FeedStream<UserOrder> {
        FeedStream::new(
            self.state.clone(),
            SubscriptionKey::private(Feed::UserOrder),
            Some(token.as_str().to_string()),
        )
    }
}
