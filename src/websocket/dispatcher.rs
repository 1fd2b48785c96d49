//! Dispatcher: the single reader of the exchange connection
//!
//! Classifies every frame through the codec table, forwards status frames to
//! their watchers and parsed feed items to the feed queues, and reconnects
//! with capped exponential backoff when the transport fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::{FrameReader, Inbound};
use crate::codec::{ControlRequest, FeedFrame, Frame, StatusFrame};
use crate::error::{FeedError, Result};
use crate::feed::Feed;
use crate::messages::FeedMessage;
use crate::queues::{FeedQueue, Heartbeat};
use crate::FeedState;

/// Maximum backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Lifecycle of the read loop for one connection
pub enum DispatchState {
    /// No transport opened yet
    Idle,
    /// Connected, read half waiting for the loop to start
    Ready(FrameReader),
    Running,
    Finished,
}

impl DispatchState {
    pub fn is_running(&self) -> bool {
        matches!(self, DispatchState::Running)
    }
}

/// Start the read loop unless it is already running
///
/// Returns `Ok(true)` when this call started it and `Ok(false)` when a loop
/// was already active.
pub fn ensure_started(state: &Arc<FeedState>) -> Result<bool> {
    let reader = {
        let mut slot = state.lock_dispatch();
        match std::mem::replace(&mut *slot, DispatchState::Running) {
            DispatchState::Ready(reader) => reader,
            DispatchState::Running => return Ok(false),
            previous @ (DispatchState::Idle | DispatchState::Finished) => {
                *slot = previous;
                return Err(FeedError::ConnectionClosed);
            }
        }
    };

    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        let mut dispatcher = Dispatcher::new(task_state.clone());
        match dispatcher.run(reader).await {
            Ok(()) => task_state.queues.close_all(),
            Err(e) => {
                error!(error = %e, "Dispatcher stopped");
                task_state.supervisor.disconnect().await;
                task_state.queues.fail_all(e);
            }
        }
        *task_state.lock_dispatch() = DispatchState::Finished;
    });
    state.supervisor.own(handle);

    info!("Dispatcher started");
    Ok(true)
}

/// Reads frames and routes them, reconnecting on transport failure
pub struct Dispatcher {
    state: Arc<FeedState>,
    reconnect_attempts: u32,
}

impl Dispatcher {
    pub fn new(state: Arc<FeedState>) -> Self {
        Self {
            state,
            reconnect_attempts: 0,
        }
    }

    /// Run until termination or until the reconnect budget is spent
    pub async fn run(&mut self, reader: FrameReader) -> Result<()> {
        let mut reader = reader;

        loop {
            match self.read_loop(&mut reader).await {
                Ok(()) => {
                    info!("Dispatcher stopping on termination");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Read loop failed");
                    self.state.supervisor.disconnect().await;
                }
            }

            reader = match self.reconnect().await? {
                Some(reader) => reader,
                None => return Ok(()),
            };
        }
    }

    async fn read_loop(&mut self, reader: &mut FrameReader) -> Result<()> {
        let cancel = self.state.supervisor.cancellation();
        let recv_timeout = self.state.config.recv_timeout();
        let mut last_message = Instant::now();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = timeout(recv_timeout, reader.recv()) => next,
            };

            match next {
                Ok(Ok(Some(Inbound::Text(text)))) => {
                    last_message = Instant::now();
                    route_frame(&self.state, &text);
                }
                Ok(Ok(Some(Inbound::Undecodable(e)))) => {
                    last_message = Instant::now();
                    drop_unclassified(&self.state, &e);
                }
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = self.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(FeedError::ConnectionTimeout);
                    }
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<Option<FrameReader>> {
        let cancel = self.state.supervisor.cancellation();
        let max_attempts = self.state.config.max_reconnect_attempts;

        loop {
            if self.reconnect_attempts >= max_attempts {
                error!(attempts = self.reconnect_attempts, "Reconnect budget exhausted");
                return Err(FeedError::MaxReconnectAttemptsExceeded(max_attempts));
            }
            self.reconnect_attempts += 1;

            let delay = backoff(self.state.config.reconnect_delay(), self.reconnect_attempts);
            warn!(
                attempt = self.reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after error..."
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = sleep(delay) => {}
            }

            match self.state.supervisor.connect().await {
                Ok(reader) => {
                    info!(
                        previous_attempts = self.reconnect_attempts,
                        "Reconnected, resetting reconnect counter"
                    );
                    self.reconnect_attempts = 0;
                    self.state.telemetry.reconnects.inc();
                    self.state
                        .subscriptions
                        .restore(&self.state.supervisor)
                        .await;
                    return Ok(Some(reader));
                }
                Err(_) if self.state.supervisor.is_terminated() => return Ok(None),
                Err(e) => error!(error = %e, "Reconnect attempt failed"),
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let reqid = self.state.subscriptions.next_reqid();
        let frame = (self.state.codec.encode)(&ControlRequest::Ping { reqid })?;
        self.state.supervisor.send(frame).await
    }
}

/// Capped exponential backoff for the given attempt number
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.pow(attempt.min(6))).min(MAX_BACKOFF)
}

/// Route one raw frame; never fails the read loop
pub fn route_frame(state: &FeedState, raw: &str) {
    match (state.codec.decode)(raw) {
        Ok(Frame::Status(status)) => {
            state.telemetry.frames.with_label_values(&["status"]).inc();
            route_status(state, status);
        }
        Ok(Frame::Feed(frame)) => {
            state.telemetry.frames.with_label_values(&["feed"]).inc();
            route_feed(state, &frame);
        }
        Err(e) => drop_unclassified(state, &e),
    }
}

fn drop_unclassified(state: &FeedState, err: &FeedError) {
    state.telemetry.frames.with_label_values(&["unclassified"]).inc();
    state.telemetry.decode_errors.inc();
    warn!(error = %err, "Dropping unclassifiable frame");
}

fn route_status(state: &FeedState, status: StatusFrame) {
    match status {
        StatusFrame::System(system) => state.status.connection.push(system),
        StatusFrame::Subscription(ack) => state.status.subscription.push(ack),
        StatusFrame::Heartbeat => {
            trace!("Heartbeat");
            state.status.heartbeat.push(Heartbeat::Heartbeat {
                at: std::time::Instant::now(),
            });
        }
        StatusFrame::Pong { reqid } => {
            debug!(reqid = ?reqid, "Pong");
            state.status.heartbeat.push(Heartbeat::Pong {
                at: std::time::Instant::now(),
                reqid,
            });
        }
    }
}

fn route_feed(state: &FeedState, frame: &FeedFrame) {
    let codec = state.codec;
    let symbols = state.symbols.as_ref();
    let queues = &state.queues;

    match frame.feed {
        Feed::Trade => publish(state, &queues.trades, frame, (codec.trades)(frame, symbols)),
        Feed::Spread => {
            let parsed = (codec.spreads)(frame, symbols);
            publish(state, &queues.spread_observer, frame, parsed.clone());
            publish(state, &queues.spreads, frame, parsed);
        }
        Feed::OrderBook => publish(state, &queues.books, frame, (codec.book)(frame, symbols)),
        Feed::Candle => publish(state, &queues.candles, frame, (codec.candles)(frame, symbols)),
        Feed::UserTrade => publish(
            state,
            &queues.user_trades,
            frame,
            (codec.user_trades)(frame, symbols),
        ),
        Feed::UserOrder => publish(
            state,
            &queues.user_orders,
            frame,
            (codec.user_orders)(frame, symbols),
        ),
    }
}

fn publish<T: FeedMessage>(
    state: &FeedState,
    queue: &FeedQueue<T>,
    frame: &FeedFrame,
    parsed: Result<Vec<T>>,
) {
    match parsed {
        Ok(items) => {
            for item in items {
                let symbol = item.symbol().cloned();
                queue.publish_with(symbol.as_ref(), &frame.params, Ok(item));
            }
        }
        Err(e) => {
            state
                .telemetry
                .parse_errors
                .with_label_values(&[frame.feed.as_str()])
                .inc();
            warn!(feed = %frame.feed, error = %e, "Failed to parse feed frame");
            let symbol = frame.pair.as_ref().map(|p| state.symbols.from_exchange(p));
            queue.publish_with(symbol.as_ref(), &frame.params, Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::feed::{SlashPairs, Symbol};
    use rust_decimal_macros::dec;

    fn state() -> FeedState {
        FeedState::new(Config::default(), Arc::new(SlashPairs)).unwrap()
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff(base, 1), Duration::from_secs(2));
        assert_eq!(backoff(base, 3), Duration::from_secs(8));
        assert_eq!(backoff(base, 6), Duration::from_secs(60));
        assert_eq!(backoff(base, 9), Duration::from_secs(60));
    }

    #[test]
    fn test_trades_keep_wire_order() {
        let state = state();
        let mut rx = state.queues.trades.attach(Some(Symbol::new("XBT-USD")));

        for i in 1..=20 {
            let raw = format!(
                r#"[0,[["{}.0","0.1","1534614057.321597","s","l",""]],"trade","XBT/USD"]"#,
                i
            );
            route_frame(&state, &raw);
        }

        for i in 1..=20 {
            let trade = rx.try_recv().unwrap().unwrap();
            assert_eq!(trade.price, rust_decimal::Decimal::from(i));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spreads_are_duplicated_for_books() {
        let state = state();
        let mut spreads = state.queues.spreads.attach(None);
        let mut observer = state.queues.spread_observer.attach(None);

        route_frame(
            &state,
            r#"[0,["5698.40000","5700.00000","1542057299.545897","1.01234567","0.98765432"],"spread","XBT/USD"]"#,
        );

        assert_eq!(spreads.try_recv().unwrap().unwrap().bid, dec!(5698.40000));
        assert_eq!(observer.try_recv().unwrap().unwrap().ask, dec!(5700.00000));
    }

    #[test]
    fn test_unparseable_frame_reaches_no_queue() {
        let state = state();
        let mut trades = state.queues.trades.attach(None);
        let mut books = state.queues.books.attach(None);

        route_frame(&state, "not-json");

        assert!(trades.try_recv().is_err());
        assert!(books.try_recv().is_err());
        assert_eq!(state.telemetry.decode_errors.get(), 1);
    }

    #[test]
    fn test_bad_feed_payload_is_delivered_as_error() {
        let state = state();
        let mut rx = state.queues.trades.attach(Some(Symbol::new("XBT-USD")));

        route_frame(&state, r#"[0,[["oops","0.1","1534614057.321597","s","l",""]],"trade","XBT/USD"]"#);

        assert!(matches!(rx.try_recv().unwrap(), Err(FeedError::Decode { .. })));
    }

    #[test]
    fn test_status_frames_reach_status_queues() {
        let state = state();
        let mut acks = state.status.subscription.take_receiver().unwrap();

        route_frame(&state, r#"{"event":"heartbeat"}"#);
        route_frame(&state, r#"{"event":"pong","reqid":7}"#);
        route_frame(
            &state,
            r#"{"channelName":"trade","event":"subscriptionStatus","pair":"XBT/USD","status":"subscribed","subscription":{"name":"trade"}}"#,
        );

        assert_eq!(state.status.heartbeat.len(), 2);
        assert!(matches!(
            state.status.heartbeat.latest(),
            Some(Heartbeat::Pong { reqid: Some(7), .. })
        ));
        assert_eq!(acks.try_recv().unwrap().feed, Some(Feed::Trade));
    }
}
