//! Feed and status queues
//!
//! Every feed has one [`FeedQueue`]. Consumers attach to it and each gets
//! its own unbounded FIFO, so wire order is kept per consumer while
//! independent consumers of the same feed never steal each other's items.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::codec::{SubscriptionStatus, SystemStatus};
use crate::error::{FeedError, Result};
use crate::feed::{FeedParams, SubscriptionKey, Symbol};
use crate::messages::{BookUpdate, Candle, FeedMessage, Spread, Trade, UserOrder, UserTrade};

/// Receiving end handed to one consumer
pub type FeedReceiver<T> = mpsc::UnboundedReceiver<Result<T>>;

struct Attachment<T> {
    filter: Option<Symbol>,
    params: FeedParams,
    tx: mpsc::UnboundedSender<Result<T>>,
}

impl<T> Attachment<T> {
    fn accepts(&self, symbol: Option<&Symbol>, params: &FeedParams) -> bool {
        let symbol_matches = match (&self.filter, symbol) {
            (Some(filter), Some(symbol)) => filter == symbol,
            _ => true,
        };
        symbol_matches && self.params.admits(params)
    }
}

/// FIFO fan-out for one feed
pub struct FeedQueue<T> {
    attachments: Mutex<Vec<Attachment<T>>>,
}

impl<T> Default for FeedQueue<T> {
    fn default() -> Self {
        Self {
            attachments: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> FeedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer, optionally restricted to one symbol
    pub fn attach(&self, filter: Option<Symbol>) -> FeedReceiver<T> {
        self.attach_filtered(filter, FeedParams::default())
    }

    /// Attach a consumer to exactly the stream a subscription key names
    pub fn attach_key(&self, key: &SubscriptionKey) -> FeedReceiver<T> {
        self.attach_filtered(key.symbol.clone(), key.params)
    }

    fn attach_filtered(&self, filter: Option<Symbol>, params: FeedParams) -> FeedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Attachment { filter, params, tx });
        rx
    }

    /// Deliver an item to every matching consumer
    ///
    /// Items without a symbol (failures that could not be attributed) reach
    /// every consumer. Returns the number of receivers the item reached.
    pub fn publish(&self, symbol: Option<&Symbol>, item: Result<T>) -> usize {
        self.publish_with(symbol, &FeedParams::default(), item)
    }

    /// Like [`FeedQueue::publish`], also matching the depth or interval the item was published with
    pub fn publish_with(&self, symbol: Option<&Symbol>, params: &FeedParams, item: Result<T>) -> usize {
        let mut attachments = self.lock();
        attachments.retain(|a| !a.tx.is_closed());

        let mut delivered = 0;
        for attachment in attachments
            .iter()
            .filter(|a| a.accepts(symbol, params))
        {
            if attachment.tx.send(item.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a terminal error to everyone, then close
    pub fn fail(&self, err: FeedError) {
        self.publish(None, Err(err));
        self.close();
    }

    /// Drop all senders; attached receivers drain and then end
    pub fn close(&self) {
        self.lock().clear();
    }

    pub fn attached(&self) -> usize {
        let mut attachments = self.lock();
        attachments.retain(|a| !a.tx.is_closed());
        attachments.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Attachment<T>>> {
        // A panic while holding the lock cannot leave the Vec half-updated
        self.attachments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One queue per feed, plus the spread duplicate read by book consumers
#[derive(Default)]
pub struct FeedQueues {
    pub trades: FeedQueue<Trade>,
    pub spreads: FeedQueue<Spread>,
    pub spread_observer: FeedQueue<Spread>,
    pub books: FeedQueue<BookUpdate>,
    pub candles: FeedQueue<Candle>,
    pub user_trades: FeedQueue<UserTrade>,
    pub user_orders: FeedQueue<UserOrder>,
}

impl FeedQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a terminal error to every consumer of every feed
    pub fn fail_all(&self, err: FeedError) {
        self.trades.fail(err.clone());
        self.spreads.fail(err.clone());
        self.spread_observer.fail(err.clone());
        self.books.fail(err.clone());
        self.candles.fail(err.clone());
        self.user_trades.fail(err.clone());
        self.user_orders.fail(err);
    }

    pub fn close_all(&self) {
        self.trades.close();
        self.spreads.close();
        self.spread_observer.close();
        self.books.close();
        self.candles.close();
        self.user_trades.close();
        self.user_orders.close();
    }
}

/// Messages with a consumer-facing queue in [`FeedQueues`]
pub trait Queued: FeedMessage {
    fn queue(queues: &FeedQueues) -> &FeedQueue<Self>;
}

impl Queued for Trade {
    fn queue(queues: &FeedQueues) -> &FeedQueue<Self> {
        &queues.trades
    }
}

impl Queued for Spread {
    fn queue(queues: &FeedQueues) -> &FeedQueue<Self> {
        &queues.spreads
    }
}

impl Queued for BookUpdate {
    fn queue(queues: &FeedQueues) -> &FeedQueue<Self> {
        &queues.books
    }
}

impl Queued for Candle {
    fn queue(queues: &FeedQueues) -> &FeedQueue<Self> {
        &queues.candles
    }
}

impl Queued for UserTrade {
    fn queue(queues: &FeedQueues) -> &FeedQueue<Self> {
        &queues.user_trades
    }
}

impl Queued for UserOrder {
    fn queue(queues: &FeedQueues) -> &FeedQueue<Self> {
        &queues.user_orders
    }
}

/// Liveness marker observed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Heartbeat { at: Instant },
    Pong { at: Instant, reqid: Option<u64> },
}

impl Heartbeat {
    pub fn at(&self) -> Instant {
        match self {
            Heartbeat::Heartbeat { at } | Heartbeat::Pong { at, .. } => *at,
        }
    }
}

/// Bounded queue that evicts its oldest entry on overflow
pub struct RingQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T: Clone> RingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Push an item; returns the evicted entry if the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = self.lock();
        let evicted = if items.len() == self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn latest(&self) -> Option<T> {
        self.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single-consumer queue: the sender is shared, the receiver is taken once
pub struct StatusQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T> StatusQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn push(&self, item: T) {
        // The receiver only goes away on shutdown
        let _ = self.tx.send(item);
    }

    /// Hand the receiving end to its watcher; `None` once taken
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<T>> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl<T> Default for StatusQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Status queues filled by the dispatcher
pub struct StatusQueues {
    pub connection: StatusQueue<SystemStatus>,
    pub subscription: StatusQueue<SubscriptionStatus>,
    pub heartbeat: RingQueue<Heartbeat>,
}

impl StatusQueues {
    pub fn new(heartbeat_capacity: usize) -> Self {
        Self {
            connection: StatusQueue::new(),
            subscription: StatusQueue::new(),
            heartbeat: RingQueue::new(heartbeat_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_per_consumer() {
        let queue = FeedQueue::<u32>::new();
        let mut rx = queue.attach(None);

        for i in 0..100 {
            queue.publish(None, Ok(i));
        }

        for i in 0..100 {
            assert_eq!(rx.try_recv().unwrap(), Ok(i));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_symbol_filter() {
        let queue = FeedQueue::<&'static str>::new();
        let btc = Symbol::new("XBT-USD");
        let eth = Symbol::new("ETH-USD");

        let mut btc_rx = queue.attach(Some(btc.clone()));
        let mut eth_rx = queue.attach(Some(eth.clone()));
        let mut all_rx = queue.attach(None);

        assert_eq!(queue.publish(Some(&btc), Ok("btc")), 2);
        assert_eq!(queue.publish(None, Err(FeedError::decode("?", "bad"))), 3);

        assert_eq!(btc_rx.try_recv().unwrap(), Ok("btc"));
        assert!(btc_rx.try_recv().unwrap().is_err());
        assert!(eth_rx.try_recv().unwrap().is_err());
        assert!(eth_rx.try_recv().is_err());
        assert_eq!(all_rx.try_recv().unwrap(), Ok("btc"));
    }

    #[test]
    fn test_params_select_the_stream() {
        use crate::feed::Feed;

        let queue = FeedQueue::<u32>::new();
        let xbt = Symbol::new("XBT-USD");
        let one = SubscriptionKey::new(Feed::Candle, xbt.clone()).with_interval(1);
        let five = SubscriptionKey::new(Feed::Candle, xbt.clone()).with_interval(5);
        let mut one_rx = queue.attach_key(&one);
        let mut five_rx = queue.attach_key(&five);

        assert_eq!(queue.publish_with(Some(&xbt), &five.params, Ok(5)), 1);
        assert_eq!(five_rx.try_recv().unwrap(), Ok(5));
        assert!(one_rx.try_recv().is_err());

        // Failures without params still reach both
        assert_eq!(queue.publish(Some(&xbt), Err(FeedError::decode("?", "bad"))), 2);
    }

    #[test]
    fn test_closed_receivers_are_pruned() {
        let queue = FeedQueue::<u8>::new();
        let rx = queue.attach(None);
        let _kept = queue.attach(None);
        drop(rx);

        assert_eq!(queue.publish(None, Ok(1)), 1);
        assert_eq!(queue.attached(), 1);
    }

    #[tokio::test]
    async fn test_fail_delivers_then_ends() {
        let queue = FeedQueue::<u8>::new();
        let mut rx = queue.attach(None);
        queue.publish(None, Ok(7));
        queue.fail(FeedError::ConnectionClosed);

        assert_eq!(rx.recv().await, Some(Ok(7)));
        assert_eq!(rx.recv().await, Some(Err(FeedError::ConnectionClosed)));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_publish_wakes_waiting_consumer() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let queue = FeedQueue::<u8>::new();
        let mut rx = queue.attach(None);
        let mut recv = task::spawn(async move { rx.recv().await });

        assert_pending!(recv.poll());
        queue.publish(None, Ok(3));
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(Ok(3)));
    }

    #[test]
    fn test_ring_drops_oldest() {
        let ring = RingQueue::new(3);
        assert_eq!(ring.push(1), None);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.push(4), Some(1));

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest(), Some(4));
        assert_eq!(ring.pop(), Some(2));
    }

    #[test]
    fn test_status_receiver_taken_once() {
        let queue = StatusQueue::<u8>::new();
        queue.push(1);
        let mut rx = queue.take_receiver().unwrap();
        assert!(queue.take_receiver().is_none());
        assert_eq!(rx.try_recv().unwrap(), 1);
    }
}
