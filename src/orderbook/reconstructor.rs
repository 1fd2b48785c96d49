//! Order book reconstruction state machine
//!
//! `Uninitialized` until the first snapshot, `Synchronized` afterwards.
//! Deltas patch the book in place and are then pruned against the spread
//! observed closest in time to the update.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use super::{FullBook, FullBookView};
use crate::error::{FeedError, Result};
use crate::feed::Symbol;
use crate::messages::{BookUpdate, BookUpdateKind, Spread};
use crate::queues::FeedReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructorState {
    Uninitialized,
    Synchronized,
}

/// What an applied message did to the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Snapshot,
    Delta,
}

/// Per-symbol reconstructor; the only writer of its book
#[derive(Debug)]
pub struct BookReconstructor {
    symbol: Symbol,
    depth: usize,
    book: Option<FullBook>,
}

impl BookReconstructor {
    pub fn new(symbol: Symbol, depth: usize) -> Self {
        Self {
            symbol,
            depth,
            book: None,
        }
    }

    pub fn state(&self) -> ReconstructorState {
        if self.book.is_some() {
            ReconstructorState::Synchronized
        } else {
            ReconstructorState::Uninitialized
        }
    }

    pub fn book(&self) -> Option<&FullBook> {
        self.book.as_ref()
    }

    /// Apply one book message
    ///
    /// A snapshot replaces the book wholesale in either state. A delta
    /// before any snapshot is rejected and leaves the state unchanged.
    pub fn apply(&mut self, update: &BookUpdate) -> Result<Applied> {
        if update.symbol != self.symbol {
            return Err(FeedError::ReconstructionPrecondition(format!(
                "update for {} routed to the {} book",
                update.symbol, self.symbol
            )));
        }

        match (update.kind, self.book.as_mut()) {
            (BookUpdateKind::Snapshot, _) => {
                let mut book = FullBook::new(self.symbol.clone(), self.depth);
                book.apply_snapshot(&update.asks, &update.bids, update.time);
                debug!(
                    symbol = %self.symbol,
                    bids = book.bid_levels(),
                    asks = book.ask_levels(),
                    "Order book snapshot applied"
                );
                self.book = Some(book);
                Ok(Applied::Snapshot)
            }
            (BookUpdateKind::Delta, Some(book)) => {
                book.apply_delta(&update.asks, &update.bids, update.time);
                Ok(Applied::Delta)
            }
            (BookUpdateKind::Delta, None) => Err(FeedError::ReconstructionPrecondition(format!(
                "delta for {} received before any snapshot",
                self.symbol
            ))),
        }
    }

    /// Prune against the paired spread, then trim to depth
    pub fn prune(&mut self, spread: &Spread) -> usize {
        match self.book.as_mut() {
            Some(book) => {
                let removed = book.prune(spread);
                book.trim_depth();
                if removed > 0 {
                    debug!(symbol = %self.symbol, removed, "Pruned levels outside the spread");
                }
                removed
            }
            None => 0,
        }
    }

    /// Trim without pruning, used when no spread could be paired
    pub fn trim(&mut self) {
        if let Some(book) = self.book.as_mut() {
            book.trim_depth();
        }
    }

    pub fn view(&self) -> Result<FullBookView> {
        self.book
            .as_ref()
            .ok_or_else(|| {
                FeedError::ReconstructionPrecondition(format!("no snapshot for {} yet", self.symbol))
            })?
            .view()
    }
}

/// Pairs each book update with one spread observation from the duplicate queue
///
/// The exchange only publishes a spread when the top of book moves, so the
/// last paired observation stays a candidate for later updates.
pub struct SpreadPairer {
    rx: FeedReceiver<Spread>,
    lookahead: Option<Spread>,
    last: Option<Spread>,
}

impl SpreadPairer {
    pub fn new(rx: FeedReceiver<Spread>) -> Self {
        Self {
            rx,
            lookahead: None,
            last: None,
        }
    }

    /// Most recent observation handed out by [`SpreadPairer::pair`]
    pub fn last(&self) -> Option<&Spread> {
        self.last.as_ref()
    }

    /// Take the spread observed closest to `at`
    ///
    /// Waits up to `wait` only when no spread has been seen yet, returning
    /// `Ok(None)` if none arrives. Queued observations that are at least as
    /// close as the current candidate replace it; the first farther one is
    /// kept for the next update.
    pub async fn pair(&mut self, at: DateTime<Utc>, wait: Duration) -> Result<Option<Spread>> {
        let mut current = match self.last.take() {
            Some(spread) => spread,
            None => match self.lookahead.take() {
                Some(spread) => spread,
                None => match tokio::time::timeout(wait, self.next_spread()).await {
                    Ok(spread) => spread?,
                    Err(_) => return Ok(None),
                },
            },
        };

        loop {
            let next = match self.lookahead.take() {
                Some(spread) => spread,
                None => match self.try_next_spread() {
                    Ok(Some(spread)) => spread,
                    Ok(None) => break,
                    Err(e) => {
                        self.last = Some(current);
                        return Err(e);
                    }
                },
            };
            if distance(&next, at) <= distance(&current, at) {
                current = next;
            } else {
                self.lookahead = Some(next);
                break;
            }
        }

        self.last = Some(current.clone());
        Ok(Some(current))
    }

    async fn next_spread(&mut self) -> Result<Spread> {
        loop {
            match self.rx.recv().await {
                Some(Ok(spread)) => return Ok(spread),
                Some(Err(e)) if e.is_terminal() => return Err(e),
                Some(Err(e)) => warn!(error = %e, "Skipping malformed spread observation"),
                None => return Err(FeedError::ConnectionClosed),
            }
        }
    }

    fn try_next_spread(&mut self) -> Result<Option<Spread>> {
        loop {
            match self.rx.try_recv() {
                Ok(Ok(spread)) => return Ok(Some(spread)),
                Ok(Err(e)) if e.is_terminal() => return Err(e),
                Ok(Err(e)) => warn!(error = %e, "Skipping malformed spread observation"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(None),
            }
        }
    }
}

fn distance(spread: &Spread, at: DateTime<Utc>) -> i64 {
    (spread.time - at)
        .num_microseconds()
        .map(i64::abs)
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PriceLevel;
    use crate::queues::FeedQueue;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn update(kind: BookUpdateKind, asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)]) -> BookUpdate {
        let levels = |pairs: &[(Decimal, Decimal)]| {
            pairs.iter().map(|(p, q)| PriceLevel::new(*p, *q)).collect()
        };
        BookUpdate {
            symbol: Symbol::new("XBT-USD"),
            kind,
            asks: levels(asks),
            bids: levels(bids),
            time: at(0),
        }
    }

    fn spread(bid: Decimal, ask: Decimal, secs: i64) -> Spread {
        Spread {
            symbol: Symbol::new("XBT-USD"),
            bid,
            ask,
            time: at(secs),
            bid_volume: None,
            ask_volume: None,
        }
    }

    #[test]
    fn test_delta_before_snapshot_stays_uninitialized() {
        let mut reconstructor = BookReconstructor::new(Symbol::new("XBT-USD"), 10);
        let delta = update(BookUpdateKind::Delta, &[(dec!(101), dec!(1))], &[]);

        let result = reconstructor.apply(&delta);
        assert!(matches!(result, Err(FeedError::ReconstructionPrecondition(_))));
        assert_eq!(reconstructor.state(), ReconstructorState::Uninitialized);
        assert!(reconstructor.view().is_err());
    }

    #[test]
    fn test_snapshot_then_delta_with_spread() {
        let mut reconstructor = BookReconstructor::new(Symbol::new("XBT-USD"), 10);

        let snapshot = update(BookUpdateKind::Snapshot, &[(dec!(101), dec!(5))], &[(dec!(100), dec!(3))]);
        assert_eq!(reconstructor.apply(&snapshot).unwrap(), Applied::Snapshot);
        assert_eq!(reconstructor.state(), ReconstructorState::Synchronized);

        let delta = update(BookUpdateKind::Delta, &[(dec!(101), dec!(0))], &[(dec!(100), dec!(5))]);
        assert_eq!(reconstructor.apply(&delta).unwrap(), Applied::Delta);
        reconstructor.prune(&spread(dec!(100), dec!(101), 0));

        let view = reconstructor.view().unwrap();
        assert!(view.asks.is_empty());
        assert_eq!(view.bids, vec![PriceLevel::new(dec!(100), dec!(5))]);
    }

    #[test]
    fn test_snapshot_in_synchronized_replaces_book() {
        let mut reconstructor = BookReconstructor::new(Symbol::new("XBT-USD"), 10);
        reconstructor
            .apply(&update(BookUpdateKind::Snapshot, &[(dec!(101), dec!(5))], &[(dec!(100), dec!(3))]))
            .unwrap();
        reconstructor
            .apply(&update(BookUpdateKind::Snapshot, &[(dec!(201), dec!(1))], &[]))
            .unwrap();

        let view = reconstructor.view().unwrap();
        assert!(view.bids.is_empty());
        assert_eq!(view.asks, vec![PriceLevel::new(dec!(201), dec!(1))]);
    }

    #[test]
    fn test_foreign_symbol_rejected() {
        let mut reconstructor = BookReconstructor::new(Symbol::new("ETH-USD"), 10);
        let snapshot = update(BookUpdateKind::Snapshot, &[], &[]);
        assert!(reconstructor.apply(&snapshot).is_err());
        assert_eq!(reconstructor.state(), ReconstructorState::Uninitialized);
    }

    #[tokio::test]
    async fn test_pairer_picks_closest_and_keeps_lookahead() {
        let queue = FeedQueue::new();
        let mut pairer = SpreadPairer::new(queue.attach(None));

        queue.publish(None, Ok(spread(dec!(1), dec!(2), -3)));
        queue.publish(None, Ok(spread(dec!(2), dec!(3), -1)));
        queue.publish(None, Ok(spread(dec!(3), dec!(4), 5)));

        let paired = pairer.pair(at(0), Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(paired.bid, dec!(2));

        // The farther observation was held back for the next update
        let paired = pairer.pair(at(5), Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(paired.bid, dec!(3));
    }

    #[tokio::test]
    async fn test_pairer_reuses_last_spread_without_waiting() {
        let queue = FeedQueue::new();
        let mut pairer = SpreadPairer::new(queue.attach(None));

        queue.publish(None, Ok(spread(dec!(100), dec!(101), 1)));
        let first = pairer.pair(at(1), Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.bid, dec!(100));

        // Deeper-level change: no new spread on the wire
        let started = std::time::Instant::now();
        let again = pairer
            .pair(at(2), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, first);
        assert!(started.elapsed() < Duration::from_secs(1));

        queue.publish(None, Ok(spread(dec!(99), dec!(100), 3)));
        let moved = pairer.pair(at(3), Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(moved.bid, dec!(99));
        assert_eq!(pairer.last(), Some(&moved));
    }

    #[tokio::test]
    async fn test_pairer_times_out_without_spread() {
        let queue = FeedQueue::<Spread>::new();
        let mut pairer = SpreadPairer::new(queue.attach(None));

        let paired = pairer.pair(at(0), Duration::from_millis(20)).await.unwrap();
        assert!(paired.is_none());
    }

    #[tokio::test]
    async fn test_pairer_skips_malformed_and_surfaces_terminal() {
        let queue = FeedQueue::new();
        let mut pairer = SpreadPairer::new(queue.attach(None));

        queue.publish(None, Err(FeedError::decode("[]", "bad spread")));
        queue.publish(None, Ok(spread(dec!(1), dec!(2), 0)));
        assert!(pairer.pair(at(0), Duration::from_millis(10)).await.unwrap().is_some());

        queue.fail(FeedError::MaxReconnectAttemptsExceeded(10));
        assert_eq!(
            pairer.pair(at(0), Duration::from_millis(10)).await,
            Err(FeedError::MaxReconnectAttemptsExceeded(10))
        );
    }
}
