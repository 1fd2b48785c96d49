//! Reconstructed full order book
//!
//! Uses BTreeMap for efficient sorted price level management.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{BookSide, FullBookView, OrderBookMetrics};
use crate::error::{FeedError, Result};
use crate::feed::Symbol;
use crate::messages::{PriceLevel, Spread};

/// Full book for a single symbol
#[derive(Debug, Clone)]
pub struct FullBook {
    symbol: Symbol,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Maximum depth levels to maintain
    max_depth: usize,
    /// Time of the last applied message
    last_update_time: DateTime<Utc>,
    /// Messages applied since the snapshot, snapshot included
    updates: u64,
}

impl FullBook {
    /// Create a new empty book
    pub fn new(symbol: Symbol, max_depth: usize) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            max_depth,
            last_update_time: DateTime::<Utc>::MIN_UTC,
            updates: 0,
        }
    }

    /// Replace both sides wholesale
    pub fn apply_snapshot(&mut self, asks: &[PriceLevel], bids: &[PriceLevel], time: DateTime<Utc>) {
        self.bids.clear();
        self.asks.clear();

        for level in bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_update_time = time;
        self.updates = 1;
        self.trim_depth();
    }

    /// Write changed levels; prices absent from the delta are untouched
    pub fn apply_delta(&mut self, asks: &[PriceLevel], bids: &[PriceLevel], time: DateTime<Utc>) {
        for level in bids {
            self.update_side(BookSide::Bid, level);
        }

        for level in asks {
            self.update_side(BookSide::Ask, level);
        }

        self.last_update_time = self.last_update_time.max(time);
        self.updates += 1;
    }

    /// Update a single price level; quantity <= 0 means the level emptied out
    fn update_side(&mut self, side: BookSide, level: &PriceLevel) {
        match side {
            BookSide::Bid => {
                if level.quantity <= Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            BookSide::Ask => {
                if level.quantity <= Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    /// Drop asks below the best ask and bids above the best bid
    ///
    /// Returns the number of levels removed.
    pub fn prune(&mut self, spread: &Spread) -> usize {
        let before = self.bids.len() + self.asks.len();
        // Reverse ordering puts higher prices first, so split at the best bid
        self.bids = self.bids.split_off(&Reverse(spread.bid));
        self.asks = self.asks.split_off(&spread.ask);
        before - (self.bids.len() + self.asks.len())
    }

    /// Trim the book to max depth
    pub fn trim_depth(&mut self) {
        while self.bids.len() > self.max_depth {
            self.bids.pop_last();
        }
        while self.asks.len() > self.max_depth {
            self.asks.pop_last();
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Quantity resting at a price, if any
    pub fn level(&self, side: BookSide, price: Decimal) -> Option<Decimal> {
        match side {
            BookSide::Bid => self.bids.get(&Reverse(price)).copied(),
            BookSide::Ask => self.asks.get(&price).copied(),
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.iter().take(levels).map(|(_, q)| q).sum();
        let ask_volume: Decimal = self.asks.iter().take(levels).map(|(_, q)| q).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Calculate weighted imbalance (closer to the top weighted more)
    pub fn weighted_imbalance(&self, levels: usize, decay: Decimal) -> Option<Decimal> {
        let weighted = |quantities: &mut dyn Iterator<Item = Decimal>| -> Decimal {
            let mut weight = Decimal::ONE;
            let mut sum = Decimal::ZERO;
            for q in quantities.take(levels) {
                sum += q * weight;
                weight *= decay;
            }
            sum
        };

        let bid_weighted = weighted(&mut self.bids.values().copied());
        let ask_weighted = weighted(&mut self.asks.values().copied());

        let total = bid_weighted + ask_weighted;
        if total > Decimal::ZERO {
            Some((bid_weighted - ask_weighted) / total)
        } else {
            None
        }
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Validated, sorted view of the current book
    pub fn view(&self) -> Result<FullBookView> {
        let bids: Vec<PriceLevel> = self
            .bids
            .iter()
            .map(|(Reverse(p), q)| PriceLevel::new(*p, *q))
            .collect();
        let asks: Vec<PriceLevel> = self
            .asks
            .iter()
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect();

        if let Some(level) = bids
            .iter()
            .chain(asks.iter())
            .find(|l| l.price <= Decimal::ZERO || l.quantity <= Decimal::ZERO)
        {
            return Err(FeedError::ReconstructionPrecondition(format!(
                "{} holds invalid level {} @ {}",
                self.symbol, level.quantity, level.price
            )));
        }

        Ok(FullBookView {
            symbol: self.symbol.clone(),
            time: self.last_update_time,
            updates: self.updates,
            bids,
            asks,
            metrics: self.calculate_metrics(),
        })
    }

    /// Calculate order book metrics
    fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(5),
            weighted_imbalance: self.weighted_imbalance(10, Decimal::new(9, 1)),
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels(pairs: &[(Decimal, Decimal)]) -> Vec<PriceLevel> {
        pairs.iter().map(|(p, q)| PriceLevel::new(*p, *q)).collect()
    }

    fn spread(bid: Decimal, ask: Decimal) -> Spread {
        Spread {
            symbol: Symbol::new("XBT-USD"),
            bid,
            ask,
            time: Utc::now(),
            bid_volume: None,
            ask_volume: None,
        }
    }

    fn create_test_book() -> FullBook {
        let mut book = FullBook::new(Symbol::new("XBT-USD"), 10);
        book.apply_snapshot(
            &levels(&[(dec!(50001), dec!(1.5)), (dec!(50002), dec!(2.5))]),
            &levels(&[(dec!(50000), dec!(1.0)), (dec!(49999), dec!(2.0))]),
            Utc::now(),
        );
        book
    }

    #[test]
    fn test_best_bid_ask() {
        let book = create_test_book();
        assert_eq!(book.best_bid(), Some(dec!(50000)));
        assert_eq!(book.best_ask(), Some(dec!(50001)));
    }

    #[test]
    fn test_mid_price() {
        let book = create_test_book();
        assert_eq!(book.mid_price(), Some(dec!(50000.5)));
    }

    #[test]
    fn test_imbalance() {
        let book = create_test_book();
        // Bids: 1.0 + 2.0 = 3.0, Asks: 1.5 + 2.5 = 4.0
        let imbalance = book.imbalance(10).unwrap();
        assert!(imbalance < Decimal::ZERO);
        assert!(book.weighted_imbalance(10, dec!(0.9)).unwrap() < Decimal::ZERO);
    }

    #[test]
    fn test_snapshot_skips_empty_levels() {
        let mut book = FullBook::new(Symbol::new("XBT-USD"), 10);
        book.apply_snapshot(&levels(&[(dec!(101), dec!(0))]), &levels(&[(dec!(100), dec!(3))]), Utc::now());
        assert_eq!(book.ask_levels(), 0);
        assert_eq!(book.level(BookSide::Bid, dec!(100)), Some(dec!(3)));
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut book = create_test_book();
        book.apply_delta(&levels(&[(dec!(50001), dec!(0))]), &[], Utc::now());
        assert_eq!(book.level(BookSide::Ask, dec!(50001)), None);
        assert_eq!(book.best_ask(), Some(dec!(50002)));
    }

    #[test]
    fn test_zero_quantity_for_absent_price_is_noop() {
        let mut book = create_test_book();
        book.apply_delta(&[], &levels(&[(dec!(12345), dec!(0))]), Utc::now());
        assert_eq!(book.bid_levels(), 2);
        assert_eq!(book.ask_levels(), 2);
    }

    #[test]
    fn test_negative_quantity_removes_level() {
        let mut book = create_test_book();
        book.apply_delta(&[], &levels(&[(dec!(50000), dec!(-1))]), Utc::now());
        assert_eq!(book.level(BookSide::Bid, dec!(50000)), None);
    }

    #[test]
    fn test_delta_leaves_other_levels() {
        let mut book = create_test_book();
        book.apply_delta(&[], &levels(&[(dec!(50000), dec!(4))]), Utc::now());
        assert_eq!(book.level(BookSide::Bid, dec!(50000)), Some(dec!(4)));
        assert_eq!(book.level(BookSide::Bid, dec!(49999)), Some(dec!(2.0)));
    }

    #[test]
    fn test_prune_against_spread() {
        let mut book = FullBook::new(Symbol::new("XBT-USD"), 10);
        book.apply_snapshot(
            &levels(&[(dec!(100), dec!(1)), (dec!(101), dec!(1)), (dec!(103), dec!(1))]),
            &levels(&[(dec!(99), dec!(1)), (dec!(100), dec!(1)), (dec!(102), dec!(1))]),
            Utc::now(),
        );

        let removed = book.prune(&spread(dec!(100), dec!(101)));
        assert_eq!(removed, 2);

        let view = book.view().unwrap();
        let bid_prices: Vec<_> = view.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<_> = view.asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(100), dec!(99)]);
        assert_eq!(ask_prices, vec![dec!(101), dec!(103)]);
    }

    #[test]
    fn test_trim_depth() {
        let mut book = FullBook::new(Symbol::new("XBT-USD"), 2);
        book.apply_snapshot(
            &levels(&[(dec!(101), dec!(1)), (dec!(102), dec!(1)), (dec!(103), dec!(1))]),
            &levels(&[(dec!(100), dec!(1)), (dec!(99), dec!(1)), (dec!(98), dec!(1))]),
            Utc::now(),
        );
        assert_eq!(book.ask_levels(), 2);
        assert_eq!(book.best_ask(), Some(dec!(101)));
        assert_eq!(book.level(BookSide::Bid, dec!(98)), None);
    }

    #[test]
    fn test_view_metrics() {
        let view = create_test_book().view().unwrap();
        assert_eq!(view.updates, 1);
        assert_eq!(view.metrics.bid_levels, 2);
        assert_eq!(view.metrics.ask_depth, dec!(4.0));
        assert!(view.metrics.is_healthy());
    }
}
