//! Order book metrics attached to every reconstructed view

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Computed metrics for a reconstructed book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,

    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Simple imbalance over the top 5 levels: (bid_vol - ask_vol) / (bid_vol + ask_vol)
    pub imbalance: Option<Decimal>,

    /// Imbalance over the top 10 levels with geometric decay per level
    pub weighted_imbalance: Option<Decimal>,

    /// Total bid depth (volume)
    pub bid_depth: Decimal,

    /// Total ask depth (volume)
    pub ask_depth: Decimal,

    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl OrderBookMetrics {
    /// Both sides populated and not crossed
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some() && self.bid_levels > 0 && self.ask_levels > 0 && !self.is_crossed()
    }

    /// Best bid at or above best ask
    pub fn is_crossed(&self) -> bool {
        matches!((self.best_bid, self.best_ask), (Some(bid), Some(ask)) if bid >= ask)
    }

    /// Get volume ratio (bid_depth / ask_depth)
    pub fn volume_ratio(&self) -> Option<Decimal> {
        if self.ask_depth > Decimal::ZERO {
            Some(self.bid_depth / self.ask_depth)
        } else {
            None
        }
    }
}
