//! Order book module
//!
//! Reconstructs full per-symbol books from snapshot and delta messages,
//! bounded by the concurrently observed spread.

mod book;
mod metrics;
mod reconstructor;

pub use book::FullBook;
pub use metrics::OrderBookMetrics;
pub use reconstructor::{Applied, BookReconstructor, ReconstructorState, SpreadPairer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feed::Symbol;
use crate::messages::PriceLevel;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Reconstructed book handed to the caller after each applied update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullBookView {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub updates: u64,
    /// Highest price first
    pub bids: Vec<PriceLevel>,
    /// Lowest price first
    pub asks: Vec<PriceLevel>,
    pub metrics: OrderBookMetrics,
}
