//! Validated domain messages delivered to feed consumers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::feed::Symbol;

/// Aggressor or order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Order type of a public trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Public trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub price: Decimal,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
    pub side: Side,
    pub order_type: OrderType,
}

/// Best bid/ask observation for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub symbol: Symbol,
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
    pub bid_volume: Option<Decimal>,
    pub ask_volume: Option<Decimal>,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Whether a book message replaces or patches local state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookUpdateKind {
    Snapshot,
    Delta,
}

/// One order book message, either a full snapshot or changed levels only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookUpdate {
    pub symbol: Symbol,
    pub kind: BookUpdateKind,
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
    /// Latest level timestamp in the message
    pub time: DateTime<Utc>,
}

impl BookUpdate {
    pub fn is_snapshot(&self) -> bool {
        self.kind == BookUpdateKind::Snapshot
    }
}

/// OHLC candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    /// Interval in minutes, when the channel name carries it
    pub interval: Option<u32>,
    pub time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub vwap: Decimal,
    pub volume: Decimal,
    pub count: u64,
}

/// Fill on one of the account's orders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTrade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub side: Side,
    pub order_type: String,
    pub price: Decimal,
    pub cost: Decimal,
    pub fee: Decimal,
    pub volume: Decimal,
    pub margin: Option<Decimal>,
}

/// State change of one of the account's orders
///
/// Status-only updates carry just the id and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOrder {
    pub order_id: String,
    pub status: Option<String>,
    pub symbol: Option<Symbol>,
    pub side: Option<Side>,
    pub order_type: Option<String>,
    pub price: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub volume_executed: Option<Decimal>,
    pub open_time: Option<DateTime<Utc>>,
}

/// A domain message that can be routed to symbol-filtered consumers
pub trait FeedMessage: Clone + Send + 'static {
    /// Canonical symbol, when the message is bound to one
    fn symbol(&self) -> Option<&Symbol>;
}

impl FeedMessage for Trade {
    fn symbol(&self) -> Option<&Symbol> {
        Some(&self.symbol)
    }
}

impl FeedMessage for Spread {
    fn symbol(&self) -> Option<&Symbol> {
        Some(&self.symbol)
    }
}

impl FeedMessage for BookUpdate {
    fn symbol(&self) -> Option<&Symbol> {
        Some(&self.symbol)
    }
}

impl FeedMessage for Candle {
    fn symbol(&self) -> Option<&Symbol> {
        Some(&self.symbol)
    }
}

impl FeedMessage for UserTrade {
    fn symbol(&self) -> Option<&Symbol> {
        Some(&self.symbol)
    }
}

impl FeedMessage for UserOrder {
    fn symbol(&self) -> Option<&Symbol> {
        self.symbol.as_ref()
    }
}
