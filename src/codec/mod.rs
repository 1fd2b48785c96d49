//! Wire codec module
//!
//! Classifies raw text frames into status frames or feed frames and turns
//! feed frames into domain messages. Each exchange is one static
//! [`CodecTable`] of plain functions selected through [`Exchange`].

pub mod kraken;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FeedError, Result};
use crate::feed::{ConfirmationKey, Feed, FeedParams, SymbolMap, WireSymbol};
use crate::messages::{BookUpdate, Candle, Spread, Trade, UserOrder, UserTrade};

/// A classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Status(StatusFrame),
    Feed(FeedFrame),
}

/// Connection, subscription and liveness frames
#[derive(Debug, Clone, PartialEq)]
pub enum StatusFrame {
    System(SystemStatus),
    Subscription(SubscriptionStatus),
    Heartbeat,
    Pong { reqid: Option<u64> },
}

/// Connection-level status announced by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub status: String,
    pub version: Option<String>,
    pub connection_id: Option<u64>,
}

impl SystemStatus {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

/// Outcome carried by a subscription acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Subscribed,
    Unsubscribed,
    Error,
}

/// Subscription acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatus {
    pub status: AckStatus,
    pub feed: Option<Feed>,
    pub pair: Option<WireSymbol>,
    /// Depth or interval echoed by the acknowledgment
    pub params: FeedParams,
    pub channel_name: Option<String>,
    pub reqid: Option<u64>,
    pub error_message: Option<String>,
}

impl SubscriptionStatus {
    /// The confirmed-set entry this acknowledgment refers to
    pub fn confirmation(&self) -> Option<ConfirmationKey> {
        let feed = self.feed?;
        if feed.is_private() {
            return Some(ConfirmationKey {
                feed,
                pair: None,
                params: FeedParams::default(),
            });
        }
        Some(ConfirmationKey {
            feed,
            pair: self.pair.clone(),
            params: self.params,
        })
    }
}

/// Feed payload still in wire form
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFrame {
    pub feed: Feed,
    pub channel_name: String,
    /// Depth or interval carried by the channel name
    pub params: FeedParams,
    pub pair: Option<WireSymbol>,
    pub payload: Vec<Value>,
    pub raw: String,
}

/// Subscribe or unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Subscribe,
    Unsubscribe,
}

impl ControlEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlEvent::Subscribe => "subscribe",
            ControlEvent::Unsubscribe => "unsubscribe",
        }
    }
}

/// Outbound control frame before encoding
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Subscription {
        event: ControlEvent,
        feed: Feed,
        pairs: Vec<WireSymbol>,
        params: FeedParams,
        token: Option<String>,
        reqid: u64,
    },
    Ping {
        reqid: u64,
    },
}

/// Parses one feed frame into zero or more domain messages
pub type ParseFn<T> = fn(&FeedFrame, &dyn SymbolMap) -> Result<Vec<T>>;

/// Static function table for one exchange
pub struct CodecTable {
    pub name: &'static str,
    pub decode: fn(&str) -> Result<Frame>,
    pub encode: fn(&ControlRequest) -> Result<String>,
    pub trades: ParseFn<Trade>,
    pub spreads: ParseFn<Spread>,
    pub book: ParseFn<BookUpdate>,
    pub candles: ParseFn<Candle>,
    pub user_trades: ParseFn<UserTrade>,
    pub user_orders: ParseFn<UserOrder>,
}

impl fmt::Debug for CodecTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecTable").field("name", &self.name).finish()
    }
}

/// Supported exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Kraken,
}

impl Exchange {
    pub fn codec(self) -> &'static CodecTable {
        match self {
            Exchange::Kraken => &kraken::CODEC,
        }
    }
}

impl FromStr for Exchange {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kraken" => Ok(Exchange::Kraken),
            other => Err(FeedError::Config(format!("Unsupported exchange: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_resolves_codec() {
        let exchange: Exchange = "Kraken".parse().unwrap();
        assert_eq!(exchange.codec().name, "kraken");
    }

    #[test]
    fn test_private_ack_drops_pair() {
        let status = SubscriptionStatus {
            status: AckStatus::Subscribed,
            feed: Some(Feed::UserOrder),
            pair: Some(WireSymbol::new("XBT/USD")),
            params: FeedParams::default(),
            channel_name: Some("openOrders".into()),
            reqid: None,
            error_message: None,
        };
        assert_eq!(status.confirmation().unwrap().pair, None);
    }
}
