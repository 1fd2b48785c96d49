//! Feed vocabulary: symbols, feeds and subscription keys

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical, exchange-agnostic symbol (`BASE-QUOTE`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symbol as written on the exchange's wire (e.g. `XBT/USD`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireSymbol(String);

impl WireSymbol {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WireSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bidirectional symbol translation, supplied by the caller
pub trait SymbolMap: Send + Sync {
    fn to_exchange(&self, symbol: &Symbol) -> WireSymbol;
    fn from_exchange(&self, symbol: &WireSymbol) -> Symbol;
}

/// Maps `BASE-QUOTE` to `BASE/QUOTE` and back
#[derive(Debug, Default, Clone, Copy)]
pub struct SlashPairs;

impl SymbolMap for SlashPairs {
    fn to_exchange(&self, symbol: &Symbol) -> WireSymbol {
        WireSymbol::new(symbol.as_str().replacen('-', "/", 1))
    }

    fn from_exchange(&self, symbol: &WireSymbol) -> Symbol {
        Symbol::new(symbol.as_str().replacen('/', "-", 1))
    }
}

/// One logical category of streaming data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feed {
    Trade,
    Spread,
    OrderBook,
    Candle,
    UserTrade,
    UserOrder,
}

impl Feed {
    pub const ALL: [Feed; 6] = [
        Feed::Trade,
        Feed::Spread,
        Feed::OrderBook,
        Feed::Candle,
        Feed::UserTrade,
        Feed::UserOrder,
    ];

    /// Private feeds need an auth token and are not bound to a pair on the wire
    pub fn is_private(self) -> bool {
        matches!(self, Feed::UserTrade | Feed::UserOrder)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Feed::Trade => "trade",
            Feed::Spread => "spread",
            Feed::OrderBook => "order-book",
            Feed::Candle => "candle",
            Feed::UserTrade => "user-trade",
            Feed::UserOrder => "user-order",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-feed parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeedParams {
    /// Book depth
    pub depth: Option<u32>,
    /// Candle interval in minutes
    pub interval: Option<u32>,
}

impl FeedParams {
    /// Whether an item published with `published` belongs to a stream with these params
    ///
    /// A parameter left unset on either side matches anything.
    pub fn admits(&self, published: &FeedParams) -> bool {
        fn matches(wanted: Option<u32>, got: Option<u32>) -> bool {
            match (wanted, got) {
                (Some(wanted), Some(got)) => wanted == got,
                _ => true,
            }
        }
        matches(self.depth, published.depth) && matches(self.interval, published.interval)
    }
}

/// Uniquely identifies one logical stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub feed: Feed,
    pub symbol: Option<Symbol>,
    pub params: FeedParams,
}

impl SubscriptionKey {
    pub fn new(feed: Feed, symbol: Symbol) -> Self {
        Self {
            feed,
            symbol: Some(symbol),
            params: FeedParams::default(),
        }
    }

    /// Key for a private feed, which covers every pair
    pub fn private(feed: Feed) -> Self {
        Self {
            feed,
            symbol: None,
            params: FeedParams::default(),
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.params.depth = Some(depth);
        self
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.params.interval = Some(interval);
        self
    }

    /// The (feed, wire symbol, params) entry the exchange acknowledges
    pub fn confirmation(&self, symbols: &dyn SymbolMap) -> ConfirmationKey {
        if self.feed.is_private() {
            return ConfirmationKey {
                feed: self.feed,
                pair: None,
                params: FeedParams::default(),
            };
        }
        ConfirmationKey {
            feed: self.feed,
            pair: self.symbol.as_ref().map(|s| symbols.to_exchange(s)),
            params: self.params,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{}:{}", self.feed, symbol),
            None => write!(f, "{}", self.feed),
        }
    }
}

/// Entry of the confirmed-subscriptions set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfirmationKey {
    pub feed: Feed,
    pub pair: Option<WireSymbol>,
    pub params: FeedParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_pairs_round_trip() {
        let map = SlashPairs;
        let wire = map.to_exchange(&Symbol::new("XBT-USD"));
        assert_eq!(wire.as_str(), "XBT/USD");
        assert_eq!(map.from_exchange(&wire), Symbol::new("XBT-USD"));
    }

    #[test]
    fn test_private_confirmation_has_no_pair() {
        let key = SubscriptionKey::private(Feed::UserTrade);
        assert_eq!(
            key.confirmation(&SlashPairs),
            ConfirmationKey {
                feed: Feed::UserTrade,
                pair: None,
                params: FeedParams::default(),
            }
        );
    }

    #[test]
    fn test_public_confirmation_uses_wire_symbol() {
        let key = SubscriptionKey::new(Feed::OrderBook, Symbol::new("ETH-USD")).with_depth(10);
        let confirmation = key.confirmation(&SlashPairs);
        assert_eq!(confirmation.pair, Some(WireSymbol::new("ETH/USD")));
        assert_eq!(confirmation.params.depth, Some(10));
        assert_eq!(key.to_string(), "order-book:ETH-USD");
    }

    #[test]
    fn test_params_keep_streams_apart() {
        let one = SubscriptionKey::new(Feed::Candle, Symbol::new("XBT-USD")).with_interval(1);
        let five = SubscriptionKey::new(Feed::Candle, Symbol::new("XBT-USD")).with_interval(5);
        assert_ne!(one.confirmation(&SlashPairs), five.confirmation(&SlashPairs));

        let ohlc_5 = FeedParams {
            depth: None,
            interval: Some(5),
        };
        assert!(!one.params.admits(&ohlc_5));
        assert!(five.params.admits(&ohlc_5));
        assert!(one.params.admits(&FeedParams::default()));
        assert!(FeedParams::default().admits(&ohlc_5));
    }
}
