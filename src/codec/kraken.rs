//! Kraken WebSocket v1 codec
//!
//! Status frames are JSON objects keyed by `event`; feed frames are JSON
//! arrays ending in the channel name and pair (public) or the channel name
//! and a sequence object (private).

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};

use super::{
    AckStatus, CodecTable, ControlRequest, FeedFrame, Frame, StatusFrame, SubscriptionStatus,
    SystemStatus,
};
use crate::error::{FeedError, Result};
use crate::feed::{Feed, FeedParams, Symbol, SymbolMap, WireSymbol};
use crate::messages::{
    BookUpdate, BookUpdateKind, Candle, OrderType, PriceLevel, Side, Spread, Trade, UserOrder,
    UserTrade,
};

pub static CODEC: CodecTable = CodecTable {
    name: "kraken",
    decode,
    encode,
    trades: parse_trades,
    spreads: parse_spreads,
    book: parse_book,
    candles: parse_candles,
    user_trades: parse_user_trades,
    user_orders: parse_user_orders,
};

/// Wire name of a feed's subscription
pub fn feed_name(feed: Feed) -> &'static str {
    match feed {
        Feed::Trade => "trade",
        Feed::Spread => "spread",
        Feed::OrderBook => "book",
        Feed::Candle => "ohlc",
        Feed::UserTrade => "ownTrades",
        Feed::UserOrder => "openOrders",
    }
}

/// Resolve a subscription or channel name (`book-10`, `ohlc-5`) to its feed
pub fn feed_from_name(name: &str) -> Option<Feed> {
    let base = name.split('-').next().unwrap_or(name);
    match base {
        "trade" => Some(Feed::Trade),
        "spread" => Some(Feed::Spread),
        "book" => Some(Feed::OrderBook),
        "ohlc" => Some(Feed::Candle),
        "ownTrades" => Some(Feed::UserTrade),
        "openOrders" => Some(Feed::UserOrder),
        _ => None,
    }
}

/// Depth or interval encoded as the channel name suffix (`book-25`, `ohlc-5`)
pub fn params_from_name(feed: Feed, name: &str) -> FeedParams {
    let suffix = name
        .split_once('-')
        .and_then(|(_, suffix)| suffix.parse::<u32>().ok());
    match feed {
        Feed::OrderBook => FeedParams {
            depth: suffix,
            interval: None,
        },
        Feed::Candle => FeedParams {
            depth: None,
            interval: suffix,
        },
        _ => FeedParams::default(),
    }
}

#[derive(Debug, Deserialize)]
struct SystemStatusWire {
    status: String,
    version: Option<String>,
    #[serde(rename = "connectionID")]
    connection_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionStatusWire {
    status: String,
    pair: Option<String>,
    channel_name: Option<String>,
    reqid: Option<u64>,
    error_message: Option<String>,
    subscription: Option<SubscriptionDescriptor>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDescriptor {
    name: String,
    depth: Option<u32>,
    interval: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PongWire {
    reqid: Option<u64>,
}

/// Classify a raw frame
pub fn decode(raw: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(raw).map_err(|e| FeedError::decode(raw, e))?;

    match value {
        Value::Object(map) => decode_event(raw, map),
        Value::Array(items) => decode_channel(raw, items),
        _ => Err(FeedError::decode(raw, "expected JSON object or array")),
    }
}

fn decode_event(raw: &str, map: Map<String, Value>) -> Result<Frame> {
    let event = map
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::decode(raw, "object frame without event"))?
        .to_string();
    let value = Value::Object(map);

    let status = match event.as_str() {
        "systemStatus" => {
            let wire: SystemStatusWire =
                serde_json::from_value(value).map_err(|e| FeedError::decode(raw, e))?;
            StatusFrame::System(SystemStatus {
                status: wire.status,
                version: wire.version,
                connection_id: wire.connection_id,
            })
        }
        "subscriptionStatus" => {
            let wire: SubscriptionStatusWire =
                serde_json::from_value(value).map_err(|e| FeedError::decode(raw, e))?;
            let status = match wire.status.as_str() {
                "subscribed" => AckStatus::Subscribed,
                "unsubscribed" => AckStatus::Unsubscribed,
                "error" => AckStatus::Error,
                other => {
                    return Err(FeedError::decode(
                        raw,
                        format!("unknown subscription status: {}", other),
                    ))
                }
            };
            let feed = wire
                .subscription
                .as_ref()
                .and_then(|s| feed_from_name(&s.name))
                .or_else(|| wire.channel_name.as_deref().and_then(feed_from_name));
            let from_name = match (feed, wire.channel_name.as_deref()) {
                (Some(feed), Some(name)) => params_from_name(feed, name),
                _ => FeedParams::default(),
            };
            let params = FeedParams {
                depth: wire
                    .subscription
                    .as_ref()
                    .and_then(|s| s.depth)
                    .or(from_name.depth),
                interval: wire
                    .subscription
                    .as_ref()
                    .and_then(|s| s.interval)
                    .or(from_name.interval),
            };
            StatusFrame::Subscription(SubscriptionStatus {
                status,
                feed,
                pair: wire.pair.map(WireSymbol::new),
                params,
                channel_name: wire.channel_name,
                reqid: wire.reqid,
                error_message: wire.error_message,
            })
        }
        "heartbeat" => StatusFrame::Heartbeat,
        "pong" => {
            let wire: PongWire =
                serde_json::from_value(value).map_err(|e| FeedError::decode(raw, e))?;
            StatusFrame::Pong { reqid: wire.reqid }
        }
        other => return Err(FeedError::decode(raw, format!("unknown event: {}", other))),
    };

    Ok(Frame::Status(status))
}

fn decode_channel(raw: &str, mut items: Vec<Value>) -> Result<Frame> {
    if items.len() < 3 {
        return Err(FeedError::decode(raw, "channel frame too short"));
    }

    // Private frames end with a {"sequence": n} object, public ones with the pair
    let private = items.last().map(Value::is_object).unwrap_or(false);
    let tail = items.split_off(items.len() - 2);

    let channel_name = tail[0]
        .as_str()
        .ok_or_else(|| FeedError::decode(raw, "channel name is not a string"))?
        .to_string();
    let feed = feed_from_name(&channel_name)
        .ok_or_else(|| FeedError::decode(raw, format!("unknown channel: {}", channel_name)))?;

    let (pair, payload) = if private {
        (None, items)
    } else {
        let pair = tail[1]
            .as_str()
            .ok_or_else(|| FeedError::decode(raw, "pair is not a string"))?;
        // Leading element is the numeric channel id
        (Some(WireSymbol::new(pair)), items.split_off(1))
    };

    if payload.is_empty() {
        return Err(FeedError::decode(raw, "channel frame without payload"));
    }

    Ok(Frame::Feed(FeedFrame {
        feed,
        params: params_from_name(feed, &channel_name),
        channel_name,
        pair,
        payload,
        raw: raw.to_string(),
    }))
}

/// Encode an outbound control frame
pub fn encode(request: &ControlRequest) -> Result<String> {
    let frame = match request {
        ControlRequest::Subscription {
            event,
            feed,
            pairs,
            params,
            token,
            reqid,
        } => {
            let mut subscription = json!({ "name": feed_name(*feed) });
            if let Some(depth) = params.depth {
                subscription["depth"] = json!(depth);
            }
            if let Some(interval) = params.interval {
                subscription["interval"] = json!(interval);
            }
            if feed.is_private() {
                let token = token.as_ref().ok_or_else(|| FeedError::Subscribe {
                    key: feed.to_string(),
                    reason: "private feed requires an auth token".to_string(),
                })?;
                subscription["token"] = json!(token);
            }

            let mut frame = json!({
                "event": event.as_str(),
                "reqid": reqid,
                "subscription": subscription,
            });
            if !pairs.is_empty() {
                frame["pair"] = json!(pairs);
            }
            frame
        }
        ControlRequest::Ping { reqid } => json!({ "event": "ping", "reqid": reqid }),
    };

    Ok(frame.to_string())
}

type Parsed<T> = std::result::Result<T, String>;

fn with_frame<T>(frame: &FeedFrame, parsed: Parsed<T>) -> Result<T> {
    parsed.map_err(|reason| FeedError::decode(frame.raw.clone(), reason))
}

fn frame_symbol(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Parsed<Symbol> {
    frame
        .pair
        .as_ref()
        .map(|pair| symbols.from_exchange(pair))
        .ok_or_else(|| "frame has no pair".to_string())
}

fn first_array(frame: &FeedFrame) -> Parsed<&Vec<Value>> {
    frame.payload[0]
        .as_array()
        .ok_or_else(|| "payload is not an array".to_string())
}

fn str_at(fields: &[Value], index: usize) -> Parsed<&str> {
    fields
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("field {} missing or not a string", index))
}

fn decimal(raw: &str) -> Parsed<Decimal> {
    Decimal::from_str(raw).map_err(|e| format!("invalid decimal {:?}: {}", raw, e))
}

fn decimal_at(fields: &[Value], index: usize) -> Parsed<Decimal> {
    decimal(str_at(fields, index)?)
}

/// Parse a `seconds.micros` timestamp
pub fn parse_timestamp(raw: &str) -> Parsed<DateTime<Utc>> {
    let (secs, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    let secs: i64 = secs
        .parse()
        .map_err(|e| format!("invalid timestamp {:?}: {}", raw, e))?;
    let digits: String = fraction.chars().take(9).collect();
    let nanos: u32 = format!("{:0<9}", digits)
        .parse()
        .map_err(|e| format!("invalid timestamp {:?}: {}", raw, e))?;
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| format!("timestamp out of range: {}", raw))
}

fn side(raw: &str) -> Parsed<Side> {
    match raw {
        "b" | "buy" => Ok(Side::Buy),
        "s" | "sell" => Ok(Side::Sell),
        other => Err(format!("unknown side: {}", other)),
    }
}

fn parse_trades(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Result<Vec<Trade>> {
    with_frame(frame, trades(frame, symbols))
}

fn trades(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Parsed<Vec<Trade>> {
    let symbol = frame_symbol(frame, symbols)?;

    first_array(frame)?
        .iter()
        .map(|entry| {
            let fields = entry
                .as_array()
                .ok_or_else(|| "trade entry is not an array".to_string())?;
            let order_type = match str_at(fields, 4)? {
                "m" => OrderType::Market,
                "l" => OrderType::Limit,
                other => return Err(format!("unknown order type: {}", other)),
            };
            Ok(Trade {
                symbol: symbol.clone(),
                price: decimal_at(fields, 0)?,
                volume: decimal_at(fields, 1)?,
                time: parse_timestamp(str_at(fields, 2)?)?,
                side: side(str_at(fields, 3)?)?,
                order_type,
            })
        })
        .collect()
}

fn parse_spreads(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Result<Vec<Spread>> {
    with_frame(frame, spreads(frame, symbols))
}

fn spreads(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Parsed<Vec<Spread>> {
    let symbol = frame_symbol(frame, symbols)?;
    let fields = first_array(frame)?;

    let optional = |index: usize| -> Parsed<Option<Decimal>> {
        match fields.get(index).and_then(Value::as_str) {
            Some(raw) => decimal(raw).map(Some),
            None => Ok(None),
        }
    };

    Ok(vec![Spread {
        symbol,
        bid: decimal_at(fields, 0)?,
        ask: decimal_at(fields, 1)?,
        time: parse_timestamp(str_at(fields, 2)?)?,
        bid_volume: optional(3)?,
        ask_volume: optional(4)?,
    }])
}

fn parse_book(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Result<Vec<BookUpdate>> {
    with_frame(frame, book(frame, symbols))
}

fn book(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Parsed<Vec<BookUpdate>> {
    let symbol = frame_symbol(frame, symbols)?;

    let mut kind = BookUpdateKind::Delta;
    let mut asks = Vec::new();
    let mut bids = Vec::new();
    let mut latest: Option<DateTime<Utc>> = None;

    for part in &frame.payload {
        let object = part
            .as_object()
            .ok_or_else(|| "book payload is not an object".to_string())?;

        for (key, value) in object {
            let target = match key.as_str() {
                "as" => {
                    kind = BookUpdateKind::Snapshot;
                    &mut asks
                }
                "bs" => {
                    kind = BookUpdateKind::Snapshot;
                    &mut bids
                }
                "a" => &mut asks,
                "b" => &mut bids,
                // `c` is the CRC32 of the top ten levels; not verified here
                _ => continue,
            };

            let levels = value
                .as_array()
                .ok_or_else(|| format!("{} levels are not an array", key))?;
            for level in levels {
                let fields = level
                    .as_array()
                    .ok_or_else(|| "price level is not an array".to_string())?;
                let time = parse_timestamp(str_at(fields, 2)?)?;
                latest = Some(latest.map_or(time, |t| t.max(time)));
                target.push(PriceLevel::new(decimal_at(fields, 0)?, decimal_at(fields, 1)?));
            }
        }
    }

    Ok(vec![BookUpdate {
        symbol,
        kind,
        asks,
        bids,
        time: latest.unwrap_or_else(Utc::now),
    }])
}

fn parse_candles(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Result<Vec<Candle>> {
    with_frame(frame, candles(frame, symbols))
}

fn candles(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Parsed<Vec<Candle>> {
    let symbol = frame_symbol(frame, symbols)?;
    let fields = first_array(frame)?;

    let interval = frame.params.interval;
    let count = fields
        .get(8)
        .and_then(Value::as_u64)
        .ok_or_else(|| "trade count missing".to_string())?;

    Ok(vec![Candle {
        symbol,
        interval,
        time: parse_timestamp(str_at(fields, 0)?)?,
        end_time: parse_timestamp(str_at(fields, 1)?)?,
        open: decimal_at(fields, 2)?,
        high: decimal_at(fields, 3)?,
        low: decimal_at(fields, 4)?,
        close: decimal_at(fields, 5)?,
        vwap: decimal_at(fields, 6)?,
        volume: decimal_at(fields, 7)?,
        count,
    }])
}

#[derive(Debug, Deserialize)]
struct OwnTradeWire {
    ordertxid: String,
    pair: String,
    time: String,
    #[serde(rename = "type")]
    side: String,
    ordertype: String,
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    cost: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    fee: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    vol: Decimal,
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    margin: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct OpenOrderWire {
    status: Option<String>,
    descr: Option<OrderDescriptionWire>,
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    vol: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    vol_exec: Option<Decimal>,
    opentm: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderDescriptionWire {
    pair: Option<String>,
    #[serde(rename = "type")]
    side: Option<String>,
    ordertype: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    price: Option<Decimal>,
}

/// Private payloads are a list of single-entry `{id: fields}` objects
fn keyed_entries<T: for<'de> Deserialize<'de>>(frame: &FeedFrame) -> Parsed<Vec<(String, T)>> {
    let mut entries = Vec::new();
    for entry in first_array(frame)? {
        let map: HashMap<String, T> =
            serde_json::from_value(entry.clone()).map_err(|e| e.to_string())?;
        entries.extend(map);
    }
    Ok(entries)
}

fn parse_user_trades(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Result<Vec<UserTrade>> {
    with_frame(frame, user_trades(frame, symbols))
}

fn user_trades(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Parsed<Vec<UserTrade>> {
    keyed_entries::<OwnTradeWire>(frame)?
        .into_iter()
        .map(|(trade_id, wire)| {
            Ok(UserTrade {
                trade_id,
                order_id: wire.ordertxid,
                symbol: symbols.from_exchange(&WireSymbol::new(wire.pair)),
                time: parse_timestamp(&wire.time)?,
                side: side(&wire.side)?,
                order_type: wire.ordertype,
                price: wire.price,
                cost: wire.cost,
                fee: wire.fee,
                volume: wire.vol,
                margin: wire.margin,
            })
        })
        .collect()
}

fn parse_user_orders(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Result<Vec<UserOrder>> {
    with_frame(frame, user_orders(frame, symbols))
}

fn user_orders(frame: &FeedFrame, symbols: &dyn SymbolMap) -> Parsed<Vec<UserOrder>> {
    keyed_entries::<OpenOrderWire>(frame)?
        .into_iter()
        .map(|(order_id, wire)| {
            let descr = wire.descr;
            Ok(UserOrder {
                order_id,
                status: wire.status,
                symbol: descr
                    .as_ref()
                    .and_then(|d| d.pair.clone())
                    .map(|pair| symbols.from_exchange(&WireSymbol::new(pair))),
                side: descr
                    .as_ref()
                    .and_then(|d| d.side.as_deref())
                    .map(side)
                    .transpose()?,
                order_type: descr.as_ref().and_then(|d| d.ordertype.clone()),
                price: descr.as_ref().and_then(|d| d.price),
                volume: wire.vol,
                volume_executed: wire.vol_exec,
                open_time: wire.opentm.as_deref().map(parse_timestamp).transpose()?,
            })
        })
        .collect()
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

fn deserialize_optional_decimal<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    s.map(|s| Decimal::from_str(&s).map_err(serde::de::Error::custom))
        .transpose()
}
