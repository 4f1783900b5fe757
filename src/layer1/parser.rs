// Frame Parser - Bybit v5 public stream decoding
// Classifies protocol frames and decodes each topic with its own fixed schema

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::core::events::MarketEvent;
use crate::core::types::{BookLevel, Candle, OrderBookSnapshot, Side, TickerUpdate, Trade, ValidationError};

// ============================================================================
// Topic prefixes
// ============================================================================

pub const TICKER_PREFIX: &str = "tickers.";
pub const KLINE_PREFIX: &str = "kline.";
pub const ORDERBOOK_PREFIX: &str = "orderbook.";
pub const TRADE_PREFIX: &str = "publicTrade.";

// ============================================================================
// Errors
// ============================================================================

/// Per-frame decode failure. The offending frame is dropped; the session keeps running.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Schema mismatch on {topic}: {reason}")]
    Schema { topic: String, reason: String },
    #[error("Invalid number in field '{field}': '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("Frame carries neither topic nor op")]
    Unclassified,
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Parse a string field as f64, returning ParseError on failure
fn parse_f64_field(value: &str, field: &'static str) -> Result<f64, ParseError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber { field, value: value.to_string() })
}

fn parse_optional(value: &Option<String>, field: &'static str) -> Result<Option<f64>, ParseError> {
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some(v) => parse_f64_field(v, field).map(Some),
    }
}

/// Parse a [price_string, size_string] pair
fn parse_level(raw: &[String; 2]) -> Result<BookLevel, ParseError> {
    Ok(BookLevel::new(
        parse_f64_field(&raw[0], "book.price")?,
        parse_f64_field(&raw[1], "book.size")?,
    ))
}

fn schema_error(topic: &str, err: serde_json::Error) -> ParseError {
    ParseError::Schema {
        topic: topic.to_string(),
        reason: err.to_string(),
    }
}

// ============================================================================
// Decoded frame
// ============================================================================

/// Bybit `type` on topic frames: a full picture or only the changes since the last one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Snapshot,
    Delta,
}

impl UpdateKind {
    fn from_frame(kind: Option<&str>) -> Self {
        match kind {
            Some("delta") => UpdateKind::Delta,
            _ => UpdateKind::Snapshot,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to our subscribe request
    SubscribeAck { success: bool, message: String },
    /// Server-initiated keepalive; must be answered with a pong carrying the same args
    Ping { args: Vec<serde_json::Value> },
    /// Reply to our own keepalive
    HeartbeatAck,
    /// Any other protocol reply (unsubscribe acks and the like)
    Control { op: String },
    Event(MarketEvent),
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::SubscribeAck { success, .. } => write!(f, "Frame(subscribe_ack, success={})", success),
            Frame::Ping { .. } => write!(f, "Frame(ping)"),
            Frame::HeartbeatAck => write!(f, "Frame(heartbeat_ack)"),
            Frame::Control { op } => write!(f, "Frame(control, op={})", op),
            Frame::Event(event) => write!(f, "Frame({})", event),
        }
    }
}

// ============================================================================
// Serde Structures (Raw Bybit JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
    #[serde(default)]
    args: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    symbol: String,
    #[serde(rename = "lastPrice", default)]
    last_price: Option<String>,
    #[serde(rename = "price24hPcnt", default)]
    price_24h_pcnt: Option<String>,
    #[serde(rename = "volume24h", default)]
    volume_24h: Option<String>,
    #[serde(rename = "highPrice24h", default)]
    high_24h: Option<String>,
    #[serde(rename = "lowPrice24h", default)]
    low_24h: Option<String>,
    #[serde(rename = "bid1Price", default)]
    bid_price: Option<String>,
    #[serde(rename = "ask1Price", default)]
    ask_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawKline {
    start: i64,
    interval: String,
    open: String,
    close: String,
    high: String,
    low: String,
    volume: String,
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct RawOrderBook {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
    #[serde(rename = "u")]
    update_id: u64,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "T")]
    timestamp: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "i")]
    id: String,
}

// ============================================================================
// MessageParser - Stateful parser with validation & stats
// ============================================================================

/// Parser statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParserStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub validation_failures: u64,
    pub unknown_topics: u64,
    pub control_frames: u64,
    pub ticker_count: u64,
    pub kline_count: u64,
    pub orderbook_count: u64,
    pub orderbook_deltas: u64,
    pub trade_count: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_parsed + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for ParserStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parser(parsed={}, errors={}, unknown_topics={}, tickers={}, klines={}, books={}, trades={})",
            self.messages_parsed, self.parse_errors, self.unknown_topics, self.ticker_count,
            self.kline_count, self.orderbook_count, self.trade_count
        )
    }
}

/// Stateful frame parser for one symbol
pub struct MessageParser {
    pub symbol: String,
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            stats: ParserStats::default(),
        }
    }

    // ========================================================================
    // Main parse entry point
    // ========================================================================

    /// Decode one text frame. Errors are counted here and returned for the caller to log.
    pub fn parse(&mut self, raw_json: &str) -> Result<Frame, ParseError> {
        let result = self.parse_inner(raw_json);
        match &result {
            Ok(Frame::Event(_)) => self.stats.messages_parsed += 1,
            Ok(_) => self.stats.control_frames += 1,
            Err(ParseError::UnknownTopic(_)) => self.stats.unknown_topics += 1,
            Err(ParseError::Validation(_)) => {
                self.stats.validation_failures += 1;
                self.stats.parse_errors += 1;
            }
            Err(_) => self.stats.parse_errors += 1,
        }
        result
    }

    fn parse_inner(&mut self, raw_json: &str) -> Result<Frame, ParseError> {
        let envelope: RawEnvelope = serde_json::from_str(raw_json)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        if let Some(topic) = envelope.topic.as_deref() {
            let data = envelope.data.as_ref().ok_or_else(|| ParseError::Schema {
                topic: topic.to_string(),
                reason: "missing data".to_string(),
            })?;
            let ts = envelope.ts.unwrap_or_default();
            let kind = UpdateKind::from_frame(envelope.kind.as_deref());
            return self.parse_topic(topic, kind, data, ts).map(Frame::Event);
        }

        let op = envelope.op.ok_or(ParseError::Unclassified)?;
        let frame = match op.as_str() {
            "subscribe" => Frame::SubscribeAck {
                success: envelope.success.unwrap_or(false),
                message: envelope.ret_msg.unwrap_or_default(),
            },
            "pong" => Frame::HeartbeatAck,
            // the exchange echoes op=ping with success set when answering our own ping
            "ping" if envelope.success.is_some() => Frame::HeartbeatAck,
            "ping" => Frame::Ping {
                args: envelope.args.unwrap_or_default(),
            },
            _ => Frame::Control { op },
        };
        Ok(frame)
    }

    /// Route a topic frame by prefix to its decoder
    pub fn parse_topic(
        &mut self,
        topic: &str,
        kind: UpdateKind,
        data: &serde_json::Value,
        ts: i64,
    ) -> Result<MarketEvent, ParseError> {
        if topic.starts_with(TICKER_PREFIX) {
            let ticker = self.parse_ticker(topic, data, ts)?;
            self.stats.ticker_count += 1;
            Ok(MarketEvent::Ticker(ticker))
        } else if topic.starts_with(KLINE_PREFIX) {
            let candles = self.parse_klines(topic, data)?;
            self.stats.kline_count += 1;
            Ok(MarketEvent::Klines(candles))
        } else if topic.starts_with(ORDERBOOK_PREFIX) {
            let book = self.parse_orderbook(topic, kind, data, ts)?;
            self.stats.orderbook_count += 1;
            match kind {
                UpdateKind::Snapshot => Ok(MarketEvent::OrderBook(book)),
                UpdateKind::Delta => {
                    self.stats.orderbook_deltas += 1;
                    Ok(MarketEvent::OrderBookDelta(book))
                }
            }
        } else if topic.starts_with(TRADE_PREFIX) {
            let trades = self.parse_trades(topic, data)?;
            self.stats.trade_count += 1;
            Ok(MarketEvent::Trades(trades))
        } else {
            debug!(topic = topic, "Unknown topic");
            Err(ParseError::UnknownTopic(topic.to_string()))
        }
    }

    fn check_symbol(&self, actual: &str) -> Result<(), ParseError> {
        if actual.eq_ignore_ascii_case(&self.symbol) {
            Ok(())
        } else {
            Err(ParseError::Validation(ValidationError::SymbolMismatch {
                expected: self.symbol.clone(),
                actual: actual.to_string(),
            }))
        }
    }

    // ========================================================================
    // Individual decoders
    // ========================================================================

    pub fn parse_ticker(
        &mut self,
        topic: &str,
        data: &serde_json::Value,
        ts: i64,
    ) -> Result<TickerUpdate, ParseError> {
        let raw = RawTicker::deserialize(data).map_err(|e| schema_error(topic, e))?;
        self.check_symbol(&raw.symbol)?;

        Ok(TickerUpdate {
            symbol: raw.symbol.to_uppercase(),
            timestamp: ts,
            last_price: parse_optional(&raw.last_price, "lastPrice")?,
            change_24h_pct: parse_optional(&raw.price_24h_pcnt, "price24hPcnt")?.map(|v| v * 100.0),
            volume_24h: parse_optional(&raw.volume_24h, "volume24h")?,
            high_24h: parse_optional(&raw.high_24h, "highPrice24h")?,
            low_24h: parse_optional(&raw.low_24h, "lowPrice24h")?,
            bid_price: parse_optional(&raw.bid_price, "bid1Price")?,
            ask_price: parse_optional(&raw.ask_price, "ask1Price")?,
        })
    }

    /// kline.<interval>.<symbol>; data is an array of candles
    pub fn parse_klines(&mut self, topic: &str, data: &serde_json::Value) -> Result<Vec<Candle>, ParseError> {
        let symbol = topic.rsplit('.').next().unwrap_or_default();
        self.check_symbol(symbol)?;

        let raw: Vec<RawKline> = Vec::deserialize(data).map_err(|e| schema_error(topic, e))?;
        let mut candles = Vec::with_capacity(raw.len());
        for k in raw {
            let candle = Candle::new(
                self.symbol.clone(),
                k.start,
                k.interval,
                parse_f64_field(&k.open, "kline.open")?,
                parse_f64_field(&k.high, "kline.high")?,
                parse_f64_field(&k.low, "kline.low")?,
                parse_f64_field(&k.close, "kline.close")?,
                parse_f64_field(&k.volume, "kline.volume")?,
                k.confirm,
            );
            candle.validate()?;
            candles.push(candle);
        }
        Ok(candles)
    }

    /// Zero-size levels are dropped from snapshots and kept in deltas, where they mean removal
    pub fn parse_orderbook(
        &mut self,
        topic: &str,
        kind: UpdateKind,
        data: &serde_json::Value,
        ts: i64,
    ) -> Result<OrderBookSnapshot, ParseError> {
        let raw = RawOrderBook::deserialize(data).map_err(|e| schema_error(topic, e))?;
        self.check_symbol(&raw.symbol)?;

        let keep = |l: &Result<BookLevel, ParseError>| {
            kind == UpdateKind::Delta || l.as_ref().map_or(true, |l| l.size > 0.0)
        };
        let bids = raw.bids.iter().map(parse_level).filter(keep).collect::<Result<Vec<_>, _>>()?;
        let asks = raw.asks.iter().map(parse_level).filter(keep).collect::<Result<Vec<_>, _>>()?;

        Ok(OrderBookSnapshot::new(raw.symbol.to_uppercase(), bids, asks, ts, raw.update_id))
    }

    pub fn parse_trades(&mut self, topic: &str, data: &serde_json::Value) -> Result<Vec<Trade>, ParseError> {
        let raw: Vec<RawTrade> = Vec::deserialize(data).map_err(|e| schema_error(topic, e))?;
        let mut trades = Vec::with_capacity(raw.len());
        for t in raw {
            self.check_symbol(&t.symbol)?;
            let side = Side::from_str(&t.side).map_err(|reason| ParseError::Schema {
                topic: topic.to_string(),
                reason,
            })?;
            let trade = Trade::new(
                t.symbol.to_uppercase(),
                t.id,
                t.timestamp,
                parse_f64_field(&t.price, "trade.price")?,
                parse_f64_field(&t.size, "trade.size")?,
                side,
            );
            trade.validate()?;
            trades.push(trade);
        }
        Ok(trades)
    }
}
