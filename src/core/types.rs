// Core Type Definitions for the Signal Hunt pipeline
// Market data model shared by the stream session, the aggregator and the signal engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribing,
    Streaming,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(format!("Invalid Side: '{}'. Expected 'Buy' or 'Sell'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleType {
    Bullish,
    Bearish,
    Doji,
}

impl fmt::Display for CandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for BookSentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Invariant violations detected before a record is stored
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("OHLC invariant violated: open={open} high={high} low={low} close={close}")]
    Ohlc { open: f64, high: f64, low: f64, close: f64 },
    #[error("non-finite or negative value in field '{0}'")]
    BadValue(&'static str),
    #[error("order book side is empty (bids={bids}, asks={asks})")]
    EmptyBookSide { bids: usize, asks: usize },
    #[error("crossed order book: best bid {bid} >= best ask {ask}")]
    CrossedBook { bid: f64, ask: f64 },
    #[error("symbol mismatch: expected {expected}, got {actual}")]
    SymbolMismatch { expected: String, actual: String },
}

fn check_price(value: f64, field: &'static str) -> Result<(), ValidationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::BadValue(field))
    }
}

fn check_size(value: f64, field: &'static str) -> Result<(), ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::BadValue(field))
    }
}

// ============================================================================
// Candle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub start_time: i64, // milliseconds, period start
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub confirmed: bool,
}

impl Candle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        start_time: i64,
        interval: String,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        confirmed: bool,
    ) -> Self {
        Self {
            symbol,
            start_time,
            interval,
            open,
            high,
            low,
            close,
            volume,
            confirmed,
        }
    }

    /// Checks `low <= open, close <= high` and that every value is usable
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_price(self.open, "open")?;
        check_price(self.high, "high")?;
        check_price(self.low, "low")?;
        check_price(self.close, "close")?;
        check_size(self.volume, "volume")?;

        if self.low > self.open.min(self.close) || self.high < self.open.max(self.close) {
            return Err(ValidationError::Ohlc {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        Ok(())
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn upper_shadow(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_shadow(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn candle_type(&self) -> CandleType {
        if self.close > self.open {
            CandleType::Bullish
        } else if self.close < self.open {
            CandleType::Bearish
        } else {
            CandleType::Doji
        }
    }

    /// Close location inside the high/low range, 0-100. 50 when the range is flat.
    pub fn close_position_pct(&self) -> f64 {
        let range = self.range();
        if range > 0.0 {
            (self.close - self.low) / range * 100.0
        } else {
            50.0
        }
    }

    pub fn metrics(&self) -> CandleMetrics {
        let range = self.range();
        let (change_pct, range_pct) = if self.open > 0.0 {
            (
                (self.close - self.open) / self.open * 100.0,
                range / self.open * 100.0,
            )
        } else {
            (0.0, 0.0)
        };
        let body_pct = if range > 0.0 { self.body() / range * 100.0 } else { 0.0 };
        let volume_price_ratio = if self.close > 0.0 { self.volume / self.close } else { 0.0 };

        CandleMetrics {
            start_time: self.start_time,
            body: self.body(),
            range,
            upper_shadow: self.upper_shadow(),
            lower_shadow: self.lower_shadow(),
            change_pct,
            range_pct,
            body_pct,
            candle_type: self.candle_type(),
            close_position_pct: self.close_position_pct(),
            volume_price_ratio,
        }
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candle(symbol={}, interval={}, start={}, O={:.2}, H={:.2}, L={:.2}, C={:.2}, V={:.4}, confirmed={})",
            self.symbol, self.interval, self.start_time, self.open, self.high, self.low,
            self.close, self.volume, self.confirmed
        )
    }
}

/// Shape metrics derived from a single candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleMetrics {
    pub start_time: i64,
    pub body: f64,
    pub range: f64,
    pub upper_shadow: f64,
    pub lower_shadow: f64,
    pub change_pct: f64,
    pub range_pct: f64,
    pub body_pct: f64,
    pub candle_type: CandleType,
    pub close_position_pct: f64,
    pub volume_price_ratio: f64,
}

// ============================================================================
// Ticker
// ============================================================================

/// Partial ticker as delivered on the wire. Absent fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub symbol: String,
    pub timestamp: i64,
    pub last_price: Option<f64>,
    pub change_24h_pct: Option<f64>,
    pub volume_24h: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
}

impl TickerUpdate {
    /// Checks only the fields present; prices must be positive, volume non-negative
    pub fn validate(&self) -> Result<(), ValidationError> {
        let prices = [
            (self.last_price, "ticker.last_price"),
            (self.high_24h, "ticker.high_24h"),
            (self.low_24h, "ticker.low_24h"),
            (self.bid_price, "ticker.bid_price"),
            (self.ask_price, "ticker.ask_price"),
        ];
        for (value, field) in prices {
            if let Some(v) = value {
                check_price(v, field)?;
            }
        }
        if let Some(v) = self.volume_24h {
            check_size(v, "ticker.volume_24h")?;
        }
        match self.change_24h_pct {
            Some(v) if !v.is_finite() => Err(ValidationError::BadValue("ticker.change_24h_pct")),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub timestamp: i64,
    pub last_price: f64,
    pub change_24h_pct: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub bid_price: f64,
    pub ask_price: f64,
}

impl Ticker {
    /// Applies a partial update on top of the current values
    pub fn merge(&mut self, update: &TickerUpdate) {
        self.symbol.clone_from(&update.symbol);
        self.timestamp = update.timestamp;
        if let Some(v) = update.last_price {
            self.last_price = v;
        }
        if let Some(v) = update.change_24h_pct {
            self.change_24h_pct = v;
        }
        if let Some(v) = update.volume_24h {
            self.volume_24h = v;
        }
        if let Some(v) = update.high_24h {
            self.high_24h = v;
        }
        if let Some(v) = update.low_24h {
            self.low_24h = v;
        }
        if let Some(v) = update.bid_price {
            self.bid_price = v;
        }
        if let Some(v) = update.ask_price {
            self.ask_price = v;
        }
    }

    pub fn spread(&self) -> Option<f64> {
        if self.bid_price > 0.0 && self.ask_price > 0.0 {
            Some(self.ask_price - self.bid_price)
        } else {
            None
        }
    }

    pub fn spread_pct(&self) -> Option<f64> {
        self.spread().map(|s| s / self.bid_price * 100.0)
    }

    pub fn mid_price(&self) -> Option<f64> {
        if self.bid_price > 0.0 && self.ask_price > 0.0 {
            Some((self.bid_price + self.ask_price) / 2.0)
        } else {
            None
        }
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ticker(symbol={}, last={:.2}, 24h={:+.2}%, bid={:.2}, ask={:.2})",
            self.symbol, self.last_price, self.change_24h_pct, self.bid_price, self.ask_price
        )
    }
}

// ============================================================================
// BookLevel / OrderBookSnapshot
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

impl fmt::Display for BookLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BookLevel(price={:.2}, size={:.4})", self.price, self.size)
    }
}

/// Full top-of-book picture. Bids are price-descending, asks price-ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: i64,
    pub update_id: u64,
}

impl OrderBookSnapshot {
    pub fn new(
        symbol: String,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: i64,
        update_id: u64,
    ) -> Self {
        Self {
            symbol,
            bids,
            asks,
            timestamp,
            update_id,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bids.is_empty() || self.asks.is_empty() {
            return Err(ValidationError::EmptyBookSide {
                bids: self.bids.len(),
                asks: self.asks.len(),
            });
        }
        for level in self.bids.iter().chain(self.asks.iter()) {
            check_price(level.price, "book.price")?;
            check_size(level.size, "book.size")?;
        }
        let bid = self.bids[0].price;
        let ask = self.asks[0].price;
        if bid >= ask {
            return Err(ValidationError::CrossedBook { bid, ask });
        }
        Ok(())
    }

    /// Restores price ordering and keeps at most `levels` per side
    pub fn normalize(&mut self, levels: usize) {
        self.sort_levels();
        self.bids.truncate(levels);
        self.asks.truncate(levels);
    }

    fn sort_levels(&mut self) {
        self.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
    }

    /// Applies an incremental update. A level's new size replaces the old one; size 0 removes it.
    pub fn apply_delta(&mut self, delta: &OrderBookSnapshot) {
        apply_side(&mut self.bids, &delta.bids);
        apply_side(&mut self.asks, &delta.asks);
        self.sort_levels();
        self.timestamp = delta.timestamp;
        self.update_id = delta.update_id;
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    pub fn mid_price(&self) -> Option<f64> {
        let best_bid = self.best_bid()?;
        let best_ask = self.best_ask()?;
        Some((best_bid.price + best_ask.price) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        let best_bid = self.best_bid()?;
        let best_ask = self.best_ask()?;
        Some(best_ask.price - best_bid.price)
    }

    /// Depth, imbalance and sentiment over the top `depth` levels of each side
    pub fn metrics(&self, depth: usize) -> Option<BookMetrics> {
        let best_bid = self.best_bid()?.price;
        let best_ask = self.best_ask()?.price;
        let spread = best_ask - best_bid;

        let bid_volume: f64 = self.bids.iter().take(depth).map(|l| l.size).sum();
        let ask_volume: f64 = self.asks.iter().take(depth).map(|l| l.size).sum();
        let total = bid_volume + ask_volume;
        let imbalance = if total > 0.0 { (bid_volume - ask_volume) / total } else { 0.0 };

        let sentiment = if imbalance > 0.1 {
            BookSentiment::Bullish
        } else if imbalance < -0.1 {
            BookSentiment::Bearish
        } else {
            BookSentiment::Neutral
        };

        Some(BookMetrics {
            best_bid,
            best_ask,
            spread,
            spread_pct: if best_bid > 0.0 { spread / best_bid * 100.0 } else { 0.0 },
            mid_price: (best_bid + best_ask) / 2.0,
            bid_volume,
            ask_volume,
            imbalance,
            sentiment,
        })
    }
}

fn apply_side(levels: &mut Vec<BookLevel>, changes: &[BookLevel]) {
    for change in changes {
        levels.retain(|l| l.price != change.price);
        if change.size > 0.0 {
            levels.push(*change);
        }
    }
}

impl fmt::Display for OrderBookSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBookSnapshot(symbol={}, update_id={}, bids={}, asks={})",
            self.symbol, self.update_id, self.bids.len(), self.asks.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookMetrics {
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub mid_price: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
    /// (bid - ask) / (bid + ask), always within [-1, 1]
    pub imbalance: f64,
    pub sentiment: BookSentiment,
}

// ============================================================================
// Trade
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub id: String,
    pub timestamp: i64, // milliseconds
    pub price: f64,
    pub size: f64,
    pub side: Side,
    /// Set once on intake, relative to the trades recorded before it
    pub is_large: bool,
}

impl Trade {
    pub fn new(symbol: String, id: String, timestamp: i64, price: f64, size: f64, side: Side) -> Self {
        Self {
            symbol,
            id,
            timestamp,
            price,
            size,
            side,
            is_large: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_price(self.price, "trade.price")?;
        check_size(self.size, "trade.size")
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trade(symbol={}, id={}, price={:.2}, size={:.4}, side={})",
            self.symbol, self.id, self.price, self.size, self.side
        )
    }
}
