// Market Events - typed output of the stream session
// One variant per subscribed topic family, delivered to a single handler

use serde::Serialize;
use std::fmt;

use crate::core::types::{Candle, OrderBookSnapshot, Trade, TickerUpdate};

// ============================================================================
// Event Kind
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Ticker,
    Kline,
    OrderBook,
    Trades,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Market Event
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarketEvent {
    Ticker(TickerUpdate),
    Klines(Vec<Candle>),
    OrderBook(OrderBookSnapshot),
    /// Changed levels only; size 0 marks a removed level
    OrderBookDelta(OrderBookSnapshot),
    Trades(Vec<Trade>),
}

impl MarketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MarketEvent::Ticker(_) => EventKind::Ticker,
            MarketEvent::Klines(_) => EventKind::Kline,
            MarketEvent::OrderBook(_) | MarketEvent::OrderBookDelta(_) => EventKind::OrderBook,
            MarketEvent::Trades(_) => EventKind::Trades,
        }
    }
}

impl fmt::Display for MarketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketEvent::Ticker(t) => write!(f, "MarketEvent(ticker, symbol={})", t.symbol),
            MarketEvent::Klines(k) => write!(f, "MarketEvent(kline, count={})", k.len()),
            MarketEvent::OrderBook(b) => write!(f, "MarketEvent({})", b),
            MarketEvent::OrderBookDelta(b) => write!(f, "MarketEvent(delta, {})", b),
            MarketEvent::Trades(t) => write!(f, "MarketEvent(trades, count={})", t.len()),
        }
    }
}

// ============================================================================
// Handler capability
// ============================================================================

/// Downstream consumer of decoded events.
///
/// Called inline from the session's read loop, so implementations must not block
/// on network I/O.
pub trait MarketEventHandler: Send + Sync {
    fn on_event(&self, event: MarketEvent);

    /// The session re-established its connection after a failure
    fn on_reconnect(&self) {}
}
