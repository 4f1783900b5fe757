// Market Data Store - single writer of all rolling market state for one symbol
// Bounded candle/trade/book-history buffers plus derived enrichment; readers get copies

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

use crate::core::config::StoreConfig;
use crate::core::types::{
    BookMetrics, Candle, CandleMetrics, OrderBookSnapshot, Side, Ticker, TickerUpdate, Trade,
    ValidationError,
};
use crate::layer2::price_levels::{self, PriceLevels};
use crate::layer2::volume_profile::{ProfileLevel, VolumeProfile};
use crate::layer3::signal_engine::SignalInput;

// ============================================================================
// Public views
// ============================================================================

/// What `on_kline` did with a candle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlineOutcome {
    /// New unconfirmed period
    Appended,
    /// Unconfirmed candle replaced in place
    Updated,
    /// Candle closed: enrichment ran and downstream should evaluate
    Confirmed,
    /// Duplicate of a confirmed candle or older than the last stored period
    Ignored,
}

/// Compact per-snapshot book record kept for trend metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookSummary {
    pub timestamp: i64,
    pub spread: f64,
    pub mid_price: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub imbalance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeFlowStats {
    pub trade_count: usize,
    pub buy_count: usize,
    pub sell_count: usize,
    /// Buys over all trades, 0..1
    pub buy_ratio: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// (buy - sell) / total volume, -1..1
    pub volume_imbalance: f64,
    pub avg_trade_size: f64,
    pub last_price: Option<f64>,
    pub large_trade_count: usize,
}

impl TradeFlowStats {
    pub fn from_trades<'a>(trades: impl Iterator<Item = &'a Trade>) -> Self {
        let mut stats = Self::default();
        for trade in trades {
            stats.trade_count += 1;
            match trade.side {
                Side::Buy => {
                    stats.buy_count += 1;
                    stats.buy_volume += trade.size;
                }
                Side::Sell => {
                    stats.sell_count += 1;
                    stats.sell_volume += trade.size;
                }
            }
            if trade.is_large {
                stats.large_trade_count += 1;
            }
            stats.last_price = Some(trade.price);
        }

        let total_volume = stats.buy_volume + stats.sell_volume;
        if stats.trade_count > 0 {
            stats.buy_ratio = stats.buy_count as f64 / stats.trade_count as f64;
            stats.avg_trade_size = total_volume / stats.trade_count as f64;
        }
        if total_volume > 0.0 {
            stats.volume_imbalance = (stats.buy_volume - stats.sell_volume) / total_volume;
        }
        stats
    }
}

/// Immutable, self-consistent copy of the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    /// Bumped on every accepted mutation
    pub sequence: u64,
    pub ticker: Option<Ticker>,
    /// Most recent candles, oldest first; the last one may be unconfirmed
    pub candles: Vec<Candle>,
    pub latest_candle_metrics: Option<CandleMetrics>,
    pub orderbook: Option<OrderBookSnapshot>,
    pub book_metrics: Option<BookMetrics>,
    pub book_history: Vec<BookSummary>,
    pub trades: Vec<Trade>,
    pub trade_flow: TradeFlowStats,
    pub volume_profile: Vec<ProfileLevel>,
    pub point_of_control: Option<ProfileLevel>,
    pub price_levels: PriceLevels,
}

impl MarketSnapshot {
    pub fn confirmed_candles(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter().filter(|c| c.confirmed)
    }

    /// Ticker last price, falling back to the latest candle close
    pub fn last_price(&self) -> Option<f64> {
        self.ticker
            .as_ref()
            .map(|t| t.last_price)
            .filter(|p| *p > 0.0)
            .or_else(|| self.candles.last().map(|c| c.close))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamQuality {
    pub stream: String,
    pub last_update_ms: Option<i64>,
    pub age_ms: Option<i64>,
    pub fresh: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataQualityReport {
    pub streams: Vec<StreamQuality>,
    /// Streams that have delivered at least once, over all four
    pub availability_score: f64,
    /// Confirmed candles over 50, capped at 1
    pub completeness: f64,
    pub confirmed_candles: usize,
}

impl DataQualityReport {
    pub fn stale_streams(&self) -> Vec<String> {
        self.streams
            .iter()
            .filter(|s| !s.fresh)
            .map(|s| s.stream.clone())
            .collect()
    }
}

/// Statistics snapshot from the market data store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketDataStoreStats {
    pub ticker_updates: u64,
    pub klines_received: u64,
    pub candles_confirmed: u64,
    pub klines_ignored: u64,
    pub orderbook_updates: u64,
    pub orderbook_deltas: u64,
    /// Deltas that arrived before any snapshot or carried an old update id
    pub deltas_skipped: u64,
    pub trades_received: u64,
    pub large_trades: u64,
    pub validation_failures: u64,
    pub candle_count: usize,
    pub trade_count: usize,
    pub book_history_len: usize,
    pub profile_levels: usize,
}

impl fmt::Display for MarketDataStoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MarketData(tickers={}, klines={}, confirmed={}, books={}, trades={}, invalid={})",
            self.ticker_updates, self.klines_received, self.candles_confirmed,
            self.orderbook_updates, self.trades_received, self.validation_failures
        )
    }
}

// ============================================================================
// Store
// ============================================================================

const COMPLETENESS_TARGET: f64 = 50.0;

#[derive(Debug, Default, Clone, Copy)]
struct LastUpdates {
    ticker: Option<i64>,
    candles: Option<i64>,
    orderbook: Option<i64>,
    trades: Option<i64>,
}

struct StoreState {
    ticker: Option<Ticker>,
    candles: VecDeque<Candle>,
    latest_candle_metrics: Option<CandleMetrics>,
    orderbook: Option<OrderBookSnapshot>,
    /// Untruncated book that deltas are applied to; `orderbook` is its top levels
    depth_book: Option<OrderBookSnapshot>,
    book_metrics: Option<BookMetrics>,
    book_history: VecDeque<BookSummary>,
    trades: VecDeque<Trade>,
    profile: VolumeProfile,
    levels: PriceLevels,
    last_updates: LastUpdates,
    stats: MarketDataStoreStats,
    sequence: u64,
}

impl StoreState {
    fn touch(&mut self) {
        self.sequence += 1;
    }

    fn confirmed(&self) -> Vec<Candle> {
        self.candles.iter().filter(|c| c.confirmed).cloned().collect()
    }
}

/// Thread-safe rolling state for one symbol. All intake goes through one lock.
pub struct MarketDataStore {
    symbol: String,
    config: StoreConfig,
    state: RwLock<StoreState>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl MarketDataStore {
    pub fn new(symbol: &str, config: StoreConfig) -> Self {
        let profile = VolumeProfile::new(
            config.profile_price_decimals,
            config.profile_max_levels,
            config.profile_retain_levels,
        );
        Self {
            symbol: symbol.to_uppercase(),
            state: RwLock::new(StoreState {
                ticker: None,
                candles: VecDeque::with_capacity(config.max_candles + 1),
                latest_candle_metrics: None,
                orderbook: None,
                depth_book: None,
                book_metrics: None,
                book_history: VecDeque::with_capacity(config.max_orderbook_history),
                trades: VecDeque::with_capacity(config.max_trades),
                profile,
                levels: PriceLevels::default(),
                last_updates: LastUpdates::default(),
                stats: MarketDataStoreStats::default(),
                sequence: 0,
            }),
            config,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ValidationError> {
        if symbol.eq_ignore_ascii_case(&self.symbol) {
            Ok(())
        } else {
            Err(ValidationError::SymbolMismatch {
                expected: self.symbol.clone(),
                actual: symbol.to_string(),
            })
        }
    }

    fn reject(&self, err: ValidationError) -> ValidationError {
        self.state.write().stats.validation_failures += 1;
        warn!(symbol = %self.symbol, error = %err, "Rejected market data");
        err
    }

    // ------------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------------

    pub fn on_ticker(&self, update: &TickerUpdate) -> Result<(), ValidationError> {
        if let Err(e) = self.check_symbol(&update.symbol).and_then(|_| update.validate()) {
            return Err(self.reject(e));
        }

        let mut state = self.state.write();
        state.ticker.get_or_insert_with(Ticker::default).merge(update);
        state.last_updates.ticker = Some(now_ms());
        state.stats.ticker_updates += 1;
        state.touch();
        Ok(())
    }

    pub fn on_kline(&self, candle: Candle) -> Result<KlineOutcome, ValidationError> {
        if let Err(e) = self
            .check_symbol(&candle.symbol)
            .and_then(|_| candle.validate())
        {
            return Err(self.reject(e));
        }

        let mut state = self.state.write();
        state.stats.klines_received += 1;

        let last = state.candles.back().map(|c| (c.start_time, c.confirmed));
        let outcome = match last {
            Some((start, true)) if start == candle.start_time => KlineOutcome::Ignored,
            Some((start, _)) if start > candle.start_time => KlineOutcome::Ignored,
            Some((start, false)) if start == candle.start_time => {
                state.candles.pop_back();
                KlineOutcome::Updated
            }
            Some((start, false)) => {
                // its close was never delivered
                debug!(start = start, "Dropping unconfirmed candle superseded by a newer period");
                state.candles.pop_back();
                KlineOutcome::Appended
            }
            _ => KlineOutcome::Appended,
        };

        if outcome == KlineOutcome::Ignored {
            state.stats.klines_ignored += 1;
            debug!(start = candle.start_time, confirmed = candle.confirmed, "Ignoring kline update");
            return Ok(outcome);
        }

        let confirmed = candle.confirmed;
        state.candles.push_back(candle);
        state.last_updates.candles = Some(now_ms());
        state.touch();

        if !confirmed {
            return Ok(outcome);
        }

        while state.candles.len() > self.config.max_candles {
            state.candles.pop_front();
        }
        state.latest_candle_metrics = state.candles.back().map(Candle::metrics);
        let confirmed_candles = state.confirmed();
        state.levels = price_levels::detect(
            &confirmed_candles,
            self.config.swing_lookback,
            self.config.level_proximity,
            self.config.max_price_levels,
        );
        state.stats.candles_confirmed += 1;

        if let Some(last) = state.candles.back() {
            debug!(candle = %last, "Candle confirmed");
        }
        Ok(KlineOutcome::Confirmed)
    }

    /// Replace the whole book with a snapshot
    pub fn on_orderbook(&self, book: OrderBookSnapshot) -> Result<(), ValidationError> {
        let mut view = book.clone();
        view.normalize(self.config.book_levels);
        if let Err(e) = self.check_symbol(&book.symbol).and_then(|_| view.validate()) {
            return Err(self.reject(e));
        }

        let mut depth = book;
        depth.normalize(usize::MAX);
        let mut state = self.state.write();
        self.install_book(&mut state, depth, view);
        Ok(())
    }

    /// Apply changed levels onto the stored book; size 0 removes a level
    pub fn on_orderbook_delta(&self, delta: OrderBookSnapshot) -> Result<(), ValidationError> {
        self.check_symbol(&delta.symbol).map_err(|e| self.reject(e))?;

        let mut state = self.state.write();
        let stored_id = state.depth_book.as_ref().map(|b| b.update_id);
        let mut depth = match state.depth_book.clone() {
            Some(current) if delta.update_id > current.update_id => current,
            _ => {
                state.stats.deltas_skipped += 1;
                debug!(update_id = delta.update_id, stored = ?stored_id, "Skipping order book delta");
                return Ok(());
            }
        };
        depth.apply_delta(&delta);

        let mut view = depth.clone();
        view.normalize(self.config.book_levels);
        if let Err(e) = view.validate() {
            state.stats.validation_failures += 1;
            warn!(symbol = %self.symbol, error = %e, "Rejected order book delta");
            return Err(e);
        }

        state.stats.orderbook_deltas += 1;
        self.install_book(&mut state, depth, view);
        Ok(())
    }

    fn install_book(&self, state: &mut StoreState, depth: OrderBookSnapshot, view: OrderBookSnapshot) {
        let metrics = view.metrics(self.config.imbalance_depth);
        if let Some(m) = &metrics {
            state.book_history.push_back(BookSummary {
                timestamp: view.timestamp,
                spread: m.spread,
                mid_price: m.mid_price,
                bid_volume: m.bid_volume,
                ask_volume: m.ask_volume,
                imbalance: m.imbalance,
            });
            while state.book_history.len() > self.config.max_orderbook_history {
                state.book_history.pop_front();
            }
        }

        state.profile.add_book(&view, self.config.book_levels);
        state.book_metrics = metrics;
        state.orderbook = Some(view);
        state.depth_book = Some(depth);
        state.last_updates.orderbook = Some(now_ms());
        state.stats.orderbook_updates += 1;
        state.touch();
    }

    /// Store a trade batch; invalid trades are dropped individually. Returns how many were stored.
    pub fn on_trades(&self, trades: Vec<Trade>) -> usize {
        let mut stored = 0;
        let mut state = self.state.write();

        for mut trade in trades {
            if let Err(e) = self.check_symbol(&trade.symbol).and_then(|_| trade.validate()) {
                state.stats.validation_failures += 1;
                warn!(symbol = %self.symbol, error = %e, "Rejected trade");
                continue;
            }

            // averaged on demand over what is stored right now
            let window = self.config.large_trade_window.min(state.trades.len());
            if window > 0 {
                let mean = state.trades.iter().rev().take(window).map(|t| t.size).sum::<f64>() / window as f64;
                trade.is_large = trade.size > mean * self.config.large_trade_multiplier;
            }
            if trade.is_large {
                state.stats.large_trades += 1;
                debug!(trade = %trade, "Large trade");
            }

            state.trades.push_back(trade);
            while state.trades.len() > self.config.max_trades {
                state.trades.pop_front();
            }
            stored += 1;
        }

        if stored > 0 {
            state.stats.trades_received += stored as u64;
            state.last_updates.trades = Some(now_ms());
            state.touch();
        }
        stored
    }

    /// Forget the in-flight candle, e.g. after the stream dropped
    pub fn drop_unconfirmed(&self) -> bool {
        let mut state = self.state.write();
        if state.candles.back().is_some_and(|c| !c.confirmed) {
            state.candles.pop_back();
            state.touch();
            return true;
        }
        false
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> MarketSnapshot {
        let state = self.state.read();

        let candle_skip = state.candles.len().saturating_sub(self.config.snapshot_candles);
        let trade_skip = state.trades.len().saturating_sub(self.config.snapshot_trades);
        let flow_skip = state.trades.len().saturating_sub(self.config.trade_stats_window);

        MarketSnapshot {
            symbol: self.symbol.clone(),
            sequence: state.sequence,
            ticker: state.ticker.clone(),
            candles: state.candles.iter().skip(candle_skip).cloned().collect(),
            latest_candle_metrics: state.latest_candle_metrics.clone(),
            orderbook: state.orderbook.clone(),
            book_metrics: state.book_metrics.clone(),
            book_history: state.book_history.iter().cloned().collect(),
            trades: state.trades.iter().skip(trade_skip).cloned().collect(),
            trade_flow: TradeFlowStats::from_trades(state.trades.iter().skip(flow_skip)),
            volume_profile: state.profile.levels(),
            point_of_control: state.profile.point_of_control(),
            price_levels: state.levels.clone(),
        }
    }

    /// Last `limit` confirmed candles plus current book imbalance
    pub fn signal_input(&self, limit: usize) -> SignalInput {
        let state = self.state.read();
        let confirmed: Vec<&Candle> = state.candles.iter().filter(|c| c.confirmed).collect();
        let skip = confirmed.len().saturating_sub(limit);
        SignalInput {
            candles: confirmed.into_iter().skip(skip).cloned().collect(),
            book_imbalance: state.book_metrics.as_ref().map(|m| m.imbalance),
        }
    }

    pub fn confirmed_count(&self) -> usize {
        self.state.read().candles.iter().filter(|c| c.confirmed).count()
    }

    pub fn quality_report(&self, now_ms: i64) -> DataQualityReport {
        let state = self.state.read();
        let freshness_ms = self.config.freshness_secs as i64 * 1000;
        let updates = state.last_updates;

        let streams: Vec<StreamQuality> = [
            ("ticker", updates.ticker),
            ("candles", updates.candles),
            ("orderbook", updates.orderbook),
            ("trades", updates.trades),
        ]
        .into_iter()
        .map(|(name, last)| {
            let age = last.map(|t| (now_ms - t).max(0));
            StreamQuality {
                stream: name.to_string(),
                last_update_ms: last,
                age_ms: age,
                fresh: age.is_some_and(|a| a < freshness_ms),
            }
        })
        .collect();

        let available = streams.iter().filter(|s| s.last_update_ms.is_some()).count();
        let confirmed = state.candles.iter().filter(|c| c.confirmed).count();

        DataQualityReport {
            availability_score: available as f64 / streams.len() as f64,
            completeness: (confirmed as f64 / COMPLETENESS_TARGET).min(1.0),
            confirmed_candles: confirmed,
            streams,
        }
    }

    /// Drop candles, trades and book summaries older than `cutoff_ms`
    pub fn prune_older_than(&self, cutoff_ms: i64) -> usize {
        let mut state = self.state.write();
        let before = state.candles.len() + state.trades.len() + state.book_history.len();

        state.candles.retain(|c| c.start_time >= cutoff_ms);
        state.trades.retain(|t| t.timestamp >= cutoff_ms);
        state.book_history.retain(|b| b.timestamp >= cutoff_ms);

        let removed = before - (state.candles.len() + state.trades.len() + state.book_history.len());
        if removed > 0 {
            let confirmed_candles = state.confirmed();
            state.levels = price_levels::detect(
                &confirmed_candles,
                self.config.swing_lookback,
                self.config.level_proximity,
                self.config.max_price_levels,
            );
            state.touch();
            info!(symbol = %self.symbol, removed = removed, "Pruned old market data");
        }
        removed
    }

    pub fn get_stats(&self) -> MarketDataStoreStats {
        let state = self.state.read();
        MarketDataStoreStats {
            candle_count: state.candles.len(),
            trade_count: state.trades.len(),
            book_history_len: state.book_history.len(),
            profile_levels: state.profile.len(),
            ..state.stats.clone()
        }
    }
}

impl fmt::Display for MarketDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.get_stats();
        write!(f, "MarketDataStore({}, {})", self.symbol, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BookLevel;

    fn make_store() -> MarketDataStore {
        MarketDataStore::new("BTCUSDT", StoreConfig::default())
    }

    fn make_candle(start: i64, close: f64, confirmed: bool) -> Candle {
        Candle::new(
            "BTCUSDT".to_string(),
            start,
            "5".to_string(),
            close,
            close + 1.0,
            close - 1.0,
            close,
            10.0,
            confirmed,
        )
    }

    fn make_trade(id: u32, size: f64, side: Side) -> Trade {
        Trade::new("BTCUSDT".to_string(), format!("t{}", id), id as i64, 100.0, size, side)
    }

    fn make_book(bid_size: f64, ask_size: f64) -> OrderBookSnapshot {
        OrderBookSnapshot::new(
            "BTCUSDT".to_string(),
            vec![BookLevel::new(99.5, bid_size), BookLevel::new(99.0, 1.0)],
            vec![BookLevel::new(100.5, ask_size), BookLevel::new(101.0, 1.0)],
            1000,
            1,
        )
    }

    #[test]
    fn test_unconfirmed_updates_in_place() {
        let store = make_store();
        assert_eq!(store.on_kline(make_candle(0, 100.0, false)), Ok(KlineOutcome::Appended));
        assert_eq!(store.on_kline(make_candle(0, 101.0, false)), Ok(KlineOutcome::Updated));
        assert_eq!(store.confirmed_count(), 0);
        assert_eq!(store.snapshot().candles.len(), 1);

        assert_eq!(store.on_kline(make_candle(0, 102.0, true)), Ok(KlineOutcome::Confirmed));
        // confirmed candles are immutable
        assert_eq!(store.on_kline(make_candle(0, 103.0, true)), Ok(KlineOutcome::Ignored));
        assert_eq!(store.on_kline(make_candle(-300_000, 99.0, true)), Ok(KlineOutcome::Ignored));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.candles.len(), 1);
        assert_eq!(snapshot.candles[0].close, 102.0);
        assert_eq!(snapshot.latest_candle_metrics.map(|m| m.start_time), Some(0));
    }

    #[test]
    fn test_invalid_candle_rejected_before_storage() {
        let store = make_store();
        let mut bad = make_candle(0, 100.0, true);
        bad.high = 99.0;
        assert!(matches!(store.on_kline(bad), Err(ValidationError::Ohlc { .. })));

        let mut other = make_candle(0, 100.0, true);
        other.symbol = "ETHUSDT".to_string();
        assert!(matches!(store.on_kline(other), Err(ValidationError::SymbolMismatch { .. })));

        assert_eq!(store.snapshot().candles.len(), 0);
        assert_eq!(store.get_stats().validation_failures, 2);
    }

    #[test]
    fn test_candle_buffer_fifo_eviction() {
        let config = StoreConfig {
            max_candles: 5,
            ..Default::default()
        };
        let store = MarketDataStore::new("BTCUSDT", config);
        for i in 0..6 {
            store.on_kline(make_candle(i * 300_000, 100.0 + i as f64, true)).unwrap();
        }

        let candles = store.snapshot().candles;
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].start_time, 300_000);
        assert_eq!(candles[4].close, 105.0);
    }

    #[test]
    fn test_trade_buffer_fifo_and_large_flag() {
        let config = StoreConfig {
            max_trades: 5,
            ..Default::default()
        };
        let store = MarketDataStore::new("BTCUSDT", config);
        let batch: Vec<Trade> = (0..5).map(|i| make_trade(i, 1.0, Side::Buy)).collect();
        assert_eq!(store.on_trades(batch), 5);
        assert_eq!(store.on_trades(vec![make_trade(5, 2.5, Side::Sell)]), 1);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.trades.len(), 5);
        assert_eq!(snapshot.trades[0].id, "t1");
        assert!(snapshot.trades[4].is_large);
        assert!(!snapshot.trades[0].is_large);

        let flow = &snapshot.trade_flow;
        assert_eq!(flow.trade_count, 5);
        assert_eq!(flow.sell_count, 1);
        assert_eq!(flow.large_trade_count, 1);
        assert!((flow.buy_ratio - 0.8).abs() < 1e-12);
        assert!((flow.volume_imbalance - (4.0 - 2.5) / 6.5).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_trade_dropped_from_batch() {
        let store = make_store();
        let mut bad = make_trade(1, 1.0, Side::Buy);
        bad.price = -1.0;
        assert_eq!(store.on_trades(vec![bad, make_trade(2, 1.0, Side::Sell)]), 1);
        assert_eq!(store.get_stats().validation_failures, 1);
    }

    #[test]
    fn test_orderbook_history_fifo_and_metrics() {
        let config = StoreConfig {
            max_orderbook_history: 3,
            ..Default::default()
        };
        let store = MarketDataStore::new("BTCUSDT", config);
        for i in 0..4 {
            let mut book = make_book(3.0, 1.0);
            book.timestamp = i;
            store.on_orderbook(book).unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.book_history.len(), 3);
        assert_eq!(snapshot.book_history[0].timestamp, 1);

        let metrics = snapshot.book_metrics.unwrap();
        assert_eq!(metrics.spread, 1.0);
        // (4 - 2) / 6
        assert!((metrics.imbalance - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(store.signal_input(50).book_imbalance, Some(metrics.imbalance));
        assert_eq!(snapshot.point_of_control.map(|l| l.price), Some(99.5));
    }

    #[test]
    fn test_crossed_book_rejected() {
        let store = make_store();
        let mut book = make_book(1.0, 1.0);
        book.asks = vec![BookLevel::new(99.0, 1.0)];
        assert!(matches!(store.on_orderbook(book), Err(ValidationError::CrossedBook { .. })));
        assert!(store.snapshot().orderbook.is_none());
    }

    fn make_delta(update_id: u64, bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> OrderBookSnapshot {
        OrderBookSnapshot::new("BTCUSDT".to_string(), bids, asks, 2000 + update_id as i64, update_id)
    }

    #[test]
    fn test_orderbook_delta_patches_stored_book() {
        let store = make_store();
        let snapshot = OrderBookSnapshot::new(
            "BTCUSDT".to_string(),
            vec![BookLevel::new(100.0, 2.0), BookLevel::new(99.0, 2.0), BookLevel::new(98.0, 2.0)],
            vec![BookLevel::new(101.0, 2.0), BookLevel::new(102.0, 2.0), BookLevel::new(103.0, 2.0)],
            1000,
            1,
        );
        store.on_orderbook(snapshot).unwrap();
        assert_eq!(store.snapshot().book_metrics.unwrap().imbalance, 0.0);

        store
            .on_orderbook_delta(make_delta(2, vec![BookLevel::new(99.0, 6.0)], vec![BookLevel::new(103.0, 0.1)]))
            .unwrap();
        let book = store.snapshot().orderbook.unwrap();
        assert_eq!(book.bids.len(), 3);
        assert_eq!(book.asks.len(), 3);
        assert_eq!(book.bids[1], BookLevel::new(99.0, 6.0));
        assert_eq!(book.asks[2], BookLevel::new(103.0, 0.1));
        assert_eq!(book.update_id, 2);
        // (10 - 4.1) / 14.1
        let imbalance = store.snapshot().book_metrics.unwrap().imbalance;
        assert!((imbalance - 5.9 / 14.1).abs() < 1e-12);

        // one-sided delta removing the best ask
        store
            .on_orderbook_delta(make_delta(3, vec![], vec![BookLevel::new(101.0, 0.0)]))
            .unwrap();
        let snapshot = store.snapshot();
        let book = snapshot.orderbook.unwrap();
        assert_eq!(book.bids.len(), 3);
        assert_eq!(book.asks[0].price, 102.0);
        assert_eq!(snapshot.book_history.len(), 3);

        let stats = store.get_stats();
        assert_eq!(stats.validation_failures, 0);
        assert_eq!(stats.orderbook_deltas, 2);
        assert_eq!(stats.orderbook_updates, 3);
    }

    #[test]
    fn test_orderbook_delta_keeps_levels_beyond_view() {
        let config = StoreConfig {
            book_levels: 1,
            ..Default::default()
        };
        let store = MarketDataStore::new("BTCUSDT", config);
        store.on_orderbook(make_book(1.0, 1.0)).unwrap();
        assert_eq!(store.snapshot().orderbook.unwrap().asks.len(), 1);

        store
            .on_orderbook_delta(make_delta(2, vec![], vec![BookLevel::new(100.5, 0.0)]))
            .unwrap();
        // the second ask level surfaces once the first is removed
        assert_eq!(store.snapshot().orderbook.unwrap().asks, vec![BookLevel::new(101.0, 1.0)]);
    }

    #[test]
    fn test_orderbook_delta_skipped_without_base_or_when_stale() {
        let store = make_store();
        let delta = make_delta(5, vec![BookLevel::new(99.5, 1.0)], vec![]);
        store.on_orderbook_delta(delta.clone()).unwrap();
        assert!(store.snapshot().orderbook.is_none());

        store.on_orderbook(make_delta(6, vec![BookLevel::new(99.5, 1.0)], vec![BookLevel::new(100.5, 1.0)])).unwrap();
        store.on_orderbook_delta(delta).unwrap();
        assert_eq!(store.snapshot().orderbook.unwrap().update_id, 6);

        let stats = store.get_stats();
        assert_eq!(stats.deltas_skipped, 2);
        assert_eq!(stats.orderbook_updates, 1);
    }

    #[test]
    fn test_orderbook_delta_that_crosses_is_rejected() {
        let store = make_store();
        store.on_orderbook(make_book(1.0, 1.0)).unwrap();
        let crossing = make_delta(2, vec![BookLevel::new(100.7, 1.0)], vec![]);
        assert!(matches!(store.on_orderbook_delta(crossing), Err(ValidationError::CrossedBook { .. })));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.orderbook.unwrap().bids[0].price, 99.5);
        assert_eq!(store.get_stats().validation_failures, 1);
    }

    #[test]
    fn test_ticker_with_bad_price_rejected() {
        let store = make_store();
        let bad = TickerUpdate {
            symbol: "BTCUSDT".to_string(),
            last_price: Some(-5.0),
            ..Default::default()
        };
        assert_eq!(store.on_ticker(&bad), Err(ValidationError::BadValue("ticker.last_price")));
        assert!(store.snapshot().ticker.is_none());
        assert_eq!(store.get_stats().validation_failures, 1);
        assert_eq!(store.get_stats().ticker_updates, 0);
    }

    #[test]
    fn test_ticker_merge() {
        let store = make_store();
        store
            .on_ticker(&TickerUpdate {
                symbol: "BTCUSDT".to_string(),
                last_price: Some(100.0),
                bid_price: Some(99.9),
                ..Default::default()
            })
            .unwrap();
        store
            .on_ticker(&TickerUpdate {
                symbol: "BTCUSDT".to_string(),
                ask_price: Some(100.1),
                ..Default::default()
            })
            .unwrap();

        let ticker = store.snapshot().ticker.unwrap();
        assert_eq!(ticker.last_price, 100.0);
        assert_eq!(ticker.bid_price, 99.9);
        assert_eq!(ticker.ask_price, 100.1);
    }

    #[test]
    fn test_snapshot_is_stable_without_mutation() {
        let store = make_store();
        store.on_kline(make_candle(0, 100.0, true)).unwrap();
        store.on_orderbook(make_book(2.0, 1.0)).unwrap();
        store.on_trades(vec![make_trade(1, 1.0, Side::Buy)]);

        let first = store.snapshot();
        let second = store.snapshot();
        assert_eq!(first, second);

        store.on_kline(make_candle(300_000, 101.0, false)).unwrap();
        let third = store.snapshot();
        assert_ne!(first, third);
        assert!(third.sequence > first.sequence);
    }

    #[test]
    fn test_signal_input_only_confirmed() {
        let store = make_store();
        for i in 0..4 {
            store.on_kline(make_candle(i * 300_000, 100.0, true)).unwrap();
        }
        store.on_kline(make_candle(4 * 300_000, 100.0, false)).unwrap();

        let input = store.signal_input(3);
        assert_eq!(input.candles.len(), 3);
        assert!(input.candles.iter().all(|c| c.confirmed));
        assert_eq!(input.candles[0].start_time, 300_000);

        assert!(store.drop_unconfirmed());
        assert!(!store.drop_unconfirmed());
    }

    #[test]
    fn test_quality_report_and_pruning() {
        let store = make_store();
        store.on_kline(make_candle(0, 100.0, true)).unwrap();
        store.on_kline(make_candle(300_000, 100.0, true)).unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        let report = store.quality_report(now);
        assert_eq!(report.availability_score, 0.25);
        assert_eq!(report.confirmed_candles, 2);
        assert!((report.completeness - 0.04).abs() < 1e-12);
        assert_eq!(report.stale_streams(), vec!["ticker", "orderbook", "trades"]);

        let later = store.quality_report(now + 120_000);
        assert_eq!(later.stale_streams().len(), 4);

        assert_eq!(store.prune_older_than(300_000), 1);
        assert_eq!(store.confirmed_count(), 1);
    }
}
