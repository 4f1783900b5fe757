// Integrated Pipeline - stream events -> market data store -> signal engine -> sink
// Implements the session's event handler; signal evaluation runs on candle confirmation

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::config::AppConfig;
use crate::core::events::{MarketEvent, MarketEventHandler};
use crate::layer1::websocket::StreamSession;
use crate::layer2::market_data_store::{
    KlineOutcome, MarketDataStore, MarketDataStoreStats, MarketSnapshot,
};
use crate::layer2::metrics::UnifiedMetrics;
use crate::layer3::analysis::AnalysisRequest;
use crate::layer3::indicators::IndicatorSnapshot;
use crate::layer3::signal_engine::{ConditionReport, EngineStats, Signal, SignalEngine};
use crate::layer3::sink::{ChannelSink, SignalSink};

const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Pipeline statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub symbol: String,
    pub timeframe: String,
    pub events_processed: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub signals_emitted: u64,
    pub last_signal_id: Option<String>,
    pub market_data: MarketDataStoreStats,
    pub engine: EngineStats,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline(symbol={}, timeframe={}, processed={}, signals={}, errors={})",
            self.symbol, self.timeframe, self.events_processed, self.signals_emitted, self.errors
        )
    }
}

/// One symbol, one timeframe. Shared with the session as its event handler.
pub struct MarketPipeline {
    symbol: String,
    timeframe: String,
    analysis_window: usize,
    retention: chrono::Duration,

    // Components
    store: Arc<MarketDataStore>,
    engine: Mutex<SignalEngine>,
    signals: Mutex<Option<mpsc::Receiver<Signal>>>,

    // State
    events_processed: RwLock<u64>,
    errors: RwLock<u64>,
    reconnects: RwLock<u64>,
    last_signal_id: RwLock<Option<String>>,
}

impl MarketPipeline {
    /// Pipeline whose signals are read through `subscribe_signals()`
    pub fn new(config: &AppConfig) -> Self {
        let (sink, rx) = ChannelSink::new(SIGNAL_CHANNEL_CAPACITY);
        let pipeline = Self::with_sink(config, Arc::new(sink));
        *pipeline.signals.lock() = Some(rx);
        pipeline
    }

    /// Pipeline publishing into a caller-provided sink
    pub fn with_sink(config: &AppConfig, sink: Arc<dyn SignalSink>) -> Self {
        let symbol = config.stream.symbol.to_uppercase();
        let timeframe = config.stream.timeframe.clone();
        info!(symbol = %symbol, timeframe = %timeframe, "Creating Market Pipeline");

        let engine = SignalEngine::new(&symbol, &timeframe, config.strategy.clone()).with_sink(sink);

        Self {
            store: Arc::new(MarketDataStore::new(&symbol, config.store.clone())),
            engine: Mutex::new(engine),
            signals: Mutex::new(None),
            analysis_window: config.strategy.analysis_window,
            retention: chrono::Duration::hours(config.store.data_retention_hours as i64),
            events_processed: RwLock::new(0),
            errors: RwLock::new(0),
            reconnects: RwLock::new(0),
            last_signal_id: RwLock::new(None),
            symbol,
            timeframe,
        }
    }

    /// Receiver for emitted signals. Only the first caller gets it.
    pub fn subscribe_signals(&self) -> Option<mpsc::Receiver<Signal>> {
        self.signals.lock().take()
    }

    /// Route one decoded event. Returns the signals it produced.
    pub fn process_event_at(&self, event: MarketEvent, now: DateTime<Utc>) -> Vec<Signal> {
        *self.events_processed.write() += 1;
        let mut emitted = Vec::new();

        match event {
            MarketEvent::Ticker(update) => {
                if self.store.on_ticker(&update).is_err() {
                    *self.errors.write() += 1;
                }
            }
            MarketEvent::Klines(candles) => {
                for candle in candles {
                    match self.store.on_kline(candle) {
                        Ok(KlineOutcome::Confirmed) => {
                            if let Some(signal) = self.evaluate(now) {
                                emitted.push(signal);
                            }
                        }
                        Ok(_) => {}
                        Err(_) => *self.errors.write() += 1,
                    }
                }
            }
            MarketEvent::OrderBook(book) => {
                if self.store.on_orderbook(book).is_err() {
                    *self.errors.write() += 1;
                }
            }
            MarketEvent::OrderBookDelta(delta) => {
                if self.store.on_orderbook_delta(delta).is_err() {
                    *self.errors.write() += 1;
                }
            }
            MarketEvent::Trades(trades) => {
                let received = trades.len();
                let stored = self.store.on_trades(trades);
                if stored < received {
                    *self.errors.write() += (received - stored) as u64;
                }
            }
        }

        emitted
    }

    // The store lock is released before the engine runs
    fn evaluate(&self, now: DateTime<Utc>) -> Option<Signal> {
        let input = self.store.signal_input(self.analysis_window);
        let signal = self.engine.lock().evaluate(&input, now)?;
        *self.last_signal_id.write() = Some(signal.id.clone());
        Some(signal)
    }

    /// Drop market data and signal history past the retention window
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let removed = self.store.prune_older_than(cutoff.timestamp_millis());
        let cleared = self.engine.lock().clear_older_than(self.retention, now);
        debug!(symbol = %self.symbol, removed = removed, cleared = cleared, "Retention pass");
        removed + cleared
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        self.store.snapshot()
    }

    pub fn recent_signals(&self, limit: usize) -> Vec<Signal> {
        self.engine.lock().recent_signals(limit)
    }

    pub fn validate_conditions(&self, now: DateTime<Utc>) -> ConditionReport {
        let quality = self.store.quality_report(now.timestamp_millis());
        let stale = quality.stale_streams();
        self.engine
            .lock()
            .validate_conditions(quality.confirmed_candles, &stale, now)
    }

    /// Read-only bundle for the market analyst, taken from one store snapshot
    pub fn analysis_request(&self, now: DateTime<Utc>) -> AnalysisRequest {
        let market = self.store.snapshot();
        let quality = self.store.quality_report(now.timestamp_millis());

        let confirmed: Vec<_> = market.confirmed_candles().cloned().collect();
        let skip = confirmed.len().saturating_sub(self.analysis_window);

        let engine = self.engine.lock();
        let indicators = IndicatorSnapshot::compute(&confirmed[skip..], engine.config());
        let signal_stats = engine.statistics(now);
        drop(engine);

        AnalysisRequest {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            generated_at: now,
            market,
            indicators,
            signal_stats,
            quality,
        }
    }

    /// Get pipeline statistics
    pub fn stats(&self) -> PipelineStats {
        let engine = self.engine.lock().stats();
        PipelineStats {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            events_processed: *self.events_processed.read(),
            errors: *self.errors.read(),
            reconnects: *self.reconnects.read(),
            signals_emitted: engine.emitted,
            last_signal_id: self.last_signal_id.read().clone(),
            market_data: self.store.get_stats(),
            engine,
        }
    }

    /// Collect unified metrics from all components
    pub fn collect_metrics(&self, session: Option<&StreamSession>) -> UnifiedMetrics {
        UnifiedMetrics::from_stats(
            session.map(|s| s.stats()),
            session.map(|s| s.parser_stats()),
            Some(self.store.get_stats()),
            Some(self.engine.lock().stats()),
        )
    }
}

impl MarketEventHandler for MarketPipeline {
    fn on_event(&self, event: MarketEvent) {
        for signal in self.process_event_at(event, Utc::now()) {
            debug!(id = %signal.id, "Signal handed to sink");
        }
    }

    fn on_reconnect(&self) {
        if self.store.drop_unconfirmed() {
            warn!(symbol = %self.symbol, "Dropped in-flight candle after reconnect");
        }
        self.engine.lock().note_reconnect();
        *self.reconnects.write() += 1;
    }
}

impl fmt::Display for MarketPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stats())
    }
}
