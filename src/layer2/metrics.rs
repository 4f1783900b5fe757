// Unified Metrics - Collects and formats stats from all pipeline components
// Aggregates existing per-component stats into a single view

use std::fmt;
use tracing::info;

use crate::layer1::parser::ParserStats;
use crate::layer1::websocket::SessionStats;
use crate::layer2::market_data_store::MarketDataStoreStats;
use crate::layer3::signal_engine::EngineStats;

/// Unified metrics snapshot from all pipeline components
#[derive(Debug, Clone)]
pub struct UnifiedMetrics {
    pub session: Option<SessionStats>,
    pub parser: Option<ParserStats>,
    pub market_data: Option<MarketDataStoreStats>,
    pub engine: Option<EngineStats>,
}

impl UnifiedMetrics {
    pub fn from_stats(
        session: Option<SessionStats>,
        parser: Option<ParserStats>,
        market_data: Option<MarketDataStoreStats>,
        engine: Option<EngineStats>,
    ) -> Self {
        Self { session, parser, market_data, engine }
    }

    /// Total frames received by the session
    pub fn total_messages(&self) -> u64 {
        self.session.as_ref().map(|s| s.messages_received).unwrap_or(0)
    }

    pub fn total_parsed(&self) -> u64 {
        self.parser.as_ref().map(|p| p.messages_parsed).unwrap_or(0)
    }

    pub fn total_signals(&self) -> u64 {
        self.engine.as_ref().map(|e| e.emitted).unwrap_or(0)
    }

    /// Total errors across all components
    pub fn total_errors(&self) -> u64 {
        let parse_errs = self.parser.as_ref().map(|p| p.parse_errors).unwrap_or(0);
        let transport_errs = self.session.as_ref().map(|s| s.transport_errors).unwrap_or(0);
        let rejected = self.market_data.as_ref().map(|m| m.validation_failures).unwrap_or(0);
        let sink_errs = self.engine.as_ref().map(|e| e.sink_errors).unwrap_or(0);
        parse_errs + transport_errs + rejected + sink_errs
    }

    /// Print detailed multi-line report
    pub fn print_report(&self) {
        info!("=== UNIFIED METRICS ===");

        if let Some(s) = &self.session {
            info!("  Session:      connections={} msgs={} events={} reconnects={} transport_errs={}",
                s.connections, s.messages_received, s.events_delivered, s.reconnects, s.transport_errors);
            info!("                pings={} heartbeats={}", s.pings_answered, s.heartbeats_sent);
        }

        if let Some(p) = &self.parser {
            info!("  Parser:       parsed={} errs={} unknown={} error_rate={:.2}%",
                p.messages_parsed, p.parse_errors, p.unknown_topics, p.error_rate() * 100.0);
            info!("                tickers={} klines={} books={} trades={}",
                p.ticker_count, p.kline_count, p.orderbook_count, p.trade_count);
        }

        if let Some(md) = &self.market_data {
            info!("  Market Data:  candles={} (confirmed {}) trades={} (large {}) books={}",
                md.candle_count, md.candles_confirmed, md.trade_count, md.large_trades, md.orderbook_updates);
            info!("                deltas={} deltas_skipped={} profile_levels={} rejected={}",
                md.orderbook_deltas, md.deltas_skipped, md.profile_levels, md.validation_failures);
        }

        if let Some(e) = &self.engine {
            info!("  Signals:      evaluated={} emitted={} holds={} low_conf={} cooldown={} sink_errs={}",
                e.evaluations, e.emitted, e.holds, e.below_confidence, e.cooldown_skips, e.sink_errors);
        }
    }

    /// Print compact single-line stats for periodic logging
    pub fn print_compact(&self, elapsed_secs: u64) {
        let klines = self.parser.as_ref().map(|p| p.kline_count).unwrap_or(0);
        let books = self.parser.as_ref().map(|p| p.orderbook_count).unwrap_or(0);
        let trades = self.parser.as_ref().map(|p| p.trade_count).unwrap_or(0);
        let reconnects = self.session.as_ref().map(|s| s.reconnects).unwrap_or(0);

        info!("[{:>4}s] msgs={} | kline={} book={} trade={} | signals={} reconnects={} errs={}",
            elapsed_secs, self.total_messages(), klines, books, trades,
            self.total_signals(), reconnects, self.total_errors());
    }
}

impl fmt::Display for UnifiedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnifiedMetrics(parsed={}, signals={}, errors={})",
            self.total_parsed(), self.total_signals(), self.total_errors()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_metrics() {
        let metrics = UnifiedMetrics::from_stats(None, None, None, None);
        assert_eq!(metrics.total_messages(), 0);
        assert_eq!(metrics.total_parsed(), 0);
        assert_eq!(metrics.total_errors(), 0);
    }

    #[test]
    fn test_metrics_total_errors() {
        let session = SessionStats {
            messages_received: 100,
            transport_errors: 1,
            ..Default::default()
        };
        let parser = ParserStats {
            messages_parsed: 90,
            parse_errors: 2,
            ..Default::default()
        };
        let market_data = MarketDataStoreStats {
            validation_failures: 3,
            ..Default::default()
        };
        let engine = EngineStats {
            emitted: 2,
            sink_errors: 1,
            ..Default::default()
        };
        let metrics = UnifiedMetrics::from_stats(Some(session), Some(parser), Some(market_data), Some(engine));
        // 1 transport + 2 parse + 3 rejected + 1 sink = 7
        assert_eq!(metrics.total_errors(), 7);
        assert_eq!(metrics.total_messages(), 100);
        assert_eq!(metrics.total_signals(), 2);
    }

    #[test]
    fn test_display() {
        let metrics = UnifiedMetrics::from_stats(None, None, None, None);
        let s = format!("{}", metrics);
        assert!(s.contains("parsed=0"));
        assert!(s.contains("errors=0"));
    }
}
