// Signal Rule Engine - votes from independent rules, gated by cooldown
// At most one signal per confirmed candle; emitted signals go to a non-blocking sink

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::StrategyConfig;
use crate::core::types::{Candle, Side};
use crate::layer3::indicators::IndicatorSnapshot;
use crate::layer3::sink::SignalSink;

const MAX_REASONS: usize = 3;

// ============================================================================
// Signal
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
}

impl From<Side> for SignalType {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => SignalType::Buy,
            Side::Sell => SignalType::Sell,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Buy => write!(f, "BUY"),
            SignalType::Sell => write!(f, "SELL"),
            SignalType::Hold => write!(f, "HOLD"),
        }
    }
}

/// Advisory signal. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub signal_type: SignalType,
    pub price: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub indicators: IndicatorSnapshot,
    pub timeframe: String,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signal({} {} @ {:.4}, confidence={:.0}%, reason={})",
            self.signal_type,
            self.symbol,
            self.price,
            self.confidence * 100.0,
            self.reason
        )
    }
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub direction: Side,
    pub weight: f64,
    pub reason: String,
}

impl Vote {
    fn new(direction: Side, weight: f64, reason: String) -> Self {
        Self { direction, weight, reason }
    }
}

fn rsi_rule(ind: &IndicatorSnapshot, config: &StrategyConfig) -> Option<Vote> {
    if ind.rsi <= config.rsi_oversold {
        Some(Vote::new(Side::Buy, 0.8, format!("RSI oversold: {:.1}", ind.rsi)))
    } else if ind.rsi >= config.rsi_overbought {
        Some(Vote::new(Side::Sell, 0.8, format!("RSI overbought: {:.1}", ind.rsi)))
    } else {
        None
    }
}

fn moving_average_rule(ind: &IndicatorSnapshot) -> Option<Vote> {
    if ind.sma_short == 0.0 || ind.sma_long == 0.0 {
        return None;
    }
    let price = ind.current_price;
    if ind.sma_short > ind.sma_long && price > ind.sma_short {
        Some(Vote::new(
            Side::Buy,
            0.6,
            format!("Price above short MA (short: {:.2}, long: {:.2})", ind.sma_short, ind.sma_long),
        ))
    } else if ind.sma_short < ind.sma_long && price < ind.sma_short {
        Some(Vote::new(
            Side::Sell,
            0.6,
            format!("Price below short MA (short: {:.2}, long: {:.2})", ind.sma_short, ind.sma_long),
        ))
    } else {
        None
    }
}

fn macd_rule(ind: &IndicatorSnapshot) -> Option<Vote> {
    if ind.macd == 0.0 || ind.macd_signal == 0.0 {
        return None;
    }
    if ind.macd > ind.macd_signal && ind.macd > 0.0 {
        Some(Vote::new(
            Side::Buy,
            0.5,
            format!("MACD bullish (MACD: {:.4} > signal: {:.4})", ind.macd, ind.macd_signal),
        ))
    } else if ind.macd < ind.macd_signal && ind.macd < 0.0 {
        Some(Vote::new(
            Side::Sell,
            0.5,
            format!("MACD bearish (MACD: {:.4} < signal: {:.4})", ind.macd, ind.macd_signal),
        ))
    } else {
        None
    }
}

fn bollinger_rule(ind: &IndicatorSnapshot) -> Option<Vote> {
    // flat bands mean too little history or no dispersion
    if ind.bb_upper == 0.0 || ind.bb_lower == 0.0 || ind.bb_upper <= ind.bb_lower {
        return None;
    }
    let price = ind.current_price;
    if price <= ind.bb_lower {
        Some(Vote::new(
            Side::Buy,
            0.7,
            format!("Price at lower Bollinger band ({:.2} <= {:.2})", price, ind.bb_lower),
        ))
    } else if price >= ind.bb_upper {
        Some(Vote::new(
            Side::Sell,
            0.7,
            format!("Price at upper Bollinger band ({:.2} >= {:.2})", price, ind.bb_upper),
        ))
    } else {
        None
    }
}

fn imbalance_rule(imbalance: Option<f64>, config: &StrategyConfig) -> Option<Vote> {
    let imbalance = imbalance?;
    if imbalance > config.imbalance_threshold {
        Some(Vote::new(
            Side::Buy,
            0.4,
            format!("Order book imbalance favours buyers ({:.1}%)", imbalance * 100.0),
        ))
    } else if imbalance < -config.imbalance_threshold {
        Some(Vote::new(
            Side::Sell,
            0.4,
            format!("Order book imbalance favours sellers ({:.1}%)", imbalance * 100.0),
        ))
    } else {
        None
    }
}

fn momentum_rule(ind: &IndicatorSnapshot, config: &StrategyConfig) -> Option<Vote> {
    if ind.ema_short == 0.0 || ind.ema_long == 0.0 || ind.current_price == 0.0 {
        return None;
    }
    let short_dev = (ind.current_price - ind.ema_short) / ind.ema_short;
    let long_dev = (ind.current_price - ind.ema_long) / ind.ema_long;

    if short_dev > config.momentum_short_threshold && long_dev > config.momentum_long_threshold {
        Some(Vote::new(
            Side::Buy,
            0.3,
            format!("Upward momentum (price {:.2}% above EMA)", short_dev * 100.0),
        ))
    } else if short_dev < -config.momentum_short_threshold && long_dev < -config.momentum_long_threshold {
        Some(Vote::new(
            Side::Sell,
            0.3,
            format!("Downward momentum (price {:.2}% below EMA)", short_dev.abs() * 100.0),
        ))
    } else {
        None
    }
}

/// Run every rule; each contributes zero or one vote
pub fn collect_votes(ind: &IndicatorSnapshot, imbalance: Option<f64>, config: &StrategyConfig) -> Vec<Vote> {
    [
        rsi_rule(ind, config),
        moving_average_rule(ind),
        macd_rule(ind),
        bollinger_rule(ind),
        imbalance_rule(imbalance, config),
        momentum_rule(ind, config),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Confidence bonus from current volume against its baseline
pub fn volume_bonus(ind: &IndicatorSnapshot) -> f64 {
    if ind.avg_volume <= 0.0 {
        return 0.0;
    }
    if ind.current_volume > ind.avg_volume * 2.0 {
        0.15
    } else if ind.current_volume > ind.avg_volume * 1.5 {
        0.1
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub signal_type: SignalType,
    pub confidence: f64,
    pub reason: String,
}

impl Decision {
    fn hold(reason: &str) -> Self {
        Self {
            signal_type: SignalType::Hold,
            confidence: 0.0,
            reason: reason.to_string(),
        }
    }
}

/// Majority vote by count; a tie holds
pub fn decide(votes: &[Vote], bonus: f64) -> Decision {
    if votes.is_empty() {
        return Decision::hold("No clear signals");
    }

    let (buys, sells): (Vec<&Vote>, Vec<&Vote>) = votes.iter().partition(|v| v.direction == Side::Buy);
    let (winner, side) = if buys.len() > sells.len() {
        (buys, Side::Buy)
    } else if sells.len() > buys.len() {
        (sells, Side::Sell)
    } else {
        return Decision::hold("Conflicting signals (buy/sell balanced)");
    };

    let mean = winner.iter().map(|v| v.weight).sum::<f64>() / winner.len() as f64;

    let mut ranked = winner;
    // stable: equal weights keep rule order
    ranked.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    let reason = ranked
        .iter()
        .take(MAX_REASONS)
        .map(|v| v.reason.as_str())
        .collect::<Vec<_>>()
        .join(" + ");

    Decision {
        signal_type: side.into(),
        confidence: (mean + bonus).min(1.0),
        reason,
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Copy of the aggregator state needed for one evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalInput {
    /// Confirmed candles, oldest first
    pub candles: Vec<Candle>,
    pub book_imbalance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub evaluations: u64,
    pub emitted: u64,
    pub cooldown_skips: u64,
    pub reconnect_skips: u64,
    pub insufficient_data: u64,
    pub daily_cap_hits: u64,
    pub holds: u64,
    pub below_confidence: u64,
    pub sink_errors: u64,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignalEngine(evaluations={}, emitted={}, cooldown={}, holds={}, low_conf={}, sink_errors={})",
            self.evaluations, self.emitted, self.cooldown_skips, self.holds,
            self.below_confidence, self.sink_errors
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalStatistics {
    pub total_signals: usize,
    pub buy_signals: usize,
    pub sell_signals: usize,
    pub signals_today: usize,
    pub average_confidence: f64,
    pub last_signal_time: Option<DateTime<Utc>>,
    pub cooldown_active: bool,
    pub buy_ratio: f64,
    pub sell_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConditionReport {
    pub can_generate_signals: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

pub struct SignalEngine {
    symbol: String,
    timeframe: String,
    config: StrategyConfig,
    sink: Option<Arc<dyn SignalSink>>,
    history: VecDeque<Signal>,
    last_signal_time: Option<DateTime<Utc>>,
    daily_count: Option<(NaiveDate, usize)>,
    skip_next: bool,
    stats: EngineStats,
}

impl SignalEngine {
    pub fn new(symbol: &str, timeframe: &str, config: StrategyConfig) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            timeframe: timeframe.to_string(),
            history: VecDeque::with_capacity(config.max_signal_history),
            config,
            sink: None,
            last_signal_time: None,
            daily_count: None,
            skip_next: false,
            stats: EngineStats::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    /// Skip the next evaluation; history may be missing the candle lost in the reconnect
    pub fn note_reconnect(&mut self) {
        if self.config.suppress_after_reconnect {
            self.skip_next = true;
            info!(symbol = %self.symbol, "Signal evaluation paused for one candle after reconnect");
        }
    }

    pub fn is_cooldown_active(&self, now: DateTime<Utc>) -> bool {
        match self.last_signal_time {
            Some(last) => {
                let cooldown_ms = self.config.signal_cooldown_minutes as i64 * 60_000;
                now.timestamp_millis() - last.timestamp_millis() < cooldown_ms
            }
            None => false,
        }
    }

    fn signals_today(&self, now: DateTime<Utc>) -> usize {
        match self.daily_count {
            Some((date, count)) if date == now.date_naive() => count,
            _ => 0,
        }
    }

    /// Evaluate one confirmed candle. Returns the emitted signal, if any.
    pub fn evaluate(&mut self, input: &SignalInput, now: DateTime<Utc>) -> Option<Signal> {
        self.stats.evaluations += 1;

        if self.skip_next {
            self.skip_next = false;
            self.stats.reconnect_skips += 1;
            debug!(symbol = %self.symbol, "Skipping first candle after reconnect");
            return None;
        }

        if self.is_cooldown_active(now) {
            self.stats.cooldown_skips += 1;
            debug!(symbol = %self.symbol, "Signal cooldown active");
            return None;
        }

        if input.candles.len() < self.config.min_candles {
            self.stats.insufficient_data += 1;
            debug!(
                candles = input.candles.len(),
                required = self.config.min_candles,
                "Not enough candles for analysis"
            );
            return None;
        }

        if self.signals_today(now) >= self.config.max_daily_signals {
            self.stats.daily_cap_hits += 1;
            warn!(symbol = %self.symbol, max = self.config.max_daily_signals, "Daily signal limit reached");
            return None;
        }

        let indicators = IndicatorSnapshot::compute(&input.candles, &self.config);
        if indicators.current_price <= 0.0 {
            self.stats.insufficient_data += 1;
            return None;
        }

        let votes = collect_votes(&indicators, input.book_imbalance, &self.config);
        let decision = decide(&votes, volume_bonus(&indicators));

        if decision.signal_type == SignalType::Hold {
            self.stats.holds += 1;
            debug!(votes = votes.len(), reason = %decision.reason, "No signal");
            return None;
        }

        if decision.confidence < self.config.min_signal_confidence {
            self.stats.below_confidence += 1;
            debug!(
                signal = %decision.signal_type,
                confidence = decision.confidence,
                min = self.config.min_signal_confidence,
                "Signal below confidence threshold"
            );
            return None;
        }

        let signal = Signal {
            id: self.next_signal_id(now),
            symbol: self.symbol.clone(),
            signal_type: decision.signal_type,
            price: indicators.current_price,
            confidence: decision.confidence,
            timestamp: now,
            reason: decision.reason,
            indicators,
            timeframe: self.timeframe.clone(),
        };

        self.record(&signal, now);
        info!(
            id = %signal.id,
            signal = %signal.signal_type,
            price = signal.price,
            confidence = signal.confidence,
            reason = %signal.reason,
            "Signal generated"
        );
        self.publish(&signal);

        Some(signal)
    }

    fn next_signal_id(&self, now: DateTime<Utc>) -> String {
        let base = format!("{}_{}", self.symbol, now.format("%Y%m%d_%H%M%S"));
        if self.history.iter().any(|s| s.id == base) {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}_{}", base, &suffix[..8])
        } else {
            base
        }
    }

    fn record(&mut self, signal: &Signal, now: DateTime<Utc>) {
        self.history.push_back(signal.clone());
        while self.history.len() > self.config.max_signal_history {
            self.history.pop_front();
        }
        self.last_signal_time = Some(now);
        self.daily_count = Some((now.date_naive(), self.signals_today(now) + 1));
        self.stats.emitted += 1;
    }

    fn publish(&mut self, signal: &Signal) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.publish(signal.clone()) {
            self.stats.sink_errors += 1;
            warn!(id = %signal.id, error = %e, "Signal sink rejected signal");
        }
    }

    /// Last `limit` signals, oldest first
    pub fn recent_signals(&self, limit: usize) -> Vec<Signal> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Drop signals older than `max_age`; returns how many were removed
    pub fn clear_older_than(&mut self, max_age: chrono::Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_age;
        let before = self.history.len();
        self.history.retain(|s| s.timestamp > cutoff);
        let removed = before - self.history.len();
        if removed > 0 {
            info!(removed = removed, "Cleared old signals");
        }
        removed
    }

    pub fn statistics(&self, now: DateTime<Utc>) -> SignalStatistics {
        let total = self.history.len();
        if total == 0 {
            return SignalStatistics {
                cooldown_active: self.is_cooldown_active(now),
                ..Default::default()
            };
        }

        let buys = self.history.iter().filter(|s| s.signal_type == SignalType::Buy).count();
        let sells = self.history.iter().filter(|s| s.signal_type == SignalType::Sell).count();
        let today = now.date_naive();

        SignalStatistics {
            total_signals: total,
            buy_signals: buys,
            sell_signals: sells,
            signals_today: self.history.iter().filter(|s| s.timestamp.date_naive() == today).count(),
            average_confidence: self.history.iter().map(|s| s.confidence).sum::<f64>() / total as f64,
            last_signal_time: self.last_signal_time,
            cooldown_active: self.is_cooldown_active(now),
            buy_ratio: buys as f64 / total as f64,
            sell_ratio: sells as f64 / total as f64,
        }
    }

    /// Whether a signal could be generated right now, and why not
    pub fn validate_conditions(
        &self,
        confirmed_candles: usize,
        stale_streams: &[String],
        now: DateTime<Utc>,
    ) -> ConditionReport {
        let mut report = ConditionReport {
            can_generate_signals: true,
            ..Default::default()
        };

        if confirmed_candles < self.config.min_candles {
            report.issues.push(format!(
                "Not enough kline data: {}/{}",
                confirmed_candles, self.config.min_candles
            ));
            report.can_generate_signals = false;
        }

        for stream in stale_streams {
            report.issues.push(format!("Stale data: {}", stream));
        }

        if self.is_cooldown_active(now) {
            report.issues.push(format!(
                "Signal cooldown active ({} min)",
                self.config.signal_cooldown_minutes
            ));
            report.can_generate_signals = false;
        }

        if self.signals_today(now) >= self.config.max_daily_signals {
            report.issues.push(format!("Daily signal limit reached ({})", self.config.max_daily_signals));
            report.can_generate_signals = false;
        }

        if !report.can_generate_signals {
            report.recommendations.push("Wait for more market data to accumulate".to_string());
            report.recommendations.push("Check the stability of the websocket connection".to_string());
        }

        report
    }
}

#[cfg(test)]
pub(crate) fn make_test_signal(id: &str, signal_type: SignalType) -> Signal {
    Signal {
        id: id.to_string(),
        symbol: "BTCUSDT".to_string(),
        signal_type,
        price: 100.0,
        confidence: 0.8,
        timestamp: Utc::now(),
        reason: "test".to_string(),
        indicators: IndicatorSnapshot::default(),
        timeframe: "5m".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer3::sink::ChannelSink;
    use chrono::TimeZone;

    fn make_time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    /// Dip, recovery ramp, then a sharp drop on 3x volume: RSI oversold, nothing else fires
    fn make_oversold_input() -> SignalInput {
        let mut closes = vec![100.0; 11];
        closes.extend([60.0; 5]);
        closes.push(100.0);
        closes.extend((101..=113).map(f64::from));
        closes.push(82.0);

        let last = closes.len() - 1;
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let volume = if i == last { 30.0 } else { 10.0 };
                Candle::new("BTCUSDT".into(), i as i64 * 300_000, "5".into(), c, c, c, c, volume, true)
            })
            .collect();
        SignalInput {
            candles,
            book_imbalance: None,
        }
    }

    fn make_config() -> StrategyConfig {
        StrategyConfig {
            // keep MACD and momentum quiet
            ema_long_period: 40,
            ..Default::default()
        }
    }

    fn make_indicators() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: 50.0,
            current_price: 100.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_rules_vote_independently() {
        let config = StrategyConfig::default();
        let ind = IndicatorSnapshot {
            rsi: 25.0,
            sma_short: 99.0,
            sma_long: 98.0,
            bb_upper: 110.0,
            bb_lower: 101.0,
            ..make_indicators()
        };
        let votes = collect_votes(&ind, Some(0.5), &config);
        let weights: Vec<f64> = votes.iter().map(|v| v.weight).collect();
        assert_eq!(weights, vec![0.8, 0.6, 0.7, 0.4]);
        assert!(votes.iter().all(|v| v.direction == Side::Buy));

        let sell = IndicatorSnapshot { rsi: 75.0, ..make_indicators() };
        let votes = collect_votes(&sell, Some(-0.31), &config);
        assert_eq!(votes.len(), 2);
        assert!(votes.iter().all(|v| v.direction == Side::Sell));
    }

    #[test]
    fn test_macd_and_momentum_rules() {
        let config = StrategyConfig::default();
        let ind = IndicatorSnapshot {
            macd: 1.0,
            macd_signal: 0.9,
            ema_short: 97.0,
            ema_long: 98.0,
            ..make_indicators()
        };
        let votes = collect_votes(&ind, None, &config);
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[0].weight, 0.5);
        assert_eq!(votes[1].weight, 0.3);
        assert!(votes[1].reason.contains("Upward momentum"));
    }

    #[test]
    fn test_flat_bands_do_not_vote() {
        let ind = IndicatorSnapshot {
            bb_upper: 100.0,
            bb_middle: 100.0,
            bb_lower: 100.0,
            ..make_indicators()
        };
        assert!(collect_votes(&ind, None, &StrategyConfig::default()).is_empty());
    }

    #[test]
    fn test_decide_majority_tie_and_reason() {
        let votes = vec![
            Vote::new(Side::Buy, 0.4, "book".into()),
            Vote::new(Side::Buy, 0.8, "RSI".into()),
            Vote::new(Side::Buy, 0.6, "MA".into()),
            Vote::new(Side::Buy, 0.3, "momentum".into()),
            Vote::new(Side::Sell, 0.7, "BB".into()),
        ];
        let decision = decide(&votes, 0.1);
        assert_eq!(decision.signal_type, SignalType::Buy);
        assert!((decision.confidence - (0.525 + 0.1)).abs() < 1e-12);
        assert_eq!(decision.reason, "RSI + MA + book");

        let tie = vec![
            Vote::new(Side::Buy, 0.8, "RSI".into()),
            Vote::new(Side::Sell, 0.7, "BB".into()),
        ];
        assert_eq!(decide(&tie, 0.15).signal_type, SignalType::Hold);
        assert_eq!(decide(&[], 0.0).signal_type, SignalType::Hold);

        let capped = decide(&[Vote::new(Side::Sell, 0.95, "x".into())], 0.15);
        assert_eq!(capped.confidence, 1.0);
    }

    #[test]
    fn test_volume_bonus_tiers() {
        let mut ind = IndicatorSnapshot { avg_volume: 10.0, current_volume: 16.0, ..Default::default() };
        assert_eq!(volume_bonus(&ind), 0.1);
        ind.current_volume = 25.0;
        assert_eq!(volume_bonus(&ind), 0.15);
        ind.current_volume = 15.0;
        assert_eq!(volume_bonus(&ind), 0.0);
        ind.avg_volume = 0.0;
        assert_eq!(volume_bonus(&ind), 0.0);
    }

    #[test]
    fn test_oversold_candle_emits_buy() {
        let mut engine = SignalEngine::new("btcusdt", "5m", make_config());
        let signal = engine.evaluate(&make_oversold_input(), make_time(0)).unwrap();

        assert_eq!(signal.signal_type, SignalType::Buy);
        assert!((signal.confidence - 0.95).abs() < 1e-9);
        assert!(signal.reason.contains("RSI"));
        assert_eq!(signal.id, "BTCUSDT_20240301_120000");
        assert_eq!(signal.price, 82.0);
        assert_eq!(signal.timeframe, "5m");
    }

    #[test]
    fn test_cooldown_allows_one_signal() {
        let (sink, mut rx) = ChannelSink::new(8);
        let mut engine = SignalEngine::new("BTCUSDT", "5m", make_config()).with_sink(Arc::new(sink));
        let input = make_oversold_input();

        assert!(engine.evaluate(&input, make_time(0)).is_some());
        assert!(engine.evaluate(&input, make_time(4)).is_none());
        assert!(engine.is_cooldown_active(make_time(4)));
        assert_eq!(engine.stats().cooldown_skips, 1);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // window over
        assert!(engine.evaluate(&input, make_time(5)).is_some());
        assert_eq!(engine.recent_signals(10).len(), 2);
    }

    #[test]
    fn test_gates() {
        let mut engine = SignalEngine::new("BTCUSDT", "5m", make_config());
        let mut short = make_oversold_input();
        short.candles.drain(..5);
        assert!(engine.evaluate(&short, make_time(0)).is_none());
        assert_eq!(engine.stats().insufficient_data, 1);

        engine.note_reconnect();
        assert!(engine.evaluate(&make_oversold_input(), make_time(1)).is_none());
        assert_eq!(engine.stats().reconnect_skips, 1);
        assert!(engine.evaluate(&make_oversold_input(), make_time(2)).is_some());

        let mut capped = SignalEngine::new(
            "BTCUSDT",
            "5m",
            StrategyConfig {
                max_daily_signals: 1,
                signal_cooldown_minutes: 0,
                ..make_config()
            },
        );
        assert!(capped.evaluate(&make_oversold_input(), make_time(0)).is_some());
        assert!(capped.evaluate(&make_oversold_input(), make_time(1)).is_none());
        assert_eq!(capped.stats().daily_cap_hits, 1);
    }

    #[test]
    fn test_three_each_way_holds_under_default_config() {
        let closes = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 100.5 }).chain([90.0]);
        let candles: Vec<Candle> = closes
            .enumerate()
            .map(|(i, c)| Candle::new("BTCUSDT".into(), i as i64 * 300_000, "5".into(), c, c, c, c, 10.0, true))
            .collect();
        let config = StrategyConfig::default();

        // RSI and Bollinger say BUY; MA, MACD and momentum say SELL
        let lopsided = SignalInput {
            candles: candles.clone(),
            book_imbalance: None,
        };
        let indicators = IndicatorSnapshot::compute(&lopsided.candles, &config);
        let votes = collect_votes(&indicators, None, &config);
        assert_eq!(votes.iter().filter(|v| v.direction == Side::Buy).count(), 2);
        assert_eq!(votes.iter().filter(|v| v.direction == Side::Sell).count(), 3);

        let mut engine = SignalEngine::new("BTCUSDT", "5m", config.clone());
        assert!(engine.evaluate(&lopsided, make_time(0)).is_none());
        assert_eq!(engine.stats().below_confidence, 1);

        // a bid-heavy book adds the third BUY vote
        let balanced = SignalInput {
            candles,
            book_imbalance: Some(0.6),
        };
        let mut engine = SignalEngine::new("BTCUSDT", "5m", config);
        assert!(engine.evaluate(&balanced, make_time(0)).is_none());
        let stats = engine.stats();
        assert_eq!(stats.holds, 1);
        assert_eq!(stats.below_confidence, 0);
        assert!(!engine.is_cooldown_active(make_time(1)));
    }

    #[test]
    fn test_low_confidence_and_hold_are_not_emitted() {
        let mut engine = SignalEngine::new(
            "BTCUSDT",
            "5m",
            StrategyConfig {
                min_signal_confidence: 0.99,
                ..make_config()
            },
        );
        assert!(engine.evaluate(&make_oversold_input(), make_time(0)).is_none());
        assert_eq!(engine.stats().below_confidence, 1);
        assert!(!engine.is_cooldown_active(make_time(0)));
    }

    #[test]
    fn test_signal_id_collision_gets_suffix() {
        let mut engine = SignalEngine::new(
            "BTCUSDT",
            "5m",
            StrategyConfig {
                signal_cooldown_minutes: 0,
                ..make_config()
            },
        );
        let first = engine.evaluate(&make_oversold_input(), make_time(0)).unwrap();
        let second = engine.evaluate(&make_oversold_input(), make_time(0)).unwrap();
        assert_eq!(first.id, "BTCUSDT_20240301_120000");
        assert!(second.id.starts_with("BTCUSDT_20240301_120000_"));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_statistics_history_and_clearing() {
        let mut engine = SignalEngine::new(
            "BTCUSDT",
            "5m",
            StrategyConfig {
                signal_cooldown_minutes: 0,
                max_signal_history: 2,
                ..make_config()
            },
        );
        for minute in 0..3 {
            engine.evaluate(&make_oversold_input(), make_time(minute));
        }

        let stats = engine.statistics(make_time(10));
        assert_eq!(stats.total_signals, 2);
        assert_eq!(stats.buy_signals, 2);
        assert_eq!(stats.signals_today, 2);
        assert_eq!(stats.buy_ratio, 1.0);
        assert_eq!(stats.last_signal_time, Some(make_time(2)));
        assert_eq!(engine.recent_signals(1)[0].timestamp, make_time(2));

        let removed = engine.clear_older_than(chrono::Duration::minutes(9), make_time(10));
        assert_eq!(removed, 1);
        assert_eq!(engine.recent_signals(10).len(), 1);
    }

    #[test]
    fn test_validate_conditions() {
        let mut engine = SignalEngine::new("BTCUSDT", "5m", make_config());
        let report = engine.validate_conditions(10, &["orderbook".to_string()], make_time(0));
        assert!(!report.can_generate_signals);
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.recommendations.len(), 2);

        engine.evaluate(&make_oversold_input(), make_time(0));
        let report = engine.validate_conditions(50, &[], make_time(1));
        assert!(!report.can_generate_signals);
        assert!(report.issues[0].contains("cooldown"));

        let report = engine.validate_conditions(50, &[], make_time(30));
        assert!(report.can_generate_signals);
        assert!(report.issues.is_empty());
    }
}
