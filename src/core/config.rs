// Configuration Management for the Signal Hunt pipeline
// Built once at startup and handed to every component constructor

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const VALID_TIMEFRAMES: [&str; 11] = [
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "12h", "1d",
];

const TESTNET_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";
const MAINNET_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("trading symbol is not configured")]
    MissingSymbol,
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub symbol: String,
    pub timeframe: String,
    pub testnet: bool,
    /// Overrides the testnet/mainnet URL when set
    pub ws_url: Option<String>,
    pub orderbook_depth: u32,

    // Connection settings
    pub ping_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub startup_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: "5m".to_string(),
            testnet: true,
            ws_url: None,
            orderbook_depth: 50,
            ping_interval_secs: 20,
            heartbeat_timeout_secs: 40,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 5000,
            startup_timeout_ms: 10_000,
        }
    }
}

impl StreamConfig {
    pub fn websocket_url(&self) -> String {
        match &self.ws_url {
            Some(url) => url.clone(),
            None if self.testnet => TESTNET_WS_URL.to_string(),
            None => MAINNET_WS_URL.to_string(),
        }
    }

    /// Exchange kline interval code for the configured timeframe ("5m" -> "5", "1h" -> "60")
    pub fn kline_interval(&self) -> String {
        timeframe_to_interval(&self.timeframe).unwrap_or_else(|| self.timeframe.clone())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Maps "1m".."12h"/"1d" onto the exchange's numeric minute codes
pub fn timeframe_to_interval(timeframe: &str) -> Option<String> {
    if !VALID_TIMEFRAMES.contains(&timeframe) {
        return None;
    }
    let (value, unit) = timeframe.split_at(timeframe.len() - 1);
    let value: u32 = value.parse().ok()?;
    match unit {
        "m" => Some(value.to_string()),
        "h" => Some((value * 60).to_string()),
        "d" => Some("D".to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_candles: usize,
    pub max_trades: usize,
    pub max_orderbook_history: usize,

    // Order book
    pub book_levels: usize,
    pub imbalance_depth: usize,

    // Volume profile
    pub profile_price_decimals: u32,
    pub profile_max_levels: usize,
    pub profile_retain_levels: usize,

    // Support / resistance
    pub level_proximity: f64, // fraction, 0.001 = 0.1%
    pub max_price_levels: usize,
    pub swing_lookback: usize,

    // Trades
    pub large_trade_window: usize,
    pub large_trade_multiplier: f64,
    pub trade_stats_window: usize,

    // Snapshot shape
    pub snapshot_candles: usize,
    pub snapshot_trades: usize,

    pub data_retention_hours: u64,
    pub freshness_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_candles: 200,
            max_trades: 1000,
            max_orderbook_history: 50,
            book_levels: 10,
            imbalance_depth: 5,
            profile_price_decimals: 2,
            profile_max_levels: 200,
            profile_retain_levels: 100,
            level_proximity: 0.001,
            max_price_levels: 20,
            swing_lookback: 3,
            large_trade_window: 50,
            large_trade_multiplier: 2.0,
            trade_stats_window: 100,
            snapshot_candles: 100,
            snapshot_trades: 100,
            data_retention_hours: 24,
            freshness_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    // RSI
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,

    // Moving averages
    pub ma_short_period: usize,
    pub ma_long_period: usize,
    pub ema_short_period: usize,
    pub ema_long_period: usize,

    // Bands / volatility
    pub bb_period: usize,
    pub bb_std_dev: f64,
    pub volatility_period: usize,
    pub volume_avg_period: usize,

    // Rule thresholds
    pub imbalance_threshold: f64,
    pub momentum_short_threshold: f64,
    pub momentum_long_threshold: f64,

    // Emission
    pub min_signal_confidence: f64,
    pub signal_cooldown_minutes: u64,
    pub min_candles: usize,
    pub analysis_window: usize,
    pub max_signal_history: usize,
    pub max_daily_signals: usize,
    pub suppress_after_reconnect: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            ma_short_period: 9,
            ma_long_period: 21,
            ema_short_period: 12,
            ema_long_period: 26,
            bb_period: 20,
            bb_std_dev: 2.0,
            volatility_period: 20,
            volume_avg_period: 10,
            imbalance_threshold: 0.3,
            momentum_short_threshold: 0.02,
            momentum_long_threshold: 0.01,
            min_signal_confidence: 0.7,
            signal_cooldown_minutes: 5,
            min_candles: 30,
            analysis_window: 50,
            max_signal_history: 100,
            max_daily_signals: 100,
            suppress_after_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_format: false,
        }
    }
}

/// Complete runtime configuration, passed explicitly into each component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub store: StoreConfig,
    pub strategy: StrategyConfig,
    pub logging: LoggingConfig,
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub symbol: String,
    pub timeframe: String,
    pub testnet: bool,
    pub websocket_url: String,
    pub rsi_period: usize,
    pub ma_periods: (usize, usize),
    pub min_signal_confidence: f64,
    pub signal_cooldown_minutes: u64,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    config: AppConfig,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            config: AppConfig::default(),
        };

        // Load from file if provided
        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        // Environment wins over the file
        manager.load_from_env();

        info!(symbol = %manager.config.stream.symbol, "Configuration initialized");
        Ok(manager)
    }

    pub fn from_config(config: AppConfig) -> Self {
        Self { config }
    }

    /// Load configuration sections from a JSON file
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let sections: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(value) = sections.get("stream") {
            self.config.stream = serde_json::from_value(value.clone())?;
        }
        if let Some(value) = sections.get("store") {
            self.config.store = serde_json::from_value(value.clone())?;
        }
        if let Some(value) = sections.get("strategy") {
            self.config.strategy = serde_json::from_value(value.clone())?;
        }
        if let Some(value) = sections.get("logging") {
            self.config.logging = serde_json::from_value(value.clone())?;
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let stream = &mut self.config.stream;
        if let Some(v) = lookup("TRADING_PAIR") {
            stream.symbol = v.trim().to_uppercase();
        }
        if let Some(v) = lookup("STRATEGY_TIMEFRAME") {
            stream.timeframe = v.trim().to_string();
        }
        if let Some(v) = lookup("BYBIT_WS_TESTNET") {
            stream.testnet = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("BYBIT_WS_URL") {
            stream.ws_url = Some(v.trim().to_string());
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "WS_PING_INTERVAL") {
            stream.ping_interval_secs = secs;
            stream.heartbeat_timeout_secs = secs * 2;
        }
        override_parsed(&lookup, "WS_RECONNECT_ATTEMPTS", &mut stream.max_reconnect_attempts);
        if let Some(secs) = parse_var::<u64, _>(&lookup, "WS_RECONNECT_DELAY") {
            stream.reconnect_delay_ms = secs * 1000;
        }

        let store = &mut self.config.store;
        override_parsed(&lookup, "KLINE_LIMIT", &mut store.snapshot_candles);
        override_parsed(&lookup, "DATA_RETENTION_HOURS", &mut store.data_retention_hours);

        let strategy = &mut self.config.strategy;
        override_parsed(&lookup, "RSI_PERIOD", &mut strategy.rsi_period);
        override_parsed(&lookup, "RSI_OVERSOLD", &mut strategy.rsi_oversold);
        override_parsed(&lookup, "RSI_OVERBOUGHT", &mut strategy.rsi_overbought);
        override_parsed(&lookup, "MA_SHORT_PERIOD", &mut strategy.ma_short_period);
        override_parsed(&lookup, "MA_LONG_PERIOD", &mut strategy.ma_long_period);
        override_parsed(&lookup, "MIN_SIGNAL_CONFIDENCE", &mut strategy.min_signal_confidence);
        override_parsed(&lookup, "SIGNAL_COOLDOWN_MINUTES", &mut strategy.signal_cooldown_minutes);
        override_parsed(&lookup, "MAX_DAILY_SIGNALS", &mut strategy.max_daily_signals);

        if let Some(v) = lookup("LOG_LEVEL") {
            self.config.logging.log_level = v.trim().to_uppercase();
        }
    }

    /// Validate configuration, collecting every violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stream = &self.config.stream;
        let store = &self.config.store;
        let strategy = &self.config.strategy;

        if stream.symbol.trim().is_empty() {
            warn!("Config validation error: missing trading symbol");
            return Err(ConfigError::MissingSymbol);
        }

        let mut errors = Vec::new();

        if stream.symbol.len() < 3 {
            errors.push(format!("invalid trading symbol '{}'", stream.symbol));
        }
        if !VALID_TIMEFRAMES.contains(&stream.timeframe.as_str()) {
            errors.push(format!(
                "invalid timeframe '{}', expected one of {:?}",
                stream.timeframe, VALID_TIMEFRAMES
            ));
        }
        if stream.max_reconnect_attempts == 0 {
            errors.push("max_reconnect_attempts must be at least 1".to_string());
        }
        if stream.ping_interval_secs == 0 {
            errors.push("ping_interval_secs must be positive".to_string());
        }
        if stream.heartbeat_timeout_secs <= stream.ping_interval_secs {
            errors.push("heartbeat_timeout_secs must exceed ping_interval_secs".to_string());
        }

        if !(5..=50).contains(&strategy.rsi_period) {
            errors.push("rsi_period must be between 5 and 50".to_string());
        }
        if !(10.0..=40.0).contains(&strategy.rsi_oversold) {
            errors.push("rsi_oversold must be between 10 and 40".to_string());
        }
        if !(60.0..=90.0).contains(&strategy.rsi_overbought) {
            errors.push("rsi_overbought must be between 60 and 90".to_string());
        }
        if strategy.rsi_oversold >= strategy.rsi_overbought {
            errors.push("rsi_oversold must be below rsi_overbought".to_string());
        }
        if strategy.ma_short_period >= strategy.ma_long_period {
            errors.push("short MA period must be below long MA period".to_string());
        }
        if strategy.ema_short_period >= strategy.ema_long_period {
            errors.push("short EMA period must be below long EMA period".to_string());
        }
        if !(0.0..=1.0).contains(&strategy.min_signal_confidence) {
            errors.push("min_signal_confidence must be between 0.0 and 1.0".to_string());
        }

        if store.max_candles == 0 || store.max_trades == 0 || store.max_orderbook_history == 0 {
            errors.push("buffer capacities must be positive".to_string());
        }
        if store.profile_retain_levels > store.profile_max_levels {
            errors.push("profile_retain_levels must not exceed profile_max_levels".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Err(ConfigError::Validation(errors));
        }

        info!("Configuration validated successfully");
        Ok(())
    }

    /// Get configuration summary
    pub fn get_summary(&self) -> ConfigSummary {
        let stream = &self.config.stream;
        let strategy = &self.config.strategy;

        ConfigSummary {
            symbol: stream.symbol.clone(),
            timeframe: stream.timeframe.clone(),
            testnet: stream.testnet,
            websocket_url: stream.websocket_url(),
            rsi_period: strategy.rsi_period,
            ma_periods: (strategy.ma_short_period, strategy.ma_long_period),
            min_signal_confidence: strategy.min_signal_confidence,
            signal_cooldown_minutes: strategy.signal_cooldown_minutes,
            log_level: self.config.logging.log_level.clone(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_var(lookup, key) {
        *target = value;
    }
}
