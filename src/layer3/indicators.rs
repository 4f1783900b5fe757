// Indicator Engine - pure functions over a closing price series
// Every function returns a finite, defined value on short input

use serde::{Deserialize, Serialize};

use crate::core::config::StrategyConfig;
use crate::core::types::Candle;

const RSI_NEUTRAL: f64 = 50.0;
const MACD_SIGNAL_FACTOR: f64 = 0.9;

// ============================================================================
// Moving averages
// ============================================================================

/// Mean of the last `period` values; 0 when there are fewer
pub fn sma(values: &[f64], period: usize) -> f64 {
    if period == 0 || values.len() < period {
        return 0.0;
    }
    values[values.len() - period..].iter().sum::<f64>() / period as f64
}

/// EMA seeded at the first value, multiplier `2 / (period + 1)`; 0 when there are fewer than `period` values
pub fn ema(values: &[f64], period: usize) -> f64 {
    if period == 0 || values.len() < period {
        return 0.0;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    values[1..]
        .iter()
        .fold(values[0], |prev, price| prev + multiplier * (price - prev))
}

// ============================================================================
// Oscillators
// ============================================================================

/// Simple-average RSI over the trailing `period` deltas
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return RSI_NEUTRAL;
    }

    let window = &closes[closes.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub macd: f64,
    /// Approximated as 0.9 × MACD, not an EMA of the MACD series
    pub signal: f64,
    pub histogram: f64,
}

pub fn macd(closes: &[f64], fast: usize, slow: usize) -> Macd {
    if slow == 0 || closes.len() < slow {
        return Macd::default();
    }
    let line = ema(closes, fast) - ema(closes, slow);
    let signal = line * MACD_SIGNAL_FACTOR;
    Macd {
        macd: line,
        signal,
        histogram: line - signal,
    }
}

// ============================================================================
// Dispersion
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerBands {
    fn flat(price: f64) -> Self {
        Self {
            upper: price,
            middle: price,
            lower: price,
        }
    }
}

/// Population standard deviation
fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// SMA ± k·σ; all three bands collapse to the last price when history is short
pub fn bollinger_bands(closes: &[f64], period: usize, k: f64) -> BollingerBands {
    if period == 0 || closes.len() < period {
        return BollingerBands::flat(closes.last().copied().unwrap_or(0.0));
    }
    let middle = sma(closes, period);
    let sigma = std_dev(&closes[closes.len() - period..]);
    BollingerBands {
        upper: middle + k * sigma,
        middle,
        lower: middle - k * sigma,
    }
}

/// Coefficient of variation of the last `period` closes, in percent
pub fn volatility(closes: &[f64], period: usize) -> f64 {
    if period < 2 || closes.len() < period {
        return 0.0;
    }
    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    if mean == 0.0 {
        return 0.0;
    }
    std_dev(window) / mean * 100.0
}

// ============================================================================
// Snapshot
// ============================================================================

/// All indicators for one evaluation, computed from confirmed candles only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub sma_short: f64,
    pub sma_long: f64,
    pub ema_short: f64,
    pub ema_long: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub volatility: f64,
    pub current_price: f64,
    pub current_volume: f64,
    /// Mean volume of the candles preceding the current one
    pub avg_volume: f64,
    pub candle_count: usize,
}

impl IndicatorSnapshot {
    pub fn compute(candles: &[Candle], config: &StrategyConfig) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let macd_values = macd(&closes, config.ema_short_period, config.ema_long_period);
        let bands = bollinger_bands(&closes, config.bb_period, config.bb_std_dev);

        let (current_volume, avg_volume) = match volumes.split_last() {
            Some((current, previous)) => {
                let take = config.volume_avg_period.min(previous.len());
                let baseline = &previous[previous.len() - take..];
                let avg = if baseline.is_empty() {
                    0.0
                } else {
                    baseline.iter().sum::<f64>() / baseline.len() as f64
                };
                (*current, avg)
            }
            None => (0.0, 0.0),
        };

        Self {
            rsi: rsi(&closes, config.rsi_period),
            sma_short: sma(&closes, config.ma_short_period),
            sma_long: sma(&closes, config.ma_long_period),
            ema_short: ema(&closes, config.ema_short_period),
            ema_long: ema(&closes, config.ema_long_period),
            macd: macd_values.macd,
            macd_signal: macd_values.signal,
            macd_histogram: macd_values.histogram,
            bb_upper: bands.upper,
            bb_middle: bands.middle,
            bb_lower: bands.lower,
            volatility: volatility(&closes, config.volatility_period),
            current_price: closes.last().copied().unwrap_or(0.0),
            current_volume,
            avg_volume,
            candle_count: candles.len(),
        }
    }

    /// Current volume over the baseline, 0 without a baseline
    pub fn volume_ratio(&self) -> f64 {
        if self.avg_volume > 0.0 {
            self.current_volume / self.avg_volume
        } else {
            0.0
        }
    }
}
