// Price Levels - naive support/resistance from swing highs and lows
// A touch is a candle whose high (low) is the extreme of its trailing window

use serde::Serialize;

use crate::core::types::Candle;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceLevel {
    pub price: f64,
    /// Number of merged touches
    pub strength: u32,
    pub first_touch: i64,
    pub last_touch: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceLevels {
    pub support: Vec<PriceLevel>,
    pub resistance: Vec<PriceLevel>,
}

impl PriceLevels {
    pub fn is_empty(&self) -> bool {
        self.support.is_empty() && self.resistance.is_empty()
    }

    /// Nearest support at or below and resistance at or above `price`
    pub fn nearest(&self, price: f64) -> (Option<&PriceLevel>, Option<&PriceLevel>) {
        let support = self
            .support
            .iter()
            .filter(|l| l.price <= price)
            .max_by(|a, b| a.price.total_cmp(&b.price));
        let resistance = self
            .resistance
            .iter()
            .filter(|l| l.price >= price)
            .min_by(|a, b| a.price.total_cmp(&b.price));
        (support, resistance)
    }
}

/// Detect and cluster levels over `candles` (oldest first).
///
/// Touches within `proximity` (relative) of an existing level join it; the level
/// price becomes the mean of its touches. Each side keeps the `max_levels`
/// strongest, most recent first on ties.
pub fn detect(candles: &[Candle], lookback: usize, proximity: f64, max_levels: usize) -> PriceLevels {
    let lookback = lookback.max(1);
    if candles.len() < lookback {
        return PriceLevels::default();
    }

    let mut support = Vec::new();
    let mut resistance = Vec::new();

    for window in candles.windows(lookback) {
        let Some(candle) = window.last() else {
            continue;
        };
        let max_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let min_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        if candle.high >= max_high {
            add_touch(&mut resistance, candle.high, candle.start_time, proximity);
        }
        if candle.low <= min_low {
            add_touch(&mut support, candle.low, candle.start_time, proximity);
        }
    }

    PriceLevels {
        support: strongest(support, max_levels),
        resistance: strongest(resistance, max_levels),
    }
}

fn add_touch(levels: &mut Vec<PriceLevel>, price: f64, timestamp: i64, proximity: f64) {
    if let Some(level) = levels
        .iter_mut()
        .find(|l| (price - l.price).abs() / l.price <= proximity)
    {
        let n = level.strength as f64;
        level.price = (level.price * n + price) / (n + 1.0);
        level.strength += 1;
        level.last_touch = timestamp;
        return;
    }
    levels.push(PriceLevel {
        price,
        strength: 1,
        first_touch: timestamp,
        last_touch: timestamp,
    });
}

fn strongest(mut levels: Vec<PriceLevel>, max_levels: usize) -> Vec<PriceLevel> {
    levels.sort_by(|a, b| {
        b.strength
            .cmp(&a.strength)
            .then_with(|| b.last_touch.cmp(&a.last_touch))
    });
    levels.truncate(max_levels);
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candle(t: i64, high: f64, low: f64) -> Candle {
        let mid = (high + low) / 2.0;
        Candle::new("BTCUSDT".to_string(), t, "5".to_string(), mid, high, low, mid, 1.0, true)
    }

    #[test]
    fn test_swing_touches_cluster() {
        let candles = vec![
            make_candle(1, 100.0, 95.0),
            make_candle(2, 101.0, 97.0),
            make_candle(3, 105.0, 98.0),
            make_candle(4, 103.0, 94.0),
            make_candle(5, 105.05, 94.05),
        ];
        let levels = detect(&candles, 3, 0.001, 20);

        // 105 and 105.05 are within 0.1%
        assert_eq!(levels.resistance.len(), 1);
        let top = &levels.resistance[0];
        assert_eq!(top.strength, 2);
        assert_eq!(top.first_touch, 3);
        assert_eq!(top.last_touch, 5);
        assert!((top.price - 105.025).abs() < 1e-9);

        // 94.05 is above the window low of 94, so no second touch
        assert_eq!(levels.support.len(), 1);
        assert_eq!(levels.support[0].price, 94.0);
        assert_eq!(levels.support[0].strength, 1);
    }

    #[test]
    fn test_short_series_has_no_levels() {
        let candles = vec![make_candle(1, 100.0, 95.0), make_candle(2, 101.0, 96.0)];
        assert!(detect(&candles, 3, 0.001, 20).is_empty());
    }

    #[test]
    fn test_max_levels_and_nearest() {
        // strictly rising highs: every candle is a new resistance touch
        let candles: Vec<Candle> = (0..10)
            .map(|i| make_candle(i, 100.0 + i as f64 * 10.0, 50.0 + i as f64))
            .collect();
        let levels = detect(&candles, 3, 0.001, 4);
        assert_eq!(levels.resistance.len(), 4);
        // equal strength, newest first
        assert_eq!(levels.resistance[0].last_touch, 9);

        // rising lows never make a window low
        assert!(levels.support.is_empty());
        let (support, resistance) = levels.nearest(175.0);
        assert!(support.is_none());
        assert_eq!(resistance.map(|l| l.price), Some(180.0));
    }
}
