// Volume Profile - resting volume accumulated per rounded price bucket
// Built from order book snapshots, pruned to the heaviest buckets when it grows past its cap

use ordered_float::OrderedFloat;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::types::{OrderBookSnapshot, Side};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Bucket {
    bid_volume: f64,
    ask_volume: f64,
}

impl Bucket {
    fn total(&self) -> f64 {
        self.bid_volume + self.ask_volume
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileLevel {
    pub price: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub total_volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeProfile {
    buckets: BTreeMap<OrderedFloat<f64>, Bucket>,
    scale: f64,
    max_levels: usize,
    retain_levels: usize,
}

impl VolumeProfile {
    pub fn new(price_decimals: u32, max_levels: usize, retain_levels: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            scale: 10f64.powi(price_decimals as i32),
            max_levels,
            retain_levels: retain_levels.min(max_levels),
        }
    }

    fn bucket_price(&self, price: f64) -> f64 {
        (price * self.scale).round() / self.scale
    }

    pub fn add(&mut self, price: f64, size: f64, side: Side) {
        let key = OrderedFloat(self.bucket_price(price));
        let bucket = self.buckets.entry(key).or_default();
        match side {
            Side::Buy => bucket.bid_volume += size,
            Side::Sell => bucket.ask_volume += size,
        }
    }

    /// Accumulate the top `levels` of each side, then prune
    pub fn add_book(&mut self, book: &OrderBookSnapshot, levels: usize) {
        for level in book.bids.iter().take(levels) {
            self.add(level.price, level.size, Side::Buy);
        }
        for level in book.asks.iter().take(levels) {
            self.add(level.price, level.size, Side::Sell);
        }
        self.prune();
    }

    fn prune(&mut self) {
        if self.buckets.len() <= self.max_levels {
            return;
        }
        let mut ranked: Vec<(OrderedFloat<f64>, Bucket)> =
            std::mem::take(&mut self.buckets).into_iter().collect();
        ranked.sort_by(|a, b| b.1.total().total_cmp(&a.1.total()));
        ranked.truncate(self.retain_levels);
        self.buckets = ranked.into_iter().collect();
    }

    /// Bucket with the highest total volume
    pub fn point_of_control(&self) -> Option<ProfileLevel> {
        self.buckets
            .iter()
            .max_by(|a, b| a.1.total().total_cmp(&b.1.total()))
            .map(|(price, bucket)| to_level(price.0, bucket))
    }

    /// All buckets, price ascending
    pub fn levels(&self) -> Vec<ProfileLevel> {
        self.buckets
            .iter()
            .map(|(price, bucket)| to_level(price.0, bucket))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn to_level(price: f64, bucket: &Bucket) -> ProfileLevel {
    ProfileLevel {
        price,
        bid_volume: bucket.bid_volume,
        ask_volume: bucket.ask_volume,
        total_volume: bucket.total(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BookLevel;

    fn make_book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBookSnapshot {
        OrderBookSnapshot::new(
            "BTCUSDT".to_string(),
            bids.iter().map(|&(p, s)| BookLevel::new(p, s)).collect(),
            asks.iter().map(|&(p, s)| BookLevel::new(p, s)).collect(),
            1,
            1,
        )
    }

    #[test]
    fn test_rounding_merges_nearby_prices() {
        let mut profile = VolumeProfile::new(2, 200, 100);
        profile.add(100.004, 1.0, Side::Buy);
        profile.add(99.996, 2.0, Side::Sell);

        let levels = profile.levels();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].price, 100.0);
        assert_eq!(levels[0].bid_volume, 1.0);
        assert_eq!(levels[0].ask_volume, 2.0);
        assert_eq!(levels[0].total_volume, 3.0);
    }

    #[test]
    fn test_add_book_and_point_of_control() {
        let mut profile = VolumeProfile::new(2, 200, 100);
        let book = make_book(&[(99.0, 5.0), (98.0, 1.0)], &[(101.0, 2.0), (102.0, 20.0)]);
        profile.add_book(&book, 1);

        // only the top level per side
        assert_eq!(profile.len(), 2);
        assert_eq!(profile.point_of_control().unwrap().price, 99.0);

        profile.add_book(&book, 2);
        assert_eq!(profile.point_of_control().unwrap().price, 102.0);
        assert_eq!(profile.levels()[0].price, 98.0);
    }

    #[test]
    fn test_prune_keeps_heaviest() {
        let mut profile = VolumeProfile::new(0, 4, 2);
        let book = make_book(
            &[(10.0, 1.0), (9.0, 7.0), (8.0, 3.0)],
            &[(11.0, 2.0), (12.0, 8.0)],
        );
        profile.add_book(&book, 10);

        let prices: Vec<f64> = profile.levels().iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![9.0, 12.0]);
        let empty = VolumeProfile::new(2, 10, 5);
        assert!(empty.is_empty());
        assert!(empty.point_of_control().is_none());
    }
}
