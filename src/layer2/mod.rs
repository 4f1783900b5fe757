// Layer 2 - Data Processing & Aggregation
// Maintains rolling market state per symbol and wires it to the signal engine

pub mod market_data_store;
pub mod volume_profile;
pub mod price_levels;
pub mod pipeline;
pub mod metrics;

// Re-export commonly used items
pub use market_data_store::{
    BookSummary, DataQualityReport, KlineOutcome, MarketDataStore, MarketDataStoreStats,
    MarketSnapshot, StreamQuality, TradeFlowStats,
};
pub use volume_profile::{ProfileLevel, VolumeProfile};
pub use price_levels::{PriceLevel, PriceLevels};
pub use pipeline::{MarketPipeline, PipelineStats};
pub use metrics::UnifiedMetrics;
