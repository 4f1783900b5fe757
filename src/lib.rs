// Signal Hunt - Bybit market data ingestion and advisory signal pipeline
//
// layer1: stream session (transport, frame decoding, reconnect)
// layer2: market data store and pipeline wiring
// layer3: indicators, signal engine, sinks and analysis

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;

pub use crate::core::{AppConfig, ConfigManager, MarketEvent, MarketEventHandler};
pub use crate::layer1::{StreamSession, WsConnector};
pub use crate::layer2::{MarketDataStore, MarketPipeline};
pub use crate::layer3::{Signal, SignalEngine, SignalType};
