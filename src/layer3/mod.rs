// Layer 3 - Analysis
// Indicators, signal rules and downstream handoff

// Indicator math over confirmed closes
pub mod indicators;

// Rule votes, cooldown and emission
pub mod signal_engine;

// Non-blocking signal handoff
pub mod sink;

// External text-generation collaborator
pub mod analysis;

pub use indicators::{BollingerBands, IndicatorSnapshot, Macd};
pub use signal_engine::{
    ConditionReport, EngineStats, Signal, SignalEngine, SignalInput, SignalStatistics, SignalType,
};
pub use sink::{ChannelSink, SignalSink, SinkError};
pub use analysis::{
    AnalysisError, AnalysisOutcome, AnalysisReport, AnalysisRequest, MarketAnalyst, TextGenerator,
};
