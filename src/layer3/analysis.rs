// Market Analysis - hands a read-only market bundle to an external text generator
// Generator failures (credentials, quota, rate limit, timeout) become part of the report

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::layer2::market_data_store::{DataQualityReport, MarketSnapshot};
use crate::layer3::indicators::IndicatorSnapshot;
use crate::layer3::signal_engine::SignalStatistics;

const MIN_ANALYSIS_CANDLES: usize = 10;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("text generator credentials are not configured")]
    MissingCredentials,
    #[error("text generator rate limit hit")]
    RateLimited,
    #[error("text generator quota exceeded")]
    QuotaExceeded,
    #[error("text generator error: {0}")]
    Upstream(String),
}

/// Everything the generator gets to see. Built from copies, never live state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub timeframe: String,
    pub generated_at: DateTime<Utc>,
    pub market: MarketSnapshot,
    pub indicators: IndicatorSnapshot,
    pub signal_stats: SignalStatistics,
    pub quality: DataQualityReport,
}

impl AnalysisRequest {
    pub fn to_prompt_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Gaps in the bundle worth telling the reader about; empty when complete
    pub fn quality_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.market.ticker.is_none() {
            issues.push("no ticker data".to_string());
        }
        if self.indicators.candle_count == 0 {
            issues.push("no indicators".to_string());
        }
        let candles = self.market.confirmed_candles().count();
        if candles == 0 {
            issues.push("no candles".to_string());
        } else if candles < MIN_ANALYSIS_CANDLES {
            issues.push(format!("few candles: {}", candles));
        }
        if self.market.orderbook.is_none() {
            issues.push("no order book".to_string());
        }
        issues
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &AnalysisRequest) -> Result<String, AnalysisError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum AnalysisOutcome {
    Text(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub symbol: String,
    pub generated_at: DateTime<Utc>,
    pub issues: Vec<String>,
    pub outcome: AnalysisOutcome,
}

impl AnalysisReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AnalysisOutcome::Text(_))
    }
}

pub struct MarketAnalyst {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl MarketAnalyst {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Never fails: generator errors and timeouts come back as `AnalysisOutcome::Failed`
    pub async fn analyze(&self, request: &AnalysisRequest) -> AnalysisReport {
        let issues = request.quality_issues();
        if !issues.is_empty() {
            info!(symbol = %request.symbol, issues = ?issues, "Analysis data is incomplete");
        }

        let outcome = match tokio::time::timeout(self.timeout, self.generator.generate(request)).await {
            Ok(Ok(text)) if text.trim().is_empty() => {
                warn!(symbol = %request.symbol, "Text generator returned an empty response");
                AnalysisOutcome::Failed("empty response from text generator".to_string())
            }
            Ok(Ok(text)) => {
                info!(symbol = %request.symbol, chars = text.len(), "Market analysis received");
                AnalysisOutcome::Text(text)
            }
            Ok(Err(e)) => {
                warn!(symbol = %request.symbol, error = %e, "Market analysis failed");
                AnalysisOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(symbol = %request.symbol, timeout_ms = self.timeout.as_millis() as u64, "Market analysis timed out");
                AnalysisOutcome::Failed(format!("text generator timed out after {:?}", self.timeout))
            }
        };

        AnalysisReport {
            symbol: request.symbol.clone(),
            generated_at: request.generated_at,
            issues,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreConfig;
    use crate::layer2::market_data_store::MarketDataStore;

    struct FixedGenerator(Result<String, AnalysisError>);

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, _request: &AnalysisRequest) -> Result<String, AnalysisError> {
            self.0.clone()
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl TextGenerator for SlowGenerator {
        async fn generate(&self, _request: &AnalysisRequest) -> Result<String, AnalysisError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
    }

    fn make_request() -> AnalysisRequest {
        let store = MarketDataStore::new("BTCUSDT", StoreConfig::default());
        AnalysisRequest {
            symbol: "BTCUSDT".to_string(),
            timeframe: "5m".to_string(),
            generated_at: Utc::now(),
            market: store.snapshot(),
            indicators: IndicatorSnapshot::default(),
            signal_stats: SignalStatistics::default(),
            quality: store.quality_report(0),
        }
    }

    #[tokio::test]
    async fn test_analysis_text() {
        let analyst = MarketAnalyst::new(
            Arc::new(FixedGenerator(Ok("Range-bound, watch 100".to_string()))),
            Duration::from_secs(1),
        );
        let report = analyst.analyze(&make_request()).await;
        assert!(report.is_success());
        assert_eq!(report.outcome, AnalysisOutcome::Text("Range-bound, watch 100".to_string()));
        assert!(report.issues.contains(&"no candles".to_string()));
    }

    #[tokio::test]
    async fn test_generator_failure_is_soft() {
        let analyst = MarketAnalyst::new(
            Arc::new(FixedGenerator(Err(AnalysisError::QuotaExceeded))),
            Duration::from_secs(1),
        );
        let report = analyst.analyze(&make_request()).await;
        assert_eq!(report.outcome, AnalysisOutcome::Failed("text generator quota exceeded".to_string()));

        let analyst = MarketAnalyst::new(Arc::new(FixedGenerator(Ok("  ".to_string()))), Duration::from_secs(1));
        assert!(!analyst.analyze(&make_request()).await.is_success());
    }

    #[tokio::test]
    async fn test_generator_timeout() {
        let analyst = MarketAnalyst::new(Arc::new(SlowGenerator), Duration::from_millis(20));
        let report = analyst.analyze(&make_request()).await;
        match report.outcome {
            AnalysisOutcome::Failed(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_prompt_json() {
        let json = make_request().to_prompt_json().unwrap();
        assert!(json.contains("\"symbol\": \"BTCUSDT\""));
        assert!(json.contains("availability_score"));
    }
}
