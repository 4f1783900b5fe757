// Signal Hunt entry point
// Usage: signal-hunt [config.json]

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use signal_hunt::core::{setup_logging, ConfigManager, SessionState};
use signal_hunt::layer1::{StreamSession, WsConnector};
use signal_hunt::layer2::MarketPipeline;

const METRICS_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let manager = ConfigManager::new(config_path.as_deref())?;
    setup_logging(&manager.config().logging);
    manager.validate()?;

    let summary = manager.get_summary();
    info!(
        symbol = %summary.symbol,
        timeframe = %summary.timeframe,
        testnet = summary.testnet,
        url = %summary.websocket_url,
        "Starting Signal Hunt"
    );
    let config = manager.into_config();

    let pipeline = Arc::new(MarketPipeline::new(&config));
    let mut signals = pipeline
        .subscribe_signals()
        .ok_or("signal receiver already taken")?;

    let session = StreamSession::new(config.stream.clone(), Arc::new(WsConnector), pipeline.clone());
    let mut state_rx = session.subscribe_state();
    session.start().await?;

    let stopped = async move {
        let _ = state_rx.wait_for(|s| *s == SessionState::Stopped).await;
    };
    tokio::pin!(stopped);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);
    let mut retention_tick = tokio::time::interval(RETENTION_INTERVAL);

    info!("Signal Hunt running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(signal) = signals.recv() => {
                info!(
                    id = %signal.id,
                    signal = %signal.signal_type,
                    price = signal.price,
                    confidence = format!("{:.0}%", signal.confidence * 100.0),
                    reason = %signal.reason,
                    "SIGNAL"
                );
            }
            _ = metrics_tick.tick() => {
                pipeline
                    .collect_metrics(Some(&session))
                    .print_compact(started.elapsed().as_secs());
            }
            _ = retention_tick.tick() => {
                pipeline.prune_expired(Utc::now());
            }
            _ = &mut stopped => {
                let outcome = session.join().await;
                pipeline.collect_metrics(Some(&session)).print_report();
                if let Err(e) = outcome {
                    error!(error = %e, "Stream session failed");
                    return Err(e.into());
                }
                warn!("Stream session stopped");
                return Ok(());
            }
            _ = &mut ctrl_c => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    session.stop();
    if let Err(e) = session.join().await {
        warn!(error = %e, "Stream session ended with error");
    }
    pipeline.collect_metrics(Some(&session)).print_report();
    info!(stats = %pipeline.stats(), "Signal Hunt stopped");
    Ok(())
}
