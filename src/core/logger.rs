// Structured Logging for the Signal Hunt pipeline
// tracing + tracing-subscriber, installed once per process

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::core::config::LoggingConfig;

static INIT: Once = Once::new();

// Transport crates are chatty at debug level
const QUIET_TARGETS: [&str; 3] = ["tungstenite=warn", "tokio_tungstenite=warn", "rustls=warn"];

pub fn parse_level(level: &str) -> Level {
    match level.trim().to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Setup structured logging for the entire application
pub fn setup_logging(config: &LoggingConfig) {
    let level = parse_level(&config.log_level);
    let json_format = config.json_format;

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());
        for target in QUIET_TARGETS {
            if let Ok(directive) = target.parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }

        // try_init: a test harness or embedding app may already own the global subscriber
        let installed = if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .try_init()
        };

        if installed.is_ok() {
            tracing::info!(
                log_level = %config.log_level,
                json = json_format,
                "Logging initialized"
            );
        }
    });
}
