// Stream Session - Bybit v5 public market-data stream
// One logical connection per symbol: connect, subscribe, heartbeat, reconnect with backoff

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
// Note: We use two lock types:
// - parking_lot: state, counters and the parser, never held across an await
// - tokio::sync::Mutex (AsyncMutex): the write half, shared by the read loop and the heartbeat task
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::config::StreamConfig;
use crate::core::events::MarketEventHandler;
use crate::core::types::SessionState;
use crate::layer1::parser::{
    Frame, MessageParser, ParseError, ParserStats, KLINE_PREFIX, ORDERBOOK_PREFIX, TICKER_PREFIX,
    TRADE_PREFIX,
};
use crate::layer1::transport::{Connector, FrameSink, FrameSource, TransportError, WireMessage};

const MAX_BACKOFF_HISTORY: usize = 64;

type SharedSink = Arc<AsyncMutex<Box<dyn FrameSink>>>;

// ============================================================================
// Errors
// ============================================================================

/// Fatal session outcomes, reported once through `start()` or the task handle
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("startup failed: {0}")]
    Connect(String),
    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("session already started")]
    AlreadyStarted,
    #[error("session task failed: {0}")]
    TaskFailed(String),
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub connections: u64,
    pub messages_received: u64,
    pub events_delivered: u64,
    pub decode_errors: u64,
    pub unknown_topics: u64,
    pub transport_errors: u64,
    pub reconnects: u64,
    pub pings_answered: u64,
    pub heartbeats_sent: u64,
    /// Most recent backoff delays, oldest first
    pub backoff_history_ms: Vec<u64>,
}

impl SessionStats {
    fn record_backoff(&mut self, delay: Duration) {
        self.backoff_history_ms.push(delay.as_millis() as u64);
        if self.backoff_history_ms.len() > MAX_BACKOFF_HISTORY {
            self.backoff_history_ms.remove(0);
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionStats(connections={}, messages={}, events={}, decode_errors={}, unknown_topics={}, reconnects={})",
            self.connections, self.messages_received, self.events_delivered,
            self.decode_errors, self.unknown_topics, self.reconnects
        )
    }
}

// ============================================================================
// Outbound protocol messages
// ============================================================================

/// Topics for one symbol: ticker, kline, order book depth, public trades
pub fn session_topics(config: &StreamConfig) -> Vec<String> {
    let symbol = config.symbol.to_uppercase();
    vec![
        format!("{}{}", TICKER_PREFIX, symbol),
        format!("{}{}.{}", KLINE_PREFIX, config.kline_interval(), symbol),
        format!("{}{}.{}", ORDERBOOK_PREFIX, config.orderbook_depth, symbol),
        format!("{}{}", TRADE_PREFIX, symbol),
    ]
}

pub fn subscribe_message(topics: &[String]) -> String {
    serde_json::json!({
        "op": "subscribe",
        "args": topics,
    })
    .to_string()
}

pub fn ping_message(timestamp_ms: i64) -> String {
    serde_json::json!({
        "op": "ping",
        "args": [timestamp_ms.to_string()],
    })
    .to_string()
}

/// Reply to a server keepalive, echoing its args
pub fn pong_message(args: &[serde_json::Value]) -> String {
    serde_json::json!({
        "op": "pong",
        "args": args,
    })
    .to_string()
}

/// Linear backoff: `base × attempt`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

// ============================================================================
// Session
// ============================================================================

struct SessionInner {
    config: StreamConfig,
    url: String,
    topics: Vec<String>,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MarketEventHandler>,
    parser: Mutex<MessageParser>,
    stats: RwLock<SessionStats>,
    heartbeats_sent: Arc<AtomicU64>,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    has_streamed: AtomicBool,
}

/// Owns one exchange connection across reconnects and feeds decoded events to a handler
pub struct StreamSession {
    inner: Arc<SessionInner>,
    task: Mutex<Option<JoinHandle<Result<(), SessionError>>>>,
}

impl StreamSession {
    pub fn new(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn MarketEventHandler>,
    ) -> Self {
        let url = config.websocket_url();
        let topics = session_topics(&config);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        info!(symbol = %config.symbol, url = %url, "Stream session created");

        Self {
            inner: Arc::new(SessionInner {
                parser: Mutex::new(MessageParser::new(&config.symbol)),
                config,
                url,
                topics,
                connector,
                handler,
                stats: RwLock::new(SessionStats::default()),
                heartbeats_sent: Arc::new(AtomicU64::new(0)),
                state_tx,
                shutdown_tx,
                has_streamed: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.inner.topics
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.inner.stats.read().clone();
        stats.heartbeats_sent = self.inner.heartbeats_sent.load(Ordering::Relaxed);
        stats
    }

    pub fn parser_stats(&self) -> ParserStats {
        self.inner.parser.lock().stats.clone()
    }

    /// Spawn the session task and wait until it is Streaming or the startup window elapses
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        {
            let mut task = self.task.lock();
            if task.is_some() {
                return Err(SessionError::AlreadyStarted);
            }
            *task = Some(tokio::spawn(self.inner.clone().run()));
        }

        let wait_streaming = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    SessionState::Streaming => return true,
                    SessionState::Stopped => return false,
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        };

        let startup_timeout = self.inner.config.startup_timeout();
        match tokio::time::timeout(startup_timeout, wait_streaming).await {
            Ok(true) => {
                info!(symbol = %self.inner.config.symbol, "Stream session streaming");
                Ok(())
            }
            Ok(false) => match self.join().await {
                Err(e) => Err(e),
                Ok(()) => Err(SessionError::Connect("session stopped before streaming".to_string())),
            },
            Err(_) => {
                warn!(timeout_ms = startup_timeout.as_millis() as u64, "Stream session did not reach Streaming");
                self.stop();
                Err(SessionError::Connect(format!(
                    "no streaming state within {} ms",
                    startup_timeout.as_millis()
                )))
            }
        }
    }

    /// Drive the session on the current task until shutdown or a fatal error
    pub async fn run(&self) -> Result<(), SessionError> {
        self.inner.clone().run().await
    }

    /// Request shutdown; in-flight backoff sleeps are cancelled
    pub fn stop(&self) {
        info!("Stopping stream session");
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Wait for the spawned session task and return its outcome
    pub async fn join(&self) -> Result<(), SessionError> {
        let handle = self.task.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| SessionError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
        debug!("Stream session dropped, shutdown requested");
    }
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state change");
        }
    }

    /// Main loop with automatic reconnection
    async fn run(self: Arc<Self>) -> Result<(), SessionError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut failures: u32 = 0;

        loop {
            let stop_requested = *shutdown.borrow();
            if stop_requested {
                break;
            }

            match self.connect_and_stream(&mut shutdown, &mut failures).await {
                Ok(()) => break,
                Err(e) => {
                    self.set_state(SessionState::Disconnected);
                    self.stats.write().transport_errors += 1;
                    warn!(error = %e, consecutive_failures = failures, "Stream session transport failure");

                    if failures >= self.config.max_reconnect_attempts {
                        error!(max_attempts = self.config.max_reconnect_attempts, "Max reconnection attempts reached");
                        self.set_state(SessionState::Stopped);
                        return Err(SessionError::ReconnectExhausted { attempts: failures });
                    }

                    failures += 1;
                    let delay = backoff_delay(self.config.reconnect_delay(), failures);
                    self.stats.write().record_backoff(delay);
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = failures,
                        max = self.config.max_reconnect_attempts,
                        "Reconnecting"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.set_state(SessionState::Stopped);
        info!("Stream session stopped");
        Ok(())
    }

    /// One connection lifetime. Ok means deliberate shutdown; Err is retried.
    async fn connect_and_stream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Result<(), TransportError> {
        self.set_state(SessionState::Connecting);
        info!(url = %self.url, "Connecting to WebSocket");

        let connected = tokio::select! {
            result = self.connector.connect(&self.url) => result,
            _ = shutdown.changed() => return Ok(()),
        };
        let (sink, source) = connected?;
        let sink: SharedSink = Arc::new(AsyncMutex::new(sink));
        self.stats.write().connections += 1;

        self.set_state(SessionState::Subscribing);
        sink.lock().await.send_text(subscribe_message(&self.topics)).await?;
        info!(topics = ?self.topics, "Subscribe request sent");

        let last_ack = Arc::new(RwLock::new(Instant::now()));
        let (failure_tx, failure_rx) = mpsc::channel::<TransportError>(1);
        let heartbeat = tokio::spawn(heartbeat_loop(
            sink.clone(),
            self.config.ping_interval(),
            self.config.heartbeat_timeout(),
            last_ack.clone(),
            self.heartbeats_sent.clone(),
            failure_tx,
        ));

        let result = self
            .read_loop(source, &sink, &last_ack, failure_rx, shutdown, failures)
            .await;

        heartbeat.abort();
        if let Err(e) = sink.lock().await.close().await {
            debug!(error = %e, "Close after disconnect failed");
        }
        result
    }

    async fn read_loop(
        &self,
        mut source: Box<dyn FrameSource>,
        sink: &SharedSink,
        last_ack: &RwLock<Instant>,
        mut heartbeat_failures: mpsc::Receiver<TransportError>,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                msg = source.next_message() => match msg {
                    Some(Ok(WireMessage::Text(text))) => {
                        self.handle_text(&text, sink, last_ack, failures).await?;
                    }
                    Some(Ok(WireMessage::Ping(payload))) => {
                        sink.lock().await.send_pong(payload).await?;
                    }
                    Some(Ok(WireMessage::Pong(_))) => {
                        *last_ack.write() = Instant::now();
                    }
                    Some(Ok(WireMessage::Close)) | None => {
                        info!("WebSocket closed by server");
                        return Err(TransportError::Closed);
                    }
                    Some(Err(e)) => return Err(e),
                },
                Some(e) = heartbeat_failures.recv() => return Err(e),
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        sink: &SharedSink,
        last_ack: &RwLock<Instant>,
        failures: &mut u32,
    ) -> Result<(), TransportError> {
        self.stats.write().messages_received += 1;
        let parsed = self.parser.lock().parse(text);

        match parsed {
            Ok(Frame::Event(event)) => {
                let kind = event.kind();
                let handler = &self.handler;
                if catch_unwind(AssertUnwindSafe(|| handler.on_event(event))).is_err() {
                    error!(kind = %kind, "Event handler panicked");
                    return Err(TransportError::Protocol(format!("handler panicked on {} event", kind)));
                }
                self.stats.write().events_delivered += 1;
            }
            Ok(Frame::SubscribeAck { success: true, message }) => {
                *failures = 0;
                self.set_state(SessionState::Streaming);
                info!(ret_msg = %message, "Subscription confirmed");
                if self.has_streamed.swap(true, Ordering::SeqCst) {
                    self.stats.write().reconnects += 1;
                    self.handler.on_reconnect();
                }
            }
            Ok(Frame::SubscribeAck { success: false, message }) => {
                return Err(TransportError::SubscribeRejected(message));
            }
            Ok(Frame::Ping { args }) => {
                sink.lock().await.send_text(pong_message(&args)).await?;
                self.stats.write().pings_answered += 1;
            }
            Ok(Frame::HeartbeatAck) => {
                *last_ack.write() = Instant::now();
            }
            Ok(Frame::Control { op }) => debug!(op = %op, "Ignoring control frame"),
            Err(ParseError::UnknownTopic(topic)) => {
                self.stats.write().unknown_topics += 1;
                warn!(topic = %topic, "Unknown topic");
            }
            Err(e) => {
                self.stats.write().decode_errors += 1;
                warn!(error = %e, "Dropping malformed frame");
            }
        }
        Ok(())
    }
}

/// Proactive keepalive, independent of the read loop
async fn heartbeat_loop(
    sink: SharedSink,
    interval: Duration,
    ack_timeout: Duration,
    last_ack: Arc<RwLock<Instant>>,
    sent: Arc<AtomicU64>,
    failure_tx: mpsc::Sender<TransportError>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let elapsed = last_ack.read().elapsed();
        if elapsed > ack_timeout {
            let elapsed_ms = elapsed.as_millis() as u64;
            warn!(elapsed_ms = elapsed_ms, "Heartbeat ack missing");
            let _ = failure_tx.send(TransportError::HeartbeatTimeout { elapsed_ms }).await;
            return;
        }

        let message = ping_message(chrono::Utc::now().timestamp_millis());
        let result = sink.lock().await.send_text(message).await;
        if let Err(e) = result {
            warn!(error = %e, "Heartbeat send failed");
            let _ = failure_tx.send(e).await;
            return;
        }
        sent.fetch_add(1, Ordering::Relaxed);
        debug!("Heartbeat sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{EventKind, MarketEvent};
    use crate::layer1::transport::ChannelConnector;

    const ACK: &str = r#"{"success":true,"ret_msg":"","conn_id":"c1","op":"subscribe"}"#;
    const TRADE: &str = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1,"data":[{"T":1,"s":"BTCUSDT","S":"Buy","v":"0.1","p":"100.0","i":"t1"}]}"#;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<EventKind>>,
        reconnects: Mutex<u32>,
    }

    impl MarketEventHandler for RecordingHandler {
        fn on_event(&self, event: MarketEvent) {
            self.events.lock().push(event.kind());
        }

        fn on_reconnect(&self) {
            *self.reconnects.lock() += 1;
        }
    }

    fn make_config() -> StreamConfig {
        StreamConfig {
            reconnect_delay_ms: 1,
            startup_timeout_ms: 2000,
            max_reconnect_attempts: 3,
            ..Default::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_topics_and_messages() {
        let topics = session_topics(&StreamConfig::default());
        assert_eq!(
            topics,
            vec!["tickers.BTCUSDT", "kline.5.BTCUSDT", "orderbook.50.BTCUSDT", "publicTrade.BTCUSDT"]
        );

        let sub: serde_json::Value = serde_json::from_str(&subscribe_message(&topics)).unwrap();
        assert_eq!(sub["op"], "subscribe");
        assert_eq!(sub["args"].as_array().unwrap().len(), 4);

        let ping: serde_json::Value = serde_json::from_str(&ping_message(1700000000000)).unwrap();
        assert_eq!(ping["op"], "ping");
        assert_eq!(ping["args"][0], "1700000000000");

        let pong: serde_json::Value =
            serde_json::from_str(&pong_message(&[serde_json::json!("abc")])).unwrap();
        assert_eq!(pong["op"], "pong");
        assert_eq!(pong["args"][0], "abc");
    }

    #[test]
    fn test_backoff_delay_increases() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(15));
        let delays: Vec<Duration> = (1..=10).map(|a| backoff_delay(base, a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_start_reaches_streaming_and_answers_ping() {
        let connector = Arc::new(ChannelConnector::new());
        let mut peer = connector.push_connection();
        peer.send_text(ACK);

        let handler = Arc::new(RecordingHandler::default());
        let session = StreamSession::new(make_config(), connector.clone(), handler.clone());
        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        let subscribe = peer.next_sent().await.unwrap();
        assert!(subscribe.contains("publicTrade.BTCUSDT"));

        peer.send_text(TRADE);
        peer.send_text(r#"{"op":"ping","args":["42"]}"#);
        let pong: serde_json::Value = serde_json::from_str(&peer.next_sent().await.unwrap()).unwrap();
        assert_eq!(pong["op"], "pong");
        assert_eq!(pong["args"][0], "42");
        assert_eq!(*handler.events.lock(), vec![EventKind::Trades]);

        session.stop();
        assert_eq!(session.join().await, Ok(()));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stats().pings_answered, 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let connector = Arc::new(ChannelConnector::new());
        let peer = connector.push_connection();
        peer.send_text(ACK);
        peer.send_text("{not json");
        peer.send_text(r#"{"topic":"liquidation.BTCUSDT","ts":1,"data":{}}"#);
        peer.send_text(TRADE);

        let handler = Arc::new(RecordingHandler::default());
        let session = StreamSession::new(make_config(), connector.clone(), handler.clone());
        session.start().await.unwrap();

        wait_until(|| handler.events.lock().len() == 1).await;
        let stats = session.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.unknown_topics, 1);
        assert_eq!(session.state(), SessionState::Streaming);

        session.stop();
        session.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_close_resets_attempts() {
        let connector = Arc::new(ChannelConnector::new());
        let first = connector.push_connection();
        first.send_text(ACK);
        connector.push_failure("refused");
        let second = connector.push_connection();
        second.send_text(ACK);

        let handler = Arc::new(RecordingHandler::default());
        let session = StreamSession::new(make_config(), connector.clone(), handler.clone());
        session.start().await.unwrap();

        // peer goes away
        drop(first);
        wait_until(|| *handler.reconnects.lock() == 1).await;

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(connector.attempts(), 3);
        let stats = session.stats();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.backoff_history_ms, vec![1, 2]);

        session.stop();
        session.join().await.unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn test_reconnect_exhausted_after_attempt_limit() {
        let connector = Arc::new(ChannelConnector::new());
        let handler = Arc::new(RecordingHandler::default());
        let session = StreamSession::new(make_config(), connector.clone(), handler);

        let result = session.run().await;
        assert_eq!(result, Err(SessionError::ReconnectExhausted { attempts: 3 }));
        // initial attempt plus three retries
        assert_eq!(connector.attempts(), 4);
        assert_eq!(session.state(), SessionState::Stopped);

        let delays = session.stats().backoff_history_ms;
        assert_eq!(delays, vec![1, 2, 3]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_start_times_out_without_ack() {
        let connector = Arc::new(ChannelConnector::new());
        let _peer = connector.push_connection();
        let handler = Arc::new(RecordingHandler::default());
        let config = StreamConfig {
            startup_timeout_ms: 50,
            ..make_config()
        };
        let session = StreamSession::new(config, connector, handler);

        assert!(matches!(session.start().await, Err(SessionError::Connect(_))));
        assert_eq!(session.join().await, Ok(()));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let connector = Arc::new(ChannelConnector::new());
        let peer = connector.push_connection();
        peer.send_text(ACK);
        let session = StreamSession::new(make_config(), connector, Arc::new(RecordingHandler::default()));

        session.start().await.unwrap();
        assert_eq!(session.start().await, Err(SessionError::AlreadyStarted));
        session.stop();
        session.join().await.unwrap();
    }
}
