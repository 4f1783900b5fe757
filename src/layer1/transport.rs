// Transport - connection capability used by the stream session
// tokio-tungstenite for the live exchange, channels for replays and tests

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

// ============================================================================
// Wire types
// ============================================================================

/// Transport-level message, independent of the websocket library
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Recoverable connection failure; the session retries these with backoff
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("no heartbeat ack for {elapsed_ms} ms")]
    HeartbeatTimeout { elapsed_ms: u64 },
    #[error("subscription rejected: {0}")]
    SubscribeRejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// Capability traits
// ============================================================================

#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait FrameSource: Send {
    /// `None` once the connection is gone
    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>>;
}

pub type Connection = (Box<dyn FrameSink>, Box<dyn FrameSource>);

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}

// ============================================================================
// tokio-tungstenite implementation
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = url, status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink { inner: write }), Box::new(WsSource { inner: read })))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.inner
            .send(Message::Pong(payload))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            let wire = match msg {
                Message::Text(text) => WireMessage::Text(text),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => WireMessage::Text(text),
                    Err(_) => {
                        debug!("Skipping non-UTF8 binary frame");
                        continue;
                    }
                },
                Message::Ping(payload) => WireMessage::Ping(payload),
                Message::Pong(payload) => WireMessage::Pong(payload),
                Message::Close(_) => WireMessage::Close,
                Message::Frame(_) => continue,
            };
            return Some(Ok(wire));
        }
    }
}

// ============================================================================
// Channel implementation
// ============================================================================

struct ChannelSink {
    outbound: mpsc::UnboundedSender<String>,
}

struct ChannelSource {
    inbound: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn send_pong(&mut self, _payload: Vec<u8>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }
}

/// Handles for driving one scripted connection from the outside
pub struct ScriptedPeer {
    /// Frames the session will read
    pub inbound: mpsc::UnboundedSender<WireMessage>,
    /// Text frames the session sent
    pub outbound: mpsc::UnboundedReceiver<String>,
}

impl ScriptedPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(WireMessage::Text(text.into())).is_ok()
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }
}

/// In-memory connector that hands out pre-registered connections in order.
/// Each `connect` call consumes one entry; an empty queue is a connect failure.
#[derive(Default)]
pub struct ChannelConnector {
    queue: Mutex<VecDeque<Result<(ChannelSink, ChannelSource), TransportError>>>,
    attempts: AtomicU32,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_connection(&self) -> ScriptedPeer {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.queue.lock().push_back(Ok((
            ChannelSink { outbound: out_tx },
            ChannelSource { inbound: in_rx },
        )));
        ScriptedPeer {
            inbound: in_tx,
            outbound: out_rx,
        }
    }

    pub fn push_failure(&self, reason: &str) {
        self.queue
            .lock()
            .push_back(Err(TransportError::Connect(reason.to_string())));
    }

    /// Number of connect calls made so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _url: &str) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().pop_front();
        match next {
            Some(Ok((sink, source))) => Ok((Box::new(sink), Box::new(source))),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Connect("connection refused".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_connector_order() {
        let connector = ChannelConnector::new();
        connector.push_failure("boom");
        let mut peer = connector.push_connection();

        assert!(matches!(connector.connect("ws://x").await, Err(TransportError::Connect(_))));
        let (mut sink, mut source) = connector.connect("ws://x").await.unwrap();
        assert!(connector.connect("ws://x").await.is_err());
        assert_eq!(connector.attempts(), 3);

        sink.send_text("hello".to_string()).await.unwrap();
        assert_eq!(peer.next_sent().await.as_deref(), Some("hello"));

        assert!(peer.send_text("frame"));
        assert_eq!(
            source.next_message().await,
            Some(Ok(WireMessage::Text("frame".to_string())))
        );

        drop(peer);
        assert_eq!(source.next_message().await, None);
    }
}
