// Layer 1 - Data Connector for the Bybit v5 public stream
// Transport, frame decoding and the reconnecting session

pub mod parser;
pub mod transport;
pub mod websocket;

// Re-export commonly used items for convenience
pub use parser::{Frame, MessageParser, ParseError, ParserStats, UpdateKind};
pub use transport::{
    ChannelConnector, Connector, FrameSink, FrameSource, ScriptedPeer, TransportError, WireMessage,
    WsConnector,
};
pub use websocket::{
    backoff_delay, ping_message, pong_message, session_topics, subscribe_message, SessionError,
    SessionStats, StreamSession,
};
