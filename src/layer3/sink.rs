// Signal Sink - non-blocking handoff of emitted signals
// Producers never wait on the consumer: a full or closed sink is reported, not awaited

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::layer3::signal_engine::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("signal sink is full")]
    Full,
    #[error("signal sink is closed")]
    Closed,
}

/// Downstream consumer of emitted signals (notifier, bot, recorder)
pub trait SignalSink: Send + Sync {
    fn publish(&self, signal: Signal) -> Result<(), SinkError>;
}

/// Bounded tokio channel; `publish` uses `try_send`
pub struct ChannelSink {
    tx: mpsc::Sender<Signal>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl SignalSink for ChannelSink {
    fn publish(&self, signal: Signal) -> Result<(), SinkError> {
        self.tx.try_send(signal).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer3::signal_engine::{make_test_signal, SignalType};

    #[tokio::test]
    async fn test_channel_sink_full_and_closed() {
        let (sink, mut rx) = ChannelSink::new(1);

        assert_eq!(sink.publish(make_test_signal("A", SignalType::Buy)), Ok(()));
        assert_eq!(sink.publish(make_test_signal("B", SignalType::Sell)), Err(SinkError::Full));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "A");

        drop(rx);
        assert_eq!(sink.publish(make_test_signal("C", SignalType::Buy)), Err(SinkError::Closed));
    }
}
