//! Outbound message channel abstraction.
//!
//! The session only ever hands envelopes to a [`MessageChannel`]; it never
//! touches sockets. `send` must not block: a channel that cannot accept a
//! message right now reports it and the caller degrades to the offline path.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{Envelope, ProtocolError};

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Channel full")]
    Full,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One-way, event-typed outbound channel.
pub trait MessageChannel: Send {
    fn send(&self, envelope: &Envelope<Value>) -> Result<(), ChannelError>;
}

/// In-process channel delivering envelopes to a receiver. Used by tests and
/// by embedders that bridge the session to their own transport.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Envelope<Value>>,
}

impl MemoryChannel {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Envelope<Value>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageChannel for MemoryChannel {
    fn send(&self, envelope: &Envelope<Value>) -> Result<(), ChannelError> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| ChannelError::Closed)
    }
}

/// Feeds encoded frames to a WebSocket writer task.
#[derive(Debug, Clone)]
pub struct WsChannel {
    outgoing: mpsc::Sender<String>,
}

impl WsChannel {
    pub fn new(outgoing: mpsc::Sender<String>) -> Self {
        Self { outgoing }
    }
}

impl MessageChannel for WsChannel {
    fn send(&self, envelope: &Envelope<Value>) -> Result<(), ChannelError> {
        let frame = envelope.encode()?;
        self.outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_channel_delivers() {
        let (channel, mut rx) = MemoryChannel::pair();
        channel
            .send(&Envelope::new("chat", json!({"text": "hi"})))
            .unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.event, "chat");
    }

    #[test]
    fn test_memory_channel_closed() {
        let (channel, rx) = MemoryChannel::pair();
        drop(rx);
        assert!(matches!(
            channel.send(&Envelope::new("chat", json!(null))),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn test_ws_channel_full_and_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = WsChannel::new(tx);
        let envelope = Envelope::new("user_positions", json!({"position": [0, 0, 0]}));

        channel.send(&envelope).unwrap();
        assert!(matches!(channel.send(&envelope), Err(ChannelError::Full)));

        let frame = rx.try_recv().unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), envelope);

        drop(rx);
        assert!(matches!(channel.send(&envelope), Err(ChannelError::Closed)));
    }
}
