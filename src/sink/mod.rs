//! Event delivery to the external collaborator
//!
//! The lifecycle core never renders anything itself; it hands every status
//! transition and every chat message to an [`EventSink`].

use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

pub mod log;

pub use log::{EventLog, LogEntry, DEFAULT_LOG_CAPACITY};

/// Event emitted to the external collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Lifecycle notice for a channel
    Status { channel: String, text: String },
    /// Ordinary bus traffic
    Message { channel: String, payload: String },
}

impl LinkEvent {
    pub fn status(channel: impl Into<String>, text: impl Into<String>) -> Self {
        LinkEvent::Status {
            channel: channel.into(),
            text: text.into(),
        }
    }

    pub fn message(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        LinkEvent::Message {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            LinkEvent::Status { channel, .. } | LinkEvent::Message { channel, .. } => channel,
        }
    }
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Status { channel, text } => write!(f, "[{channel}] * {text}"),
            LinkEvent::Message { channel, payload } => write!(f, "[{channel}] {payload}"),
        }
    }
}

/// Receiver of lifecycle and message events
///
/// Called from worker tasks; implementations must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: LinkEvent);
}

/// Sink forwarding events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: LinkEvent) {
        if self.sender.send(event).is_err() {
            debug!("Event dropped - receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        assert_eq!(
            LinkEvent::status("room1", "room1 subscribed").to_string(),
            "[room1] * room1 subscribed"
        );
        assert_eq!(LinkEvent::message("room1", "hi").to_string(), "[room1] hi");
        assert_eq!(LinkEvent::message("room2", "x").channel(), "room2");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_in_order() {
        let (sink, mut receiver) = ChannelSink::new();
        sink.deliver(LinkEvent::status("room1", "room1 subscribed"));
        sink.deliver(LinkEvent::message("room1", "hi"));

        assert_eq!(
            receiver.recv().await,
            Some(LinkEvent::status("room1", "room1 subscribed"))
        );
        assert_eq!(receiver.recv().await, Some(LinkEvent::message("room1", "hi")));
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, receiver) = ChannelSink::new();
        drop(receiver);
        sink.deliver(LinkEvent::message("room1", "lost"));
    }
}
