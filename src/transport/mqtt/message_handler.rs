//! Pure message routing for MQTT events
//!
//! Maps raw rumqttc events onto routing decisions and keeps track of which
//! channel an outstanding SubAck/UnsubAck belongs to.

use crate::protocol::validate_channel;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use std::collections::VecDeque;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { channel: String, payload: Vec<u8> },
    /// SubAck received; `granted` is false if the broker refused the filter
    SubscriptionConfirmed { granted: bool },
    /// UnsubAck received
    UnsubscriptionConfirmed,
    /// MQTT broker disconnected
    Disconnected,
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    channel: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    granted: suback
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
                },
                Packet::UnsubAck(_) => EventRoute::UnsubscriptionConfirmed,
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Channels double as MQTT topic names, so wildcards are not allowed
    pub fn validate_channel(channel: &str) -> Result<(), String> {
        validate_channel(channel).map_err(|e| e.to_string())
    }
}

/// Kind of command awaiting a broker acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// FIFO of commands awaiting SubAck/UnsubAck
///
/// The broker acknowledges commands on one link in the order they were sent,
/// so the oldest pending entry of the matching kind owns the next ack.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: VecDeque<(AckKind, String)>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&mut self, kind: AckKind, channel: &str) {
        self.pending.push_back((kind, channel.to_string()));
    }

    /// Resolve the oldest pending command of `kind`, returning its channel
    pub fn resolve(&mut self, kind: AckKind) -> Option<String> {
        let index = self.pending.iter().position(|(k, _)| *k == kind)?;
        self.pending.remove(index).map(|(_, channel)| channel)
    }

    /// Drop the most recent pending command for `channel` (the send itself failed)
    pub fn forget(&mut self, kind: AckKind, channel: &str) {
        if let Some(index) = self
            .pending
            .iter()
            .rposition(|(k, c)| *k == kind && c == channel)
        {
            self.pending.remove(index);
        }
    }

    /// Acks for commands sent on a dropped link never arrive
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("room1"),
            pkid: 1,
            payload: Bytes::from("hi"),
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                channel: "room1".to_string(),
                payload: b"hi".to_vec(),
            }
        );
    }

    #[test]
    fn test_validate_channel() {
        assert!(MessageHandler::validate_channel("room1").is_ok());
        assert!(MessageHandler::validate_channel("lobby/general").is_ok());
        assert!(MessageHandler::validate_channel("").is_err());
        assert!(MessageHandler::validate_channel("room/+").is_err());
        assert!(MessageHandler::validate_channel("#").is_err());
    }

    #[test]
    fn test_ack_tracker_matches_in_order() {
        let mut tracker = AckTracker::new();
        tracker.expect(AckKind::Subscribe, "room1");
        tracker.expect(AckKind::Unsubscribe, "room1");
        tracker.expect(AckKind::Subscribe, "room2");

        assert_eq!(tracker.resolve(AckKind::Unsubscribe), Some("room1".to_string()));
        assert_eq!(tracker.resolve(AckKind::Subscribe), Some("room1".to_string()));
        assert_eq!(tracker.resolve(AckKind::Subscribe), Some("room2".to_string()));
        assert_eq!(tracker.resolve(AckKind::Subscribe), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_ack_tracker_forget_and_clear() {
        let mut tracker = AckTracker::new();
        tracker.expect(AckKind::Subscribe, "room1");
        tracker.expect(AckKind::Subscribe, "room2");
        tracker.forget(AckKind::Subscribe, "room2");
        assert_eq!(tracker.len(), 1);

        tracker.clear();
        assert_eq!(tracker.resolve(AckKind::Subscribe), None);
    }
}
