//! Mock implementations for testing
//!
//! Provides an in-memory bus implementing the transport seam, with loopback
//! delivery and injectable failures, and a sink that records every event.

use crate::protocol::Envelope;
use crate::sink::{EventSink, LinkEvent};
use crate::transport::{
    BusClient, BusConnector, BusError, BusEvent, ClientOptions, Endpoint, PubSubConnection,
    Publisher,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure the mock bus can be told to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusFault {
    /// `connect_pubsub` fails as if the broker were down
    SubscribeUnreachable,
    /// `open_publisher` fails as if the broker were down
    PublisherUnreachable,
    /// `publish` hangs and times out
    PublishTimeout,
    /// `subscribe` is accepted but never confirmed
    SilentSubscribe,
    /// `unsubscribe` fails as if the link were reconnecting
    UnsubscribeRejected,
}

#[derive(Debug, Default)]
struct BusState {
    next_client: u64,
    clients_created: usize,
    endpoints: Vec<Endpoint>,
    shutdowns: usize,
    subscribes: Vec<String>,
    unsubscribes: Vec<String>,
    publishers_opened: usize,
    publishers_closed: usize,
    published: Vec<PublishedMessage>,
    faults: HashSet<BusFault>,
    routes: Vec<Route>,
}

#[derive(Debug)]
struct Route {
    client: u64,
    channel: String,
    events: mpsc::UnboundedSender<BusEvent>,
}

/// In-memory pub/sub bus
///
/// Cloning yields another handle to the same bus.
#[derive(Debug, Default, Clone)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent matching operation fail
    pub fn inject(&self, fault: BusFault) {
        lock(&self.state).faults.insert(fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.state).faults.clear();
    }

    /// Deliver a raw payload to every subscriber of `channel`, as a foreign publisher would
    pub fn deliver_raw(&self, channel: &str, payload: &[u8]) {
        Self::route(&lock(&self.state), channel, payload);
    }

    pub fn clients_created(&self) -> usize {
        lock(&self.state).clients_created
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        lock(&self.state).endpoints.clone()
    }

    pub fn shutdown_count(&self) -> usize {
        lock(&self.state).shutdowns
    }

    pub fn subscribes(&self) -> Vec<String> {
        lock(&self.state).subscribes.clone()
    }

    pub fn unsubscribe_count(&self) -> usize {
        lock(&self.state).unsubscribes.len()
    }

    pub fn publishers_opened(&self) -> usize {
        lock(&self.state).publishers_opened
    }

    pub fn publishers_closed(&self) -> usize {
        lock(&self.state).publishers_closed
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    /// Published payloads that decode as envelopes
    pub fn published_envelopes(&self) -> Vec<(String, Envelope)> {
        self.published()
            .into_iter()
            .filter_map(|(channel, payload)| {
                Envelope::decode(&payload).map(|envelope| (channel, envelope))
            })
            .collect()
    }

    /// Channels with at least one live subscriber
    pub fn subscribed_channels(&self) -> Vec<String> {
        lock(&self.state)
            .routes
            .iter()
            .map(|route| route.channel.clone())
            .collect()
    }

    fn has_fault(&self, fault: BusFault) -> bool {
        lock(&self.state).faults.contains(&fault)
    }

    fn route(state: &BusState, channel: &str, payload: &[u8]) {
        for route in state.routes.iter().filter(|r| r.channel == channel) {
            let _ = route.events.send(BusEvent::Message {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            });
        }
    }
}

impl BusConnector for MockBus {
    fn create_client(
        &self,
        endpoint: &Endpoint,
        _options: &ClientOptions,
    ) -> Result<Arc<dyn BusClient>, BusError> {
        let id = {
            let mut state = lock(&self.state);
            state.next_client += 1;
            state.clients_created += 1;
            state.endpoints.push(endpoint.clone());
            state.next_client
        };

        let client: Arc<dyn BusClient> = Arc::new(MockClient {
            id,
            bus: self.clone(),
            endpoint: endpoint.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        });
        Ok(client)
    }
}

struct MockClient {
    id: u64,
    bus: MockBus,
    endpoint: Endpoint,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BusClient for MockClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect_pubsub(
        &self,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Result<Arc<dyn PubSubConnection>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if self.bus.has_fault(BusFault::SubscribeUnreachable) {
            return Err(BusError::unreachable(&self.endpoint, "connection refused"));
        }

        let subscription: Arc<dyn PubSubConnection> = Arc::new(MockSubscription {
            client: self.id,
            bus: self.bus.clone(),
            closed: Arc::clone(&self.closed),
            events,
        });
        Ok(subscription)
    }

    async fn open_publisher(&self) -> Result<Arc<dyn Publisher>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if self.bus.has_fault(BusFault::PublisherUnreachable) {
            return Err(BusError::unreachable(&self.endpoint, "connection refused"));
        }

        lock(&self.bus.state).publishers_opened += 1;
        let publisher: Arc<dyn Publisher> = Arc::new(MockPublisher {
            bus: self.bus.clone(),
            closed: AtomicBool::new(false),
        });
        Ok(publisher)
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = lock(&self.bus.state);
        state.shutdowns += 1;
        state.routes.retain(|route| route.client != self.id);
    }
}

struct MockSubscription {
    client: u64,
    bus: MockBus,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<BusEvent>,
}

#[async_trait]
impl PubSubConnection for MockSubscription {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let silent = {
            let mut state = lock(&self.bus.state);
            state.subscribes.push(channel.to_string());
            state.routes.push(Route {
                client: self.client,
                channel: channel.to_string(),
                events: self.events.clone(),
            });
            state.faults.contains(&BusFault::SilentSubscribe)
        };

        if !silent {
            let _ = self.events.send(BusEvent::Subscribed {
                channel: channel.to_string(),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if self.bus.has_fault(BusFault::UnsubscribeRejected) {
            return Err(BusError::CommandTimeout(format!(
                "link is reconnecting, cannot unsubscribe from {channel}"
            )));
        }

        {
            let mut state = lock(&self.bus.state);
            state.unsubscribes.push(channel.to_string());
            state
                .routes
                .retain(|route| !(route.client == self.client && route.channel == channel));
        }

        let _ = self.events.send(BusEvent::Unsubscribed {
            channel: channel.to_string(),
        });
        Ok(())
    }
}

struct MockPublisher {
    bus: MockBus,
    closed: AtomicBool,
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if self.bus.has_fault(BusFault::PublishTimeout) {
            return Err(BusError::CommandTimeout(format!("publish to {channel}")));
        }

        let mut state = lock(&self.bus.state);
        MockBus::route(&state, channel, &payload);
        state.published.push((channel.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            lock(&self.bus.state).publishers_closed += 1;
        }
    }
}

/// Sink that keeps every delivered event
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        lock(&self.events).clone()
    }

    /// Status texts, in delivery order
    pub fn statuses(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                LinkEvent::Status { text, .. } => Some(text.clone()),
                LinkEvent::Message { .. } => None,
            })
            .collect()
    }

    /// (channel, payload) of delivered messages, in delivery order
    pub fn messages(&self) -> Vec<(String, String)> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                LinkEvent::Message { channel, payload } => Some((channel.clone(), payload.clone())),
                LinkEvent::Status { .. } => None,
            })
            .collect()
    }

    pub fn count_status(&self, text: &str) -> usize {
        self.statuses().iter().filter(|s| *s == text).count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: LinkEvent) {
        lock(&self.events).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(bus: &MockBus) -> Arc<dyn BusClient> {
        bus.create_client(&Endpoint::new("10.0.0.1", 6379), &ClientOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_loopback_delivery() {
        let bus = MockBus::new();
        let client = client(&bus);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let subscription = client.connect_pubsub(events_tx).await.unwrap();
        subscription.subscribe("room1").await.unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some(BusEvent::Subscribed {
                channel: "room1".to_string()
            })
        );

        let publisher = client.open_publisher().await.unwrap();
        publisher.publish("room1", b"hi".to_vec()).await.unwrap();
        publisher.publish("room2", b"elsewhere".to_vec()).await.unwrap();

        assert_eq!(
            events_rx.recv().await,
            Some(BusEvent::Message {
                channel: "room1".to_string(),
                payload: b"hi".to_vec()
            })
        );
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let bus = MockBus::new();
        let client = client(&bus);

        bus.inject(BusFault::SubscribeUnreachable);
        bus.inject(BusFault::PublisherUnreachable);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        assert!(client
            .connect_pubsub(events_tx)
            .await
            .err()
            .unwrap()
            .is_link_unreachable());
        assert!(client
            .open_publisher()
            .await
            .err()
            .unwrap()
            .is_link_unreachable());

        bus.clear_faults();
        bus.inject(BusFault::PublishTimeout);
        let publisher = client.open_publisher().await.unwrap();
        assert!(publisher
            .publish("room1", Vec::new())
            .await
            .unwrap_err()
            .is_command_timeout());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_routes() {
        let bus = MockBus::new();
        let client = client(&bus);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let subscription = client.connect_pubsub(events_tx).await.unwrap();
        subscription.subscribe("room1").await.unwrap();
        assert_eq!(bus.subscribed_channels(), vec!["room1".to_string()]);

        client.shutdown().await;
        client.shutdown().await;

        assert_eq!(bus.shutdown_count(), 1);
        assert!(bus.subscribed_channels().is_empty());
        assert!(matches!(
            subscription.subscribe("room1").await,
            Err(BusError::Closed)
        ));
    }

    #[test]
    fn test_recording_sink_filters() {
        let sink = RecordingSink::new();
        sink.deliver(LinkEvent::status("room1", "room1 subscribed"));
        sink.deliver(LinkEvent::message("room1", "hi"));
        sink.deliver(LinkEvent::status("room1", "room1 subscribed"));

        assert_eq!(sink.count_status("room1 subscribed"), 2);
        assert_eq!(
            sink.messages(),
            vec![("room1".to_string(), "hi".to_string())]
        );
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
