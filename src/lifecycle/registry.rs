//! Connection registry
//!
//! Holds the connection record of the active channel. The manager keeps it at
//! zero or one entries; the registry itself only guarantees that add, remove
//! and iteration are safe from any task.

use crate::transport::{BusClient, Endpoint, PubSubConnection};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One attempted connection to one channel
pub struct ConnectionRecord {
    id: u64,
    client: Arc<dyn BusClient>,
    channel: String,
    subscription: Mutex<Option<Arc<dyn PubSubConnection>>>,
    connected: watch::Sender<bool>,
    retired: AtomicBool,
}

impl ConnectionRecord {
    pub fn new(client: Arc<dyn BusClient>, channel: impl Into<String>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            client,
            channel: channel.into(),
            subscription: Mutex::new(None),
            connected,
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &Arc<dyn BusClient> {
        &self.client
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.client.endpoint()
    }

    pub fn set_subscription(&self, connection: Arc<dyn PubSubConnection>) {
        *lock(&self.subscription) = Some(connection);
    }

    pub fn subscription(&self) -> Option<Arc<dyn PubSubConnection>> {
        lock(&self.subscription).clone()
    }

    /// True between `subscribed` and `unsubscribed`
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// True once teardown has started
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Accept a subscription confirmation; false once the record is retired
    pub fn mark_subscribed(&self) -> bool {
        self.connected.send_if_modified(|connected| {
            if self.retired.load(Ordering::Acquire) {
                return false;
            }
            *connected = true;
            true
        })
    }

    /// Mark the record disconnected; true if it was connected
    pub fn mark_unsubscribed(&self) -> bool {
        self.connected.send_replace(false)
    }

    /// Stop accepting confirmations and report whether the record was connected.
    /// Runs under the same lock as `mark_subscribed`, so no confirmation can
    /// slip in between the check and the flag.
    fn retire(&self) -> bool {
        let mut was_connected = false;
        self.connected.send_if_modified(|connected| {
            self.retired.store(true, Ordering::Release);
            was_connected = *connected;
            false
        });
        was_connected
    }

    /// Retire the record, unsubscribe if connected, then shut the client down.
    ///
    /// Waits up to `unsubscribe_grace` for the unsubscription to be confirmed
    /// so the `unsubscribed` notice is delivered before the link goes away.
    /// Returns true when the record was still connected at release, i.e. the
    /// unsubscription was never confirmed.
    pub async fn teardown(&self, unsubscribe_grace: Duration) -> bool {
        if self.retire() {
            if let Some(subscription) = self.subscription() {
                match subscription.unsubscribe(&self.channel).await {
                    Ok(()) => {
                        let mut connected = self.connected.subscribe();
                        let confirmed = tokio::time::timeout(
                            unsubscribe_grace,
                            connected.wait_for(|connected| !*connected),
                        )
                        .await;
                        if confirmed.is_err() {
                            debug!(record = self.id, channel = %self.channel, "Unsubscribe not confirmed in time");
                        }
                    }
                    Err(e) => {
                        warn!(record = self.id, channel = %self.channel, "Unsubscribe failed: {}", e);
                    }
                }
            }
        }

        self.client.shutdown().await;
        lock(&self.subscription).take();
        let unconfirmed = self.mark_unsubscribed();
        debug!(record = self.id, channel = %self.channel, "Connection record torn down");
        unconfirmed
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("endpoint", self.endpoint())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Thread-safe collection of connection records
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: Mutex<Vec<Arc<ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: Arc<ConnectionRecord>) {
        lock(&self.records).push(record);
    }

    /// Remove `record`; false if it was not registered
    pub fn remove(&self, record: &Arc<ConnectionRecord>) -> bool {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|r| !Arc::ptr_eq(r, record));
        records.len() != before
    }

    pub fn contains(&self, record: &Arc<ConnectionRecord>) -> bool {
        lock(&self.records).iter().any(|r| Arc::ptr_eq(r, record))
    }

    /// Copy of the current records, safe to iterate across awaits
    pub fn snapshot(&self) -> Vec<Arc<ConnectionRecord>> {
        lock(&self.records).clone()
    }

    pub fn first(&self) -> Option<Arc<ConnectionRecord>> {
        lock(&self.records).first().cloned()
    }

    /// A record bound to a channel other than `channel`
    pub fn find_conflict(&self, channel: &str) -> Option<Arc<ConnectionRecord>> {
        lock(&self.records)
            .iter()
            .find(|r| r.channel() != channel)
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    pub fn connected_count(&self) -> usize {
        lock(&self.records).iter().filter(|r| r.is_connected()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;
    use crate::transport::{BusConnector, ClientOptions, Endpoint};

    fn record(bus: &MockBus, channel: &str) -> Arc<ConnectionRecord> {
        let client = bus
            .create_client(&Endpoint::new("10.0.0.1", 6379), &ClientOptions::default())
            .unwrap();
        Arc::new(ConnectionRecord::new(client, channel))
    }

    #[test]
    fn test_add_remove_snapshot() {
        let bus = MockBus::new();
        let registry = ConnectionRegistry::new();
        let a = record(&bus, "room1");
        let b = record(&bus, "room2");

        registry.add(a.clone());
        registry.add(b.clone());
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&a));

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        let remaining = registry.snapshot();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
    }

    #[test]
    fn test_find_conflict() {
        let bus = MockBus::new();
        let registry = ConnectionRegistry::new();
        registry.add(record(&bus, "room1"));

        assert!(registry.find_conflict("room1").is_none());
        let conflict = registry.find_conflict("room2").unwrap();
        assert_eq!(conflict.channel(), "room1");
    }

    #[test]
    fn test_records_have_distinct_ids() {
        let bus = MockBus::new();
        assert_ne!(record(&bus, "a").id(), record(&bus, "a").id());
    }

    #[tokio::test]
    async fn test_teardown_of_unconnected_record_only_shuts_down() {
        let bus = MockBus::new();
        let record = record(&bus, "room1");
        assert!(!record.is_connected());

        assert!(!record.teardown(Duration::from_millis(100)).await);

        assert!(record.is_retired());
        assert_eq!(bus.unsubscribe_count(), 0);
        assert_eq!(bus.shutdown_count(), 1);
        assert!(record.subscription().is_none());
    }

    #[tokio::test]
    async fn test_teardown_waits_for_unsubscribed_confirmation() {
        let bus = MockBus::new();
        let record = record(&bus, "room1");
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let connection = record.client().connect_pubsub(events_tx).await.unwrap();
        record.set_subscription(connection.clone());
        connection.subscribe("room1").await.unwrap();
        assert!(record.mark_subscribed());

        // Plays the listener: confirm the unsubscription as it arrives
        let listener_record = record.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let crate::transport::BusEvent::Unsubscribed { .. } = event {
                    listener_record.mark_unsubscribed();
                }
            }
        });

        assert!(!record.teardown(Duration::from_secs(1)).await);

        assert!(!record.is_connected());
        assert_eq!(bus.unsubscribe_count(), 1);
        assert_eq!(bus.shutdown_count(), 1);
        listener.abort();
    }

    #[test]
    fn test_retired_record_refuses_confirmation() {
        let bus = MockBus::new();
        let record = record(&bus, "room1");

        assert!(!record.retire());
        assert!(!record.mark_subscribed());
        assert!(!record.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_reports_unconfirmed_unsubscribe() {
        let bus = MockBus::new();
        let record = record(&bus, "room1");
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let connection = record.client().connect_pubsub(events_tx).await.unwrap();
        record.set_subscription(connection);
        assert!(record.mark_subscribed());

        // No listener confirms the unsubscription
        assert!(record.teardown(Duration::from_secs(1)).await);

        assert!(!record.is_connected());
        assert_eq!(bus.unsubscribe_count(), 1);
        assert_eq!(bus.shutdown_count(), 1);
    }
}
