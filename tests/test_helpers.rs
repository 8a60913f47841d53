//! Test helpers and utilities for integration tests

use chanlink::lifecycle::{ConnectionManager, ManagerSettings};
use chanlink::testing::{MockBus, RecordingSink};
use chanlink::transport::ClientOptions;
use std::sync::Arc;
use std::time::Duration;

/// Debounce window used by every harness
#[allow(dead_code)]
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Heartbeat period short enough to step through several ticks
#[allow(dead_code)]
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first heartbeat
#[allow(dead_code)]
pub const HEARTBEAT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Settings used by integration tests
#[allow(dead_code)]
pub fn test_settings() -> ManagerSettings {
    ManagerSettings {
        debounce: DEBOUNCE,
        heartbeat_interval: HEARTBEAT_INTERVAL,
        heartbeat_initial_delay: HEARTBEAT_INITIAL_DELAY,
        client_options: ClientOptions::default(),
    }
}

/// Manager wired to an in-memory bus and a recording sink
pub struct Harness {
    pub bus: MockBus,
    pub sink: Arc<RecordingSink>,
    pub manager: ConnectionManager,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        let bus = MockBus::new();
        let sink = Arc::new(RecordingSink::new());
        let manager = ConnectionManager::new(Arc::new(bus.clone()), sink.clone(), settings);
        Self { bus, sink, manager }
    }

    /// Connect to `channel` on 10.0.0.1:6379 and let the debounced command run
    pub async fn connect(&self, channel: &str) {
        self.manager.request_connect("10.0.0.1", 6379, channel);
        settle_debounce().await;
    }

    pub async fn disconnect(&self) {
        self.manager.request_disconnect();
        settle_debounce().await;
    }

    pub fn statuses(&self) -> Vec<String> {
        self.sink.statuses()
    }
}

/// Sleep past the debounce window; with paused time every spawned task runs first
#[allow(dead_code)]
pub async fn settle_debounce() {
    tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;
}

/// Let spawned tasks run without crossing any timer
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
