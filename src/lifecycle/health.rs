//! Periodic heartbeat over the publish link
//!
//! Once a channel is subscribed the monitor publishes a heartbeat envelope to
//! every registered record on a fixed interval. A hung command on an accepted
//! link is reported as "fail to reconnect"; a broker that cannot be reached at
//! all is only logged, since the subscription link already reports that.

use crate::heartbeat_span;
use crate::observability::metrics::metrics;
use crate::protocol::{Envelope, StatusNotice};
use crate::transport::{BusError, Publisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

use super::registry::ConnectionRecord;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the monitor needs from the connection manager
#[async_trait]
pub trait HeartbeatTarget: Send + Sync {
    /// Records to probe on this tick
    fn records(&self) -> Vec<Arc<ConnectionRecord>>;

    /// Shared publish handle, created lazily from `record`'s client
    async fn publisher_for(
        &self,
        record: &ConnectionRecord,
    ) -> Result<Option<Arc<dyn Publisher>>, BusError>;

    /// Origin stamped on heartbeat envelopes
    fn origin(&self) -> Uuid;

    /// Report a status notice for `channel`
    fn report(&self, channel: &str, notice: StatusNotice);
}

/// Result of probing one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Heartbeat published
    Sent,
    /// No publish handle could be obtained (no active connection)
    Skipped,
    /// Broker unreachable while opening the publish link; logged only
    LinkDown,
    /// Command hung on an accepted link; reported to the sink
    TimedOut,
    /// Any other failure; logged only
    Failed(String),
}

/// Heartbeat scheduler
pub struct HealthMonitor {
    interval: Duration,
    initial_delay: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    last_sent: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration, initial_delay: Duration) -> Self {
        Self {
            interval,
            initial_delay,
            task: Mutex::new(None),
            last_sent: Arc::new(Mutex::new(None)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start (or restart) the periodic heartbeat against `target`
    ///
    /// The task stops by itself once `target` is dropped.
    pub fn arm(&self, target: Weak<dyn HeartbeatTarget>) {
        let interval = self.interval;
        let initial_delay = self.initial_delay;
        let last_sent = Arc::clone(&self.last_sent);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                let Some(target) = target.upgrade() else {
                    debug!("Heartbeat target dropped, stopping monitor");
                    return;
                };
                let outcomes = beat(target.as_ref())
                    .instrument(heartbeat_span!())
                    .await;
                drop(target);

                if outcomes.contains(&HeartbeatOutcome::Sent) {
                    *lock(&last_sent) = Some(Utc::now());
                }
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = lock(&self.task).replace(handle) {
            previous.abort();
        }
        debug!(interval_secs = interval.as_secs(), "Heartbeat armed");
    }

    /// Stop the periodic heartbeat. Idempotent.
    pub fn disarm(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            debug!("Heartbeat disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// When the last heartbeat was published successfully
    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_sent)
    }

    /// Classify a heartbeat failure (pure function)
    pub fn classify_failure(error: &BusError) -> HeartbeatOutcome {
        match error {
            BusError::CommandTimeout(_) => HeartbeatOutcome::TimedOut,
            BusError::Unreachable { .. } => HeartbeatOutcome::LinkDown,
            other => HeartbeatOutcome::Failed(other.to_string()),
        }
    }

    /// Whether an outcome must be reported to the sink (pure function)
    pub fn should_report(outcome: &HeartbeatOutcome) -> bool {
        matches!(outcome, HeartbeatOutcome::TimedOut)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// Probe every record of `target` once
pub async fn beat(target: &dyn HeartbeatTarget) -> Vec<HeartbeatOutcome> {
    let mut outcomes = Vec::new();

    for record in target.records() {
        let outcome = probe(target, &record).await;
        match &outcome {
            HeartbeatOutcome::Sent => {
                metrics().heartbeat_sent();
                debug!(channel = record.channel(), "Heartbeat sent");
            }
            HeartbeatOutcome::Skipped => {
                debug!(channel = record.channel(), "Heartbeat skipped - no publish link");
            }
            HeartbeatOutcome::LinkDown => {
                warn!(
                    channel = record.channel(),
                    endpoint = %record.endpoint(),
                    "Heartbeat could not open publish link - broker unreachable"
                );
            }
            HeartbeatOutcome::TimedOut => {
                metrics().heartbeat_timed_out();
                error!(
                    channel = record.channel(),
                    endpoint = %record.endpoint(),
                    "Heartbeat command timed out"
                );
            }
            HeartbeatOutcome::Failed(reason) => {
                warn!(channel = record.channel(), "Heartbeat failed: {}", reason);
            }
        }

        if HealthMonitor::should_report(&outcome) {
            target.report(record.channel(), StatusNotice::FailToReconnect);
        }
        outcomes.push(outcome);
    }

    outcomes
}

async fn probe(target: &dyn HeartbeatTarget, record: &ConnectionRecord) -> HeartbeatOutcome {
    let publisher = match target.publisher_for(record).await {
        Ok(Some(publisher)) => publisher,
        Ok(None) => return HeartbeatOutcome::Skipped,
        Err(e) => return HealthMonitor::classify_failure(&e),
    };

    let payload = match Envelope::heartbeat(target.origin()).encode() {
        Ok(payload) => payload,
        Err(e) => return HeartbeatOutcome::Failed(e.to_string()),
    };

    match publisher.publish(record.channel(), payload).await {
        Ok(()) => HeartbeatOutcome::Sent,
        Err(e) => HealthMonitor::classify_failure(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BusFault, MockBus};
    use crate::transport::{BusConnector, ClientOptions, Endpoint};

    struct FakeTarget {
        bus: MockBus,
        records: Vec<Arc<ConnectionRecord>>,
        origin: Uuid,
        reports: Mutex<Vec<(String, StatusNotice)>>,
    }

    impl FakeTarget {
        fn new(bus: MockBus, channels: &[&str]) -> Self {
            let records = channels
                .iter()
                .map(|channel| {
                    let client = bus
                        .create_client(&Endpoint::new("10.0.0.1", 6379), &ClientOptions::default())
                        .unwrap();
                    Arc::new(ConnectionRecord::new(client, *channel))
                })
                .collect();
            Self {
                bus,
                records,
                origin: Uuid::new_v4(),
                reports: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HeartbeatTarget for FakeTarget {
        fn records(&self) -> Vec<Arc<ConnectionRecord>> {
            self.records.clone()
        }

        async fn publisher_for(
            &self,
            record: &ConnectionRecord,
        ) -> Result<Option<Arc<dyn Publisher>>, BusError> {
            record.client().open_publisher().await.map(Some)
        }

        fn origin(&self) -> Uuid {
            self.origin
        }

        fn report(&self, channel: &str, notice: StatusNotice) {
            self.reports.lock().unwrap().push((channel.to_string(), notice));
        }
    }

    #[test]
    fn test_classify_failure() {
        let endpoint = Endpoint::new("10.0.0.1", 6379);
        assert_eq!(
            HealthMonitor::classify_failure(&BusError::CommandTimeout("publish".into())),
            HeartbeatOutcome::TimedOut
        );
        assert_eq!(
            HealthMonitor::classify_failure(&BusError::unreachable(&endpoint, "refused")),
            HeartbeatOutcome::LinkDown
        );
        assert!(matches!(
            HealthMonitor::classify_failure(&BusError::Closed),
            HeartbeatOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_only_timeouts_are_reported() {
        assert!(HealthMonitor::should_report(&HeartbeatOutcome::TimedOut));
        assert!(!HealthMonitor::should_report(&HeartbeatOutcome::LinkDown));
        assert!(!HealthMonitor::should_report(&HeartbeatOutcome::Sent));
        assert!(!HealthMonitor::should_report(&HeartbeatOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_beat_publishes_heartbeat_envelope() {
        let target = FakeTarget::new(MockBus::new(), &["room1"]);

        let outcomes = beat(&target).await;

        assert_eq!(outcomes, vec![HeartbeatOutcome::Sent]);
        let published = target.bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "room1");
        let envelope = Envelope::decode(&published[0].1).unwrap();
        assert_eq!(envelope.kind, crate::protocol::EnvelopeKind::Heartbeat);
        assert_eq!(envelope.origin, target.origin);
        assert!(target.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_command_timeout_reports_fail_to_reconnect_once() {
        let bus = MockBus::new();
        bus.inject(BusFault::PublishTimeout);
        let target = FakeTarget::new(bus, &["room1"]);

        let outcomes = beat(&target).await;

        assert_eq!(outcomes, vec![HeartbeatOutcome::TimedOut]);
        let reports = target.reports.lock().unwrap();
        assert_eq!(
            *reports,
            vec![("room1".to_string(), StatusNotice::FailToReconnect)]
        );
    }

    #[tokio::test]
    async fn test_unreachable_publisher_is_logged_only() {
        let bus = MockBus::new();
        bus.inject(BusFault::PublisherUnreachable);
        let target = FakeTarget::new(bus, &["room1"]);

        let outcomes = beat(&target).await;

        assert_eq!(outcomes, vec![HeartbeatOutcome::LinkDown]);
        assert!(target.reports.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_and_disarm() {
        let target: Arc<dyn HeartbeatTarget> =
            Arc::new(FakeTarget::new(MockBus::new(), &["room1"]));
        let monitor = HealthMonitor::new(Duration::from_secs(60), Duration::from_millis(10));

        monitor.arm(Arc::downgrade(&target));
        assert!(monitor.is_armed());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.last_sent().is_some());

        monitor.disarm();
        assert!(!monitor.is_armed());
        monitor.disarm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_when_target_dropped() {
        let target: Arc<dyn HeartbeatTarget> =
            Arc::new(FakeTarget::new(MockBus::new(), &["room1"]));
        let monitor = HealthMonitor::new(Duration::from_secs(1), Duration::from_millis(10));

        monitor.arm(Arc::downgrade(&target));
        drop(target);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!monitor.is_armed());
    }
}
