//! Thread-safe link metrics
//!
//! Atomic counters for connection lifecycle, traffic and heartbeat activity,
//! plus a bounded window of publish latencies.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum number of publish latency samples kept
const LATENCY_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<LinkMetrics> = Lazy::new(LinkMetrics::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static LinkMetrics {
    &METRICS
}

pub struct LinkMetrics {
    // Connection lifecycle
    connected: AtomicBool,
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connect_failures: AtomicU64,
    reconnects: AtomicU64,
    disconnects: AtomicU64,
    connected_since: AtomicU64,

    // Traffic
    messages_received: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publish_latencies: Mutex<Vec<u64>>, // in milliseconds

    // Heartbeat
    heartbeats_sent: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    last_heartbeat: AtomicU64,

    started_at: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            connected_since: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_latencies: Mutex::new(Vec::new()),
            heartbeats_sent: AtomicU64::new(0),
            heartbeat_timeouts: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection lifecycle
    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    // Traffic
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self, latency: Duration) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = self.publish_latencies.lock() {
            latencies.push(latency.as_millis() as u64);
            if latencies.len() > LATENCY_WINDOW {
                latencies.remove(0);
            }
        }
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Heartbeat
    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn heartbeat_timed_out(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connect_attempts,
            &self.connections_established,
            &self.connect_failures,
            &self.reconnects,
            &self.disconnects,
            &self.connected_since,
            &self.messages_received,
            &self.messages_published,
            &self.publish_failures,
            &self.heartbeats_sent,
            &self.heartbeat_timeouts,
            &self.last_heartbeat,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.started_at
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut latencies) = self.publish_latencies.lock() {
            latencies.clear();
        }
    }

    /// Publish latency statistics: (avg, p50, p95) in milliseconds (pure function)
    fn latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(latencies) = self.publish_latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected = self.connected.load(Ordering::Relaxed);
        let connected_since = self.connected_since.load(Ordering::Relaxed);
        let connection_duration_seconds = if connected && connected_since > 0 {
            now.saturating_sub(connected_since)
        } else {
            0
        };
        let (avg_publish_latency_ms, publish_latency_p50_ms, publish_latency_p95_ms) =
            self.latency_statistics();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected,
                connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connect_failures: self.connect_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                disconnects: self.disconnects.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            traffic: TrafficMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                avg_publish_latency_ms,
                publish_latency_p50_ms,
                publish_latency_p95_ms,
            },
            heartbeat: HeartbeatMetrics {
                heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
                heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub traffic: TrafficMetrics,
    pub heartbeat: HeartbeatMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connect_failures: u64,
    pub reconnects: u64,
    pub disconnects: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct TrafficMetrics {
    pub messages_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub avg_publish_latency_ms: f64,
    pub publish_latency_p50_ms: f64,
    pub publish_latency_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatMetrics {
    pub heartbeats_sent: u64,
    pub heartbeat_timeouts: u64,
    pub last_heartbeat: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let collector = LinkMetrics::new();

        collector.connect_attempt();
        collector.connection_established();
        collector.reconnect();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connection.connect_attempts, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert_eq!(snapshot.connection.reconnects, 1);
        assert!(snapshot.connection.connected);

        collector.disconnected();
        let snapshot = collector.snapshot();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.disconnects, 1);
        assert_eq!(snapshot.connection.connection_duration_seconds, 0);
    }

    #[test]
    fn test_traffic_and_heartbeat_metrics() {
        let collector = LinkMetrics::new();

        collector.message_received();
        collector.message_published(Duration::from_millis(20));
        collector.message_published(Duration::from_millis(40));
        collector.publish_failed();
        collector.heartbeat_sent();
        collector.heartbeat_timed_out();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.traffic.messages_received, 1);
        assert_eq!(snapshot.traffic.messages_published, 2);
        assert_eq!(snapshot.traffic.publish_failures, 1);
        assert!((snapshot.traffic.avg_publish_latency_ms - 30.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.heartbeat.heartbeats_sent, 1);
        assert_eq!(snapshot.heartbeat.heartbeat_timeouts, 1);
        assert!(snapshot.heartbeat.last_heartbeat > 0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = LinkMetrics::new();
        for i in 0..1500 {
            collector.message_published(Duration::from_millis(i));
        }

        assert_eq!(collector.publish_latencies.lock().unwrap().len(), LATENCY_WINDOW);
        // Only the newest 1000 samples (500..1500) remain
        assert!(collector.snapshot().traffic.publish_latency_p50_ms > 900.0);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(LinkMetrics::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.message_received();
                        collector.heartbeat_sent();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.traffic.messages_received, 1000);
        assert_eq!(snapshot.heartbeat.heartbeats_sent, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.5).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = LinkMetrics::new();
        collector.connect_attempt();

        let json = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(json["connection"]["connect_attempts"], 1);
        assert!(json["traffic"].is_object());
    }

    #[test]
    fn test_reset() {
        let collector = LinkMetrics::new();
        collector.connect_attempt();
        collector.connection_established();
        collector.message_published(Duration::from_millis(5));

        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connection.connect_attempts, 0);
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.traffic.avg_publish_latency_ms, 0.0);
    }
}
