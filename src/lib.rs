//! chanlink - single-channel pub/sub link
//!
//! Joins one named channel on a publish/subscribe bus, exchanges short text
//! messages over it and recovers from connection loss.
//!
//! # Overview
//!
//! - [`lifecycle`]: the connection manager with its registry, debouncer and heartbeat monitor
//! - [`transport`]: the bus client seam and its MQTT implementation
//! - [`protocol`]: the message envelope and status notice texts
//! - [`sink`]: delivery of status and message events, plus a capped event log
//!
//! # Quick Start
//!
//! ```rust
//! use chanlink::lifecycle::{ConnectionManager, ManagerSettings};
//! use chanlink::testing::{MockBus, RecordingSink};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let bus = MockBus::new();
//! let sink = Arc::new(RecordingSink::new());
//! let settings = ManagerSettings {
//!     debounce: Duration::from_millis(10),
//!     ..ManagerSettings::default()
//! };
//! let manager = ConnectionManager::new(Arc::new(bus.clone()), sink.clone(), settings);
//!
//! manager.request_connect("10.0.0.1", 6379, "room1");
//! tokio::time::sleep(Duration::from_millis(100)).await;
//!
//! assert_eq!(
//!     sink.statuses()[..2],
//!     ["room1 subscribed", "successfully connected. room1 - 10.0.0.1:6379"]
//! );
//! manager.shutdown().await;
//! # });
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod sink;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, LinkConfig};
pub use error::{LinkError, LinkResult};
pub use lifecycle::{ConnectionManager, ManagerSettings};
pub use sink::{EventSink, LinkEvent};
