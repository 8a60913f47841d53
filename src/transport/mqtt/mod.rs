//! MQTT implementation of the bus client
//!
//! Channels map one-to-one onto MQTT topics. Every link runs its own
//! reconnection supervisor with a constant backoff, so the lifecycle core
//! never sees transient link drops, only the failure classes it reacts to.
//!
//! # Architecture
//!
//! - [`connection`] - Pure link state transitions and option construction
//! - [`message_handler`] - Pure event routing and ack bookkeeping
//! - [`client`] - Impure I/O: event loops, supervisors, commands
//!
//! # Usage
//!
//! ```rust,no_run
//! use chanlink::transport::{BusConnector, ClientOptions, Endpoint};
//! use chanlink::transport::mqtt::MqttConnector;
//!
//! # tokio_test::block_on(async {
//! let client = MqttConnector::new()
//!     .create_client(&Endpoint::new("localhost", 1883), &ClientOptions::default())?;
//! let publisher = client.open_publisher().await?;
//! publisher.publish("room1", b"hello".to_vec()).await?;
//! client.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttBusClient, MqttConnector, MqttLink};
pub use connection::{ConnectionState, LinkRole};
pub use message_handler::{EventRoute, MessageHandler};
