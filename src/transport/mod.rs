//! Transport layer for the pub/sub bus
//!
//! This module defines the seam between the connection lifecycle core and the
//! bus client that actually speaks the wire protocol. The core only ever talks
//! to these traits, so the MQTT implementation in [`mqtt`] and the in-memory
//! bus in [`crate::testing`] are interchangeable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Host/port pair of a bus broker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Options every bus client is created with
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Constant delay between link-level reconnection attempts
    pub reconnect_delay: Duration,
    /// Keep-alive interval negotiated with the broker
    pub keep_alive: Duration,
    /// How long to wait for the broker to acknowledge a new link
    pub connect_timeout: Duration,
    /// How long a single command may take before it counts as hung
    pub command_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Asynchronous notifications delivered by a subscription link
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// The broker confirmed a subscription
    Subscribed { channel: String },
    /// The broker confirmed an unsubscription
    Unsubscribed { channel: String },
    /// A message was published to a subscribed channel
    Message { channel: String, payload: Vec<u8> },
}

/// Bus-level failures, classified the way the lifecycle core reacts to them
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached when opening a link
    #[error("bus unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },
    /// The link was accepted but a command hung or failed
    #[error("command timed out: {0}")]
    CommandTimeout(String),
    /// The client was already shut down
    #[error("bus client closed")]
    Closed,
    /// Any other protocol-level failure
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BusError {
    pub fn unreachable(endpoint: &Endpoint, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    /// Connect-time failure: nothing is listening at the endpoint
    pub fn is_link_unreachable(&self) -> bool {
        matches!(self, BusError::Unreachable { .. })
    }

    /// Command-time failure on an accepted link
    pub fn is_command_timeout(&self) -> bool {
        matches!(self, BusError::CommandTimeout(_))
    }
}

/// Creates bus clients; one client per connection record
pub trait BusConnector: Send + Sync {
    /// Build a client for `endpoint`. Performs no I/O.
    fn create_client(
        &self,
        endpoint: &Endpoint,
        options: &ClientOptions,
    ) -> Result<Arc<dyn BusClient>, BusError>;
}

/// A client bound to one broker endpoint
#[async_trait::async_trait]
pub trait BusClient: Send + Sync {
    /// Endpoint this client was created for
    fn endpoint(&self) -> &Endpoint;

    /// Open the subscription link. Events for this link are sent to `events`.
    async fn connect_pubsub(
        &self,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Result<Arc<dyn PubSubConnection>, BusError>;

    /// Open a dedicated outbound link used only for publishing
    async fn open_publisher(&self) -> Result<Arc<dyn Publisher>, BusError>;

    /// Release every link opened by this client. Idempotent.
    async fn shutdown(&self);
}

/// Subscription side of a link
#[async_trait::async_trait]
pub trait PubSubConnection: Send + Sync {
    /// Request a subscription; confirmation arrives as [`BusEvent::Subscribed`]
    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Request an unsubscription; confirmation arrives as [`BusEvent::Unsubscribed`]
    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;
}

/// Publish side of a link
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Close the outbound link. Idempotent.
    async fn close(&self);
}

/// Type alias for the production bus connector
pub type MqttBus = mqtt::MqttConnector;
