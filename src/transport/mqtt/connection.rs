//! Pure connection state management for MQTT links
//!
//! This module contains pure functions for link state transitions and
//! option construction. Nothing here touches the network.

use crate::transport::{ClientOptions, Endpoint};
use rumqttc::v5::MqttOptions;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Connection state of a single MQTT link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for ConnAck
    Connecting,
    /// Broker acknowledged the link
    Connected,
    /// Link lost with reason; the supervisor keeps retrying
    Disconnected(String),
    /// Waiting out the constant backoff before the given attempt
    Reconnecting(u32),
    /// Link released on request
    Closed,
}

/// Events that drive [`ConnectionState`] transitions
#[derive(Debug, Clone)]
pub enum LinkEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    ShutdownRequested,
}

/// What a link is used for; only affects its client id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Subscriber,
    Publisher,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Subscriber => write!(f, "sub"),
            LinkRole::Publisher => write!(f, "pub"),
        }
    }
}

/// Determine next state after a link event (pure function)
pub fn next_state(event: LinkEvent) -> ConnectionState {
    match event {
        LinkEvent::ConnAckReceived => ConnectionState::Connected,
        LinkEvent::DisconnectedByBroker => {
            ConnectionState::Disconnected("Broker disconnected".to_string())
        }
        LinkEvent::NetworkError(error) => ConnectionState::Disconnected(error),
        LinkEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
        LinkEvent::ShutdownRequested => ConnectionState::Closed,
    }
}

/// Commands are only accepted by the broker while the link is up (pure function)
pub fn can_issue_commands(state: &ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected)
}

/// Log a link state transition
pub fn log_state_transition(endpoint: &Endpoint, from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!(%endpoint, "Bus link established");
        }
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
            info!(%endpoint, attempt, "Bus link re-established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
            warn!(%endpoint, %reason, "Bus link lost");
        }
        (_, ConnectionState::Disconnected(reason)) => {
            error!(%endpoint, %reason, "Bus link error");
        }
        _ => {
            tracing::debug!(%endpoint, "Bus link state: {:?} -> {:?}", from, to);
        }
    }
}

/// Build MQTT options for a link (pure function apart from the random client id)
pub fn configure_mqtt_options(
    endpoint: &Endpoint,
    options: &ClientOptions,
    role: LinkRole,
) -> MqttOptions {
    // A fresh client id per link keeps the subscriber and publisher from kicking each other off
    let client_id = format!("chanlink-{role}-{}", uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
    mqtt_options.set_keep_alive(options.keep_alive.max(Duration::from_secs(5)));
    mqtt_options
}

/// Wait until the link is acknowledged, or fail on the first error or timeout
pub async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), String> {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) => return Err(reason.clone()),
                ConnectionState::Closed => return Err("link closed".to_string()),
                ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
            }
            if state_rx.changed().await.is_err() {
                return Err("state channel closed".to_string());
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err("ConnAck timeout - no connection confirmation received".to_string()),
    }
}
