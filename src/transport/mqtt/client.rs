//! Impure I/O operations for the MQTT bus client
//!
//! This module handles all network communication: it owns the rumqttc event
//! loops, runs one reconnection supervisor per link and translates broker
//! acknowledgements into [`BusEvent`]s.

use super::connection::{
    can_issue_commands, configure_mqtt_options, log_state_transition, next_state,
    wait_for_connection_confirmation, ConnectionState, LinkEvent, LinkRole,
};
use super::message_handler::{AckKind, AckTracker, EventRoute, MessageHandler};
use crate::transport::{
    BusClient, BusConnector, BusError, BusEvent, ClientOptions, Endpoint, PubSubConnection,
    Publisher,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 10;

/// How long a closing link may take to flush its DISCONNECT
const CLOSE_GRACE: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Production [`BusConnector`] speaking MQTT v5
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

impl BusConnector for MqttConnector {
    fn create_client(
        &self,
        endpoint: &Endpoint,
        options: &ClientOptions,
    ) -> Result<Arc<dyn BusClient>, BusError> {
        if endpoint.host.is_empty() || endpoint.port == 0 {
            return Err(BusError::unreachable(endpoint, "invalid endpoint"));
        }
        Ok(Arc::new(MqttBusClient::new(endpoint.clone(), options.clone())))
    }
}

/// One bus client: owns every link it opened and releases them on shutdown
pub struct MqttBusClient {
    endpoint: Endpoint,
    options: ClientOptions,
    links: Mutex<Vec<Arc<MqttLink>>>,
    closed: AtomicBool,
}

impl MqttBusClient {
    pub fn new(endpoint: Endpoint, options: ClientOptions) -> Self {
        Self {
            endpoint,
            options,
            links: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    async fn open_link(
        &self,
        role: LinkRole,
        events: Option<mpsc::UnboundedSender<BusEvent>>,
    ) -> Result<Arc<MqttLink>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let link = Arc::new(MqttLink::open(&self.endpoint, &self.options, role, events).await?);

        // shutdown() may have run while we were waiting for the ConnAck
        if self.closed.load(Ordering::Acquire) {
            link.release().await;
            return Err(BusError::Closed);
        }
        lock(&self.links).push(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl BusClient for MqttBusClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect_pubsub(
        &self,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Result<Arc<dyn PubSubConnection>, BusError> {
        let link: Arc<dyn PubSubConnection> =
            self.open_link(LinkRole::Subscriber, Some(events)).await?;
        Ok(link)
    }

    async fn open_publisher(&self) -> Result<Arc<dyn Publisher>, BusError> {
        let link: Arc<dyn Publisher> = self.open_link(LinkRole::Publisher, None).await?;
        Ok(link)
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let links: Vec<_> = lock(&self.links).drain(..).collect();
        for link in links {
            link.release().await;
        }
        info!(endpoint = %self.endpoint, "Bus client shut down");
    }
}

/// State shared between a link handle and its supervisor task
struct LinkShared {
    acks: Mutex<AckTracker>,
    subscriptions: Mutex<Vec<String>>,
    events: Option<mpsc::UnboundedSender<BusEvent>>,
}

impl LinkShared {
    fn emit(&self, event: BusEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Bus event dropped - listener gone");
            }
        }
    }
}

/// A single MQTT connection with its own event loop supervisor
pub struct MqttLink {
    endpoint: Endpoint,
    client: AsyncClient,
    command_timeout: Duration,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    shared: Arc<LinkShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    /// Open a link and wait for the broker to acknowledge it
    pub async fn open(
        endpoint: &Endpoint,
        options: &ClientOptions,
        role: LinkRole,
        events: Option<mpsc::UnboundedSender<BusEvent>>,
    ) -> Result<Self, BusError> {
        let mqtt_options = configure_mqtt_options(endpoint, options, role);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            acks: Mutex::new(AckTracker::new()),
            subscriptions: Mutex::new(Vec::new()),
            events,
        });

        let supervisor = LinkSupervisor {
            endpoint: endpoint.clone(),
            client: client.clone(),
            event_loop,
            state_tx,
            shutdown_rx,
            shared: shared.clone(),
            reconnect_delay: options.reconnect_delay,
        };
        let handle = tokio::spawn(supervisor.run());

        let link = MqttLink {
            endpoint: endpoint.clone(),
            client,
            command_timeout: options.command_timeout,
            state_rx: state_rx.clone(),
            shutdown_tx,
            shared,
            supervisor: Mutex::new(Some(handle)),
        };

        if let Err(reason) =
            wait_for_connection_confirmation(state_rx, options.connect_timeout).await
        {
            link.release().await;
            return Err(BusError::unreachable(endpoint, reason));
        }

        debug!(endpoint = %endpoint, role = %role, "Bus link opened");
        Ok(link)
    }

    /// Current link state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        let state = self.state();
        match state {
            ConnectionState::Closed => Err(BusError::Closed),
            ref s if !can_issue_commands(s) => Err(BusError::CommandTimeout(format!(
                "link to {} is not up: {state:?}",
                self.endpoint
            ))),
            _ => Ok(()),
        }
    }

    /// Stop the supervisor and release the connection. Idempotent.
    pub async fn release(&self) {
        let handle = lock(&self.supervisor).take();
        let Some(handle) = handle else {
            return;
        };

        if can_issue_commands(&self.state()) {
            let _ = self.client.try_disconnect();
        }
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(CLOSE_GRACE, handle).await {
            Ok(Ok(())) => debug!(endpoint = %self.endpoint, "Link supervisor stopped"),
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(endpoint = %self.endpoint, "Link supervisor ended with error: {}", e);
            }
            Err(_) => warn!(endpoint = %self.endpoint, "Link supervisor did not stop in time"),
            _ => {}
        }
    }

    async fn run_command<F>(&self, what: String, command: F) -> Result<(), BusError>
    where
        F: std::future::Future<Output = Result<(), rumqttc::v5::ClientError>>,
    {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BusError::CommandTimeout(format!("{what} failed: {e}"))),
            Err(_) => Err(BusError::CommandTimeout(format!(
                "{what} did not complete within {:?}",
                self.command_timeout
            ))),
        }
    }
}

/// Reject a topic the client would refuse, before any request is queued.
/// Only failures past this point count as command failures on the link.
fn check_channel(channel: &str) -> Result<(), BusError> {
    MessageHandler::validate_channel(channel).map_err(BusError::Protocol)
}

#[async_trait]
impl PubSubConnection for MqttLink {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        check_channel(channel)?;
        self.ensure_connected()?;

        // Registered before sending so the SubAck can never arrive first
        lock(&self.shared.acks).expect(AckKind::Subscribe, channel);
        let result = self
            .run_command(
                format!("subscribe to {channel}"),
                self.client.subscribe(channel, QoS::AtLeastOnce),
            )
            .await;

        match result {
            Ok(()) => {
                let mut subscriptions = lock(&self.shared.subscriptions);
                if !subscriptions.iter().any(|c| c == channel) {
                    subscriptions.push(channel.to_string());
                }
                Ok(())
            }
            Err(e) => {
                lock(&self.shared.acks).forget(AckKind::Subscribe, channel);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        lock(&self.shared.subscriptions).retain(|c| c != channel);
        self.ensure_connected()?;

        lock(&self.shared.acks).expect(AckKind::Unsubscribe, channel);
        let result = self
            .run_command(
                format!("unsubscribe from {channel}"),
                self.client.unsubscribe(channel),
            )
            .await;
        if result.is_err() {
            lock(&self.shared.acks).forget(AckKind::Unsubscribe, channel);
        }
        result
    }
}

#[async_trait]
impl Publisher for MqttLink {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        check_channel(channel)?;
        self.ensure_connected()?;
        self.run_command(
            format!("publish to {channel}"),
            self.client.publish(channel, QoS::AtLeastOnce, false, payload),
        )
        .await
    }

    async fn close(&self) {
        self.release().await
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

/// Owns the event loop of one link and retries with a constant backoff
struct LinkSupervisor {
    endpoint: Endpoint,
    client: AsyncClient,
    event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    shared: Arc<LinkShared>,
    reconnect_delay: Duration,
}

impl LinkSupervisor {
    async fn run(mut self) {
        let mut ever_connected = false;
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        self.flush_disconnect().await;
                        break;
                    }
                }
                result = self.event_loop.poll() => match result {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        if route == EventRoute::ConnectionAcknowledged {
                            ever_connected = true;
                            attempts = 0;
                        }
                        if !self.process_event_route(route) {
                            if !self.backoff(&mut attempts).await {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        self.transition(LinkEvent::NetworkError(e.to_string()));
                        self.lock_acks().clear();
                        // A link that never came up is reported to the opener, not retried
                        if !ever_connected || !self.backoff(&mut attempts).await {
                            break;
                        }
                    }
                }
            }
        }

        self.transition(LinkEvent::ShutdownRequested);
        debug!(endpoint = %self.endpoint, "Link supervisor exiting");
    }

    fn lock_acks(&self) -> MutexGuard<'_, AckTracker> {
        lock(&self.shared.acks)
    }

    fn transition(&self, event: LinkEvent) {
        let to = next_state(event);
        let from = self.state_tx.borrow().clone();
        log_state_transition(&self.endpoint, &from, &to);
        let _ = self.state_tx.send(to);
    }

    /// Returns false when the link dropped and the supervisor must back off
    fn process_event_route(&self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(LinkEvent::ConnAckReceived);
                self.resubscribe();
                true
            }
            EventRoute::MessageReceived { channel, payload } => {
                debug!(%channel, bytes = payload.len(), "Bus message received");
                self.shared.emit(BusEvent::Message { channel, payload });
                true
            }
            EventRoute::SubscriptionConfirmed { granted } => {
                match self.lock_acks().resolve(AckKind::Subscribe) {
                    Some(channel) if granted => self.shared.emit(BusEvent::Subscribed { channel }),
                    Some(channel) => warn!(%channel, "Broker refused subscription"),
                    None => debug!("SubAck without pending subscribe"),
                }
                true
            }
            EventRoute::UnsubscriptionConfirmed => {
                if let Some(channel) = self.lock_acks().resolve(AckKind::Unsubscribe) {
                    self.shared.emit(BusEvent::Unsubscribed { channel });
                }
                true
            }
            EventRoute::Disconnected => {
                self.transition(LinkEvent::DisconnectedByBroker);
                self.lock_acks().clear();
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                tracing::trace!(target: "bus_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Re-issue tracked subscriptions after the broker dropped our session
    fn resubscribe(&self) {
        let channels = lock(&self.shared.subscriptions).clone();
        for channel in channels {
            self.lock_acks().expect(AckKind::Subscribe, &channel);
            // try_ variant: this task is the one draining the request queue
            if let Err(e) = self.client.try_subscribe(channel.as_str(), QoS::AtLeastOnce) {
                self.lock_acks().forget(AckKind::Subscribe, &channel);
                warn!(%channel, "Failed to re-subscribe: {}", e);
            } else {
                debug!(%channel, "Re-subscribed after reconnection");
            }
        }
    }

    /// Sleep for the constant backoff; false if shutdown was requested meanwhile
    async fn backoff(&mut self, attempts: &mut u32) -> bool {
        *attempts += 1;
        self.transition(LinkEvent::ReconnectionStarted(*attempts));
        info!(
            endpoint = %self.endpoint,
            attempt = *attempts,
            "Reconnecting after {:?}",
            self.reconnect_delay
        );

        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                if changed.is_err() || *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }

    /// Give a queued DISCONNECT a brief chance to reach the broker
    async fn flush_disconnect(&mut self) {
        if !can_issue_commands(&self.state_tx.borrow()) {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_millis(200), async {
            while let Ok(event) = self.event_loop.poll().await {
                if matches!(
                    MessageHandler::route_mqtt_event(&event),
                    EventRoute::OutgoingEvent
                ) {
                    break;
                }
            }
        })
        .await;
    }
}
