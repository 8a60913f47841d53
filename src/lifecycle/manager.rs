//! Connection manager
//!
//! Owns the single active channel. Connect and disconnect requests pass
//! through the [`CommandDebouncer`] and then run one at a time on a lifecycle
//! worker task, which is the only place the registry is mutated. Sends and
//! heartbeats run concurrently and share one lazily opened publish link.

use crate::config::LinkConfig;
use crate::error::LinkResult;
use crate::observability::metrics::metrics;
use crate::protocol::{classify_inbound, Envelope, Inbound, StatusNotice};
use crate::sink::{EventSink, LinkEvent};
use crate::transport::{BusConnector, BusError, BusEvent, ClientOptions, Endpoint, Publisher};
use crate::{connection_span, lifecycle_span, publish_span};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::debouncer::CommandDebouncer;
use super::health::{HealthMonitor, HeartbeatTarget};
use super::registry::{ConnectionRecord, ConnectionRegistry};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Timing and client options of a [`ConnectionManager`]
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub debounce: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_initial_delay: Duration,
    pub client_options: ClientOptions,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(20 * 60),
            heartbeat_initial_delay: Duration::from_secs(1),
            client_options: ClientOptions::default(),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            debounce: config.debounce(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_initial_delay: config.heartbeat_initial_delay(),
            client_options: config.client_options(),
        }
    }
}

/// Last requested connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub endpoint: Endpoint,
    pub channel: String,
}

#[derive(Debug)]
enum LifecycleCommand {
    Connect(ConnectTarget),
    Disconnect,
    Shutdown(oneshot::Sender<()>),
}

/// Lazily filled publish link; `epoch` advances on every teardown
#[derive(Default)]
struct PublishSlot {
    publisher: Option<Arc<dyn Publisher>>,
    epoch: u64,
}

/// Single-channel connection lifecycle manager
///
/// # Examples
/// ```no_run
/// use chanlink::lifecycle::{ConnectionManager, ManagerSettings};
/// use chanlink::sink::ChannelSink;
/// use chanlink::transport::MqttBus;
/// use std::sync::Arc;
///
/// # async fn example() {
/// let (sink, mut events) = ChannelSink::new();
/// let manager = ConnectionManager::new(
///     Arc::new(MqttBus::new()),
///     Arc::new(sink),
///     ManagerSettings::default(),
/// );
///
/// manager.request_connect("127.0.0.1", 1883, "room1");
/// while let Some(event) = events.recv().await {
///     println!("{event}");
/// }
/// # }
/// ```
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    debouncer: CommandDebouncer,
    commands: mpsc::UnboundedSender<LifecycleCommand>,
}

struct ManagerShared {
    me: Weak<ManagerShared>,
    connector: Arc<dyn BusConnector>,
    sink: Arc<dyn EventSink>,
    settings: ManagerSettings,
    origin: Uuid,
    target: Mutex<Option<ConnectTarget>>,
    connecting: AtomicBool,
    registry: ConnectionRegistry,
    publish_slot: Mutex<PublishSlot>,
    health: HealthMonitor,
}

impl ConnectionManager {
    /// Create the manager and start its lifecycle worker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        connector: Arc<dyn BusConnector>,
        sink: Arc<dyn EventSink>,
        settings: ManagerSettings,
    ) -> Self {
        let health = HealthMonitor::new(
            settings.heartbeat_interval,
            settings.heartbeat_initial_delay,
        );
        let debouncer = CommandDebouncer::new(settings.debounce);
        let shared = Arc::new_cyclic(|me| ManagerShared {
            me: me.clone(),
            connector,
            sink,
            settings,
            origin: Uuid::new_v4(),
            target: Mutex::new(None),
            connecting: AtomicBool::new(false),
            registry: ConnectionRegistry::new(),
            publish_slot: Mutex::new(PublishSlot::default()),
            health,
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(Arc::clone(&shared), receiver));
        info!(origin = %shared.origin, "Connection manager started");

        Self {
            shared,
            debouncer,
            commands,
        }
    }

    /// Store the target and schedule a debounced connect. Never blocks.
    pub fn request_connect(&self, host: impl Into<String>, port: u16, channel: impl Into<String>) {
        let target = ConnectTarget {
            endpoint: Endpoint::new(host, port),
            channel: channel.into(),
        };
        info!(channel = %target.channel, endpoint = %target.endpoint, "Connect requested");
        *lock(&self.shared.target) = Some(target.clone());
        self.enqueue(LifecycleCommand::Connect(target));
    }

    /// Schedule a debounced disconnect. Never blocks.
    pub fn request_disconnect(&self) {
        info!("Disconnect requested");
        self.enqueue(LifecycleCommand::Disconnect);
    }

    /// Publish `payload` to `channel` in the background. Best-effort.
    pub fn request_send(&self, channel: impl Into<String>, payload: impl Into<String>) {
        let shared = Arc::clone(&self.shared);
        let channel = channel.into();
        let payload = payload.into();
        let span = publish_span!(channel = %channel);
        tokio::spawn(async move { shared.send(&channel, payload).await }.instrument(span));
    }

    /// Drop any pending command, tear down the active connection and stop the worker
    pub async fn shutdown(&self) {
        self.debouncer.cancel();

        let (done_tx, done_rx) = oneshot::channel();
        let stopped = self
            .commands
            .send(LifecycleCommand::Shutdown(done_tx))
            .is_ok()
            && done_rx.await.is_ok();

        if !stopped {
            // Worker already gone; teardown is idempotent
            self.shared
                .disconnect()
                .instrument(lifecycle_span!(event = "shutdown"))
                .await;
        }
        info!("Connection manager shut down");
    }

    pub fn target(&self) -> Option<ConnectTarget> {
        lock(&self.shared.target).clone()
    }

    /// Channel of the registered record, if any
    pub fn active_channel(&self) -> Option<String> {
        self.shared
            .registry
            .first()
            .map(|record| record.channel().to_string())
    }

    /// True while a record is subscribed
    pub fn is_connected(&self) -> bool {
        self.shared.registry.connected_count() > 0
    }

    pub fn registry_len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_heartbeat_armed(&self) -> bool {
        self.shared.health.is_armed()
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.shared.health.last_sent()
    }

    /// Identifier stamped on every envelope this manager publishes
    pub fn origin(&self) -> Uuid {
        self.shared.origin
    }

    fn enqueue(&self, command: LifecycleCommand) {
        let commands = self.commands.clone();
        self.debouncer.submit(async move {
            if let Err(rejected) = commands.send(command) {
                debug!(command = ?rejected.0, "Lifecycle worker stopped, command dropped");
            }
        });
    }
}

async fn run_worker(shared: Arc<ManagerShared>, mut commands: mpsc::UnboundedReceiver<LifecycleCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            LifecycleCommand::Connect(target) => {
                let span = connection_span!(
                    command = "connect",
                    channel = %target.channel,
                    endpoint = %target.endpoint
                );
                shared.connect(target).instrument(span).await;
            }
            LifecycleCommand::Disconnect => {
                shared
                    .disconnect()
                    .instrument(connection_span!(command = "disconnect"))
                    .await;
            }
            LifecycleCommand::Shutdown(done) => {
                shared
                    .disconnect()
                    .instrument(lifecycle_span!(event = "shutdown"))
                    .await;
                let _ = done.send(());
                break;
            }
        }
    }
    debug!("Lifecycle worker stopped");
}

impl ManagerShared {
    async fn connect(&self, target: ConnectTarget) {
        metrics().connect_attempt();

        // The most recent channel wins: tear the other one down first, in this
        // same worker step, so no other lifecycle command can interleave.
        if let Some(existing) = self.registry.find_conflict(&target.channel) {
            info!(
                from = existing.channel(),
                to = %target.channel,
                "Channel conflict, reconnecting"
            );
            metrics().reconnect();
            self.disconnect().await;
        }

        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.notify(
                &target.channel,
                StatusNotice::AlreadyConnected {
                    endpoint: target.endpoint.clone(),
                },
            );
            return;
        }

        if !self.registry.is_empty() {
            error!(
                records = self.registry.len(),
                "Connect guard acquired while registry is not empty"
            );
        }

        let client = match self
            .connector
            .create_client(&target.endpoint, &self.settings.client_options)
        {
            Ok(client) => client,
            Err(e) => return self.fail_connect(&target, e).await,
        };
        let record = Arc::new(ConnectionRecord::new(client, target.channel.clone()));
        self.registry.add(Arc::clone(&record));
        debug!(record = record.id(), "Connection record registered");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscription = match record.client().connect_pubsub(events_tx).await {
            Ok(subscription) => subscription,
            Err(e) => return self.fail_connect(&target, e).await,
        };
        record.set_subscription(Arc::clone(&subscription));
        self.spawn_listener(Arc::clone(&record), events_rx);

        if let Err(e) = subscription.subscribe(&target.channel).await {
            self.fail_connect(&target, e).await;
        }
    }

    /// Terminal failure of one connect attempt; no retry is scheduled
    async fn fail_connect(&self, target: &ConnectTarget, error: BusError) {
        warn!(
            channel = %target.channel,
            endpoint = %target.endpoint,
            "Connect failed: {}",
            error
        );
        metrics().connect_failed();
        self.teardown().await;
        self.notify(&target.channel, StatusNotice::FailToConnect);
    }

    async fn disconnect(&self) {
        if self.registry.is_empty() {
            debug!("Disconnect with no active connection");
        } else {
            metrics().disconnected();
        }
        self.teardown().await;
    }

    /// Release every resource of the active connection. Idempotent.
    async fn teardown(&self) {
        self.health.disarm();

        if let Some(publisher) = self.take_publisher() {
            publisher.close().await;
        }

        let grace = self.settings.client_options.command_timeout;
        for record in self.registry.snapshot() {
            if record.teardown(grace).await {
                debug!(record = record.id(), "Unsubscribe not confirmed by the bus");
                self.notify(record.channel(), StatusNotice::Unsubscribed);
            }
            self.registry.remove(&record);
        }

        // A subscription confirmed mid-teardown may have re-armed the monitor
        self.health.disarm();
        self.connecting.store(false, Ordering::Release);
    }

    fn spawn_listener(&self, record: Arc<ConnectionRecord>, mut events: mpsc::UnboundedReceiver<BusEvent>) {
        let shared = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_bus_event(&record, event);
            }
            debug!(record = record.id(), "Bus event listener finished");
        });
    }

    fn handle_bus_event(&self, record: &Arc<ConnectionRecord>, event: BusEvent) {
        match event {
            BusEvent::Subscribed { channel } => {
                if !record.mark_subscribed() {
                    debug!(record = record.id(), "Ignoring subscription of a retired record");
                    return;
                }
                metrics().connection_established();
                self.notify(&channel, StatusNotice::Subscribed);
                self.notify(
                    &channel,
                    StatusNotice::Connected {
                        endpoint: record.endpoint().clone(),
                    },
                );
                self.arm_heartbeat();
            }
            BusEvent::Unsubscribed { channel } => {
                if record.mark_unsubscribed() {
                    self.notify(&channel, StatusNotice::Unsubscribed);
                } else {
                    debug!(record = record.id(), "Unsubscribed while not connected");
                }
            }
            BusEvent::Message { channel, payload } => {
                metrics().message_received();
                match classify_inbound(&payload, self.origin) {
                    Inbound::Message(text) => self.sink.deliver(LinkEvent::message(channel, text)),
                    Inbound::Notice(text) => self.sink.deliver(LinkEvent::status(channel, text)),
                    Inbound::OwnNotice(text) => {
                        debug!(%channel, "Own notice echoed: {}", text);
                    }
                    Inbound::Heartbeat { own, body } => {
                        debug!(%channel, own, "Heartbeat observed: {}", body);
                    }
                }
            }
        }
    }

    fn arm_heartbeat(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let target: Arc<dyn HeartbeatTarget> = me;
        self.health.arm(Arc::downgrade(&target));
    }

    /// Deliver a status notice; connection confirmations are also announced on the channel
    fn notify(&self, channel: &str, notice: StatusNotice) {
        let text = notice.render(channel);
        info!(channel, notice = %notice, "{}", text);

        if notice.is_broadcast() {
            self.broadcast(channel, text.clone());
        }
        self.sink.deliver(LinkEvent::status(channel, text));
    }

    fn broadcast(&self, channel: &str, text: String) {
        let Some(shared) = self.me.upgrade() else {
            return;
        };
        let channel = channel.to_string();
        let span = publish_span!(channel = %channel, kind = "control");
        tokio::spawn(
            async move {
                let envelope = Envelope::control(shared.origin, text);
                if let Err(e) = shared.publish_envelope(&channel, envelope).await {
                    warn!("Announcement not published: {}", e);
                }
            }
            .instrument(span),
        );
    }

    async fn send(&self, channel: &str, payload: String) {
        let started = Instant::now();
        match self
            .publish_envelope(channel, Envelope::data(self.origin, payload))
            .await
        {
            Ok(true) => {
                metrics().message_published(started.elapsed());
                debug!("Message published");
            }
            Ok(false) => warn!("No active connection, message dropped"),
            Err(e) => {
                metrics().publish_failed();
                warn!("Send failed: {}", e);
            }
        }
    }

    /// Publish `envelope`; `Ok(false)` when there is no connection to publish through
    async fn publish_envelope(&self, channel: &str, envelope: Envelope) -> LinkResult<bool> {
        let Some(record) = self.registry.first() else {
            return Ok(false);
        };
        let Some(publisher) = self.publisher_via(&record).await? else {
            return Ok(false);
        };
        publisher.publish(channel, envelope.encode()?).await?;
        Ok(true)
    }

    /// Shared publish link, opened through `record`'s client on first use
    async fn publisher_via(
        &self,
        record: &ConnectionRecord,
    ) -> Result<Option<Arc<dyn Publisher>>, BusError> {
        let epoch = {
            let slot = lock(&self.publish_slot);
            if let Some(publisher) = &slot.publisher {
                return Ok(Some(Arc::clone(publisher)));
            }
            slot.epoch
        };

        let fresh = record.client().open_publisher().await?;

        let (chosen, discarded) = {
            let mut slot = lock(&self.publish_slot);
            if slot.epoch != epoch {
                // Torn down while the link was opening
                (None, Some(fresh))
            } else if let Some(winner) = &slot.publisher {
                (Some(Arc::clone(winner)), Some(fresh))
            } else {
                slot.publisher = Some(Arc::clone(&fresh));
                (Some(fresh), None)
            }
        };

        if let Some(loser) = discarded {
            debug!("Closing surplus publish link");
            loser.close().await;
        }
        Ok(chosen)
    }

    fn take_publisher(&self) -> Option<Arc<dyn Publisher>> {
        let mut slot = lock(&self.publish_slot);
        slot.epoch += 1;
        slot.publisher.take()
    }
}

#[async_trait]
impl HeartbeatTarget for ManagerShared {
    fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        self.registry.snapshot()
    }

    async fn publisher_for(
        &self,
        record: &ConnectionRecord,
    ) -> Result<Option<Arc<dyn Publisher>>, BusError> {
        self.publisher_via(record).await
    }

    fn origin(&self) -> Uuid {
        self.origin
    }

    fn report(&self, channel: &str, notice: StatusNotice) {
        self.notify(channel, notice);
    }
}
