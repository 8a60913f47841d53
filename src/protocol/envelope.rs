//! Tagged message envelope carried over the bus
//!
//! Control notices, heartbeats and chat payloads share one channel. Every
//! payload this crate publishes is wrapped in an [`Envelope`] whose `kind`
//! tells the receiver how to dispatch it, so nothing has to be inferred from
//! the text itself.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed marker at the start of every heartbeat body
pub const HEARTBEAT_MARKER: &str = "check redis connection";

/// Timestamp layout used in heartbeat bodies
const HEARTBEAT_TIME_FORMAT: &str = "%m-%d %H:%M:%S";

/// What an envelope carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// User payload
    Data,
    /// Lifecycle notice meant for the other participants of the channel
    Control,
    /// Self-addressed liveness probe
    Heartbeat,
}

/// Wire format of everything published by this crate
///
/// # Examples
/// ```
/// use chanlink::protocol::{Envelope, EnvelopeKind};
/// use uuid::Uuid;
///
/// let origin = Uuid::new_v4();
/// let envelope = Envelope::data(origin, "hi");
/// let bytes = envelope.encode().unwrap();
///
/// let decoded = Envelope::decode(&bytes).unwrap();
/// assert_eq!(decoded.kind, EnvelopeKind::Data);
/// assert_eq!(decoded.body, "hi");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Process that published the envelope
    pub origin: Uuid,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, origin: Uuid, body: impl Into<String>) -> Self {
        Self {
            kind,
            origin,
            body: body.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn data(origin: Uuid, body: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Data, origin, body)
    }

    pub fn control(origin: Uuid, body: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Control, origin, body)
    }

    /// Heartbeat stamped with the local wall-clock time
    pub fn heartbeat(origin: Uuid) -> Self {
        Self::new(EnvelopeKind::Heartbeat, origin, heartbeat_body(Local::now()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse an envelope; `None` for payloads published by foreign clients
    pub fn decode(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

/// Heartbeat body: marker plus `MM-dd HH:mm:ss`
pub fn heartbeat_body(now: DateTime<Local>) -> String {
    format!("{HEARTBEAT_MARKER} {}", now.format(HEARTBEAT_TIME_FORMAT))
}

/// How an inbound payload must be dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Deliver to the message path
    Message(String),
    /// Deliver to the status path
    Notice(String),
    /// Our own control notice coming back; it was already delivered locally
    OwnNotice(String),
    /// Liveness probe; never shown to the user
    Heartbeat { own: bool, body: String },
}

/// Decide how an inbound payload is dispatched (pure function)
///
/// Payloads that are not envelopes come from foreign publishers and are
/// delivered verbatim as messages.
pub fn classify_inbound(payload: &[u8], local_origin: Uuid) -> Inbound {
    let Some(envelope) = Envelope::decode(payload) else {
        return Inbound::Message(String::from_utf8_lossy(payload).into_owned());
    };

    let own = envelope.origin == local_origin;
    match envelope.kind {
        EnvelopeKind::Data => Inbound::Message(envelope.body),
        EnvelopeKind::Control if own => Inbound::OwnNotice(envelope.body),
        EnvelopeKind::Control => Inbound::Notice(envelope.body),
        EnvelopeKind::Heartbeat => Inbound::Heartbeat {
            own,
            body: envelope.body,
        },
    }
}
