//! Status notices reported to the event sink

use crate::transport::Endpoint;
use std::fmt;

/// Lifecycle transition reported for a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusNotice {
    Subscribed,
    Connected { endpoint: Endpoint },
    Unsubscribed,
    FailToConnect,
    FailToReconnect,
    AlreadyConnected { endpoint: Endpoint },
}

impl StatusNotice {
    /// Human-readable text of the notice for `channel`
    pub fn render(&self, channel: &str) -> String {
        match self {
            StatusNotice::Subscribed => format!("{channel} subscribed"),
            StatusNotice::Connected { endpoint } => {
                format!("successfully connected. {channel} - {endpoint}")
            }
            StatusNotice::Unsubscribed => format!("{channel} unsubscribed"),
            StatusNotice::FailToConnect => "fail to connect".to_string(),
            StatusNotice::FailToReconnect => "fail to reconnect".to_string(),
            StatusNotice::AlreadyConnected { endpoint } => {
                format!("already connected. {channel} - {endpoint}")
            }
        }
    }

    /// Notices that are also announced to the other participants of the channel
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            StatusNotice::Connected { .. } | StatusNotice::AlreadyConnected { .. }
        )
    }
}

impl fmt::Display for StatusNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusNotice::Subscribed => "subscribed",
            StatusNotice::Connected { .. } => "connected",
            StatusNotice::Unsubscribed => "unsubscribed",
            StatusNotice::FailToConnect => "fail_to_connect",
            StatusNotice::FailToReconnect => "fail_to_reconnect",
            StatusNotice::AlreadyConnected { .. } => "already_connected",
        };
        f.write_str(name)
    }
}
