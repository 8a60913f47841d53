//! Channel name validation
//!
//! Channels are used verbatim as bus topic names, so anything the broker would
//! interpret as a wildcard is rejected before it reaches the wire.

use thiserror::Error;

/// Longest channel name accepted (MQTT topic length limit)
pub const MAX_CHANNEL_LEN: usize = 65_535;

pub fn validate_channel(channel: &str) -> Result<(), ValidationError> {
    if channel.is_empty() {
        return Err(ValidationError::EmptyChannel);
    }

    if channel.len() > MAX_CHANNEL_LEN {
        return Err(ValidationError::ChannelTooLong(channel.len()));
    }

    for ch in channel.chars() {
        if ch == '+' || ch == '#' || ch == '\0' {
            return Err(ValidationError::InvalidChannelChar(ch));
        }
    }

    Ok(())
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Channel name cannot be empty")]
    EmptyChannel,
    #[error("Channel name is {0} bytes long")]
    ChannelTooLong(usize),
    #[error("Invalid character in channel name: {0:?}")]
    InvalidChannelChar(char),
}
