//! Realtime channel - one persistent push connection per logged-in user

mod realtime;
mod transport;

pub use realtime::{
    Listener, RealtimeChannel, Subscription, DEFAULT_RECONNECT_DELAY, MIN_RECONNECT_DELAY,
};
pub use transport::{Connector, Transport, TransportError, WsConnector};

use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Connection status of the channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Initial state, and terminal after an explicit disconnect
    #[default]
    Disconnected,
    /// A transport connection attempt is in flight
    Connecting,
    /// Transport is open; frames flow both ways
    Connected,
    /// The last attempt failed or the connection dropped; a retry is scheduled
    Reconnecting,
}

impl ChannelStatus {
    /// Edges of the channel state graph
    pub fn can_transition_to(self, next: ChannelStatus) -> bool {
        use ChannelStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Reconnecting, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Reconnecting, Disconnected)
        )
    }

    /// A transport exists or is being established
    pub fn is_active(&self) -> bool {
        matches!(self, ChannelStatus::Connecting | ChannelStatus::Connected)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelStatus::Disconnected => "disconnected",
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Observable channel state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub status: ChannelStatus,

    /// Consecutive failed attempts since the last successful connect
    pub retry_count: u32,

    /// User the channel is keyed by, while not disconnected
    pub user_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Realtime channel is not connected (status: {status})")]
    NotConnected { status: ChannelStatus },

    #[error("Cannot open a realtime channel without a user id")]
    MissingUserId,

    #[error("Invalid realtime endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Realtime channel requires a running tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
