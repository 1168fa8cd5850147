use std::time::Duration;

use thiserror::Error;

use crate::mircat::config::ConfigError;
use crate::mircat::relay::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Control channel could not be established; retried with backoff.
    #[error("connect {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// The client could not reach the destination for one stream.
    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// Heartbeat timeout or transport failure on an established channel.
    #[error("channel {channel_id} lost: {reason}")]
    ChannelLost { channel_id: u64, reason: String },

    /// The server installed another client's channel in place of ours.
    #[error("channel {channel_id} replaced by a newer client")]
    Replaced { channel_id: u64 },

    #[error("session {session_id} idle for {}", human(.idle))]
    SessionTimeout { session_id: u64, idle: Duration },

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("relay is already running")]
    AlreadyRunning,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn human(d: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*d)
}

impl RelayError {
    pub fn connect(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RelayError::Connect {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn dial(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RelayError::Dial {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }
}
