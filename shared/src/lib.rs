//! Smart Strip Shared Link Types
//!
//! This crate provides the transport-independent pieces of the smart strip
//! controller: peer states, the command vocabulary, the per-peer lifecycle
//! state machine, the reconnect policy and the payload codec.

pub mod backoff;
pub mod codec;
pub mod state_machine;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

pub use backoff::ReconnectPolicy;
pub use state_machine::{PeerLifecycle, SessionEvent, TransitionResult};

/// Stable transport address of a strip (e.g. `"AA:BB:CC:DD:EE:FF"`)
pub type PeerId = String;

/// Link timing parameters
pub mod link {
    /// Delay before the first automatic reconnect, multiplied by the attempt count
    pub const RECONNECT_BASE_DELAY_MS: u64 = 2000;

    /// Upper bound for the reconnect delay
    pub const RECONNECT_MAX_DELAY_MS: u64 = 30000;

    /// Interval between liveness probes sent to ready peers
    pub const HEARTBEAT_INTERVAL_MS: u64 = 5000;

    /// Manager-side deadline for a session stuck in Connecting
    pub const CONNECT_TIMEOUT_MS: u64 = 20000;

    /// Largest payload accepted for a single characteristic write
    pub const MAX_WRITE_LEN: usize = 512;
}

/// Lifecycle state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerState {
    /// Known but never connected
    #[default]
    Idle,
    /// Transport session opened, waiting for the link to come up
    Connecting,
    /// Link up, capability discovery in progress (or failed)
    Connected,
    /// Write capability discovered, commands may be sent
    Ready,
    /// Link down, possibly waiting for a reconnect
    Disconnected,
}

impl PeerState {
    /// Wire name used in state-change notifications
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Idle => "IDLE",
            PeerState::Connecting => "CONNECTING",
            PeerState::Connected => "CONNECTED",
            PeerState::Ready => "READY",
            PeerState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands understood by the strip firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripCommand {
    /// Switch the outlets on
    On,
    /// Switch the outlets off
    Off,
    /// Liveness probe
    Ping,
}

impl StripCommand {
    pub fn token(&self) -> &'static str {
        match self {
            StripCommand::On => "ON",
            StripCommand::Off => "OFF",
            StripCommand::Ping => "PING",
        }
    }

    /// Newline-terminated payload ready for a characteristic write
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("{}\n", self.token()))
    }
}

impl fmt::Display for StripCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for StripCommand {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(StripCommand::On),
            "OFF" => Ok(StripCommand::Off),
            "PING" => Ok(StripCommand::Ping),
            other => Err(LinkError::UnknownCommand(other.to_string())),
        }
    }
}

impl From<StripCommand> for Bytes {
    fn from(command: StripCommand) -> Self {
        command.encode()
    }
}

/// Failures reported for a single peer operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Bluetooth radio is off")]
    RadioOff,

    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("No connection entry for peer {0}")]
    UnknownPeer(PeerId),

    #[error("Write failed: not connected or UART not ready.")]
    NotReady,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Unknown strip command: {0}")]
    UnknownCommand(String),
}
