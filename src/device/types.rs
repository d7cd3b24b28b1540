use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{STATUS_GATT_ERROR, STATUS_PEER_DISCONNECTED, STATUS_SUCCESS, STATUS_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    pub name: Option<String>,
    pub signal_strength: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(String),
    Connected(String),
    ServicesDiscovered {
        address: String,
        has_write_channel: bool,
    },
    Failed(String),
}

impl ConnectionState {
    /// True for `Disconnected` and `Failed`, the states without a link.
    pub fn is_down(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting(address) => write!(f, "connecting to {}", address),
            ConnectionState::Connected(address) => write!(f, "connected to {} (discovering services)", address),
            ConnectionState::ServicesDiscovered { address, has_write_channel } => {
                write!(f, "services discovered on {} (write channel: {})", address, has_write_channel)
            },
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Status reported with a link state change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Success,
    Timeout,
    PeerDisconnected,
    GattError,
    Unknown(i32),
}

impl LinkStatus {
    pub fn from_code(code: i32) -> LinkStatus {
        match code {
            STATUS_SUCCESS => LinkStatus::Success,
            STATUS_TIMEOUT => LinkStatus::Timeout,
            STATUS_PEER_DISCONNECTED => LinkStatus::PeerDisconnected,
            STATUS_GATT_ERROR => LinkStatus::GattError,
            other => LinkStatus::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            LinkStatus::Success => STATUS_SUCCESS,
            LinkStatus::Timeout => STATUS_TIMEOUT,
            LinkStatus::PeerDisconnected => STATUS_PEER_DISCONNECTED,
            LinkStatus::GattError => STATUS_GATT_ERROR,
            LinkStatus::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == LinkStatus::Success
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Success => write!(f, "success"),
            LinkStatus::Timeout => write!(f, "connection timeout ({})", self.code()),
            LinkStatus::PeerDisconnected => write!(f, "peer disconnected ({})", self.code()),
            LinkStatus::GattError => write!(f, "GATT error ({})", self.code()),
            LinkStatus::Unknown(code) => write!(f, "GATT status={}", code),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Scan,
    Connect,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Grant {
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStopReason {
    UserRequested,
    CapabilityRevoked,
    WriteFailed,
    Disconnected,
    LinkFailed(String),
    Shutdown,
}

impl fmt::Display for LoopStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStopReason::UserRequested => write!(f, "stopped by user"),
            LoopStopReason::CapabilityRevoked => write!(f, "capability revoked"),
            LoopStopReason::WriteFailed => write!(f, "write failed/likely disconnected"),
            LoopStopReason::Disconnected => write!(f, "disconnected"),
            LoopStopReason::LinkFailed(reason) => write!(f, "disconnected: {}", reason),
            LoopStopReason::Shutdown => write!(f, "session shut down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Started { byte_count: usize, period: Duration },
    Stopped(LoopStopReason),
    TickResult(bool),
}

/// The commands a presentation layer can issue, without their arguments.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandKind {
    StartScan,
    StopScan,
    Connect,
    Disconnect,
    Write,
    StartLoop,
    StopLoop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DropReason {
    PermissionDenied,
    Superseded,
}

/// Notifications from the session to the presentation layer, delivered in the order they occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    DeviceObserved(DeviceRecord),
    ScanStarted,
    ScanStopped,
    ScanError(String),
    WriteResult { ok: bool, byte_count: usize },
    Loop(LoopEvent),
    CommandDropped { command: CommandKind, reason: DropReason },
}
