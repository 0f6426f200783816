use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// OS-level numeric identity of an application.
pub type Uid = u32;

/// Network transport currently carrying traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum TransportState {
    Wifi = 1,
    Cellular = 2,
    #[default]
    None = 0,
}

impl TransportState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TransportState::Wifi,
            2 => TransportState::Cellular,
            _ => TransportState::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Wifi => "WIFI",
            TransportState::Cellular => "CELLULAR",
            TransportState::None => "NONE",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WIFI" => Ok(TransportState::Wifi),
            "CELLULAR" => Ok(TransportState::Cellular),
            "NONE" => Ok(TransportState::None),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// Per-application blocking rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRule {
    pub identifier: String,
    pub display_name: String,
    pub is_system: bool,
    pub wifi_blocked: bool,
    pub cellular_blocked: bool,
    pub last_updated: DateTime<Utc>,
}

impl ApplicationRule {
    /// A rule that blocks nothing
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>, is_system: bool) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
            is_system,
            wifi_blocked: false,
            cellular_blocked: false,
            last_updated: Utc::now(),
        }
    }

    /// Whether this rule blocks traffic on the given transport
    pub fn blocks_on(&self, transport: TransportState) -> bool {
        match transport {
            TransportState::Wifi => self.wifi_blocked,
            TransportState::Cellular => self.cellular_blocked,
            TransportState::None => false,
        }
    }

    pub fn is_blocked_anywhere(&self) -> bool {
        self.wifi_blocked || self.cellular_blocked
    }
}

/// A recorded connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLogRecord {
    /// Assigned by the log store; `None` until persisted
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub identifier: String,
    pub display_name: String,
    pub destination: String,
    pub port: u16,
    pub transport: TransportState,
    pub blocked: bool,
}

impl ConnectionLogRecord {
    pub fn blocked(
        identifier: impl Into<String>,
        display_name: impl Into<String>,
        destination: impl Into<String>,
        port: u16,
        transport: TransportState,
    ) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            identifier: identifier.into(),
            display_name: display_name.into(),
            destination: destination.into(),
            port,
            transport,
            blocked: true,
        }
    }
}

/// An installed application as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub identifier: String,
    pub display_name: String,
    pub uid: Uid,
    #[serde(default)]
    pub is_system: bool,
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Disconnected => write!(f, "disconnected"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Connected => write!(f, "connected"),
            TunnelState::Error => write!(f, "error"),
        }
    }
}

impl FromStr for TunnelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(TunnelState::Disconnected),
            "connecting" => Ok(TunnelState::Connecting),
            "connected" => Ok(TunnelState::Connected),
            "error" => Ok(TunnelState::Error),
            other => Err(format!("unknown tunnel state: {}", other)),
        }
    }
}
