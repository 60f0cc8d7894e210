use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::connection::ConnectionState;

/// Medium used to reach the robot controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Usb,
    Bluetooth,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "usb"),
            TransportKind::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "usb" | "cable" => Ok(TransportKind::Usb),
            "bluetooth" | "ble" => Ok(TransportKind::Bluetooth),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Snapshot of the active connection for the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub transport: Option<TransportKind>,
    pub state: ConnectionState,
    pub busy: bool,
    pub port_name: Option<String>,
    pub last_changed: DateTime<Utc>,
}

impl ConnectionStatus {
    pub fn idle(last_changed: DateTime<Utc>) -> Self {
        Self {
            transport: None,
            state: ConnectionState::Disconnected,
            busy: false,
            port_name: None,
            last_changed,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }
}
