//! Bluetooth LE access to the XRP's Nordic UART service.
//!
//! The connection layer only sees [`BleHost`] and [`BlePeripheral`]; the
//! btleplug backend lives behind the `ble` feature.

#[cfg(feature = "ble")]
pub mod btle;

#[cfg(feature = "ble")]
pub use btle::BtleplugHost;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Written by us, received by the robot.
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Notified by the robot.
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

pub const XRP_NAME_PREFIX: &str = "XRP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleDeviceInfo {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

impl BleDeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    #[error("Device selection cancelled")]
    SelectionCancelled,

    #[error("Service {0} not found")]
    MissingService(Uuid),

    #[error("Characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Bluetooth operation timed out")]
    Timeout,

    #[error("BLE error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, BleError>;

/// One robot reachable over BLE.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    fn info(&self) -> &BleDeviceInfo;

    /// Connect the GATT server, locate the UART characteristics and
    /// subscribe to RX notifications.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Write one block to the TX characteristic.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// RX notifications. The channel closes when the link drops.
    async fn notifications(&self) -> Result<mpsc::Receiver<Vec<u8>>>;
}

#[async_trait]
pub trait BleHost: Send + Sync {
    /// Scan and let the user pick a robot whose name starts with
    /// `name_prefix`. Returns [`BleError::SelectionCancelled`] on dismissal.
    async fn request_device(&self, name_prefix: &str) -> Result<Arc<dyn BlePeripheral>>;
}

/// Device chooser shown while pairing over BLE.
#[async_trait]
pub trait BleChooser: Send + Sync {
    async fn choose(&self, candidates: &[BleDeviceInfo]) -> Option<usize>;
}
