pub mod manager;
pub mod models;
pub mod port_monitor;

pub use manager::ConnectionMgr;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Transport not supported: {0}")]
    UnsupportedTransport(TransportKind),

    #[error("Device negotiation failed: {0}")]
    Negotiation(String),

    #[error("Device is busy")]
    Busy,

    #[error("Unexpected device response: {0}")]
    Protocol(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Bluetooth error: {0}")]
    Ble(#[from] crate::bluetooth::BleError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
