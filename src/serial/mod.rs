pub mod host;
pub mod interface;
pub mod port;

pub use host::{PortChooser, SerialHost};
pub use interface::NativeSerialHost;
pub use port::{BoxedStream, PortHandle, PortReader, PortWriter, StreamOpener};

use serde::{Deserialize, Serialize};

/// USB vendor/product pair used to recognize an XRP controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self { vendor_id, product_id }
    }

    pub fn matches(&self, info: &SerialDeviceInfo) -> bool {
        self.vendor_id == info.vid && self.product_id == info.pid
    }
}

/// Current XRP controller identity.
pub const XRP_FILTER: DeviceFilter = DeviceFilter::new(6991, 70);
/// Beta hardware revision, still in the field.
pub const XRP_BETA_FILTER: DeviceFilter = DeviceFilter::new(11914, 5);
pub const BAUD_RATE: u32 = 115200;

/// True if any filter accepts the device. All filters have equal priority.
pub fn matches_any(filters: &[DeviceFilter], info: &SerialDeviceInfo) -> bool {
    filters.iter().any(|f| f.matches(info))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    pub fn new(port_name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            port_name: port_name.into(),
            vid,
            pid,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Port is already open")]
    AlreadyOpen,

    #[error("Port is not open")]
    NotOpen,

    #[error("Port stream is locked")]
    StreamLocked,

    #[error("Device selection cancelled")]
    SelectionCancelled,

    #[error("Communication timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
