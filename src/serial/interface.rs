use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::sync::RwLock;
use tokio_serial::SerialPortBuilderExt;

use super::{
    matches_any, BoxedStream, DeviceFilter, PortChooser, PortHandle, Result, SerialDeviceInfo,
    SerialError, SerialHost, StreamOpener,
};

/// Opens real serial ports through tokio-serial.
pub struct TokioSerialOpener;

#[async_trait]
impl StreamOpener for TokioSerialOpener {
    async fn open_stream(&self, info: &SerialDeviceInfo, baud_rate: u32) -> Result<BoxedStream> {
        // opening blocks on some platforms; keep it off the runtime threads
        let port_name = info.port_name.clone();
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(port_name.as_str(), baud_rate)
                .timeout(Duration::from_millis(1000))
                .open_native_async()
        })
        .await
        .map_err(|e| SerialError::ConnectionFailed(format!("open task failed: {}", e)))?
        .map_err(|e| match e.kind {
            tokio_serial::ErrorKind::NoDevice => SerialError::PortNotFound(info.port_name.clone()),
            _ => SerialError::ConnectionFailed(e.to_string()),
        })?;

        log::info!("Opened serial stream on {}", info.port_name);
        Ok(Box::new(stream))
    }
}

/// Desktop serial host.
///
/// A port counts as authorized once the user picked it in the chooser, or if
/// its name was passed in at construction (persisted grants).
pub struct NativeSerialHost {
    opener: Arc<dyn StreamOpener>,
    chooser: Arc<dyn PortChooser>,
    authorized: RwLock<HashSet<String>>,
    handles: RwLock<HashMap<String, Arc<PortHandle>>>,
}

impl NativeSerialHost {
    pub fn new(chooser: Arc<dyn PortChooser>, authorized: impl IntoIterator<Item = String>) -> Self {
        Self::with_opener(Arc::new(TokioSerialOpener), chooser, authorized)
    }

    pub fn with_opener(
        opener: Arc<dyn StreamOpener>,
        chooser: Arc<dyn PortChooser>,
        authorized: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            opener,
            chooser,
            authorized: RwLock::new(authorized.into_iter().collect()),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// List USB serial ports currently present on the system
    pub fn discover_devices() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                // macOS lists every device twice; the /dev/cu.* node is the one to open
                if port.port_name.starts_with("/dev/tty.") {
                    continue;
                }
                devices.push(SerialDeviceInfo {
                    port_name: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                    product: usb_info.product.clone(),
                });
            }
        }

        Ok(devices)
    }

    /// [`discover_devices`](Self::discover_devices) on the blocking pool.
    pub async fn scan_devices() -> Result<Vec<SerialDeviceInfo>> {
        tokio::task::spawn_blocking(Self::discover_devices)
            .await
            .map_err(|e| SerialError::ConnectionFailed(format!("port scan failed: {}", e)))?
    }

    pub async fn authorize(&self, port_name: &str) {
        let mut authorized = self.authorized.write().await;
        if authorized.insert(port_name.to_string()) {
            log::info!("Authorized serial port {}", port_name);
        }
    }

    /// Reuse the handle for a port so its open state survives re-enumeration.
    async fn handle_for(&self, info: SerialDeviceInfo) -> Arc<PortHandle> {
        let mut handles = self.handles.write().await;
        if let Some(existing) = handles.get(&info.port_name) {
            if existing.info().vid == info.vid && existing.info().pid == info.pid {
                return existing.clone();
            }
        }
        let handle = PortHandle::new(info.clone(), self.opener.clone());
        handles.insert(info.port_name, handle.clone());
        handle
    }
}

#[async_trait]
impl SerialHost for NativeSerialHost {
    async fn get_ports(&self) -> Result<Vec<Arc<PortHandle>>> {
        let present = Self::scan_devices().await?;
        let authorized = self.authorized.read().await.clone();

        let mut ports = Vec::new();
        for info in present {
            if authorized.contains(&info.port_name) {
                ports.push(self.handle_for(info).await);
            }
        }
        Ok(ports)
    }

    async fn request_port(&self, filters: &[DeviceFilter]) -> Result<Arc<PortHandle>> {
        let candidates: Vec<SerialDeviceInfo> = Self::scan_devices()
            .await?
            .into_iter()
            .filter(|info| matches_any(filters, info))
            .collect();
        log::debug!("Device chooser offered {} candidate(s)", candidates.len());

        let chosen = self
            .chooser
            .choose(&candidates)
            .await
            .and_then(|index| candidates.get(index).cloned())
            .ok_or(SerialError::SelectionCancelled)?;

        self.authorize(&chosen.port_name).await;
        Ok(self.handle_for(chosen).await)
    }

    async fn authorized_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.authorized.read().await.iter().cloned().collect();
        ports.sort();
        ports
    }
}
