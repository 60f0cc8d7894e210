use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bluetooth::BleHost;
use crate::config::{ConfigError, LinkConfig};
use crate::device::port_monitor::{create_port_monitor, PortMonitor};
use crate::device::{ConnectionMgr, Result};
use crate::events::EventBus;
use crate::serial::{NativeSerialHost, PortChooser, SerialError, SerialHost};

/// Everything the frontend needs, wired together.
pub struct AppContext {
    config: LinkConfig,
    bus: Arc<EventBus>,
    connections: Arc<ConnectionMgr>,
    monitor: Mutex<Option<Box<dyn PortMonitor>>>,
    port_events: Mutex<Option<JoinHandle<()>>>,
}

impl AppContext {
    pub fn new(config: LinkConfig, host: Arc<dyn SerialHost>) -> Self {
        let bus = Arc::new(EventBus::new());
        let connections = ConnectionMgr::new(bus.clone(), host, config.clone());
        Self::assemble(config, bus, connections)
    }

    pub fn with_ble_host(config: LinkConfig, host: Arc<dyn SerialHost>, ble_host: Arc<dyn BleHost>) -> Self {
        let bus = Arc::new(EventBus::new());
        let connections = ConnectionMgr::with_ble_host(bus.clone(), host, ble_host, config.clone());
        Self::assemble(config, bus, connections)
    }

    fn assemble(config: LinkConfig, bus: Arc<EventBus>, connections: Arc<ConnectionMgr>) -> Self {
        Self {
            config,
            bus,
            connections,
            monitor: Mutex::new(None),
            port_events: Mutex::new(None),
        }
    }

    /// Context backed by the operating system's serial ports.
    pub fn native(config: LinkConfig, chooser: Arc<dyn PortChooser>) -> Self {
        let host = Arc::new(NativeSerialHost::new(chooser, config.authorized_ports.clone()));
        Self::new(config, host)
    }

    /// Like [`native`](Self::native), with Bluetooth through the first
    /// adapter found.
    #[cfg(feature = "ble")]
    pub fn native_with_ble(
        config: LinkConfig,
        chooser: Arc<dyn PortChooser>,
        ble_chooser: Arc<dyn crate::bluetooth::BleChooser>,
    ) -> Self {
        let host = Arc::new(NativeSerialHost::new(chooser, config.authorized_ports.clone()));
        let ble_host = Arc::new(crate::bluetooth::BtleplugHost::new(ble_chooser, config.ble_scan_duration()));
        Self::with_ble_host(config, host, ble_host)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn connections(&self) -> &Arc<ConnectionMgr> {
        &self.connections
    }

    /// Write the configuration to `path` with every port granted so far,
    /// so the next run can auto-connect to them.
    pub async fn save_authorized_ports(&self, path: &Path) -> std::result::Result<LinkConfig, ConfigError> {
        let mut config = self.config.clone();
        for port in self.connections.authorized_ports().await {
            if !config.authorized_ports.contains(&port) {
                config.authorized_ports.push(port);
            }
        }
        config.save(path)?;
        log::debug!("Saved {} authorized port(s) to {}", config.authorized_ports.len(), path.display());
        Ok(config)
    }

    /// Attach the manager to the bus and start hotplug monitoring.
    pub async fn start(&self) -> Result<()> {
        self.start_with_monitor(create_port_monitor(self.config.poll_interval()))
            .await
    }

    pub async fn start_with_monitor(&self, mut monitor: Box<dyn PortMonitor>) -> Result<()> {
        self.connections.attach_bus().await;

        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            log::debug!("Port monitor already running");
            return Ok(());
        }

        let rx = monitor
            .get_receiver()
            .ok_or_else(|| SerialError::ConnectionFailed("Port monitor receiver already taken".into()))?;
        monitor.start().await?;
        *self.port_events.lock().await = Some(self.connections.spawn_port_events(rx));
        *slot = Some(monitor);

        log::info!("XRP link started");
        Ok(())
    }

    /// Disconnect and stop background work.
    pub async fn shutdown(&self) -> Result<()> {
        self.connections.disconnect().await?;

        if let Some(mut monitor) = self.monitor.lock().await.take() {
            monitor.stop().await?;
        }
        if let Some(task) = self.port_events.lock().await.take() {
            let _ = task.await;
        }
        self.connections.detach_bus().await;

        log::info!("XRP link stopped");
        Ok(())
    }
}
