use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::port_monitor::PortEvent;
use super::{ConnectionStatus, DeviceError, Result, TransportKind};
use crate::bluetooth::BleHost;
use crate::config::LinkConfig;
use crate::connection::{BleConnection, Connection, ConnectionState, Payload, UsbConnection};
use crate::events::{AppEvent, EventBus, EventKind, SubscriberId};
use crate::repl::{DeviceRoutines, FsSnapshot, ReplOutput, VersionInfo};
use crate::serial::{matches_any, SerialDeviceInfo, SerialHost};

pub const MANAGER_SUBSCRIBER: &str = "connection-mgr";

/// Owns the active connection and bridges it to the event bus
pub struct ConnectionMgr {
    bus: Arc<EventBus>,
    host: Arc<dyn SerialHost>,
    ble_host: Option<Arc<dyn BleHost>>,
    config: LinkConfig,
    connection: Arc<RwLock<Option<Arc<dyn Connection>>>>,
    routines: DeviceRoutines,
    last_state: StdMutex<(ConnectionState, DateTime<Utc>)>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMgr {
    /// Manager without Bluetooth; selecting it yields `UnsupportedTransport`.
    pub fn new(bus: Arc<EventBus>, host: Arc<dyn SerialHost>, config: LinkConfig) -> Arc<Self> {
        Self::build(bus, host, None, config)
    }

    pub fn with_ble_host(
        bus: Arc<EventBus>,
        host: Arc<dyn SerialHost>,
        ble_host: Arc<dyn BleHost>,
        config: LinkConfig,
    ) -> Arc<Self> {
        Self::build(bus, host, Some(ble_host), config)
    }

    fn build(
        bus: Arc<EventBus>,
        host: Arc<dyn SerialHost>,
        ble_host: Option<Arc<dyn BleHost>>,
        config: LinkConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            host,
            ble_host,
            config,
            connection: Arc::new(RwLock::new(None)),
            routines: DeviceRoutines::new(),
            last_state: StdMutex::new((ConnectionState::Disconnected, Utc::now())),
            forward_task: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Make `kind` the active transport, tearing down any other one.
    pub async fn select_transport(self: &Arc<Self>, kind: TransportKind) -> Result<Arc<dyn Connection>> {
        if let Some(current) = self.connection().await {
            if current.transport() == kind {
                return Ok(current);
            }
        }

        let connection: Arc<dyn Connection> = match kind {
            TransportKind::Usb => Arc::new(UsbConnection::new(self.host.clone(), &self.config)),
            TransportKind::Bluetooth => match &self.ble_host {
                Some(ble_host) => Arc::new(BleConnection::new(ble_host.clone(), &self.config)),
                None => return Err(DeviceError::UnsupportedTransport(kind)),
            },
        };
        self.wire(&connection);
        self.routines.reset();

        let previous = self.connection.write().await.replace(connection.clone());
        if let Some(previous) = previous {
            log::info!("Switching transport from {} to {}", previous.transport(), kind);
            if let Err(e) = previous.disconnect().await {
                log::warn!("Failed to release {} connection: {}", previous.transport(), e);
            }
        }
        Ok(connection)
    }

    fn wire(self: &Arc<Self>, connection: &Arc<dyn Connection>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        connection.core().set_status_callback(Arc::new(move |transport, state| {
            if let Some(mgr) = weak.upgrade() {
                mgr.on_status(transport, state);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        connection.core().set_data_callback(Arc::new(move |transport, output| {
            if let Some(mgr) = weak.upgrade() {
                mgr.on_output(transport, output);
            }
        }));
    }

    fn on_status(&self, transport: TransportKind, state: ConnectionState) {
        let previous = {
            let mut last = self.last_state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = last.0;
            *last = (state, Utc::now());
            previous
        };
        log::info!("{} connection: {:?} -> {:?}", transport, previous, state);

        self.bus.emit(&AppEvent::ConnectionStatus { transport, state });
        match (previous, state) {
            (ConnectionState::Disconnected, ConnectionState::Connected)
            | (ConnectionState::Busy, ConnectionState::Connected) => {
                self.bus
                    .emit(&AppEvent::TerminalMessage("\r\nConnected to XRP\r\n".into()));
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                self.bus
                    .emit(&AppEvent::TerminalMessage("\r\nXRP disconnected\r\n".into()));
            }
            _ => {}
        }
    }

    fn on_output(&self, transport: TransportKind, output: ReplOutput) {
        match output {
            ReplOutput::Terminal(text) => {
                self.bus.emit(&AppEvent::IncomingData { transport, text });
            }
            ReplOutput::JoystickMode(enabled) => {
                log::debug!("Joystick mode {}", if enabled { "on" } else { "off" });
                self.bus.emit(&AppEvent::JoystickMode { enabled });
            }
        }
    }

    pub async fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.read().await.clone()
    }

    pub async fn connect(self: &Arc<Self>, kind: TransportKind) -> Result<()> {
        let connection = self.select_transport(kind).await?;
        match connection.connect().await {
            Ok(()) => {
                if !connection.is_connected() {
                    log::info!("Connect finished without an XRP attached");
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to connect over {}: {}", kind, e);
                self.bus.emit(&AppEvent::ConnectionError {
                    transport: kind,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        match self.connection().await {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }

    /// Send to the active connection; dropped when there is none.
    pub async fn write(&self, payload: Payload<'_>) -> Result<()> {
        match self.connection().await {
            Some(connection) => connection.write_to_device(payload).await,
            None => {
                log::debug!("No active connection, dropped {} byte(s)", payload.as_bytes().len());
                Ok(())
            }
        }
    }

    /// Stop the running program and wait for the prompt.
    pub async fn get_to_repl(&self) -> Result<()> {
        let connection = self.connection().await.ok_or(DeviceError::NotConnected)?;
        connection.get_to_repl().await
    }

    async fn active(&self) -> Result<Arc<dyn Connection>> {
        match self.connection().await {
            Some(connection) if connection.is_connected() => Ok(connection),
            _ => Err(DeviceError::NotConnected),
        }
    }

    pub async fn battery_voltage(&self) -> Result<f64> {
        let connection = self.active().await?;
        self.routines.battery_voltage(connection.as_ref()).await
    }

    pub async fn version_info(&self) -> Result<VersionInfo> {
        let connection = self.active().await?;
        self.routines.version_info(connection.as_ref()).await
    }

    pub async fn fs_tree(&self) -> Result<FsSnapshot> {
        let connection = self.active().await?;
        self.routines.fs_tree(connection.as_ref()).await
    }

    /// Run `source` on the device and wait for it to end. Stop it from
    /// another task with [`get_to_repl`](Self::get_to_repl).
    pub async fn run_program(&self, name: &str, source: &str) -> Result<()> {
        let connection = self.active().await?;
        self.routines.run_program(connection.as_ref(), name, source).await
    }

    /// Give the REPL back to the cable and clear XRPLib's running flag.
    pub async fn reset_terminal(&self) -> Result<()> {
        let connection = self.active().await?;
        self.routines.reset_terminal(connection.as_ref()).await?;
        self.routines.clear_is_running(connection.as_ref()).await
    }

    pub async fn is_busy(&self) -> bool {
        self.connection()
            .await
            .map_or(false, |connection| connection.is_busy())
    }

    pub async fn status(&self) -> ConnectionStatus {
        let last_changed = self.last_state.lock().unwrap_or_else(PoisonError::into_inner).1;
        let Some(connection) = self.connection().await else {
            return ConnectionStatus::idle(last_changed);
        };

        let port_name = if connection.is_connected() {
            connection.port_name().await
        } else {
            None
        };

        ConnectionStatus {
            transport: Some(connection.transport()),
            state: connection.state(),
            busy: connection.is_busy(),
            port_name,
            last_changed,
        }
    }

    /// Authorized ports that look like an XRP.
    pub async fn authorized_devices(&self) -> Result<Vec<SerialDeviceInfo>> {
        let ports = self.host.get_ports().await?;
        Ok(ports
            .iter()
            .map(|port| port.info().clone())
            .filter(|info| matches_any(&self.config.device_filters, info))
            .collect())
    }

    /// Ports the user has granted so far, for persisting.
    pub async fn authorized_ports(&self) -> Vec<String> {
        self.host.authorized_ports().await
    }

    pub async fn handle_port_event(&self, event: &PortEvent) {
        if let Some(connection) = self.connection().await {
            connection.handle_port_event(event).await;
        }
    }

    /// Route hotplug events to the active connection until `rx` closes.
    pub fn spawn_port_events(self: &Arc<Self>, mut rx: mpsc::Receiver<PortEvent>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(mgr) = weak.upgrade() else { break };
                mgr.handle_port_event(&event).await;
            }
            log::debug!("Port event stream closed");
        })
    }

    /// Subscribe to `OutgoingWrite` and forward the bytes, in order, to the
    /// active connection. Must run inside a tokio runtime. Returns `false`
    /// when already attached.
    pub async fn attach_bus(self: &Arc<Self>) -> bool {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let subscribed = self.bus.subscribe(MANAGER_SUBSCRIBER, EventKind::OutgoingWrite, move |event| {
            if let AppEvent::OutgoingWrite(bytes) = event {
                let _ = tx.send(bytes.clone());
            }
        });
        if !subscribed {
            return false;
        }

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let Some(mgr) = weak.upgrade() else { break };
                if let Err(e) = mgr.write(Payload::Bytes(&bytes)).await {
                    log::warn!("Forwarding write to device failed: {}", e);
                }
            }
        });
        if let Some(previous) = self.forward_task.lock().await.replace(task) {
            previous.abort();
        }
        true
    }

    /// Undo [`attach_bus`](Self::attach_bus).
    pub async fn detach_bus(&self) {
        self.bus.unsubscribe_all(&SubscriberId::new(MANAGER_SUBSCRIBER));
        if let Some(task) = self.forward_task.lock().await.take() {
            let _ = task.await;
        }
    }
}
