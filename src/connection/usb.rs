use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Connection, ConnectionCore, ConnectionState, LinkEvent, Payload};
use crate::config::LinkConfig;
use crate::device::port_monitor::PortEvent;
use crate::device::{DeviceError, Result, TransportKind};
use crate::serial::{matches_any, DeviceFilter, PortHandle, PortWriter, SerialError, SerialHost};

const READ_TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handles held while the port is open; shared with the read loop so a
/// closed stream can release them.
#[derive(Default)]
struct PortLink {
    port: RwLock<Option<Arc<PortHandle>>>,
    writer: Mutex<Option<PortWriter>>,
}

impl PortLink {
    async fn release(&self) {
        if let Some(writer) = self.writer.lock().await.take() {
            writer.release_lock().await;
        }
        if let Some(port) = self.port.write().await.take() {
            if let Err(e) = port.close().await {
                log::warn!("Closing {} failed: {}", port.info().port_name, e);
            }
        }
    }
}

/// Resolves once the connection is `Disconnected`.
async fn link_closed(mut state_rx: watch::Receiver<ConnectionState>) {
    loop {
        if *state_rx.borrow_and_update() == ConnectionState::Disconnected {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// USB serial connection to an XRP controller.
pub struct UsbConnection {
    core: Arc<ConnectionCore>,
    host: Arc<dyn SerialHost>,
    filters: Vec<DeviceFilter>,
    baud_rate: u32,
    open_timeout: Duration,
    read_chunk_size: usize,
    link: Arc<PortLink>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl UsbConnection {
    pub fn new(host: Arc<dyn SerialHost>, config: &LinkConfig) -> Self {
        Self {
            core: Arc::new(ConnectionCore::new(TransportKind::Usb, config.repl_settings())),
            host,
            filters: config.device_filters.clone(),
            baud_rate: config.baud_rate,
            open_timeout: config.open_timeout(),
            read_chunk_size: config.read_chunk_size,
            link: Arc::new(PortLink::default()),
            read_task: Mutex::new(None),
        }
    }

    pub fn filters(&self) -> &[DeviceFilter] {
        &self.filters
    }

    pub async fn has_writer(&self) -> bool {
        self.link.writer.lock().await.is_some()
    }

    /// Open the first authorized port that looks like an XRP.
    /// Expects the state to be `Busy`.
    async fn try_auto_connect(&self) -> bool {
        log::debug!("Trying USB auto connect");
        let ports = match self.host.get_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                log::warn!("Could not enumerate authorized ports: {}", e);
                return false;
            }
        };

        for port in ports.into_iter().filter(|p| matches_any(&self.filters, p.info())) {
            if self.open_port(&port).await {
                log::info!("Auto connected to {}", port.info().port_name);
                return self.on_connected(port).await;
            }
        }

        log::debug!("No authorized XRP found for auto connect");
        false
    }

    /// Ask the user to pick a device. Expects the state to be `Busy`.
    async fn manual_connect(&self) -> Result<()> {
        log::debug!("Trying to perform a manual USB cable connection");
        self.core.set_manual(true);
        let requested = self.host.request_port(&self.filters).await;
        self.core.set_manual(false);

        match requested {
            Ok(port) => {
                let port_name = port.info().port_name.clone();
                log::debug!("Manually selected {}", port_name);
                if self.open_port(&port).await && self.on_connected(port).await {
                    return Ok(());
                }
                log::warn!("Connection failed. Check cable and try again");
                self.core.apply(LinkEvent::NegotiationFailed);
                Err(DeviceError::Negotiation(format!(
                    "could not open {}, check the cable and try again",
                    port_name
                )))
            }
            Err(SerialError::SelectionCancelled) => {
                log::info!("No device selected, manual connection cancelled");
                self.core.apply(LinkEvent::NegotiationFailed);
                Ok(())
            }
            Err(e) => {
                self.core.apply(LinkEvent::NegotiationFailed);
                Err(DeviceError::Negotiation(format!(
                    "can not manually connect using USB cable: {}",
                    e
                )))
            }
        }
    }

    async fn open_port(&self, port: &Arc<PortHandle>) -> bool {
        match timeout(self.open_timeout, port.open(self.baud_rate)).await {
            Ok(Ok(())) => true,
            Ok(Err(SerialError::AlreadyOpen)) => {
                log::debug!("Port {} already open, everything is good to go", port.info().port_name);
                true
            }
            Ok(Err(e)) => {
                log::warn!(
                    "Opening {} failed, is another application accessing this device? {}",
                    port.info().port_name,
                    e
                );
                false
            }
            Err(_) => {
                log::warn!("Opening {} timed out after {:?}", port.info().port_name, self.open_timeout);
                false
            }
        }
    }

    /// Attach the writer, flip to `Connected` and start reading. On failure
    /// the port is closed again and the state is left to the caller.
    async fn on_connected(&self, port: Arc<PortHandle>) -> bool {
        let writer = match port.writer().await {
            Ok(writer) => writer,
            Err(e) => {
                log::warn!("Could not attach a writer to {}: {}", port.info().port_name, e);
                if let Err(e) = port.close().await {
                    log::warn!("Closing {} failed: {}", port.info().port_name, e);
                }
                return false;
            }
        };
        *self.link.writer.lock().await = Some(writer);
        *self.link.port.write().await = Some(port.clone());
        self.core.clear_last_program();

        if self.core.apply(LinkEvent::PortOpened).is_none() {
            // disconnect() won the race while we were negotiating
            log::debug!("Negotiation finished after the connection was closed");
            self.link.release().await;
            return false;
        }

        let handle = tokio::spawn(read_loop(
            self.core.clone(),
            self.link.clone(),
            port,
            self.read_chunk_size,
        ));
        if let Some(previous) = self.read_task.lock().await.replace(handle) {
            previous.abort();
        }
        true
    }

    async fn auto_connect_on_plug(&self) {
        if self.core.apply(LinkEvent::NegotiationStarted).is_none() {
            return;
        }
        if !self.try_auto_connect().await {
            self.core.apply(LinkEvent::NegotiationFailed);
        }
    }

    async fn join_read_task(&self) {
        let task = self.read_task.lock().await.take();
        if let Some(mut task) = task {
            if timeout(READ_TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                log::warn!("Read loop did not stop in time, aborting it");
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Connection for UsbConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    async fn connect(&self) -> Result<()> {
        match self.core.state() {
            ConnectionState::Busy => {
                log::debug!("Connect ignored, a negotiation is already in progress");
                return Ok(());
            }
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => {}
        }

        if self.core.apply(LinkEvent::NegotiationStarted).is_none() {
            return Ok(());
        }

        if self.try_auto_connect().await || self.core.state() != ConnectionState::Busy {
            return Ok(());
        }
        self.manual_connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        let closed = self.core.apply(LinkEvent::Closed).is_some();
        self.join_read_task().await;
        self.link.release().await;

        if closed {
            log::info!("USB connection closed");
        }
        Ok(())
    }

    async fn port_name(&self) -> Option<String> {
        self.link
            .port
            .read()
            .await
            .as_ref()
            .map(|port| port.info().port_name.clone())
    }

    async fn write_to_device(&self, data: Payload<'_>) -> Result<()> {
        let bytes = data.as_bytes();
        let state_rx = self.core.subscribe_state();
        let mut writer = self.link.writer.lock().await;

        match writer.as_mut() {
            Some(writer) => {
                log::trace!("Writing to device: {}", hex::encode(bytes));
                // a device that stops draining must not keep release() waiting on this lock
                tokio::select! {
                    result = writer.write(bytes) => {
                        if let Err(e) = result {
                            log::warn!("Write to device failed: {}", e);
                        }
                    }
                    _ = link_closed(state_rx) => {
                        log::debug!("Link closed during a write, dropped {} byte(s)", bytes.len());
                    }
                }
            }
            None => {
                log::debug!("No writer attached, dropped {} byte(s)", bytes.len());
            }
        }
        Ok(())
    }

    async fn handle_port_event(&self, event: &PortEvent) {
        match event {
            PortEvent::PortAdded(info) => {
                if self.core.is_manual()
                    || !matches_any(&self.filters, info)
                    || self.core.state() != ConnectionState::Disconnected
                {
                    return;
                }
                log::debug!("XRP plugged in on {}, attempting auto connect", info.port_name);
                self.auto_connect_on_plug().await;
            }
            PortEvent::PortRemoved(info) => {
                if !matches_any(&self.filters, info) || self.core.state() == ConnectionState::Disconnected {
                    return;
                }
                let ours = match self.link.port.read().await.as_ref() {
                    Some(port) => port.info().port_name == info.port_name,
                    None => true,
                };
                if !ours {
                    return;
                }

                if self.core.apply(LinkEvent::Unplugged).is_some() {
                    log::info!("User unplugged XRP USB connection cable");
                    self.join_read_task().await;
                    self.link.release().await;
                }
            }
        }
    }
}

/// Forward device output to the core until the stream ends or the
/// connection leaves `Connected`.
///
/// A closed stream means the device end went away without a hotplug event
/// reaching us yet, so the loop tears the link down itself. I/O errors are
/// left to the unplug handler.
async fn read_loop(core: Arc<ConnectionCore>, link: Arc<PortLink>, port: Arc<PortHandle>, chunk_size: usize) {
    let mut state_rx = core.subscribe_state();
    if *state_rx.borrow() != ConnectionState::Connected {
        return;
    }

    let mut reader = match port.reader(chunk_size).await {
        Ok(reader) => reader,
        Err(e) => {
            log::warn!("Read loop could not lock {}: {}", port.info().port_name, e);
            return;
        }
    };
    log::debug!("USB read loop started on {}", port.info().port_name);

    loop {
        tokio::select! {
            chunk = reader.read() => match chunk {
                Ok(Some(chunk)) => core.on_data(&chunk),
                Ok(None) => {
                    reader.release_lock().await;
                    log::info!("Stream on {} closed by the device", port.info().port_name);
                    if core.apply(LinkEvent::Unplugged).is_some() {
                        link.release().await;
                    }
                    break;
                }
                Err(e) => {
                    // cleanup belongs to the unplug handler
                    log::debug!("Device most likely unplugged: {}", e);
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() != ConnectionState::Connected {
                    reader.release_lock().await;
                    break;
                }
            }
        }
    }
    log::debug!("Current read loop ended");
}
