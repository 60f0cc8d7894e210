use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use super::{Connection, ConnectionCore, ConnectionState, LinkEvent, Payload};
use crate::bluetooth::{self, BleError, BleHost, BlePeripheral};
use crate::config::LinkConfig;
use crate::device::port_monitor::PortEvent;
use crate::device::{DeviceError, Result, TransportKind};

const LINK_TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

type DeviceSlot = Arc<RwLock<Option<Arc<dyn BlePeripheral>>>>;

/// Connect the peripheral and subscribe to its output.
async fn open_link(peripheral: &dyn BlePeripheral) -> bluetooth::Result<mpsc::Receiver<Vec<u8>>> {
    peripheral.connect().await?;
    peripheral.notifications().await
}

/// Bluetooth LE connection over the Nordic UART service.
///
/// A link that drops on its own is re-established with the same peripheral
/// for up to `ble_reconnect_timeout_ms`; an explicit disconnect is final.
pub struct BleConnection {
    core: Arc<ConnectionCore>,
    host: Arc<dyn BleHost>,
    name_prefix: String,
    reconnect_timeout: Duration,
    device: DeviceSlot,
    // GATT writes must not interleave
    write_lock: Mutex<()>,
    link_task: Mutex<Option<JoinHandle<()>>>,
}

impl BleConnection {
    pub fn new(host: Arc<dyn BleHost>, config: &LinkConfig) -> Self {
        Self {
            core: Arc::new(ConnectionCore::new(TransportKind::Bluetooth, config.repl_settings())),
            host,
            name_prefix: config.ble_name_prefix.clone(),
            reconnect_timeout: config.ble_reconnect_timeout(),
            device: Arc::new(RwLock::new(None)),
            write_lock: Mutex::new(()),
            link_task: Mutex::new(None),
        }
    }

    async fn negotiate(&self) -> Result<()> {
        let peripheral = match self.host.request_device(&self.name_prefix).await {
            Ok(peripheral) => peripheral,
            Err(BleError::SelectionCancelled) => {
                log::info!("No robot selected, Bluetooth connection cancelled");
                self.core.apply(LinkEvent::NegotiationFailed);
                return Ok(());
            }
            Err(e) => {
                self.core.apply(LinkEvent::NegotiationFailed);
                return Err(DeviceError::Negotiation(format!("can not connect over Bluetooth: {}", e)));
            }
        };

        let name = peripheral.info().name.clone();
        log::debug!("Connecting to {}", name);
        let rx = match timeout(self.reconnect_timeout, open_link(peripheral.as_ref())).await {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => {
                self.core.apply(LinkEvent::NegotiationFailed);
                return Err(DeviceError::Negotiation(format!("could not connect to {}: {}", name, e)));
            }
            Err(_) => {
                self.core.apply(LinkEvent::NegotiationFailed);
                return Err(DeviceError::Ble(BleError::Timeout));
            }
        };

        *self.device.write().await = Some(peripheral.clone());
        self.core.clear_last_program();
        if self.core.apply(LinkEvent::PortOpened).is_none() {
            log::debug!("Negotiation finished after the connection was closed");
            self.release().await;
            return Ok(());
        }

        let handle = tokio::spawn(link_loop(
            self.core.clone(),
            self.device.clone(),
            peripheral,
            rx,
            self.reconnect_timeout,
        ));
        if let Some(previous) = self.link_task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn release(&self) {
        let device = self.device.write().await.take();
        if let Some(device) = device {
            if let Err(e) = device.disconnect().await {
                log::warn!("Disconnecting {} failed: {}", device.info().name, e);
            }
        }
    }

    async fn join_link_task(&self) {
        let task = self.link_task.lock().await.take();
        if let Some(mut task) = task {
            if timeout(LINK_TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                log::warn!("BLE link loop did not stop in time, aborting it");
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Connection for BleConnection {
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

        self.core.set_manual(true);
        let result = self.negotiate().await;
        self.core.set_manual(false);
        result
    }

    async fn disconnect(&self) -> Result<()> {
        let closed = self.core.apply(LinkEvent::Closed).is_some();
        self.release().await;
        self.join_link_task().await;

        if closed {
            log::info!("Bluetooth connection closed");
        }
        Ok(())
    }

    async fn write_to_device(&self, data: Payload<'_>) -> Result<()> {
        let bytes = data.as_bytes();
        let device = match self.core.state() {
            ConnectionState::Connected => self.device.read().await.clone(),
            _ => None,
        };
        let Some(device) = device else {
            log::debug!("No robot attached, dropped {} byte(s)", bytes.len());
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;
        log::trace!("Writing to robot: {}", hex::encode(bytes));
        if let Err(e) = device.write(bytes).await {
            log::warn!("BLE write failed: {}", e);
        }
        Ok(())
    }

    async fn handle_port_event(&self, _event: &PortEvent) {}

    async fn port_name(&self) -> Option<String> {
        self.device
            .read()
            .await
            .as_ref()
            .map(|device| device.info().name.clone())
    }
}

/// Forward notifications to the core. When the link drops while connected,
/// try to win it back; give up and forget the peripheral if that fails.
async fn link_loop(
    core: Arc<ConnectionCore>,
    slot: DeviceSlot,
    peripheral: Arc<dyn BlePeripheral>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    reconnect_timeout: Duration,
) {
    let mut state_rx = core.subscribe_state();
    if *state_rx.borrow_and_update() != ConnectionState::Connected {
        return;
    }
    let name = peripheral.info().name.clone();
    log::debug!("BLE link loop started on {}", name);

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => core.on_data(&chunk),
                None => {
                    if core.apply(LinkEvent::Unplugged).is_none() {
                        break;
                    }
                    log::info!("Lost the Bluetooth link to {}, reconnecting", name);
                    match reconnect(&core, peripheral.as_ref(), reconnect_timeout).await {
                        Some(next) => {
                            rx = next;
                            state_rx.borrow_and_update();
                        }
                        None => {
                            slot.write().await.take();
                            break;
                        }
                    }
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() != ConnectionState::Connected {
                    break;
                }
            }
        }
    }
    log::debug!("BLE link loop ended");
}

async fn reconnect(
    core: &ConnectionCore,
    peripheral: &dyn BlePeripheral,
    reconnect_timeout: Duration,
) -> Option<mpsc::Receiver<Vec<u8>>> {
    core.apply(LinkEvent::NegotiationStarted)?;
    let deadline = Instant::now() + reconnect_timeout;

    loop {
        match tokio::time::timeout_at(deadline, open_link(peripheral)).await {
            Ok(Ok(rx)) => {
                if core.apply(LinkEvent::PortOpened).is_some() {
                    log::info!("Reconnected to {}", peripheral.info().name);
                    return Some(rx);
                }
                // closed by the user meanwhile
                if let Err(e) = peripheral.disconnect().await {
                    log::debug!("Dropping the reconnected link failed: {}", e);
                }
                return None;
            }
            Ok(Err(e)) => {
                log::debug!("Reconnect attempt failed: {}", e);
                if core.state() != ConnectionState::Busy || Instant::now() + RECONNECT_RETRY_DELAY >= deadline {
                    break;
                }
                tokio::time::sleep(RECONNECT_RETRY_DELAY).await;
            }
            Err(_) => break,
        }
    }

    log::warn!("Could not reconnect to {} within {:?}", peripheral.info().name, reconnect_timeout);
    core.apply(LinkEvent::NegotiationFailed);
    None
}
