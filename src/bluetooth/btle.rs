use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::{mpsc, RwLock};

use super::{
    BleChooser, BleDeviceInfo, BleError, BleHost, BlePeripheral, Result, UART_RX_UUID, UART_SERVICE_UUID,
    UART_TX_UUID,
};

const NOTIFY_BUFFER: usize = 64;
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

fn backend(e: btleplug::Error) -> BleError {
    BleError::Backend(e.to_string())
}

/// BLE host backed by the first adapter btleplug finds.
pub struct BtleplugHost {
    chooser: Arc<dyn BleChooser>,
    scan_duration: Duration,
}

impl BtleplugHost {
    pub fn new(chooser: Arc<dyn BleChooser>, scan_duration: Duration) -> Self {
        Self { chooser, scan_duration }
    }

    async fn adapter() -> Result<Adapter> {
        let manager = Manager::new().await.map_err(backend)?;
        manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or(BleError::NoAdapter)
    }
}

#[async_trait]
impl BleHost for BtleplugHost {
    async fn request_device(&self, name_prefix: &str) -> Result<Arc<dyn BlePeripheral>> {
        let adapter = Self::adapter().await?;

        adapter.start_scan(ScanFilter::default()).await.map_err(backend)?;
        tokio::time::sleep(self.scan_duration).await;
        adapter.stop_scan().await.map_err(backend)?;

        let mut candidates = Vec::new();
        for peripheral in adapter.peripherals().await.map_err(backend)? {
            let Some(props) = peripheral.properties().await.map_err(backend)? else {
                continue;
            };
            let Some(name) = props.local_name else { continue };
            if name.starts_with(name_prefix) {
                let info = BleDeviceInfo {
                    id: peripheral.id().to_string(),
                    name,
                    rssi: props.rssi,
                };
                candidates.push((info, peripheral));
            }
        }
        log::debug!("BLE scan found {} robot(s)", candidates.len());

        let infos: Vec<BleDeviceInfo> = candidates.iter().map(|(info, _)| info.clone()).collect();
        let index = self.chooser.choose(&infos).await.ok_or(BleError::SelectionCancelled)?;
        let (info, peripheral) = candidates
            .into_iter()
            .nth(index)
            .ok_or(BleError::SelectionCancelled)?;

        Ok(Arc::new(BtleplugPeripheral {
            info,
            peripheral,
            tx: RwLock::new(None),
        }))
    }
}

pub struct BtleplugPeripheral {
    info: BleDeviceInfo,
    peripheral: Peripheral,
    tx: RwLock<Option<Characteristic>>,
}

impl BtleplugPeripheral {
    fn characteristic(&self, uuid: uuid::Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BleError::MissingCharacteristic(uuid))
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn info(&self) -> &BleDeviceInfo {
        &self.info
    }

    async fn connect(&self) -> Result<()> {
        if !self.is_connected().await {
            self.peripheral.connect().await.map_err(backend)?;
        }
        self.peripheral.discover_services().await.map_err(backend)?;
        if !self.peripheral.services().iter().any(|s| s.uuid == UART_SERVICE_UUID) {
            return Err(BleError::MissingService(UART_SERVICE_UUID));
        }

        let tx = self.characteristic(UART_TX_UUID)?;
        let rx = self.characteristic(UART_RX_UUID)?;
        self.peripheral.subscribe(&rx).await.map_err(backend)?;
        *self.tx.write().await = Some(tx);

        log::info!("Connected to {} over BLE", self.info.name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.tx.write().await.take();
        self.peripheral.disconnect().await.map_err(backend)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let tx = self.tx.read().await.clone().ok_or(BleError::NotConnected)?;
        self.peripheral
            .write(&tx, data, WriteType::WithResponse)
            .await
            .map_err(backend)
    }

    async fn notifications(&self) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut stream = self.peripheral.notifications().await.map_err(backend)?;
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);

        // not every platform ends the stream on disconnect, so poll the link too
        let peripheral = self.peripheral.clone();
        tokio::spawn(async move {
            let mut check = tokio::time::interval(LINK_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    notification = stream.next() => match notification {
                        Some(n) if n.uuid == UART_RX_UUID => {
                            if tx.send(n.value).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = check.tick() => {
                        if !peripheral.is_connected().await.unwrap_or(false) {
                            break;
                        }
                    }
                }
            }
            log::debug!("BLE notification stream ended");
        });
        Ok(rx)
    }
}
