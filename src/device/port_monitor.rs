//! Hotplug detection.
//!
//! The OS-level notification APIs differ per platform; polling the serial
//! port list works everywhere and reports the USB identity of each port,
//! which the connection needs to decide whether an event concerns it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::serial::{NativeSerialHost, Result, SerialDeviceInfo, SerialError};

const EVENT_BUFFER: usize = 100;

/// Events emitted by the port monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A serial port was added
    PortAdded(SerialDeviceInfo),
    /// A serial port was removed
    PortRemoved(SerialDeviceInfo),
}

impl PortEvent {
    pub fn info(&self) -> &SerialDeviceInfo {
        match self {
            PortEvent::PortAdded(info) | PortEvent::PortRemoved(info) => info,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, PortEvent::PortRemoved(_))
    }
}

/// Platform-agnostic trait for monitoring serial port changes
#[async_trait]
pub trait PortMonitor: Send + Sync {
    /// Start monitoring for port changes
    async fn start(&mut self) -> Result<()>;

    /// Stop monitoring
    async fn stop(&mut self) -> Result<()>;

    /// Get receiver for port events
    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

pub type PortScanner = Arc<dyn Fn() -> Result<Vec<SerialDeviceInfo>> + Send + Sync>;

/// Run `scanner` on the blocking pool; enumeration touches the OS device tree.
async fn scan(scanner: &PortScanner) -> Result<Vec<SerialDeviceInfo>> {
    let scanner = scanner.clone();
    tokio::task::spawn_blocking(move || scanner())
        .await
        .map_err(|e| SerialError::ConnectionFailed(format!("port scan failed: {}", e)))?
}

/// Events that turn `previous` into `current`, removals first.
pub fn diff_ports(previous: &[SerialDeviceInfo], current: &[SerialDeviceInfo]) -> Vec<PortEvent> {
    let same = |a: &SerialDeviceInfo, b: &SerialDeviceInfo| {
        a.port_name == b.port_name && a.vid == b.vid && a.pid == b.pid
    };

    let removed = previous
        .iter()
        .filter(|old| !current.iter().any(|new| same(old, new)))
        .cloned()
        .map(PortEvent::PortRemoved);
    let added = current
        .iter()
        .filter(|new| !previous.iter().any(|old| same(old, new)))
        .cloned()
        .map(PortEvent::PortAdded);

    removed.chain(added).collect()
}

pub struct PollingPortMonitor {
    interval: Duration,
    scanner: PortScanner,
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    stop_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(interval: Duration) -> Self {
        Self::with_scanner(interval, Arc::new(NativeSerialHost::discover_devices))
    }

    pub fn with_scanner(interval: Duration, scanner: PortScanner) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            interval,
            scanner,
            tx: Some(tx),
            rx: Some(rx),
            stop_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SerialError::ConnectionFailed("Port monitor already started".into()))?;
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let scanner = self.scanner.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            log::info!("Starting serial port polling (interval: {:?})", period);
            let mut previous = scan(&scanner).await.unwrap_or_default();
            let mut ticker = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        log::info!("Port monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let current = match scan(&scanner).await {
                            Ok(ports) => ports,
                            Err(e) => {
                                log::warn!("Failed to enumerate serial ports: {}", e);
                                continue;
                            }
                        };
                        for event in diff_ports(&previous, &current) {
                            log::debug!("Port event: {:?}", event);
                            if tx.send(event).await.is_err() {
                                log::debug!("Port event receiver dropped");
                                return;
                            }
                        }
                        previous = current;
                    }
                }
            }
        });

        self.task = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = self.task.take() {
            if let Err(e) = handle.await {
                log::warn!("Port monitor task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}

/// Create the port monitor for this platform
pub fn create_port_monitor(interval: Duration) -> Box<dyn PortMonitor> {
    Box::new(PollingPortMonitor::new(interval))
}
