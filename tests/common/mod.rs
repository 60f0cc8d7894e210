#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};

use xrp_link_lib::bluetooth::{self, BleDeviceInfo, BleError, BleHost, BlePeripheral};
use xrp_link_lib::config::LinkConfig;
use xrp_link_lib::connection::ConnectionState;
use xrp_link_lib::serial::{
    matches_any, BoxedStream, DeviceFilter, PortHandle, Result, SerialDeviceInfo, SerialError,
    SerialHost, StreamOpener,
};

pub const XRP_VID: u16 = 6991;
pub const XRP_PID: u16 = 70;

pub fn xrp_info(port: &str) -> SerialDeviceInfo {
    SerialDeviceInfo::new(port, XRP_VID, XRP_PID)
}

pub fn fast_config() -> LinkConfig {
    LinkConfig {
        repl_timeout_ms: 200,
        open_timeout_ms: 200,
        ..LinkConfig::default()
    }
}

/// Hands out in-memory pipes; the device ends are kept for the test.
#[derive(Default)]
pub struct PipeOpener {
    devices: Mutex<VecDeque<DuplexStream>>,
    pub fail: AtomicBool,
    /// Opens never complete while set.
    pub stall: AtomicBool,
    pub opens: AtomicUsize,
}

impl PipeOpener {
    pub fn take_device(&self) -> Option<DuplexStream> {
        self.devices.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl StreamOpener for PipeOpener {
    async fn open_stream(&self, info: &SerialDeviceInfo, _baud_rate: u32) -> Result<BoxedStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SerialError::ConnectionFailed(format!("{} is busy", info.port_name)));
        }
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (host_end, device_end) = tokio::io::duplex(4096);
        self.devices.lock().unwrap().push_back(device_end);
        Ok(Box::new(host_end))
    }
}

pub enum Pick {
    Cancel,
    Fail,
    Port(Arc<PortHandle>),
}

/// Scriptable stand-in for the platform serial host.
pub struct MockHost {
    pub opener: Arc<PipeOpener>,
    authorized: Mutex<Vec<Arc<PortHandle>>>,
    pick: Mutex<Option<Pick>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub request_calls: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opener: Arc::new(PipeOpener::default()),
            authorized: Mutex::new(Vec::new()),
            pick: Mutex::new(None),
            gate: Mutex::new(None),
            request_calls: AtomicUsize::new(0),
        })
    }

    pub fn port(&self, info: SerialDeviceInfo) -> Arc<PortHandle> {
        PortHandle::new(info, self.opener.clone())
    }

    /// Make `info` present and already authorized.
    pub fn authorize(&self, info: SerialDeviceInfo) -> Arc<PortHandle> {
        let port = self.port(info);
        self.authorized.lock().unwrap().push(port.clone());
        port
    }

    pub fn unplug(&self, port_name: &str) {
        self.authorized
            .lock()
            .unwrap()
            .retain(|port| port.info().port_name != port_name);
    }

    pub fn set_pick(&self, pick: Pick) {
        *self.pick.lock().unwrap() = Some(pick);
    }

    /// Hold `request_port` until the returned notify fires.
    pub fn hold_requests(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn requests(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SerialHost for MockHost {
    async fn get_ports(&self) -> Result<Vec<Arc<PortHandle>>> {
        Ok(self.authorized.lock().unwrap().clone())
    }

    async fn request_port(&self, filters: &[DeviceFilter]) -> Result<Arc<PortHandle>> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match self.pick.lock().unwrap().take() {
            Some(Pick::Port(port)) if matches_any(filters, port.info()) => {
                self.authorized.lock().unwrap().push(port.clone());
                Ok(port)
            }
            Some(Pick::Fail) => Err(SerialError::PortNotFound("chooser unavailable".into())),
            _ => Err(SerialError::SelectionCancelled),
        }
    }

    async fn authorized_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .authorized
            .lock()
            .unwrap()
            .iter()
            .map(|port| port.info().port_name.clone())
            .collect();
        ports.sort();
        ports
    }
}

/// Read at least one chunk from the device end, or `None` on timeout.
pub async fn device_read(device: &mut DuplexStream) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 256];
    match tokio::time::timeout(Duration::from_secs(1), device.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => Some(buf[..n].to_vec()),
        _ => None,
    }
}

pub async fn wait_for_state(
    rx: &mut tokio::sync::watch::Receiver<ConnectionState>,
    expected: ConnectionState,
) -> bool {
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|state| *state == expected))
        .await
        .map_or(false, |res| res.is_ok())
}

pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub const RAW_BANNER: &str = "\r\nraw REPL; CTRL-B to exit\r\n>";
pub const FRIENDLY_BANNER: &str = "\r\nMicroPython v1.22.0 on 2024-01-01; Raspberry Pi Pico W with RP2040\r\n\
Type \"help()\" for more information.\r\n>>> ";
pub const INTERRUPTED: &str = "\x04Traceback (most recent call last):\r\nKeyboardInterrupt: \r\n\x04>";

/// What the scripted robot does with an uploaded program.
pub enum Program {
    /// Print this and return to the raw prompt.
    Finishes(String),
    /// Print this and keep running until interrupted.
    Runs(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Friendly,
    Raw,
    Running,
}

/// MicroPython stand-in on the device end of a pipe. Returns the list of
/// programs it executed so far.
pub fn spawn_xrp<F>(mut device: DuplexStream, script: F) -> Arc<Mutex<Vec<String>>>
where
    F: Fn(&str) -> Program + Send + 'static,
{
    let executed = Arc::new(Mutex::new(Vec::new()));
    let seen = executed.clone();
    tokio::spawn(async move {
        let mut mode = Mode::Friendly;
        let mut code = String::new();
        let mut buf = vec![0u8; 512];

        loop {
            let n = match device.read(&mut buf).await {
                Ok(n) if n > 0 => n,
                _ => break,
            };
            let mut reply = String::new();
            for &byte in &buf[..n] {
                match (mode, byte) {
                    (Mode::Friendly, 0x01) | (Mode::Raw, 0x01) => {
                        mode = Mode::Raw;
                        code.clear();
                        reply.push_str(RAW_BANNER);
                    }
                    (Mode::Friendly, 0x02) | (Mode::Raw, 0x02) => {
                        mode = Mode::Friendly;
                        reply.push_str(FRIENDLY_BANNER);
                    }
                    (Mode::Friendly, 0x03) => reply.push_str("\r\n>>> "),
                    (Mode::Raw, 0x03) => code.clear(),
                    (Mode::Raw, 0x04) => {
                        let program = std::mem::take(&mut code);
                        reply.push_str("OK");
                        match script(&program) {
                            Program::Finishes(output) => {
                                reply.push_str(&output);
                                reply.push_str("\x04\x04>");
                            }
                            Program::Runs(output) => {
                                reply.push_str(&output);
                                mode = Mode::Running;
                            }
                        }
                        seen.lock().unwrap().push(program);
                    }
                    (Mode::Raw, byte) => code.push(byte as char),
                    (Mode::Running, 0x03) => {
                        mode = Mode::Raw;
                        reply.push_str(INTERRUPTED);
                    }
                    _ => {}
                }
            }
            if !reply.is_empty() && device.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    executed
}

/// Scriptable BLE robot.
pub struct MockPeripheral {
    info: BleDeviceInfo,
    connected: AtomicBool,
    notify_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pub written: Mutex<Vec<u8>>,
    pub connects: AtomicUsize,
    /// Upcoming connects that fail.
    pub failing_connects: AtomicUsize,
}

impl MockPeripheral {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            info: BleDeviceInfo::new(format!("{}-id", name), name),
            connected: AtomicBool::new(false),
            notify_tx: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
        })
    }

    /// Send a notification as the robot would.
    pub async fn notify(&self, data: &[u8]) -> bool {
        let tx = self.notify_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(data.to_vec()).await.is_ok(),
            None => false,
        }
    }

    /// The robot walks out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify_tx.lock().unwrap().take();
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn info(&self) -> &BleDeviceInfo {
        &self.info
    }

    async fn connect(&self) -> bluetooth::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(BleError::Backend("out of range".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> bluetooth::Result<()> {
        self.drop_link();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> bluetooth::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BleError::NotConnected);
        }
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn notifications(&self) -> bluetooth::Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(16);
        *self.notify_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

/// Offers one robot, or cancels when there is none.
#[derive(Default)]
pub struct MockBleHost {
    pub peripheral: Mutex<Option<Arc<MockPeripheral>>>,
    pub prefixes: Mutex<Vec<String>>,
}

impl MockBleHost {
    pub fn offering(peripheral: Arc<MockPeripheral>) -> Arc<Self> {
        Arc::new(Self {
            peripheral: Mutex::new(Some(peripheral)),
            prefixes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BleHost for MockBleHost {
    async fn request_device(&self, name_prefix: &str) -> bluetooth::Result<Arc<dyn BlePeripheral>> {
        self.prefixes.lock().unwrap().push(name_prefix.to_string());
        match self.peripheral.lock().unwrap().clone() {
            Some(peripheral) => Ok(peripheral as Arc<dyn BlePeripheral>),
            None => Err(BleError::SelectionCancelled),
        }
    }
}
