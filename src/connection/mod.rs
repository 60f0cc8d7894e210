pub mod ble;
pub mod state;
pub mod usb;

pub use state::{transition, ConnectionState, LinkEvent, StateCell};
pub use ble::BleConnection;
pub use usb::UsbConnection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use uuid::Uuid;

use crate::device::port_monitor::PortEvent;
use crate::device::{Result, TransportKind};
use crate::repl::{self, ReplOutput, ReplSession, ReplSettings};

/// Invoked on every real state change.
pub type StatusCallback = Arc<dyn Fn(TransportKind, ConnectionState) + Send + Sync>;
/// Invoked with terminal-bound output decoded from the device.
pub type DataCallback = Arc<dyn Fn(TransportKind, ReplOutput) + Send + Sync>;

/// Data accepted by [`Connection::write_to_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> Payload<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(text: &'a str) -> Self {
        Payload::Text(text)
    }
}

impl<'a> From<&'a String> for Payload<'a> {
    fn from(text: &'a String) -> Self {
        Payload::Text(text.as_str())
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Payload::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for Payload<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        Payload::Bytes(bytes.as_slice())
    }
}

/// Bookkeeping shared by every transport.
pub struct ConnectionCore {
    id: Uuid,
    transport: TransportKind,
    state: StateCell,
    manual: AtomicBool,
    last_program: Mutex<Option<String>>,
    status_callback: RwLock<Option<StatusCallback>>,
    repl: ReplSession,
    // held by whichever routine is driving the REPL
    control: AsyncMutex<()>,
}

impl ConnectionCore {
    pub fn new(transport: TransportKind, settings: ReplSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            state: StateCell::new(),
            manual: AtomicBool::new(false),
            last_program: Mutex::new(None),
            status_callback: RwLock::new(None),
            repl: ReplSession::new(settings),
            control: AsyncMutex::new(()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn repl(&self) -> &ReplSession {
        &self.repl
    }

    /// Wait for exclusive control of the REPL.
    pub async fn lock_control(&self) -> AsyncMutexGuard<'_, ()> {
        self.control.lock().await
    }

    /// Exclusive control of the REPL, or `None` if a routine already has it.
    pub fn try_lock_control(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        self.control.try_lock().ok()
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.status_callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn set_data_callback(&self, callback: DataCallback) {
        let transport = self.transport;
        self.repl
            .set_output_sink(Arc::new(move |output| callback(transport, output)));
    }

    /// Feed `event` to the state machine and notify on change.
    pub fn apply(&self, event: LinkEvent) -> Option<ConnectionState> {
        let next = self.state.apply(event)?;
        if next != ConnectionState::Connected {
            self.repl.cancel_waiters();
        }

        let callback = self
            .status_callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(self.transport, next);
        }
        Some(next)
    }

    /// Hand a chunk read from the device to the REPL session.
    pub fn on_data(&self, chunk: &[u8]) {
        self.repl.ingest(chunk);
    }

    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::SeqCst)
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::SeqCst);
    }

    pub fn last_program(&self) -> Option<String> {
        self.last_program.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_last_program(&self) {
        *self.last_program.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Record that `program` started on the device. Returns `false` when it
    /// is the same program as the previous run.
    pub fn program_started(&self, program: &str) -> bool {
        self.repl.set_program_running(true);
        let mut last = self.last_program.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() == Some(program) {
            return false;
        }
        *last = Some(program.to_string());
        true
    }

    pub fn program_finished(&self) {
        self.repl.set_program_running(false);
    }
}

/// Capabilities every transport provides.
#[async_trait]
pub trait Connection: Send + Sync {
    fn core(&self) -> &ConnectionCore;

    /// Negotiate with the device. No-op while a negotiation is in progress.
    async fn connect(&self) -> Result<()>;

    /// Release the transport. Safe to call when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    /// Send `data` to the device. Dropped silently when no writer is attached.
    async fn write_to_device(&self, data: Payload<'_>) -> Result<()>;

    /// React to a hotplug notification.
    async fn handle_port_event(&self, event: &PortEvent);

    /// Name of the port or peripheral currently held.
    async fn port_name(&self) -> Option<String> {
        None
    }

    fn transport(&self) -> TransportKind {
        self.core().transport()
    }

    fn state(&self) -> ConnectionState {
        self.core().state()
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn is_busy(&self) -> bool {
        self.state() == ConnectionState::Busy || self.core().repl().is_program_running()
    }

    /// Stop any running program and wait for the interactive prompt.
    async fn get_to_repl(&self) -> Result<()> {
        repl::get_to_repl(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn core() -> ConnectionCore {
        ConnectionCore::new(TransportKind::Usb, ReplSettings::default())
    }

    #[test]
    fn text_payload_is_utf8_encoded() {
        assert_eq!(Payload::from("x").as_bytes(), b"x");
        assert_eq!(Payload::from("é").as_bytes(), &[0xC3, 0xA9]);
    }

    #[test]
    fn status_callback_fires_only_on_change() {
        let core = core();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        core.set_status_callback(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        core.apply(LinkEvent::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        core.apply(LinkEvent::NegotiationStarted);
        core.apply(LinkEvent::NegotiationStarted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_program_is_reported() {
        let core = core();
        assert!(core.program_started("main.py"));
        assert!(!core.program_started("main.py"));
        assert!(core.program_started("drive.py"));
        core.clear_last_program();
        assert_eq!(core.last_program(), None);
    }
}
