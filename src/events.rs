//! Application-wide publish/subscribe.
//!
//! Handlers run synchronously on the publishing task, in the order they
//! subscribed. A subscriber registers once per event kind; a second
//! registration under the same id is refused so a component that is
//! wired up twice does not see every event twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::connection::ConnectionState;
use crate::device::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    ConnectionStatus,
    IncomingData,
    OutgoingWrite,
    ConnectionError,
    TerminalMessage,
    JoystickMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum AppEvent {
    /// The active connection changed state.
    ConnectionStatus {
        transport: TransportKind,
        state: ConnectionState,
    },
    /// Text the device printed, ready for the terminal.
    IncomingData { transport: TransportKind, text: String },
    /// Bytes the UI wants sent to the device.
    OutgoingWrite(Vec<u8>),
    ConnectionError { transport: TransportKind, message: String },
    /// Local notice shown in the terminal, not produced by the device.
    TerminalMessage(String),
    JoystickMode { enabled: bool },
}

impl AppEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AppEvent::ConnectionStatus { .. } => EventKind::ConnectionStatus,
            AppEvent::IncomingData { .. } => EventKind::IncomingData,
            AppEvent::OutgoingWrite(_) => EventKind::OutgoingWrite,
            AppEvent::ConnectionError { .. } => EventKind::ConnectionError,
            AppEvent::TerminalMessage(_) => EventKind::TerminalMessage,
            AppEvent::JoystickMode { .. } => EventKind::JoystickMode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub type Handler = Arc<dyn Fn(&AppEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriberId, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Returns `false` if `id` already
    /// listens to `kind`.
    pub fn subscribe<F>(&self, id: impl Into<SubscriberId>, kind: EventKind, handler: F) -> bool
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        let id = id.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let entries = handlers.entry(kind).or_default();

        if entries.iter().any(|(existing, _)| *existing == id) {
            log::debug!("'{}' is already subscribed to {:?}", id, kind);
            return false;
        }
        entries.push((id, Arc::new(handler)));
        true
    }

    pub fn unsubscribe(&self, id: &SubscriberId, kind: EventKind) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        match handlers.get_mut(&kind) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|(existing, _)| existing != id);
                entries.len() != before
            }
            None => false,
        }
    }

    /// Drop every registration of `id`. Returns how many were removed.
    pub fn unsubscribe_all(&self, id: &SubscriberId) -> usize {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers
            .values_mut()
            .map(|entries| {
                let before = entries.len();
                entries.retain(|(existing, _)| existing != id);
                before - entries.len()
            })
            .sum()
    }

    pub fn is_subscribed(&self, id: &SubscriberId, kind: EventKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(false, |entries| entries.iter().any(|(existing, _)| existing == id))
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler of its kind. Returns the number of
    /// handlers invoked.
    pub fn emit(&self, event: &AppEvent) -> usize {
        // Snapshot so handlers can (un)subscribe without deadlocking.
        let targets: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        log::trace!("Emitting {:?} to {} subscriber(s)", event.kind(), targets.len());
        for handler in &targets {
            handler(event);
        }
        targets.len()
    }
}
