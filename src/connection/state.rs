//! Connection lifecycle.
//!
//! Every change of [`ConnectionState`] goes through [`transition`]. Hardware
//! callbacks, user requests and stream outcomes are all expressed as
//! [`LinkEvent`] messages, so the state machine can be exercised without a
//! device attached.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Negotiating with the device (enumeration, chooser, port open).
    Busy,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    NegotiationStarted,
    PortOpened,
    NegotiationFailed,
    /// Explicit disconnect request.
    Closed,
    /// The device went away underneath us.
    Unplugged,
}

/// Next state for `event` in `state`, or `None` if the event does not apply.
pub fn transition(state: ConnectionState, event: LinkEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use LinkEvent::*;

    match (state, event) {
        (Disconnected, NegotiationStarted) => Some(Busy),
        (Busy, PortOpened) => Some(Connected),
        (Busy, NegotiationFailed) => Some(Disconnected),
        (Busy, Closed) => Some(Disconnected),
        (Connected, Closed) => Some(Disconnected),
        (Connected, Unplugged) => Some(Disconnected),
        _ => None,
    }
}

/// Holds the current state and publishes changes to watchers.
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply `event` atomically. Returns the new state if it changed.
    pub fn apply(&self, event: LinkEvent) -> Option<ConnectionState> {
        let mut changed = None;
        self.tx.send_if_modified(|state| match transition(*state, event) {
            Some(next) => {
                log::debug!("Connection state {:?} -> {:?} on {:?}", *state, next, event);
                *state = next;
                changed = Some(next);
                true
            }
            None => false,
        });
        changed
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;
    use LinkEvent::*;

    const STATES: [ConnectionState; 3] = [Disconnected, Busy, Connected];
    const EVENTS: [LinkEvent; 5] = [NegotiationStarted, PortOpened, NegotiationFailed, Closed, Unplugged];

    #[test]
    fn happy_path() {
        assert_eq!(transition(Disconnected, NegotiationStarted), Some(Busy));
        assert_eq!(transition(Busy, PortOpened), Some(Connected));
        assert_eq!(transition(Connected, Closed), Some(Disconnected));
    }

    #[test]
    fn busy_ignores_a_second_negotiation() {
        assert_eq!(transition(Busy, NegotiationStarted), None);
    }

    #[test]
    fn failed_negotiation_returns_to_disconnected() {
        assert_eq!(transition(Busy, NegotiationFailed), Some(Disconnected));
    }

    #[test]
    fn disconnected_ignores_close_and_unplug() {
        assert_eq!(transition(Disconnected, Closed), None);
        assert_eq!(transition(Disconnected, Unplugged), None);
    }

    #[test]
    fn every_transition_is_a_real_change() {
        for state in STATES {
            for event in EVENTS {
                if let Some(next) = transition(state, event) {
                    assert_ne!(next, state, "{:?} on {:?} must change state", state, event);
                }
            }
        }
    }

    #[test]
    fn only_connected_can_be_unplugged() {
        for state in STATES {
            let expected = if state == Connected { Some(Disconnected) } else { None };
            assert_eq!(transition(state, Unplugged), expected);
        }
    }

    #[test]
    fn cell_reports_changes_once() {
        let cell = StateCell::new();
        let rx = cell.subscribe();
        assert_eq!(cell.apply(NegotiationStarted), Some(Busy));
        assert_eq!(cell.apply(NegotiationStarted), None);
        assert_eq!(*rx.borrow(), Busy);
        assert_eq!(cell.apply(PortOpened), Some(Connected));
        assert_eq!(cell.get(), Connected);
    }
}
