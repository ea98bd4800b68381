//! The platform adapter seam.
//!
//! A [`BleAdapter`] opens a [`GattLink`] per remote device. Links accept operations
//! synchronously and report completions later through the [`GattCallback`] they were opened
//! with, from whatever thread or task the platform uses.

use std::sync::{
    atomic::{AtomicU64, Ordering::SeqCst},
    Arc, Mutex,
};

use async_channel::Sender;
use bluer::Address;
use log::{debug, trace, warn};

use crate::{attributes::CharacteristicId, error::GattError, error::Result, event::GattEvent};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Parses an `AA:BB:CC:DD:EE:FF` device address.
pub fn parse_address(address: &str) -> Result<Address> {
    address
        .parse()
        .map_err(|_| GattError::InvalidAddress(address.to_string()))
}

/// A platform BLE adapter capable of opening GATT connections.
pub trait BleAdapter: Send + Sync {
    /// Whether the adapter is present and powered.
    fn is_available(&self) -> bool;

    /// Starts connecting to `address`. Returning `Ok` means the attempt was accepted; the
    /// outcome is reported through `callback`.
    fn open(&self, address: Address, callback: GattCallback) -> Result<Box<dyn GattLink>>;
}

/// An open GATT connection to one remote device.
///
/// Every operation only enqueues work. Completions arrive through the link's [`GattCallback`].
pub trait GattLink: Send + Sync {
    /// Re-establishes a dropped connection on the same link.
    fn reconnect(&self) -> Result<()>;

    fn disconnect(&self);

    /// Releases the link. No callbacks are delivered afterwards.
    fn close(&self);

    fn read(&self, id: CharacteristicId) -> Result<()>;

    fn write(&self, id: CharacteristicId, value: Vec<u8>) -> Result<()>;

    /// Toggles notifications through the client characteristic configuration descriptor.
    fn set_notify(&self, id: CharacteristicId, enabled: bool) -> Result<()>;
}

/// State shared between a session and the callbacks handed to its links.
pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    // Bumped whenever the session drops a link; callbacks from older links are ignored.
    generation: AtomicU64,
    events: Sender<GattEvent>,
}

impl Shared {
    pub(crate) fn new(events: Sender<GattEvent>) -> Self {
        Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
            events,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets the state and returns the previous one.
    pub(crate) fn transition(&self, to: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *state, to)
    }

    /// Moves to `Disconnected`, emitting the event if the state changed.
    pub(crate) fn drop_to_disconnected(&self) {
        if self.transition(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            self.emit(GattEvent::Disconnected);
        }
    }

    /// Invalidates every callback handed out so far and returns one for the next link.
    pub(crate) fn next_callback(self: &Arc<Self>) -> GattCallback {
        let generation = self.generation.fetch_add(1, SeqCst) + 1;
        GattCallback {
            shared: self.clone(),
            generation,
        }
    }

    pub(crate) fn emit(&self, event: GattEvent) {
        if let Err(e) = self.events.try_send(event) {
            trace!("Event stream closed; dropping {:?}", e.into_inner());
        }
    }

    pub(crate) fn close_events(&self) {
        self.events.close();
    }
}

/// Completion sink handed to a [`GattLink`]. Cheap to clone and safe to call from any thread.
#[derive(Clone)]
pub struct GattCallback {
    shared: Arc<Shared>,
    generation: u64,
}

impl GattCallback {
    fn is_current(&self) -> bool {
        self.shared.generation.load(SeqCst) == self.generation
    }

    pub fn on_connected(&self) {
        if !self.is_current() {
            return;
        }
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ConnectionState::Connecting {
            debug!("Ignoring connected report while {:?}", *state);
            return;
        }
        *state = ConnectionState::Connected;
        drop(state);
        self.shared.emit(GattEvent::Connected);
    }

    pub fn on_disconnected(&self) {
        if self.is_current() {
            self.shared.drop_to_disconnected();
        }
    }

    pub fn on_services_discovered(&self) {
        if self.is_current_and_connected() {
            self.shared.emit(GattEvent::ServicesDiscovered);
        }
    }

    /// A read completed or a notification arrived for `id`.
    pub fn on_characteristic_changed(&self, id: CharacteristicId, value: Vec<u8>) {
        if self.is_current_and_connected() {
            self.shared.emit(GattEvent::CharacteristicUpdated(id, value));
        }
    }

    pub fn on_write_completed(&self, id: CharacteristicId) {
        if self.is_current_and_connected() {
            self.shared.emit(GattEvent::WriteCompleted(id));
        }
    }

    /// Reports a failure. Rejected operations are logged and dropped; anything else drops the
    /// session to `Disconnected`.
    pub fn on_error(&self, error: GattError) {
        if !self.is_current() {
            return;
        }
        match error {
            GattError::OperationRejected { .. } => warn!("{error}; dropping operation"),
            _ => {
                warn!("GATT link failed: {error}");
                self.shared.drop_to_disconnected();
            }
        }
    }

    fn is_current_and_connected(&self) -> bool {
        self.is_current() && self.shared.state() == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_case_addresses() {
        let address = parse_address("03:80:e1:00:34:08").unwrap();
        assert_eq!(address, Address::new([0x03, 0x80, 0xE1, 0x00, 0x34, 0x08]));
        assert_eq!(address.to_string(), "03:80:E1:00:34:08");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in [
            "",
            "03:80:E1:00:34",
            "03:80:E1:00:34:08:01",
            "0380E1003408",
            "03:80:E1:00:34:G8",
        ] {
            assert_eq!(
                parse_address(bad),
                Err(GattError::InvalidAddress(bad.to_string())),
                "{bad:?}"
            );
        }
    }
}
