//! Defines the GATT client session.

use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc, Mutex, MutexGuard,
};

use async_channel::Receiver;
use bluer::Address;
use log::{debug, info, warn};

use crate::{
    attributes::CharacteristicId,
    error::{GattError, Result},
    event::GattEvent,
    link::{parse_address, BleAdapter, ConnectionState, GattLink, Shared},
};

struct LinkSlot {
    address: Address,
    link: Box<dyn GattLink>,
}

/// A GATT client session with one remote device.
///
/// The first link opened binds the session to its device; connecting elsewhere needs a new
/// session. Operations are accepted or refused synchronously; their results arrive on the stream
/// returned by [`GattSession::events`]. Callers serialize mutating calls themselves.
pub struct GattSession {
    adapter: Arc<dyn BleAdapter>,
    shared: Arc<Shared>,
    events: Receiver<GattEvent>,
    slot: Mutex<Option<LinkSlot>>,
    closed: AtomicBool,
}

impl GattSession {
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        let (events_send, events) = async_channel::unbounded();
        GattSession {
            adapter,
            shared: Arc::new(Shared::new(events_send)),
            events,
            slot: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Starts connecting to `address`.
    ///
    /// `Ok` means the attempt was accepted, not that the device is connected; watch for
    /// [`GattEvent::Connected`]. Connecting again to the address of a connecting or connected
    /// session is a no-op. A disconnected link to the same address is reused. Any other
    /// address is refused with [`GattError::AddressMismatch`].
    pub fn connect(&self, address: &str) -> Result<()> {
        if self.is_closed() {
            return Err(GattError::Closed);
        }
        if !self.adapter.is_available() {
            warn!("Bluetooth adapter not available; cannot connect to {address:?}");
            return Err(GattError::AdapterUnavailable);
        }
        let address = parse_address(address).inspect_err(|e| warn!("{e}"))?;

        let mut slot = self.lock_slot();

        if let Some(current) = slot.as_ref() {
            if current.address != address {
                warn!("Session for {} cannot connect to {address}", current.address);
                return Err(GattError::AddressMismatch {
                    bound: current.address,
                    requested: address,
                });
            }

            let state = self.shared.state();
            if state != ConnectionState::Disconnected {
                debug!("Session for {address} already {state:?}");
                return Ok(());
            }

            debug!("Trying to use an existing link for {address}");
            self.shared.transition(ConnectionState::Connecting);
            return current.link.reconnect().inspect_err(|e| {
                warn!("Could not reconnect to {address}: {e}");
                self.shared.transition(ConnectionState::Disconnected);
            });
        }

        let callback = self.shared.next_callback();
        self.shared.transition(ConnectionState::Connecting);
        match self.adapter.open(address, callback) {
            Ok(link) => {
                debug!("Trying to create a new connection to {address}");
                *slot = Some(LinkSlot { address, link });
                Ok(())
            }
            Err(e) => {
                warn!("Could not open link to {address}: {e}");
                self.shared.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Asks the link to disconnect. The state changes once the link reports it.
    pub fn disconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(GattError::Closed);
        }
        match self.lock_slot().as_ref() {
            Some(current) => {
                info!("Disconnecting from {}", current.address);
                current.link.disconnect();
                Ok(())
            }
            None => Err(GattError::Disconnected),
        }
    }

    /// Releases the link and ends the event stream. Idempotent; the session cannot be used
    /// afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, SeqCst) {
            return;
        }
        if let Some(previous) = self.lock_slot().take() {
            info!("Closing link to {}", previous.address);
            previous.link.close();
        }
        // Orphan callbacks still held by the platform.
        let _ = self.shared.next_callback();
        self.shared.drop_to_disconnected();
        self.shared.close_events();
    }

    /// Enqueues a read of `id`; the value arrives as [`GattEvent::CharacteristicUpdated`].
    pub fn read_characteristic(&self, id: CharacteristicId) -> Result<()> {
        self.with_connected_link(id, |link| link.read(id))
    }

    /// Enqueues a write of `value` to `id`; [`GattEvent::WriteCompleted`] confirms delivery.
    pub fn write_characteristic(&self, id: CharacteristicId, value: Vec<u8>) -> Result<()> {
        self.with_connected_link(id, |link| link.write(id, value))
    }

    /// Enables or disables notifications for `id`.
    pub fn set_notify(&self, id: CharacteristicId, enabled: bool) -> Result<()> {
        self.with_connected_link(id, |link| link.set_notify(id, enabled))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Address of the device the session is linked to, once a link was opened.
    pub fn address(&self) -> Option<Address> {
        self.lock_slot().as_ref().map(|current| current.address)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(SeqCst)
    }

    /// Stream of session events. Every receiver clone competes for the same events.
    pub fn events(&self) -> Receiver<GattEvent> {
        self.events.clone()
    }

    fn with_connected_link<F>(&self, id: CharacteristicId, op: F) -> Result<()>
    where
        F: FnOnce(&dyn GattLink) -> Result<()>,
    {
        if self.is_closed() {
            return Err(GattError::Closed);
        }
        if self.shared.state() != ConnectionState::Connected {
            debug!("Not connected; ignoring operation on {id}");
            return Err(GattError::Disconnected);
        }
        match self.lock_slot().as_ref() {
            Some(current) => {
                op(current.link.as_ref()).inspect_err(|e| warn!("Operation on {id} failed: {e}"))
            }
            None => Err(GattError::Disconnected),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<LinkSlot>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        self.close();
    }
}
