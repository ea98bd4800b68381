//! Keeps at most one session per device address.

use std::sync::Arc;

use bluer::Address;
use dashmap::{mapref::entry::Entry, DashMap};
use log::debug;

use crate::{
    error::Result,
    link::{parse_address, BleAdapter},
    session::GattSession,
};

/// Table of sessions keyed by device address, all sharing one adapter.
pub struct GattClient {
    adapter: Arc<dyn BleAdapter>,
    sessions: DashMap<Address, Arc<GattSession>>,
}

impl GattClient {
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        GattClient {
            adapter,
            sessions: DashMap::new(),
        }
    }

    /// Connects the session for `address`, creating it first if needed. An existing session
    /// is reused, so repeated calls never open a second connection to the same device.
    pub fn connect(&self, address: &str) -> Result<Arc<GattSession>> {
        let key = parse_address(address)?;

        let (session, created) = match self.sessions.entry(key) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                debug!("Replacing closed session for {key}");
                let session = Arc::new(GattSession::new(self.adapter.clone()));
                entry.insert(session.clone());
                (session, true)
            }
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = Arc::new(GattSession::new(self.adapter.clone()));
                entry.insert(session.clone());
                (session, true)
            }
        };

        if let Err(e) = session.connect(address) {
            if created {
                self.sessions
                    .remove_if(&key, |_, stored| Arc::ptr_eq(stored, &session));
                session.close();
            }
            return Err(e);
        }
        Ok(session)
    }

    pub fn session(&self, address: &Address) -> Option<Arc<GattSession>> {
        self.sessions.get(address).map(|entry| entry.value().clone())
    }

    /// Closes and forgets the session for `address`. Returns whether one existed.
    pub fn close(&self, address: &Address) -> bool {
        match self.sessions.remove(address) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let addresses: Vec<Address> = self.sessions.iter().map(|e| *e.key()).collect();
        for address in addresses {
            self.close(&address);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
