//! BlueZ backend for the adapter seam, built on `bluer`.

mod worker;

use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc,
};

use async_channel::Sender;
use bluer::{AdapterEvent, AdapterProperty, Address};
use futures::{pin_mut, StreamExt};
use log::{debug, info, warn};
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    attributes::CharacteristicId,
    error::{GattError, Result},
    link::{BleAdapter, GattCallback, GattLink},
};

use worker::Op;

/// A [`BleAdapter`] backed by a BlueZ adapter.
pub struct BluezAdapter {
    adapter: bluer::Adapter,
    powered: Arc<AtomicBool>,
    runtime: Handle,
    watcher: JoinHandle<()>,
}

impl BluezAdapter {
    /// Wraps `adapter`. Must be called from within a tokio runtime, which also runs the link
    /// workers.
    pub async fn new(adapter: bluer::Adapter) -> bluer::Result<Self> {
        let powered = Arc::new(AtomicBool::new(adapter.is_powered().await?));
        let watcher = tokio::spawn(watch_powered(adapter.clone(), powered.clone()));

        Ok(BluezAdapter {
            adapter,
            powered,
            runtime: Handle::current(),
            watcher,
        })
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }
}

impl BleAdapter for BluezAdapter {
    fn is_available(&self) -> bool {
        self.powered.load(SeqCst)
    }

    fn open(&self, address: Address, callback: GattCallback) -> Result<Box<dyn GattLink>> {
        let device = self
            .adapter
            .device(address)
            .map_err(|e| GattError::DeviceNotFound(format!("{address}: {e}")))?;

        let (ops_send, ops_receive) = async_channel::unbounded::<Op>();
        self.runtime
            .spawn(worker::run(address, device, ops_receive, callback));

        Ok(Box::new(BluezLink {
            address,
            ops: ops_send,
        }))
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Keeps `powered` in sync with the adapter's Powered property.
async fn watch_powered(adapter: bluer::Adapter, powered: Arc<AtomicBool>) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot watch adapter {} properties: {e}", adapter.name());
            return;
        }
    };
    pin_mut!(events);

    while let Some(evt) = events.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = evt {
            info!("Adapter {} powered={on}", adapter.name());
            powered.store(on, SeqCst);
        }
    }
    debug!("Adapter {} events stopped streaming", adapter.name());
}

/// Link to one device; operations are queued to that device's worker task.
struct BluezLink {
    address: Address,
    ops: Sender<Op>,
}

impl BluezLink {
    fn enqueue(&self, op: Op) -> Result<()> {
        self.ops.try_send(op).map_err(|_| {
            debug!("Worker for {} has stopped", self.address);
            GattError::Disconnected
        })
    }
}

impl GattLink for BluezLink {
    fn reconnect(&self) -> Result<()> {
        self.enqueue(Op::Reconnect)
    }

    fn disconnect(&self) {
        if self.enqueue(Op::Disconnect).is_err() {
            warn!("Cannot disconnect {}: worker stopped", self.address);
        }
    }

    fn close(&self) {
        // The worker disconnects the device once it drains the queue.
        self.ops.close();
    }

    fn read(&self, id: CharacteristicId) -> Result<()> {
        self.enqueue(Op::Read(id))
    }

    fn write(&self, id: CharacteristicId, value: Vec<u8>) -> Result<()> {
        self.enqueue(Op::Write(id, value))
    }

    fn set_notify(&self, id: CharacteristicId, enabled: bool) -> Result<()> {
        self.enqueue(Op::Notify(id, enabled))
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        self.ops.close();
    }
}
