//! Per-device task that serializes GATT operations against BlueZ.

use std::collections::HashMap;

use async_channel::Receiver;
use bluer::{
    gatt::remote::Characteristic, Address, Device, DeviceEvent, DeviceProperty, ErrorKind,
};
use futures::{pin_mut, Stream, StreamExt};
use log::{debug, info, trace, warn};
use tokio::task::JoinHandle;

use crate::{
    attributes::{lookup, CharacteristicId, CLIENT_CHARACTERISTIC_CONFIG_UUID},
    error::{GattError, Result},
    link::GattCallback,
};

/// Operation queued by a `BluezLink`.
#[derive(Debug)]
pub(super) enum Op {
    Reconnect,
    Disconnect,
    Read(CharacteristicId),
    Write(CharacteristicId, Vec<u8>),
    Notify(CharacteristicId, bool),
}

/// Whether the characteristic table reflects the current connection.
#[derive(Debug, Default)]
struct Discovery {
    resolved: bool,
}

impl Discovery {
    /// Returns true if discovery should run, i.e. it has not yet run for this connection.
    fn claim(&mut self) -> bool {
        !std::mem::replace(&mut self.resolved, true)
    }

    fn reset(&mut self) {
        self.resolved = false;
    }
}

/// Forwarding task per characteristic with notifications enabled.
#[derive(Default)]
struct Notifiers {
    tasks: HashMap<CharacteristicId, JoinHandle<()>>,
}

impl Notifiers {
    fn is_active(&self, id: CharacteristicId) -> bool {
        self.tasks.get(&id).is_some_and(|task| !task.is_finished())
    }

    /// Tracks `task` for `id`, aborting the one it replaces.
    fn insert(&mut self, id: CharacteristicId, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(id, task) {
            previous.abort();
        }
    }

    /// Returns whether notifications for `id` were enabled.
    fn stop(&mut self, id: CharacteristicId) -> bool {
        match self.tasks.remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn stop_all(&mut self) {
        for (id, task) in self.tasks.drain() {
            trace!("Stopping notifications for {id}");
            task.abort();
        }
    }
}

struct Worker {
    address: Address,
    device: Device,
    callback: GattCallback,
    characteristics: HashMap<CharacteristicId, Characteristic>,
    discovery: Discovery,
    notifiers: Notifiers,
}

/// Connects to `device`, then serves `ops` one at a time until the queue is closed.
pub(super) async fn run(
    address: Address,
    device: Device,
    ops: Receiver<Op>,
    callback: GattCallback,
) {
    // Separate handle so the change stream does not borrow the worker.
    let watched = device.clone();
    let mut worker = Worker {
        address,
        device,
        callback,
        characteristics: HashMap::new(),
        discovery: Discovery::default(),
        notifiers: Notifiers::default(),
    };

    let changes = match watched.events().await {
        Ok(changes) => changes,
        Err(e) => {
            worker.callback.on_error(connect_error(&address, e));
            return;
        }
    };
    pin_mut!(changes);

    worker.establish().await;

    loop {
        tokio::select! {
            op = ops.recv() => match op {
                Ok(op) => worker.handle(op).await,
                Err(_) => {
                    debug!("Operation queue for {address} closed");
                    break;
                }
            },
            change = changes.next() => match change {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                    info!("Disconnected from GATT server {address}");
                    worker.lost();
                }
                Some(DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true))) => {
                    debug!("GATT services resolved for {address}");
                    worker.discover().await;
                }
                Some(change) => trace!("Device {address} change: {change:?}"),
                None => {
                    debug!("Changes for device {address} stopped streaming");
                    worker.lost();
                    break;
                }
            },
        }
    }

    worker.shutdown().await;
}

impl Worker {
    /// Connects if needed and discovers services when BlueZ already resolved them. Otherwise
    /// discovery runs on the `ServicesResolved` property change.
    async fn establish(&mut self) {
        let address = self.address;

        match self.device.is_connected().await {
            Ok(true) => debug!("Device {address} already connected"),
            _ => {
                debug!("Connecting to {address}");
                if let Err(e) = self.device.connect().await {
                    self.callback.on_error(connect_error(&address, e));
                    return;
                }
            }
        }
        info!("Connected to GATT server {address}");
        self.callback.on_connected();

        match self.device.is_services_resolved().await {
            Ok(true) => self.discover().await,
            Ok(false) => debug!("Waiting for GATT services of {address} to resolve"),
            Err(e) => warn!("Cannot query service resolution for {address}: {e}"),
        }
    }

    /// Rebuilds the characteristic table from the resolved services, once per connection.
    async fn discover(&mut self) {
        if !self.discovery.claim() {
            trace!("Services of {} already discovered", self.address);
            return;
        }
        match self.collect_characteristics().await {
            Ok(()) => {
                debug!(
                    "Found {} characteristics on {}",
                    self.characteristics.len(),
                    self.address
                );
                self.callback.on_services_discovered();
            }
            Err(e) => {
                self.discovery.reset();
                warn!("Service discovery on {} failed: {e}", self.address);
            }
        }
    }

    async fn collect_characteristics(&mut self) -> bluer::Result<()> {
        self.characteristics.clear();

        let services = self.device.services().await?;
        debug!("... found {} services", services.len());
        for service in services {
            let uuid = service.uuid().await?;
            debug!("Service UUID: {uuid} ({})", lookup(&uuid).unwrap_or("unknown"));
            for characteristic in service.characteristics().await? {
                let id = CharacteristicId::from(characteristic.uuid().await?);
                debug!("Characteristic: {id}");
                self.characteristics.insert(id, characteristic);
            }
        }
        Ok(())
    }

    async fn handle(&mut self, op: Op) {
        trace!("Handling {op:?} for {}", self.address);
        match op {
            Op::Reconnect => self.establish().await,
            Op::Disconnect => {
                if let Err(e) = self.device.disconnect().await {
                    warn!(
                        "Error disconnecting {} (may have already been disconnected): {e}",
                        self.address
                    );
                }
                self.lost();
            }
            Op::Read(id) => match self.read(id).await {
                Ok(value) => self.callback.on_characteristic_changed(id, value),
                Err(e) => self.callback.on_error(e),
            },
            Op::Write(id, value) => match self.write(id, &value).await {
                Ok(()) => self.callback.on_write_completed(id),
                Err(e) => self.callback.on_error(e),
            },
            Op::Notify(id, true) => {
                if let Err(e) = self.enable_notify(id).await {
                    self.callback.on_error(e);
                }
            }
            Op::Notify(id, false) => {
                if self.notifiers.stop(id) {
                    debug!("Stopped notifications for {id}");
                } else {
                    debug!("Notifications for {id} were not enabled");
                }
            }
        }
    }

    fn characteristic(&self, id: CharacteristicId) -> Result<&Characteristic> {
        self.characteristics
            .get(&id)
            .ok_or_else(|| GattError::rejected(id, "characteristic not found"))
    }

    async fn read(&self, id: CharacteristicId) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(id)?;
        let value = characteristic
            .read()
            .await
            .map_err(|e| GattError::rejected(id, e))?;
        trace!("Read {id}: {value:x?}");
        Ok(value)
    }

    async fn write(&self, id: CharacteristicId, value: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(id)?;
        trace!("Writing {id}: {value:x?}");
        characteristic
            .write(value)
            .await
            .map_err(|e| GattError::rejected(id, e))
    }

    /// Starts forwarding notifications for `id`. BlueZ writes the client configuration
    /// descriptor itself when the notify session starts, so only its presence is checked.
    async fn enable_notify(&mut self, id: CharacteristicId) -> Result<()> {
        if self.notifiers.is_active(id) {
            debug!("Notifications for {id} already enabled");
            return Ok(());
        }

        let characteristic = self.characteristic(id)?.clone();
        if !has_client_config(&characteristic)
            .await
            .map_err(|e| GattError::rejected(id, e))?
        {
            return Err(GattError::rejected(
                id,
                "no client characteristic configuration descriptor",
            ));
        }

        debug!("Enabling notifications for {id}");
        let callback = self.callback.clone();
        let task = tokio::spawn(async move {
            let values = match characteristic.notify().await {
                Ok(values) => values,
                Err(e) => {
                    callback.on_error(GattError::rejected(id, e));
                    return;
                }
            };
            forward_notifications(id, values, callback).await;
        });
        self.notifiers.insert(id, task);
        Ok(())
    }

    /// Connection dropped, by request or underneath us.
    fn lost(&mut self) {
        self.notifiers.stop_all();
        self.characteristics.clear();
        self.discovery.reset();
        self.callback.on_disconnected();
    }

    async fn shutdown(&mut self) {
        self.notifiers.stop_all();
        if let Ok(true) = self.device.is_connected().await {
            if let Err(e) = self.device.disconnect().await {
                warn!("Error disconnecting {} on close: {e}", self.address);
            }
        }
        debug!("Worker for {} stopped", self.address);
    }
}

async fn forward_notifications(
    id: CharacteristicId,
    values: impl Stream<Item = Vec<u8>>,
    callback: GattCallback,
) {
    pin_mut!(values);
    while let Some(value) = values.next().await {
        trace!("Notification from {id}: {value:x?}");
        callback.on_characteristic_changed(id, value);
    }
    debug!("Notification stream for {id} ended");
}

async fn has_client_config(characteristic: &Characteristic) -> bluer::Result<bool> {
    for descriptor in characteristic.descriptors().await? {
        if descriptor.uuid().await? == CLIENT_CHARACTERISTIC_CONFIG_UUID {
            return Ok(true);
        }
    }
    Ok(false)
}

fn connect_error(address: &Address, e: bluer::Error) -> GattError {
    match e.kind {
        ErrorKind::NotReady => GattError::AdapterUnavailable,
        _ => GattError::DeviceNotFound(format!("{address}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    /// Spawns a task that never finishes and holds a clone of `guard` until it is dropped.
    fn pending_task(guard: &Arc<()>) -> JoinHandle<()> {
        let guard = guard.clone();
        tokio::spawn(async move {
            let _guard = guard;
            futures::future::pending::<()>().await;
        })
    }

    /// Waits until every task holding a clone of `guard` has been dropped.
    async fn released(guard: &Arc<()>) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(guard) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("aborted task still alive");
    }

    #[test]
    fn discovery_runs_once_per_connection() {
        let mut discovery = Discovery::default();

        assert!(discovery.claim());
        // The ServicesResolved change queued while connecting.
        assert!(!discovery.claim());

        discovery.reset();
        assert!(discovery.claim());
        assert!(!discovery.claim());
    }

    #[tokio::test]
    async fn stopping_notifications_aborts_the_forwarder() {
        let guard = Arc::new(());
        let mut notifiers = Notifiers::default();

        notifiers.insert(CharacteristicId::DOUBLE_TAP, pending_task(&guard));
        assert!(notifiers.is_active(CharacteristicId::DOUBLE_TAP));
        assert!(!notifiers.is_active(CharacteristicId::ROLL));

        assert!(notifiers.stop(CharacteristicId::DOUBLE_TAP));
        assert!(!notifiers.stop(CharacteristicId::DOUBLE_TAP));
        assert!(!notifiers.is_active(CharacteristicId::DOUBLE_TAP));
        released(&guard).await;
    }

    #[tokio::test]
    async fn replaced_forwarder_is_aborted() {
        let first = Arc::new(());
        let second = Arc::new(());
        let mut notifiers = Notifiers::default();

        notifiers.insert(CharacteristicId::DOUBLE_TAP, pending_task(&first));
        notifiers.insert(CharacteristicId::DOUBLE_TAP, pending_task(&second));

        released(&first).await;
        assert!(notifiers.is_active(CharacteristicId::DOUBLE_TAP));
        assert_eq!(Arc::strong_count(&second), 2);

        notifiers.stop_all();
        assert!(!notifiers.is_active(CharacteristicId::DOUBLE_TAP));
        released(&second).await;
    }

    #[tokio::test]
    async fn finished_forwarder_is_not_active() {
        let mut notifiers = Notifiers::default();
        let task = tokio::spawn(async {});
        notifiers.insert(CharacteristicId::DOUBLE_TAP, task);

        tokio::time::timeout(Duration::from_secs(1), async {
            while notifiers.is_active(CharacteristicId::DOUBLE_TAP) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("forwarder never finished");
    }
}
