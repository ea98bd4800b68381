//! The sensor monitor process (runs as a systemd service.)
//!
//! Connects to the configured sensor peripheral, polls its roll, pitch and temperature
//! characteristics, repeatedly writes the configured control command and logs every typed
//! reading and double tap.

mod env;
mod poll;

use std::sync::Arc;

use anyhow::Result;
use futures::pin_mut;
use gatt_session::{
    bluez::BluezAdapter, CharacteristicId, GattClient, GattError, GattEvent, GattSession,
    SensorEvent,
};
use log::{debug, info, trace, warn};
use tokio::{
    signal::unix::{signal, Signal, SignalKind},
    time::{sleep, Instant},
};

use env::Config;
use poll::Pollers;

/// Loads the config, retrying every few seconds. A missing config likely means the device has
/// not been provisioned yet; there is nothing to monitor until it is.
async fn wait_for_config() -> Config {
    let mut logged_no_config_warning = false;
    loop {
        match env::load_config() {
            Ok(config) => break config,
            Err(e) => {
                if !logged_no_config_warning {
                    warn!("{e}");
                    warn!("Sensor monitor not functional until its config can be loaded");
                    logged_no_config_warning = true;
                }

                sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Started the sensor monitor");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let config = tokio::select! {
        config = wait_for_config() => config,
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal while loading config; stopping the sensor monitor");
            return Ok(());
        },
        _ = sigint.recv() => {
            info!("Received SIGINT signal while loading config; stopping the sensor monitor");
            return Ok(());
        }
    };
    info!(
        "Config loaded from {:?}; monitoring {}",
        env::config_path(),
        config.device_address
    );

    debug!("Getting bluer session");
    let session = bluer::Session::new().await?;
    let adapter = match &config.adapter {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    if !adapter.is_powered().await? {
        adapter.set_powered(true).await?;
    }
    log_adapter_info(&adapter).await?;

    let client = GattClient::new(Arc::new(BluezAdapter::new(adapter).await?));
    let result = monitor(&client, &config, &mut sigterm, &mut sigint).await;
    client.close_all();

    info!("Stopped the sensor monitor");
    result
}

/// Runs until SIGTERM/SIGINT. Disconnections stop the pollers and schedule a reconnect after
/// the configured delay.
async fn monitor(
    client: &GattClient,
    config: &Config,
    sigterm: &mut Signal,
    sigint: &mut Signal,
) -> Result<()> {
    let address = config.device_address.to_string();
    let delay = config.reconnect_delay();

    let mut session = loop {
        match client.connect(&address) {
            Ok(session) => break session,
            Err(e) => {
                warn!("Could not connect to {address}: {e}; retrying in {delay:?}");
                tokio::select! {
                    _ = sleep(delay) => continue,
                    _ = sigterm.recv() => return Ok(()),
                    _ = sigint.recv() => return Ok(()),
                }
            }
        }
    };
    let mut events = session.events();
    let mut pollers = Pollers::default();

    let reconnect = sleep(delay);
    pin_mut!(reconnect);
    let mut reconnect_pending = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    warn!("Event stream for {address} ended");
                    break;
                };
                if handle_event(event, &session, config, &mut pollers) {
                    reconnect.as_mut().reset(Instant::now() + delay);
                    reconnect_pending = true;
                }
            },
            () = &mut reconnect, if reconnect_pending => {
                reconnect_pending = false;
                info!("Reconnecting to {address}");
                match reconnect_session(client, &session, &address) {
                    Ok(Some(replacement)) => {
                        session = replacement;
                        events = session.events();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Could not reconnect to {address}: {e}; retrying in {delay:?}");
                        reconnect.as_mut().reset(Instant::now() + delay);
                        reconnect_pending = true;
                    }
                }
            },
            _ = sigterm.recv() => {
                info!("Stopping sensor monitor (SIGTERM)...");
                break;
            },
            _ = sigint.recv() => {
                info!("Stopping sensor monitor (SIGINT)...");
                break;
            },
        }
    }

    pollers.stop();
    Ok(())
}

/// Asks `session` to reconnect. If its link is gone, replaces the session with a fresh one.
fn reconnect_session(
    client: &GattClient,
    session: &Arc<GattSession>,
    address: &str,
) -> Result<Option<Arc<GattSession>>, GattError> {
    match session.connect(address) {
        Ok(()) => Ok(None),
        Err(GattError::Disconnected) | Err(GattError::Closed) => {
            debug!("Link to {address} is gone; opening a new session");
            if let Some(key) = session.address() {
                client.close(&key);
            }
            client.connect(address).map(Some)
        }
        Err(e) => Err(e),
    }
}

/// Reacts to one session event. Returns true if a reconnect should be scheduled.
fn handle_event(
    event: GattEvent,
    session: &Arc<GattSession>,
    config: &Config,
    pollers: &mut Pollers,
) -> bool {
    match event {
        GattEvent::Connected => {
            info!("Connected to {}", config.device_address);
            false
        }
        GattEvent::ServicesDiscovered => {
            info!("GATT services discovered; starting pollers");
            if config.double_tap_notify {
                if let Err(e) = session.set_notify(CharacteristicId::DOUBLE_TAP, true) {
                    warn!("Could not enable double tap notifications: {e}");
                }
            }
            pollers.start(session, &config.poll, &config.control);
            false
        }
        GattEvent::Disconnected => {
            info!("Disconnected from {}", config.device_address);
            pollers.stop();
            true
        }
        GattEvent::WriteCompleted(id) => {
            trace!("Write to {id} completed");
            false
        }
        update @ GattEvent::CharacteristicUpdated(..) => {
            match SensorEvent::from_gatt(&update) {
                Some(SensorEvent::Reading(reading)) => info!("{reading}"),
                Some(SensorEvent::DoubleTap) => info!("Double tap detected"),
                None => trace!("Unhandled update {update:?}"),
            }
            false
        }
    }
}

// Logs (at debug level) the reported properties for the adapter.
async fn log_adapter_info(adapter: &bluer::Adapter) -> Result<()> {
    let mut properties_log = String::new();

    properties_log.push_str("Bluetooth adapter properties:\n");
    properties_log.push_str("{\n");

    properties_log.push_str(&format!("\tName: {}\n", adapter.name()));
    if let Ok(addr) = adapter.address().await {
        properties_log.push_str(&format!("\tAddress: {addr}\n"));
    }
    if let Ok(addr_type) = adapter.address_type().await {
        properties_log.push_str(&format!("\tAddress type: {addr_type}\n"));
    }
    if let Ok(alias) = adapter.alias().await {
        properties_log.push_str(&format!("\tAlias: {alias}\n"));
    }
    if let Ok(powered) = adapter.is_powered().await {
        properties_log.push_str(&format!("\tPowered: {powered}\n"));
    }
    if let Ok(discovering) = adapter.is_discovering().await {
        properties_log.push_str(&format!("\tDiscovering: {discovering}\n"));
    }
    if let Ok(modalias) = adapter.modalias().await {
        properties_log.push_str(&format!("\tModalias: {modalias:?}\n"));
    }

    properties_log.push('}');

    debug!("{}", properties_log);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_channel::Receiver;
    use gatt_session::{Address, BleAdapter, GattCallback, GattLink};

    use super::*;

    /// Drains whatever is already queued on `events` without waiting.
    fn drain(events: &Receiver<GattEvent>) -> Vec<GattEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[derive(Default)]
    struct Platform {
        callbacks: Mutex<Vec<GattCallback>>,
        notified: Mutex<Vec<(CharacteristicId, bool)>>,
        link_gone: std::sync::atomic::AtomicBool,
    }

    struct FakeAdapter(Arc<Platform>);

    impl BleAdapter for FakeAdapter {
        fn is_available(&self) -> bool {
            true
        }

        fn open(
            &self,
            _address: Address,
            callback: GattCallback,
        ) -> gatt_session::Result<Box<dyn GattLink>> {
            self.0.callbacks.lock().unwrap().push(callback);
            Ok(Box::new(FakeLink(self.0.clone())))
        }
    }

    struct FakeLink(Arc<Platform>);

    impl GattLink for FakeLink {
        fn reconnect(&self) -> gatt_session::Result<()> {
            if self.0.link_gone.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GattError::Disconnected);
            }
            Ok(())
        }

        fn disconnect(&self) {}

        fn close(&self) {}

        fn read(&self, _id: CharacteristicId) -> gatt_session::Result<()> {
            Ok(())
        }

        fn write(&self, _id: CharacteristicId, _value: Vec<u8>) -> gatt_session::Result<()> {
            Ok(())
        }

        fn set_notify(&self, id: CharacteristicId, enabled: bool) -> gatt_session::Result<()> {
            self.0.notified.lock().unwrap().push((id, enabled));
            Ok(())
        }
    }

    fn config() -> Config {
        serde_json::from_str(r#"{"device_address": "03:80:E1:00:34:08"}"#).unwrap()
    }

    fn callback(platform: &Platform, index: usize) -> GattCallback {
        platform.callbacks.lock().unwrap()[index].clone()
    }

    #[tokio::test]
    async fn services_start_pollers_and_disconnect_schedules_reconnect() {
        let platform = Arc::new(Platform::default());
        let client = GattClient::new(Arc::new(FakeAdapter(platform.clone())));
        let config = config();
        let session = client.connect("03:80:E1:00:34:08").unwrap();
        let events = session.events();
        let mut pollers = Pollers::default();

        callback(&platform, 0).on_connected();
        callback(&platform, 0).on_services_discovered();
        for event in drain(&events) {
            assert!(!handle_event(event, &session, &config, &mut pollers));
        }
        assert!(pollers.is_running());
        assert_eq!(
            *platform.notified.lock().unwrap(),
            vec![(CharacteristicId::DOUBLE_TAP, true)]
        );

        callback(&platform, 0).on_disconnected();
        let reconnect: Vec<bool> = drain(&events)
            .into_iter()
            .map(|event| handle_event(event, &session, &config, &mut pollers))
            .collect();
        assert_eq!(reconnect, vec![true]);
        assert!(!pollers.is_running());
    }

    #[tokio::test]
    async fn reconnect_reuses_a_live_link() {
        let platform = Arc::new(Platform::default());
        let client = GattClient::new(Arc::new(FakeAdapter(platform.clone())));
        let session = client.connect("03:80:E1:00:34:08").unwrap();
        callback(&platform, 0).on_connected();
        callback(&platform, 0).on_disconnected();

        let replacement = reconnect_session(&client, &session, "03:80:E1:00:34:08").unwrap();

        assert!(replacement.is_none());
        assert_eq!(platform.callbacks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_a_dead_link() {
        let platform = Arc::new(Platform::default());
        let client = GattClient::new(Arc::new(FakeAdapter(platform.clone())));
        let session = client.connect("03:80:E1:00:34:08").unwrap();
        callback(&platform, 0).on_connected();
        callback(&platform, 0).on_disconnected();
        platform
            .link_gone
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let replacement = reconnect_session(&client, &session, "03:80:E1:00:34:08")
            .unwrap()
            .unwrap();

        assert!(session.is_closed());
        assert!(!Arc::ptr_eq(&session, &replacement));
        assert_eq!(platform.callbacks.lock().unwrap().len(), 2);
        assert_eq!(client.len(), 1);
    }
}
