//! Periodic sensor reads and control writes.

use std::{sync::Arc, time::Duration};

use gatt_session::{CharacteristicId, ControlCommand, GattSession};
use log::{debug, info};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::env::{ControlConfig, PollConfig};

/// The tasks polling one session. Stopped on drop.
#[derive(Default)]
pub(crate) struct Pollers {
    tasks: Vec<JoinHandle<()>>,
}

impl Pollers {
    /// (Re)starts sensor reads and control writes against `session`.
    pub(crate) fn start(
        &mut self,
        session: &Arc<GattSession>,
        poll: &PollConfig,
        control: &ControlConfig,
    ) {
        self.stop();

        for (id, period_ms) in [
            (CharacteristicId::ROLL, poll.roll_ms),
            (CharacteristicId::PITCH, poll.pitch_ms),
            (CharacteristicId::TEMPERATURE, poll.temperature_ms),
        ] {
            if period_ms == 0 {
                info!("Polling of {id} disabled");
                continue;
            }
            let session = session.clone();
            let period = Duration::from_millis(period_ms);
            self.tasks
                .push(tokio::spawn(poll_characteristic(session, id, period)));
        }

        if control.interval_ms == 0 {
            info!("Control writes disabled");
        } else {
            let session = session.clone();
            let period = Duration::from_millis(control.interval_ms);
            self.tasks
                .push(tokio::spawn(write_control(session, control.command(), period)));
        }
        debug!("Started {} pollers", self.tasks.len());
    }

    /// Idempotently stops all tasks.
    pub(crate) fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        debug!("Stopping {} pollers", self.tasks.len());
        while let Some(task) = self.tasks.pop() {
            task.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }
}

impl Drop for Pollers {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_characteristic(session: Arc<GattSession>, id: CharacteristicId, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = session.read_characteristic(id) {
            debug!("Read of {id} not queued: {e}");
        }
    }
}

async fn write_control(session: Arc<GattSession>, command: ControlCommand, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = session.write_characteristic(command.characteristic(), command.encode()) {
            debug!("Control write not queued: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gatt_session::{Address, BleAdapter, GattCallback, GattLink};

    use super::*;

    #[derive(Default)]
    struct Counts {
        reads: Mutex<Vec<CharacteristicId>>,
        writes: Mutex<Vec<Vec<u8>>>,
        callback: Mutex<Option<GattCallback>>,
    }

    struct CountingAdapter(Arc<Counts>);

    impl BleAdapter for CountingAdapter {
        fn is_available(&self) -> bool {
            true
        }

        fn open(
            &self,
            _address: Address,
            callback: GattCallback,
        ) -> gatt_session::Result<Box<dyn GattLink>> {
            *self.0.callback.lock().unwrap() = Some(callback);
            Ok(Box::new(CountingLink(self.0.clone())))
        }
    }

    struct CountingLink(Arc<Counts>);

    impl GattLink for CountingLink {
        fn reconnect(&self) -> gatt_session::Result<()> {
            Ok(())
        }

        fn disconnect(&self) {}

        fn close(&self) {}

        fn read(&self, id: CharacteristicId) -> gatt_session::Result<()> {
            self.0.reads.lock().unwrap().push(id);
            Ok(())
        }

        fn write(&self, _id: CharacteristicId, value: Vec<u8>) -> gatt_session::Result<()> {
            self.0.writes.lock().unwrap().push(value);
            Ok(())
        }

        fn set_notify(&self, _id: CharacteristicId, _enabled: bool) -> gatt_session::Result<()> {
            Ok(())
        }
    }

    fn count(counts: &Counts, id: CharacteristicId) -> usize {
        counts.reads.lock().unwrap().iter().filter(|r| **r == id).count()
    }

    #[tokio::test(start_paused = true)]
    async fn polls_at_configured_rates_until_stopped() {
        let counts = Arc::new(Counts::default());
        let session = Arc::new(GattSession::new(Arc::new(CountingAdapter(counts.clone()))));
        session.connect("03:80:E1:00:34:08").unwrap();
        counts.callback.lock().unwrap().as_ref().unwrap().on_connected();

        let control = ControlConfig {
            intensity: 30,
            enabled: true,
            ..Default::default()
        };
        let mut pollers = Pollers::default();
        pollers.start(&session, &PollConfig::default(), &control);
        assert!(pollers.is_running());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        pollers.stop();
        assert!(!pollers.is_running());

        let roll = count(&counts, CharacteristicId::ROLL);
        let pitch = count(&counts, CharacteristicId::PITCH);
        let temperature = count(&counts, CharacteristicId::TEMPERATURE);
        assert!(roll > temperature && pitch > 0 && temperature > 0);
        let writes = counts.writes.lock().unwrap().clone();
        assert!(writes.len() >= 4);
        assert!(writes.iter().all(|w| *w == vec![30, 0xf6]));

        let total = counts.reads.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(counts.reads.lock().unwrap().len(), total);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_periods_disable_pollers() {
        let counts = Arc::new(Counts::default());
        let session = Arc::new(GattSession::new(Arc::new(CountingAdapter(counts.clone()))));

        let poll = PollConfig {
            roll_ms: 0,
            pitch_ms: 0,
            temperature_ms: 0,
        };
        let control = ControlConfig {
            interval_ms: 0,
            ..Default::default()
        };
        let mut pollers = Pollers::default();
        pollers.start(&session, &poll, &control);

        assert!(!pollers.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn reads_are_refused_while_disconnected() {
        let counts = Arc::new(Counts::default());
        let session = Arc::new(GattSession::new(Arc::new(CountingAdapter(counts.clone()))));

        let mut pollers = Pollers::default();
        pollers.start(&session, &PollConfig::default(), &ControlConfig::default());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(counts.reads.lock().unwrap().is_empty());
        assert!(counts.writes.lock().unwrap().is_empty());
    }
}
