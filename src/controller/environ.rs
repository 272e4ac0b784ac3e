//! Environment box controller.
//!
//! The worker interleaves on-demand requests with a periodic full read-out.
//! The latest read-out is cached and can be copied by any thread without
//! touching the mailbox.

use super::{Service, Worker, WorkerTiming};
use crate::error::AppResult;
use crate::hardware::registry::FactoryMap;
use crate::hardware::{DriverRegistry, EnvironDriver, EnvironSnapshot, ResourceConfig};
use crate::request::{mailbox, Mailbox, DEFAULT_TIMEOUT};
use crate::util::Timer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Environment controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironSettings {
    /// Snapshot refresh interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Mailbox poll timeout.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Delay before reopening the link after a failure.
    #[serde(with = "humantime_serde")]
    pub reopen_backoff: Duration,
    /// Mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for EnvironSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            poll_interval: Duration::from_millis(25),
            reopen_backoff: Duration::from_secs(4),
            mailbox_capacity: 16,
        }
    }
}

type SnapshotCache = Arc<Mutex<Option<EnvironSnapshot>>>;

/// Open environment box link.
pub struct Environ {
    driver: Box<dyn EnvironDriver>,
    timer: Option<Timer>,
}

impl Environ {
    /// Access the driver.
    pub fn driver(&mut self) -> &mut dyn EnvironDriver {
        self.driver.as_mut()
    }
}

struct EnvironService {
    name: String,
    config: ResourceConfig,
    factories: FactoryMap<dyn EnvironDriver>,
    interval: Duration,
    cache: SnapshotCache,
    events: broadcast::Sender<EnvironSnapshot>,
}

impl EnvironService {
    fn refresh(&self, environ: &mut Environ) -> AppResult<EnvironSnapshot> {
        let snapshot = environ.driver.snapshot()?;
        debug!(
            chuck_temperature = snapshot.chuck_temperature,
            box_humidity = snapshot.box_humidity,
            "environment snapshot"
        );
        *self.cache.lock() = Some(snapshot.clone());
        let _ = self.events.send(snapshot.clone());
        environ.timer = Some(Timer::new());
        Ok(snapshot)
    }
}

impl Service for EnvironService {
    type Context = Environ;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> AppResult<Environ> {
        Ok(Environ {
            driver: self.factories.create(&self.name, &self.config)?,
            timer: None,
        })
    }

    fn close(&mut self, mut environ: Environ) {
        if let Err(err) = environ.driver.close() {
            warn!(resource = %self.name, error = %err, "failed to close environment box");
        }
    }

    fn idle(&mut self, environ: &mut Environ) -> AppResult<()> {
        let due = environ
            .timer
            .as_ref()
            .map_or(true, |timer| timer.delta() >= self.interval);
        if due {
            self.refresh(environ)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        *self.cache.lock() = None;
    }
}

/// Environment box access for the station and the sequence.
pub struct EnvironController {
    mailbox: Mailbox<Environ>,
    worker: Worker,
    cache: SnapshotCache,
    events: broadcast::Sender<EnvironSnapshot>,
}

impl EnvironController {
    /// Spawn the worker for resource `name`.
    pub fn start(
        name: &str,
        registry: &DriverRegistry,
        config: ResourceConfig,
        settings: EnvironSettings,
    ) -> AppResult<Self> {
        let (events, _) = broadcast::channel(64);
        let cache: SnapshotCache = Arc::new(Mutex::new(None));
        let (mailbox, inbox) = mailbox(settings.mailbox_capacity, DEFAULT_TIMEOUT);
        let service = EnvironService {
            name: name.to_string(),
            config,
            factories: registry.environs.clone(),
            interval: settings.interval,
            cache: Arc::clone(&cache),
            events: events.clone(),
        };
        let timing = WorkerTiming {
            poll_interval: settings.poll_interval,
            reopen_backoff: settings.reopen_backoff,
        };
        Ok(Self {
            mailbox,
            worker: Worker::spawn(service, inbox, timing)?,
            cache,
            events,
        })
    }

    /// Copy of the last snapshot, `None` until the first read-out.
    pub fn snapshot(&self) -> Option<EnvironSnapshot> {
        self.cache.lock().clone()
    }

    /// Subscribe to fresh snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<EnvironSnapshot> {
        self.events.subscribe()
    }

    /// Box door state.
    pub fn box_door_open(&self) -> AppResult<bool> {
        self.mailbox
            .call("environ.box_door", |environ: &mut Environ| environ.driver.box_door_open())
    }

    /// Illuminance in lux.
    pub fn box_lux(&self) -> AppResult<f64> {
        self.mailbox
            .call("environ.box_lux", |environ: &mut Environ| environ.driver.box_lux())
    }

    /// Box light state.
    pub fn box_light(&self) -> AppResult<bool> {
        self.mailbox
            .call("environ.box_light", |environ: &mut Environ| environ.driver.box_light())
    }

    /// Switch the box light.
    pub fn set_box_light(&self, enabled: bool) -> AppResult<()> {
        self.mailbox.call("environ.set_box_light", move |environ: &mut Environ| {
            environ.driver.set_box_light(enabled)
        })
    }

    /// Microscope light state.
    pub fn microscope_light(&self) -> AppResult<bool> {
        self.mailbox.call("environ.microscope_light", |environ: &mut Environ| {
            environ.driver.microscope_light()
        })
    }

    /// Switch the microscope light.
    pub fn set_microscope_light(&self, enabled: bool) -> AppResult<()> {
        self.mailbox
            .call("environ.set_microscope_light", move |environ: &mut Environ| {
                environ.driver.set_microscope_light(enabled)
            })
    }

    /// Assert or release the discharge relay.
    pub fn set_discharge(&self, enabled: bool) -> AppResult<()> {
        self.mailbox.call("environ.set_discharge", move |environ: &mut Environ| {
            environ.driver.set_discharge(enabled)
        })
    }

    /// Toggle the "test running" indicator.
    pub fn set_test_running(&self, enabled: bool) -> AppResult<()> {
        self.mailbox.call("environ.set_test_running", move |environ: &mut Environ| {
            environ.driver.set_test_running(enabled)
        })
    }

    /// Identification string of the box controller.
    pub fn identify(&self) -> AppResult<String> {
        self.mailbox
            .call("environ.identify", |environ: &mut Environ| environ.driver.identify())
    }

    /// Read the sensors now, bypassing the refresh interval.
    pub fn refresh(&self) -> AppResult<EnvironSnapshot> {
        let cache = Arc::clone(&self.cache);
        let events = self.events.clone();
        self.mailbox.call("environ.refresh", move |environ: &mut Environ| {
            let snapshot = environ.driver.snapshot()?;
            *cache.lock() = Some(snapshot.clone());
            let _ = events.send(snapshot.clone());
            environ.timer = Some(Timer::new());
            Ok(snapshot)
        })
    }

    /// Stop the worker thread.
    pub fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimBench, SIM_MODEL};

    fn settings() -> EnvironSettings {
        EnvironSettings {
            interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(2),
            reopen_backoff: Duration::from_millis(10),
            mailbox_capacity: 8,
        }
    }

    fn start(bench: &SimBench) -> EnvironController {
        EnvironController::start("environ", &bench.registry(), ResourceConfig::new(SIM_MODEL, ""), settings())
            .unwrap()
    }

    #[test]
    fn test_snapshot_refresh() {
        let bench = SimBench::new();
        bench.environ.lock().snapshot.box_humidity = 42.0;
        let environ = start(&bench);
        let snapshot = environ.refresh().unwrap();
        assert_eq!(snapshot.box_humidity, 42.0);
        assert_eq!(environ.snapshot().unwrap().box_humidity, 42.0);
        std::thread::sleep(Duration::from_millis(100));
        assert!(bench.environ.lock().snapshot_reads >= 3);
    }

    #[test]
    fn test_requests_interleave_with_polling() {
        let bench = SimBench::new();
        let environ = start(&bench);
        environ.set_box_light(true).unwrap();
        assert!(environ.box_light().unwrap());
        assert!(environ.box_lux().unwrap() > 0.0);
        environ.set_discharge(true).unwrap();
        environ.set_discharge(false).unwrap();
        assert_eq!(bench.environ.lock().discharge_log, vec![true, false]);
        assert!(!environ.box_door_open().unwrap());
    }

    #[test]
    fn test_recovers_after_fault() {
        let bench = SimBench::new();
        let environ = EnvironController::start(
            "environ",
            &bench.registry(),
            ResourceConfig::new(SIM_MODEL, ""),
            EnvironSettings {
                interval: Duration::from_secs(3600),
                ..settings()
            },
        )
        .unwrap();
        environ.refresh().unwrap();
        bench.environ.lock().link_faults = 1;
        assert!(environ.refresh().unwrap_err().is_link_fault());
        bench.environ.lock().snapshot.chuck_temperature = 21.5;
        assert_eq!(environ.refresh().unwrap().chuck_temperature, 21.5);
        assert_eq!(environ.snapshot().unwrap().chuck_temperature, 21.5);
    }
}
