//! Needle positioner controller.
//!
//! Single axis counterpart of the table controller: the needles are either
//! up (clear of the sensor) or down (in contact).

use super::{wait_until_stable, CalibrationOutcome, Service, Worker, WorkerTiming};
use crate::error::{AppResult, BenchError};
use crate::hardware::registry::FactoryMap;
use crate::hardware::{DriverRegistry, NeedleDriver, ResourceConfig};
use crate::request::{mailbox, Mailbox, Reply, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Notifications emitted by the needle worker.
#[derive(Debug, Clone, PartialEq)]
pub enum NeedleEvent {
    /// A position sample was read.
    PositionChanged(f64),
    /// A move or calibration finished.
    MovementFinished,
    /// Calibration reached `step` of `total`.
    CalibrationProgress {
        /// Completed steps.
        step: usize,
        /// Number of steps.
        total: usize,
    },
}

/// Needle controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeedleSettings {
    /// Position with needles lifted, in micrometers.
    pub up_position: f64,
    /// Position with needles in contact, in micrometers.
    pub down_position: f64,
    /// Accepted deviation after a move.
    pub tolerance: f64,
    /// Delay between two position samples.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Ceiling for a single movement to settle.
    #[serde(with = "humantime_serde")]
    pub movement_timeout: Duration,
    /// Delay before reopening the link after a failure.
    #[serde(with = "humantime_serde")]
    pub reopen_backoff: Duration,
    /// Mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for NeedleSettings {
    fn default() -> Self {
        Self {
            up_position: 1000.0,
            down_position: 0.0,
            tolerance: 1.0,
            poll_interval: Duration::from_millis(100),
            movement_timeout: Duration::from_secs(60),
            reopen_backoff: Duration::from_secs(1),
            mailbox_capacity: 16,
        }
    }
}

/// Open needle link as seen by queued requests.
pub struct Needle {
    driver: Box<dyn NeedleDriver>,
    settings: NeedleSettings,
    events: broadcast::Sender<NeedleEvent>,
}

impl Needle {
    /// Current position.
    pub fn position(&mut self) -> AppResult<f64> {
        self.driver.position()
    }

    fn wait_movement_finished(&mut self) -> AppResult<f64> {
        let driver = &mut self.driver;
        let events = &self.events;
        wait_until_stable(
            || driver.position(),
            |position| {
                let _ = events.send(NeedleEvent::PositionChanged(position));
            },
            self.settings.poll_interval,
            self.settings.movement_timeout,
        )
    }

    /// Move to `target` and verify the final position.
    pub fn move_to(&mut self, target: f64) -> AppResult<f64> {
        self.driver.move_absolute(target)?;
        let reached = self.wait_movement_finished()?;
        if (reached - target).abs() > self.settings.tolerance.abs() {
            return Err(BenchError::HardFault(format!(
                "needles at {reached:.3}, expected {target:.3}"
            )));
        }
        Ok(reached)
    }

    fn emit(&self, event: NeedleEvent) {
        let _ = self.events.send(event);
    }
}

struct NeedleService {
    name: String,
    config: ResourceConfig,
    factories: FactoryMap<dyn NeedleDriver>,
    settings: NeedleSettings,
    events: broadcast::Sender<NeedleEvent>,
}

impl Service for NeedleService {
    type Context = Needle;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> AppResult<Needle> {
        Ok(Needle {
            driver: self.factories.create(&self.name, &self.config)?,
            settings: self.settings.clone(),
            events: self.events.clone(),
        })
    }

    fn close(&mut self, mut needle: Needle) {
        if let Err(err) = needle.driver.close() {
            warn!(resource = %self.name, error = %err, "failed to close needle stage");
        }
    }
}

/// Asynchronous command API of the needle worker.
pub struct NeedleController {
    mailbox: Mailbox<Needle>,
    worker: Worker,
    abort: Arc<AtomicBool>,
    events: broadcast::Sender<NeedleEvent>,
    settings: NeedleSettings,
}

impl NeedleController {
    /// Spawn the worker for resource `name`.
    pub fn start(
        name: &str,
        registry: &DriverRegistry,
        config: ResourceConfig,
        settings: NeedleSettings,
    ) -> AppResult<Self> {
        let (events, _) = broadcast::channel(256);
        let (mailbox, inbox) = mailbox(settings.mailbox_capacity, DEFAULT_TIMEOUT);
        let service = NeedleService {
            name: name.to_string(),
            config,
            factories: registry.needles.clone(),
            settings: settings.clone(),
            events: events.clone(),
        };
        let timing = WorkerTiming {
            poll_interval: Duration::from_millis(100),
            reopen_backoff: settings.reopen_backoff,
        };
        Ok(Self {
            mailbox,
            worker: Worker::spawn(service, inbox, timing)?,
            abort: Arc::new(AtomicBool::new(false)),
            events,
            settings,
        })
    }

    /// Subscribe to needle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<NeedleEvent> {
        self.events.subscribe()
    }

    fn motion_timeout(&self, phases: u32) -> Duration {
        self.settings.movement_timeout * phases + DEFAULT_TIMEOUT
    }

    /// Query the current position.
    pub fn position(&self) -> AppResult<Reply<f64>> {
        self.mailbox.submit("needle.position", |needle: &mut Needle| {
            let position = needle.position()?;
            needle.emit(NeedleEvent::PositionChanged(position));
            Ok(position)
        })
    }

    fn submit_move(&self, name: &str, target: f64) -> AppResult<Reply<f64>> {
        let reply = self.mailbox.submit(name, move |needle: &mut Needle| {
            info!(target, "moving needles");
            let result = needle.move_to(target);
            needle.emit(NeedleEvent::MovementFinished);
            result
        })?;
        Ok(reply.with_timeout(self.motion_timeout(1)))
    }

    /// Lift the needles.
    pub fn move_up(&self) -> AppResult<Reply<f64>> {
        self.submit_move("needle.move_up", self.settings.up_position)
    }

    /// Lower the needles onto the sensor.
    pub fn move_down(&self) -> AppResult<Reply<f64>> {
        self.submit_move("needle.move_down", self.settings.down_position)
    }

    /// Run the four step calibration: calibrate, range measure, verify, move down.
    pub fn calibrate(&self) -> AppResult<Reply<CalibrationOutcome>> {
        let abort = Arc::clone(&self.abort);
        let reply = self.mailbox.submit("needle.calibrate", move |needle: &mut Needle| {
            let result = run_calibration(needle, &abort);
            abort.store(false, Ordering::SeqCst);
            needle.emit(NeedleEvent::MovementFinished);
            result
        })?;
        Ok(reply.with_timeout(self.motion_timeout(4)))
    }

    /// Stop a running calibration at the next step boundary.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Stop the worker thread.
    pub fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

fn run_calibration(needle: &mut Needle, abort: &AtomicBool) -> AppResult<CalibrationOutcome> {
    const TOTAL: usize = 4;
    for step in 0..TOTAL {
        if abort.load(Ordering::SeqCst) {
            info!(step, "needle calibration aborted");
            return Ok(CalibrationOutcome::Aborted);
        }
        needle.emit(NeedleEvent::CalibrationProgress { step, total: TOTAL });
        match step {
            0 => {
                needle.driver.calibrate()?;
                needle.wait_movement_finished()?;
            }
            1 => {
                needle.driver.range_measure()?;
                needle.wait_movement_finished()?;
            }
            2 => {
                if !needle.driver.is_calibrated()? {
                    return Err(BenchError::HardFault("failed to calibrate needles".into()));
                }
            }
            _ => {
                let down = needle.settings.down_position;
                needle.move_to(down)?;
            }
        }
    }
    needle.emit(NeedleEvent::CalibrationProgress {
        step: TOTAL,
        total: TOTAL,
    });
    Ok(CalibrationOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimBench, SIM_MODEL};

    fn start(bench: &SimBench) -> NeedleController {
        let settings = NeedleSettings {
            poll_interval: Duration::from_millis(1),
            movement_timeout: Duration::from_secs(2),
            ..NeedleSettings::default()
        };
        NeedleController::start("tango", &bench.registry(), ResourceConfig::new(SIM_MODEL, ""), settings)
            .unwrap()
    }

    #[test]
    fn test_move_up_down() {
        let bench = SimBench::new();
        let needle = start(&bench);
        assert_eq!(needle.move_up().unwrap().wait().unwrap(), 1000.0);
        assert_eq!(needle.move_down().unwrap().wait().unwrap(), 0.0);
        assert_eq!(bench.needle.lock().moves, vec![1000.0, 0.0]);
    }

    #[test]
    fn test_position_verification() {
        let bench = SimBench::new();
        bench.needle.lock().error = 5.0;
        let needle = start(&bench);
        assert!(matches!(
            needle.move_up().unwrap().wait(),
            Err(BenchError::HardFault(_))
        ));
    }

    #[test]
    fn test_calibrate() {
        let bench = SimBench::new();
        let needle = start(&bench);
        let outcome = needle.calibrate().unwrap().wait().unwrap();
        assert_eq!(outcome, CalibrationOutcome::Completed);
        assert_eq!(bench.needle.lock().calibrations, 2);
        assert_eq!(bench.needle.lock().moves, vec![0.0]);
    }
}
