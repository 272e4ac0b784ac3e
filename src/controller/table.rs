//! Table controller
//!
//! Owns the motorized table link on a dedicated worker thread. Moves are
//! started with non-blocking driver commands and completed by polling the
//! position until two consecutive samples agree.

use super::{wait_until_stable, CalibrationOutcome, Service, Worker, WorkerTiming};
use crate::error::{AppResult, BenchError};
use crate::geometry::Position;
use crate::hardware::registry::FactoryMap;
use crate::hardware::{Axis, DriverRegistry, ResourceConfig, TableDriver, AXIS_CALIBRATED};
use crate::request::{mailbox, Mailbox, Reply, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Notifications emitted by the table worker.
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    /// A position sample was read.
    PositionChanged(Position),
    /// A move or calibration request finished, successfully or not.
    MovementFinished,
    /// Calibration reached `step` of `total`.
    CalibrationProgress {
        /// Completed steps.
        step: usize,
        /// Number of steps.
        total: usize,
    },
}

/// Acceleration and velocity of a named motion profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionProfile {
    /// Acceleration.
    pub accel: f64,
    /// Velocity.
    pub velocity: f64,
}

/// Table controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    /// Delay between two position samples.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Z retraction before lateral moves, in micrometers.
    pub safe_z_offset: f64,
    /// Ceiling for a single movement to settle.
    #[serde(with = "humantime_serde")]
    pub movement_timeout: Duration,
    /// Delay before reopening the link after a failure.
    #[serde(with = "humantime_serde")]
    pub reopen_backoff: Duration,
    /// Mailbox capacity.
    pub mailbox_capacity: usize,
    /// Named motion profiles.
    pub profiles: BTreeMap<String, MotionProfile>,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            safe_z_offset: 250.0,
            movement_timeout: Duration::from_secs(60),
            reopen_backoff: Duration::from_secs(1),
            mailbox_capacity: 16,
            profiles: BTreeMap::new(),
        }
    }
}

/// Open table link as seen by queued requests.
pub struct Table {
    driver: Box<dyn TableDriver>,
    settings: TableSettings,
    events: broadcast::Sender<TableEvent>,
}

impl Table {
    /// Current position.
    pub fn position(&mut self) -> AppResult<Position> {
        self.driver.position()
    }

    /// Disable the joystick and check units.
    pub fn configure(&mut self) -> AppResult<()> {
        self.driver.configure()
    }

    /// True if every axis reports calibration done.
    pub fn is_calibrated(&mut self) -> AppResult<bool> {
        let state = self.driver.calibration_state()?;
        Ok(state.iter().all(|caldone| *caldone == AXIS_CALIBRATED))
    }

    fn require_calibrated(&mut self) -> AppResult<()> {
        if self.is_calibrated()? {
            Ok(())
        } else {
            Err(BenchError::HardFault("table requires calibration".into()))
        }
    }

    /// Block until the position stopped changing.
    pub fn wait_movement_finished(&mut self) -> AppResult<Position> {
        let driver = &mut self.driver;
        let events = &self.events;
        wait_until_stable(
            || driver.position(),
            |position| {
                let _ = events.send(TableEvent::PositionChanged(position));
            },
            self.settings.poll_interval,
            self.settings.movement_timeout,
        )
    }

    /// Relative move.
    pub fn move_relative(&mut self, delta: Position) -> AppResult<Position> {
        self.require_calibrated()?;
        self.driver.move_relative(delta)?;
        self.wait_movement_finished()
    }

    /// Direct absolute move.
    pub fn move_absolute(&mut self, target: Position) -> AppResult<Position> {
        self.require_calibrated()?;
        self.driver.move_absolute(target)?;
        self.wait_movement_finished()
    }

    /// Retract Z, move laterally, then approach the target Z.
    pub fn safe_move_absolute(&mut self, target: Position) -> AppResult<Position> {
        self.require_calibrated()?;
        let offset = self.settings.safe_z_offset.abs();
        self.driver.move_relative(Position::new(0.0, 0.0, -offset))?;
        let retracted = self.wait_movement_finished()?;
        self.driver
            .move_absolute(Position::new(target.x, target.y, retracted.z))?;
        let lateral = self.wait_movement_finished()?;
        self.driver
            .move_relative(Position::new(0.0, 0.0, target.z - lateral.z))?;
        self.wait_movement_finished()
    }

    /// Lower to Z=0, travel laterally, then rise to the target Z.
    pub fn safe_travel_absolute(&mut self, target: Position) -> AppResult<Position> {
        self.require_calibrated()?;
        let current = self.driver.position()?;
        self.driver
            .move_relative(Position::new(0.0, 0.0, -current.z.abs()))?;
        self.wait_movement_finished()?;
        self.driver.move_absolute(Position::new(target.x, target.y, 0.0))?;
        self.wait_movement_finished()?;
        self.driver.move_absolute(target)?;
        self.wait_movement_finished()
    }

    /// Enable or disable the joystick.
    pub fn set_joystick_enabled(&mut self, enabled: bool) -> AppResult<()> {
        self.driver.set_joystick(enabled)
    }

    /// Apply a named motion profile.
    pub fn apply_profile(&mut self, name: &str) -> AppResult<()> {
        let profile = self.settings.profiles.get(name).copied().ok_or_else(|| {
            BenchError::Configuration(format!("no such table profile: {name}"))
        })?;
        info!(profile = name, accel = profile.accel, velocity = profile.velocity, "apply table profile");
        self.driver.set_profile(profile.accel, profile.velocity)
    }

    fn calibrate_step(&mut self, step: CalibrationStep) -> AppResult<()> {
        match step {
            CalibrationStep::Calibrate(axis) => self.driver.calibrate_axis(axis)?,
            CalibrationStep::RangeMeasure(axis) => self.driver.range_measure_axis(axis)?,
        }
        self.wait_movement_finished().map(|_| ())
    }

    fn emit(&self, event: TableEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Clone, Copy)]
enum CalibrationStep {
    Calibrate(Axis),
    RangeMeasure(Axis),
}

const CALIBRATION_STEPS: [CalibrationStep; 6] = [
    CalibrationStep::Calibrate(Axis::Z),
    CalibrationStep::Calibrate(Axis::Y),
    CalibrationStep::Calibrate(Axis::X),
    CalibrationStep::RangeMeasure(Axis::X),
    CalibrationStep::RangeMeasure(Axis::Y),
    CalibrationStep::RangeMeasure(Axis::Z),
];

struct TableService {
    name: String,
    config: ResourceConfig,
    factories: FactoryMap<dyn TableDriver>,
    settings: TableSettings,
    events: broadcast::Sender<TableEvent>,
}

impl Service for TableService {
    type Context = Table;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> AppResult<Table> {
        let driver = self.factories.create(&self.name, &self.config)?;
        Ok(Table {
            driver,
            settings: self.settings.clone(),
            events: self.events.clone(),
        })
    }

    fn close(&mut self, mut table: Table) {
        if let Err(err) = table.driver.close() {
            warn!(resource = %self.name, error = %err, "failed to close table");
        }
    }
}

/// Asynchronous command API of the table worker.
pub struct TableController {
    mailbox: Mailbox<Table>,
    worker: Worker,
    abort: Arc<AtomicBool>,
    events: broadcast::Sender<TableEvent>,
    settings: TableSettings,
}

impl TableController {
    /// Spawn the worker for resource `name`.
    pub fn start(
        name: &str,
        registry: &DriverRegistry,
        config: ResourceConfig,
        settings: TableSettings,
    ) -> AppResult<Self> {
        let (events, _) = broadcast::channel(256);
        let (mailbox, inbox) = mailbox(settings.mailbox_capacity, DEFAULT_TIMEOUT);
        let timing = WorkerTiming {
            poll_interval: Duration::from_millis(100),
            reopen_backoff: settings.reopen_backoff,
        };
        let service = TableService {
            name: name.to_string(),
            config,
            factories: registry.tables.clone(),
            settings: settings.clone(),
            events: events.clone(),
        };
        let worker = Worker::spawn(service, inbox, timing)?;
        Ok(Self {
            mailbox,
            worker,
            abort: Arc::new(AtomicBool::new(false)),
            events,
            settings,
        })
    }

    /// Subscribe to table notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.events.subscribe()
    }

    fn motion_timeout(&self, phases: u32) -> Duration {
        self.settings.movement_timeout * phases + DEFAULT_TIMEOUT
    }

    fn submit_motion<F>(&self, name: &str, phases: u32, work: F) -> AppResult<Reply<Position>>
    where
        F: FnOnce(&mut Table) -> AppResult<Position> + Send + 'static,
    {
        let reply = self.mailbox.submit(name, move |table: &mut Table| {
            let result = work(table);
            table.emit(TableEvent::MovementFinished);
            result
        })?;
        Ok(reply.with_timeout(self.motion_timeout(phases)))
    }

    /// Query the current position.
    pub fn position(&self) -> AppResult<Reply<Position>> {
        self.mailbox.submit("table.position", |table: &mut Table| {
            let position = table.position()?;
            table.emit(TableEvent::PositionChanged(position));
            Ok(position)
        })
    }

    /// Disable the joystick and check units.
    pub fn configure(&self) -> AppResult<Reply<()>> {
        self.mailbox.submit("table.configure", |table: &mut Table| table.configure())
    }

    /// Relative move.
    pub fn move_relative(&self, delta: Position) -> AppResult<Reply<Position>> {
        self.submit_motion("table.move_relative", 1, move |table| table.move_relative(delta))
    }

    /// Direct absolute move.
    pub fn move_absolute(&self, target: Position) -> AppResult<Reply<Position>> {
        self.submit_motion("table.move_absolute", 1, move |table| table.move_absolute(target))
    }

    /// Three phase move avoiding diagonal travel across the sensor.
    pub fn safe_move_absolute(&self, target: Position) -> AppResult<Reply<Position>> {
        self.submit_motion("table.safe_move_absolute", 3, move |table| {
            table.safe_move_absolute(target)
        })
    }

    /// Travel through Z=0 to a distant position.
    pub fn travel_absolute(&self, target: Position) -> AppResult<Reply<Position>> {
        self.submit_motion("table.travel_absolute", 3, move |table| {
            table.safe_travel_absolute(target)
        })
    }

    /// Enable or disable the joystick.
    pub fn set_joystick_enabled(&self, enabled: bool) -> AppResult<Reply<()>> {
        self.mailbox.submit("table.joystick", move |table: &mut Table| {
            table.set_joystick_enabled(enabled)
        })
    }

    /// Apply a named motion profile from the settings.
    pub fn apply_profile(&self, name: &str) -> AppResult<Reply<()>> {
        let name = name.to_string();
        self.mailbox
            .submit("table.profile", move |table: &mut Table| table.apply_profile(&name))
    }

    /// True if every axis reports calibration done.
    pub fn is_calibrated(&self) -> AppResult<Reply<bool>> {
        self.mailbox
            .submit("table.is_calibrated", |table: &mut Table| table.is_calibrated())
    }

    /// Run the six step calibration.
    ///
    /// Progress `(step, 6)` is emitted before each step and `(6, 6)` at the
    /// end. [`TableController::request_abort`] stops between two steps.
    pub fn calibrate(&self) -> AppResult<Reply<CalibrationOutcome>> {
        let abort = Arc::clone(&self.abort);
        let total = CALIBRATION_STEPS.len();
        let reply = self.mailbox.submit("table.calibrate", move |table: &mut Table| {
            let result = run_calibration(table, &abort);
            abort.store(false, Ordering::SeqCst);
            table.emit(TableEvent::MovementFinished);
            result
        })?;
        Ok(reply.with_timeout(self.motion_timeout(total as u32 + 1)))
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

fn run_calibration(table: &mut Table, abort: &AtomicBool) -> AppResult<CalibrationOutcome> {
    let total = CALIBRATION_STEPS.len();
    for (step, action) in CALIBRATION_STEPS.iter().enumerate() {
        if abort.load(Ordering::SeqCst) {
            info!(step, "table calibration aborted");
            return Ok(CalibrationOutcome::Aborted);
        }
        table.emit(TableEvent::CalibrationProgress { step, total });
        table.calibrate_step(*action)?;
    }
    table.emit(TableEvent::CalibrationProgress { step: total, total });
    if !table.is_calibrated()? {
        return Err(BenchError::HardFault("failed to calibrate table".into()));
    }
    info!("table calibrated");
    Ok(CalibrationOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimBench, TableMove, SIM_MODEL};

    fn settings() -> TableSettings {
        TableSettings {
            poll_interval: Duration::from_millis(1),
            movement_timeout: Duration::from_secs(2),
            reopen_backoff: Duration::from_millis(10),
            ..TableSettings::default()
        }
    }

    fn start(bench: &SimBench) -> TableController {
        TableController::start(
            "table",
            &bench.registry(),
            ResourceConfig::new(SIM_MODEL, "table"),
            settings(),
        )
        .unwrap()
    }

    #[test]
    fn test_safe_move_phases() {
        let bench = SimBench::new();
        bench.table.lock().position = Position::new(0.0, 0.0, 300.0);
        let table = start(&bench);
        let target = Position::new(100.0, 200.0, 300.0);
        let reached = table.safe_move_absolute(target).unwrap().wait().unwrap();
        assert_eq!(reached, target);
        assert_eq!(
            bench.table.lock().moves,
            vec![
                TableMove::Relative(Position::new(0.0, 0.0, -250.0)),
                TableMove::Absolute(Position::new(100.0, 200.0, 50.0)),
                TableMove::Relative(Position::new(0.0, 0.0, 250.0)),
            ]
        );
    }

    #[test]
    fn test_move_requires_calibration() {
        let bench = SimBench::new();
        bench.table.lock().calibration = [0x3, 0x1, 0x3];
        let table = start(&bench);
        let result = table.move_absolute(Position::default()).unwrap().wait();
        assert!(matches!(result, Err(BenchError::HardFault(_))));
    }

    #[test]
    fn test_calibration_progress() {
        let bench = SimBench::new();
        let table = start(&bench);
        let mut events = table.subscribe();
        let outcome = table.calibrate().unwrap().wait().unwrap();
        assert_eq!(outcome, CalibrationOutcome::Completed);
        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TableEvent::CalibrationProgress { step, total } = event {
                progress.push((step, total));
            }
        }
        assert_eq!(progress, (0..=6).map(|i| (i, 6)).collect::<Vec<_>>());
        let moves = bench.table.lock().moves.clone();
        assert_eq!(moves[0], TableMove::Calibrate(Axis::Z));
        assert_eq!(moves[5], TableMove::RangeMeasure(Axis::Z));
    }

    #[test]
    fn test_calibration_failure() {
        let bench = SimBench::new();
        bench.table.lock().calibration_succeeds = false;
        let table = start(&bench);
        assert!(table.calibrate().unwrap().wait().is_err());
    }

    #[test]
    fn test_calibration_abort() {
        let bench = SimBench::new();
        let table = start(&bench);
        table.request_abort();
        let outcome = table.calibrate().unwrap().wait().unwrap();
        assert_eq!(outcome, CalibrationOutcome::Aborted);
        assert!(bench.table.lock().moves.is_empty());
        // flag is cleared for the next run
        let outcome = table.calibrate().unwrap().wait().unwrap();
        assert_eq!(outcome, CalibrationOutcome::Completed);
    }

    #[test]
    fn test_recovers_from_link_fault() {
        let bench = SimBench::new();
        let table = start(&bench);
        bench.table.lock().link_faults = 1;
        assert!(table.position().unwrap().wait().unwrap_err().is_link_fault());
        assert_eq!(table.position().unwrap().wait().unwrap(), Position::default());
        assert_eq!(bench.table.lock().opened, 2);
    }

    #[test]
    fn test_unknown_profile() {
        let bench = SimBench::new();
        let table = start(&bench);
        let result = table.apply_profile("fast").unwrap().wait();
        assert!(matches!(result, Err(BenchError::Configuration(_))));
    }
}
