//! One run of a sequence: validation, contact handling, retries and item
//! states.

use super::contact::ContactPlan;
use super::control::RunControl;
use super::events::{EventSink, SequenceEvent};
use super::item::{ItemState, Sequence, SequenceItem};
use super::pattern::{strip_pattern, StripPattern};
use super::record::{Row, RunRecord, Statistics};
use super::SequenceSettings;
use crate::controller::TableController;
use crate::error::{AppResult, BenchError, RunError, RunResult};
use crate::geometry::{Padfile, Position};
use crate::measurement::{ItemId, Measurement, MeasurementContext, MeasurementRegistry, StripId};
use crate::request::panic_message;
use crate::station::Station;
use crate::util::{parse_strips, Estimate};
use crate::writer::Writer;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::iter;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::thread;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Operator supplied run header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Operator name, required.
    pub operator: String,
    /// Sensor name.
    pub sensor_name: String,
    /// Sensor type.
    pub sensor_type: String,
    /// Output directory, required.
    pub output_dir: Option<PathBuf>,
}

/// Outcome of a run that passed validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Run identifier, also written to the header.
    pub run_id: String,
    /// Remeasure and recontact counters.
    pub statistics: Statistics,
    /// Final state of every item by key.
    pub states: BTreeMap<String, ItemState>,
    /// True if the run stopped on an abort request.
    pub aborted: bool,
    /// Failure that stopped the run, if any.
    pub error: Option<BenchError>,
}

impl RunReport {
    /// Final state of the item with `key`.
    pub fn state(&self, key: &str) -> Option<ItemState> {
        self.states.get(key).copied()
    }

    /// True if the run neither failed nor was aborted.
    pub fn is_success(&self) -> bool {
        !self.aborted && self.error.is_none()
    }
}

/// Check strip expressions, intervals and parameters of `sequence`
/// against `padfile` and `registry`.
///
/// Needs no hardware.
pub fn validate_sequence(
    sequence: &Sequence,
    padfile: &Padfile,
    registry: &MeasurementRegistry,
) -> AppResult<()> {
    let names = padfile.names();
    let mut keys = HashSet::new();
    for item in &sequence.items {
        parse_strips(&names, &item.strips).map_err(|err| in_item(item, err))?;
        for entry in iter::once(item).chain(&item.children) {
            if !keys.insert(entry.key()) {
                return Err(BenchError::Validation(format!("duplicate item: {}", entry.key())));
            }
            if entry.interval < 1 {
                return Err(in_item(
                    entry,
                    BenchError::Validation("interval must be at least 1".into()),
                ));
            }
            registry
                .create(&entry.kind, &entry.parameters)
                .map_err(|err| in_item(entry, err))?;
        }
    }
    Ok(())
}

fn in_item(item: &SequenceItem, err: BenchError) -> BenchError {
    match err {
        BenchError::Validation(message) => {
            BenchError::Validation(format!("{}: {message}", item.full_name))
        }
        other => other,
    }
}

/// Executes sequences on a station.
///
/// Measurements are created fresh for every run. Writers are invoked once
/// per run that passed validation, aborted and failed runs included.
pub struct SequenceStrategy {
    station: Station,
    settings: SequenceSettings,
    registry: MeasurementRegistry,
    control: RunControl,
    events: EventSink,
    padfile: Option<Padfile>,
    alignment: Option<[Position; 3]>,
    writers: Vec<Box<dyn Writer>>,
}

impl SequenceStrategy {
    /// Strategy without padfile, alignment or writers.
    pub fn new(station: Station, settings: SequenceSettings, registry: MeasurementRegistry) -> Self {
        Self {
            station,
            settings,
            registry,
            control: RunControl::new(),
            events: EventSink::new(),
            padfile: None,
            alignment: None,
            writers: Vec::new(),
        }
    }

    /// Sensor layout of the next runs.
    pub fn set_padfile(&mut self, padfile: Padfile) {
        self.padfile = Some(padfile);
    }

    /// Table positions of the padfile reference pads.
    pub fn set_alignment(&mut self, alignment: Option<[Position; 3]>) {
        self.alignment = alignment;
    }

    /// Add a writer invoked after every run.
    pub fn add_writer<W: Writer + 'static>(&mut self, writer: W) {
        self.writers.push(Box::new(writer));
    }

    /// Abort/suspend handle.
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Notification sink.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Bench hardware.
    pub fn station(&self) -> &Station {
        &self.station
    }

    /// Give back the station, e.g. for shutdown.
    pub fn into_station(self) -> Station {
        self.station
    }

    /// Check everything a run needs before touching hardware.
    pub fn validate(&self, sequence: &Sequence, options: &RunOptions) -> AppResult<()> {
        self.settings.validate()?;
        let padfile = self
            .padfile
            .as_ref()
            .ok_or_else(|| BenchError::Validation("no padfile loaded".into()))?;
        if options.output_dir.is_none() {
            return Err(BenchError::Validation("no output directory set".into()));
        }
        if options.operator.trim().is_empty() {
            return Err(BenchError::Validation("no operator set".into()));
        }
        if !self.settings.skip_table {
            if self.alignment.is_none() {
                return Err(BenchError::Validation("table alignment required".into()));
            }
            if self.station.table().is_none() {
                return Err(BenchError::Validation("no table configured".into()));
            }
        }
        validate_sequence(sequence, padfile, &self.registry)
    }

    /// Run `sequence`.
    ///
    /// Returns `Err` only if validation fails, in which case neither the
    /// hardware nor the writers are touched. Faults and aborts during the run
    /// are reported in the returned [`RunReport`].
    pub fn run(&mut self, sequence: &mut Sequence, options: &RunOptions) -> AppResult<RunReport> {
        sequence.reset_states();
        for item in sequence.iter() {
            self.events.emit(SequenceEvent::ItemState {
                key: item.key(),
                state: item.state,
            });
        }
        self.validate(sequence, options)?;

        let padfile = self
            .padfile
            .as_ref()
            .ok_or_else(|| BenchError::Validation("no padfile loaded".into()))?;
        let plan = match self.alignment {
            Some(alignment) => ContactPlan::from_alignment(padfile, alignment, self.settings.needles)?,
            None => ContactPlan::from_design(padfile, self.settings.needles),
        };
        let names = padfile.names();
        let slots = self.create_measurements(sequence)?;

        let run_id = Uuid::new_v4().to_string();
        let header = self.header(&run_id, sequence, options);
        info!(run_id = %run_id, sequence = %sequence.name, operator = %options.operator, "starting run");

        let mut run = Run {
            station: &mut self.station,
            settings: &self.settings,
            control: &self.control,
            events: &self.events,
            plan,
            names,
            record: RunRecord::new(header),
            slots,
        };
        let result = run.execute(sequence);
        let finalized = run.finalize();
        let record = run.record;

        let (aborted, mut failure) = match result {
            Ok(()) => (false, None),
            Err(RunError::Aborted) => {
                warn!("run aborted");
                (true, None)
            }
            Err(RunError::Fault(err)) => {
                error!(error = %err, "run failed");
                (false, Some(err))
            }
        };
        if let Err(err) = finalized {
            error!(error = %err, "finalize failed");
            if !aborted {
                failure.get_or_insert(err);
            }
        }

        record
            .statistics
            .log(self.settings.remeasure_attempts, self.settings.recontact_attempts);

        for writer in &mut self.writers {
            if let Err(err) = writer.write(&record) {
                error!(error = %err, "writer failed");
                failure.get_or_insert(err);
            }
        }

        self.events.emit(SequenceEvent::Finished);
        info!(run_id = %run_id, aborted, failed = failure.is_some(), "run finished");
        Ok(RunReport {
            run_id,
            statistics: record.statistics,
            states: sequence.iter().map(|item| (item.key(), item.state)).collect(),
            aborted,
            error: failure,
        })
    }

    fn create_measurements(&self, sequence: &Sequence) -> AppResult<BTreeMap<String, Slot>> {
        let mut slots = BTreeMap::new();
        for item in sequence.items.iter().filter(|item| item.enabled) {
            let children = item.children.iter().filter(|child| child.enabled);
            for entry in iter::once(item).chain(children) {
                let measurement = self
                    .registry
                    .create(&entry.kind, &entry.parameters)
                    .map_err(|err| in_item(entry, err))?;
                let id = ItemId {
                    namespace: entry.namespace.clone(),
                    kind: entry.kind.clone(),
                    name: entry.full_name.clone(),
                };
                slots.insert(entry.key(), Slot { id, measurement });
            }
        }
        Ok(slots)
    }

    fn header(&self, run_id: &str, sequence: &Sequence, options: &RunOptions) -> Row {
        let mut header = Row::new();
        let output_dir = options
            .output_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let values = [
            ("run_id", Value::from(run_id)),
            ("sequence", Value::from(sequence.name.clone())),
            ("operator", Value::from(options.operator.clone())),
            ("sensor_name", Value::from(options.sensor_name.clone())),
            ("sensor_type", Value::from(options.sensor_type.clone())),
            ("output_dir", Value::from(output_dir)),
            ("start_timestamp", Value::from(Utc::now().to_rfc3339())),
            ("remeasure_attempts", Value::from(self.settings.remeasure_attempts)),
            ("recontact_attempts", Value::from(self.settings.recontact_attempts)),
            ("skip_table", Value::from(self.settings.skip_table)),
        ];
        for (key, value) in values {
            header.insert(key.to_string(), value);
        }
        header
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    BeforeSequence,
    AfterSequence,
    BeforeStrip,
    AfterStrip,
    Initialize,
    Acquire,
    Finalize,
}

struct Slot {
    id: ItemId,
    measurement: Box<dyn Measurement>,
}

/// State of a single run, borrowed from the strategy.
struct Run<'a> {
    station: &'a mut Station,
    settings: &'a SequenceSettings,
    control: &'a RunControl,
    events: &'a EventSink,
    plan: ContactPlan,
    names: Vec<String>,
    record: RunRecord,
    slots: BTreeMap<String, Slot>,
}

impl Run<'_> {
    fn execute(&mut self, sequence: &mut Sequence) -> RunResult<()> {
        self.initialize()?;
        self.sequence_hooks(sequence, Hook::BeforeSequence)?;
        for item in sequence.items.iter_mut().filter(|item| item.enabled) {
            self.control.check_abort()?;
            self.run_item(item)?;
        }
        self.sequence_hooks(sequence, Hook::AfterSequence)
    }

    fn set_state(&self, item: &mut SequenceItem, state: ItemState) {
        item.state = state;
        self.events.emit(SequenceEvent::ItemState {
            key: item.key(),
            state,
        });
    }

    fn hook(&mut self, key: &str, strip: Option<&StripId>, hook: Hook) -> RunResult<()> {
        let Some(slot) = self.slots.get_mut(key) else {
            return Ok(());
        };
        let mut ctx = MeasurementContext::new(
            &mut *self.station,
            &mut self.record,
            self.control,
            self.events,
            &slot.id,
            strip,
        );
        let measurement = &mut slot.measurement;
        let dispatch = AssertUnwindSafe(|| match hook {
            Hook::BeforeSequence => measurement.before_sequence(&mut ctx),
            Hook::AfterSequence => measurement.after_sequence(&mut ctx),
            Hook::BeforeStrip => measurement.before_strip(&mut ctx),
            Hook::AfterStrip => measurement.after_strip(&mut ctx),
            Hook::Initialize => measurement.initialize(&mut ctx),
            Hook::Acquire => measurement.acquire(&mut ctx),
            Hook::Finalize => measurement.finalize(&mut ctx),
        });
        // A panicking measurement is a hard fault, the station still gets finalized.
        catch_unwind(dispatch).unwrap_or_else(|payload| {
            let message = format!("{key} {hook:?} panicked: {}", panic_message(payload.as_ref()));
            error!(item = key, "{message}");
            Err(BenchError::HardFault(message).into())
        })
    }

    // ---------------------------------------------------------------------
    // Station and table
    // ---------------------------------------------------------------------

    fn initialize(&mut self) -> RunResult<()> {
        self.events.message("Initialize...");
        self.station.open_resources()?;
        self.station.set_test_running(true)?;
        self.station.safe_initialize()?;
        if !self.settings.skip_table {
            self.table()?.configure()?.wait()?;
        }
        self.safe_recover_table()?;
        self.events.message("Initialize... done.");
        Ok(())
    }

    /// Retract the table and put the station into a safe state.
    ///
    /// Every step is attempted, the first failure is returned.
    fn finalize(&mut self) -> AppResult<()> {
        self.events.message("Finalize...");
        self.events.emit(SequenceEvent::StripChanged(String::new()));
        let results = [
            self.safe_recover_table(),
            self.station.finalize(),
            self.station.set_test_running(false),
        ];
        self.events.message("Done.");
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    fn table(&self) -> AppResult<&TableController> {
        self.station
            .table()
            .ok_or_else(|| BenchError::Configuration("no table configured".into()))
    }

    /// Move below `position`, then approach it in Z steps.
    fn safe_move_table(&self, position: Position) -> AppResult<()> {
        if self.settings.skip_table {
            info!(%position, "skipping table move");
            return Ok(());
        }
        let table = self.table()?;
        self.events.message(format!("Moving table to {position}..."));
        let below = Position {
            z: position.z - self.settings.approach_distance(),
            ..position
        };
        table.safe_move_absolute(below)?.wait()?;
        for step in &self.settings.approach_steps {
            thread::sleep(self.settings.approach_delay);
            table.move_relative(Position::new(0.0, 0.0, step.abs()))?.wait()?;
        }
        let current = table.position()?.wait()?;
        if !current.is_near(&position, self.settings.position_tolerance) {
            return Err(BenchError::HardFault(format!(
                "table reached {current}, expected {position}"
            )));
        }
        self.events.message("Moving table... done.");
        Ok(())
    }

    /// Lower the table away from the needles.
    fn safe_recover_table(&self) -> AppResult<()> {
        if self.settings.skip_table {
            return Ok(());
        }
        let offset = self.settings.retract_offset.abs();
        self.table()?
            .move_relative(Position::new(0.0, 0.0, -offset))?
            .wait()?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Items
    // ---------------------------------------------------------------------

    /// Run a hook on every enabled item and strip item.
    fn sequence_hooks(&mut self, sequence: &mut Sequence, hook: Hook) -> RunResult<()> {
        for item in sequence.items.iter_mut().filter(|item| item.enabled) {
            if self.control.is_abort_requested() {
                self.set_state(item, ItemState::Aborted);
                return Err(RunError::Aborted);
            }
            self.hook(&item.key(), None, hook)?;
            for child in item.children.iter_mut().filter(|child| child.enabled) {
                if self.control.is_abort_requested() {
                    self.set_state(child, ItemState::Aborted);
                    return Err(RunError::Aborted);
                }
                self.hook(&child.key(), None, hook)?;
            }
        }
        Ok(())
    }

    /// Initialize and acquire, finalize in any case.
    ///
    /// A finalize failure is only returned if the measurement itself
    /// succeeded.
    fn run_measurement(&mut self, key: &str, strip: Option<&StripId>) -> RunResult<()> {
        let mut result = self.hook(key, strip, Hook::Initialize);
        if result.is_ok() {
            result = self.hook(key, strip, Hook::Acquire);
        }
        let finalized = self.hook(key, strip, Hook::Finalize);
        match (result, finalized) {
            (Ok(()), finalized) => finalized,
            (Err(err), Err(other)) => {
                error!(item = key, error = %other, "finalize failed");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }

    fn run_item(&mut self, item: &mut SequenceItem) -> RunResult<()> {
        let key = item.key();
        self.events.emit(SequenceEvent::StripChanged(String::new()));
        self.events.message(format!("Process {}", item.full_name));
        info!(item = %key, "process item");
        self.set_state(item, ItemState::Active);

        match self.run_measurement(&key, None) {
            Ok(()) => {}
            Err(RunError::Fault(err)) if err.is_compliance() => {
                warn!(item = %key, error = %err, "compliance tripped");
                self.set_state(item, ItemState::Compliance);
                return Ok(());
            }
            Err(RunError::Fault(err)) if err.is_retryable() => {
                warn!(item = %key, error = %err, "item failed, skipping strips");
                self.set_state(item, ItemState::Failed);
                return Ok(());
            }
            Err(err) => return Err(self.unwind(item, err)),
        }
        if let Err(err) = self.control.check_abort() {
            return Err(self.unwind(item, err));
        }

        match self.run_strips(item) {
            Ok(()) => {
                self.set_state(item, ItemState::Success);
                Ok(())
            }
            Err(RunError::Fault(err)) if err.is_compliance() => {
                warn!(item = %key, error = %err, "compliance tripped");
                self.set_state(item, ItemState::Compliance);
                Ok(())
            }
            Err(err) => Err(self.unwind(item, err)),
        }
    }

    /// Mark `item` aborted or failed and hand the error on.
    fn unwind(&self, item: &mut SequenceItem, err: RunError) -> RunError {
        let state = match err {
            RunError::Aborted => ItemState::Aborted,
            RunError::Fault(_) => ItemState::Failed,
        };
        self.set_state(item, state);
        err
    }

    fn run_strips(&mut self, item: &mut SequenceItem) -> RunResult<()> {
        let key = item.key();
        let pattern = strip_pattern(&self.names, item)?;
        let mut estimate = Estimate::new(pattern.len());
        for (index, entry) in pattern.iter().enumerate() {
            self.events.emit(SequenceEvent::ItemProgress {
                key: key.clone(),
                value: index + 1,
                maximum: pattern.len(),
            });
            if self.control.is_suspend_requested() {
                self.set_state(item, ItemState::Halted);
                self.control.wait_while_suspended()?;
            }
            self.set_state(item, ItemState::Active);

            self.run_strip(item, entry)?;

            self.control.check_abort()?;
            estimate.advance();
            self.events.progress(estimate.passed(), pattern.len());
            self.events.emit(SequenceEvent::Estimate {
                elapsed: estimate.elapsed(),
                remaining: estimate.remaining(),
            });
        }
        Ok(())
    }

    /// Contact one strip and run its strip items, recontacting with an X
    /// offset while a strip item exhausts its remeasurements.
    fn run_strip(&mut self, item: &mut SequenceItem, entry: &StripPattern) -> RunResult<()> {
        let Some(position) = self.plan.position(&entry.strip)? else {
            warn!(strip = %entry.strip, "skipping invalid strip");
            return Ok(());
        };
        let strip = StripId {
            name: entry.strip.clone(),
            index: entry.index,
        };
        self.events.emit(SequenceEvent::StripChanged(strip.name.clone()));
        for (index, child) in item.children.iter_mut().enumerate() {
            let state = if entry.children.contains(&index) {
                ItemState::Pending
            } else {
                ItemState::Ignored
            };
            self.set_state(child, state);
        }

        let parent = item.key();
        let mut failing = String::new();
        for attempt in 0..=self.settings.recontact_attempts {
            if attempt > 0 {
                warn!(strip = %strip.name, item = %failing, attempt, "recontact");
                self.record.statistics.increment_recontact(&strip.name, &failing);
                self.events.emit(SequenceEvent::StatisticsChanged);
            }
            let offset = self.settings.recontact_offset(attempt);
            self.hook(&parent, Some(&strip), Hook::BeforeStrip)?;
            self.safe_move_table(position.with_x_offset(offset))?;

            let mut contacted = true;
            let mut aborted = false;
            for &index in &entry.children {
                let child = &mut item.children[index];
                if self.control.is_abort_requested() {
                    self.set_state(child, ItemState::Aborted);
                    aborted = true;
                    break;
                }
                if !self.handle_strip_item(child, &strip)? {
                    failing = child.full_name.clone();
                    contacted = false;
                    break;
                }
            }

            self.safe_recover_table()?;
            self.hook(&parent, Some(&strip), Hook::AfterStrip)?;
            if aborted {
                return Err(RunError::Aborted);
            }
            if contacted {
                break;
            }
        }
        Ok(())
    }

    /// Run a strip item with remeasurements.
    ///
    /// Returns `false` if every remeasurement failed the analysis. A
    /// compliance trip abandons the item but continues with the next one.
    fn handle_strip_item(&mut self, child: &mut SequenceItem, strip: &StripId) -> RunResult<bool> {
        self.set_state(child, ItemState::Active);
        match self.auto_repeat(child, strip) {
            Ok(true) => {
                let state = if self.control.is_abort_requested() {
                    ItemState::Aborted
                } else {
                    ItemState::Success
                };
                self.set_state(child, state);
                Ok(true)
            }
            Ok(false) => {
                self.set_state(child, ItemState::Failed);
                Ok(false)
            }
            Err(RunError::Fault(err)) if err.is_compliance() => {
                warn!(strip = %strip.name, item = %child.full_name, error = %err, "compliance tripped");
                self.set_state(child, ItemState::Compliance);
                Ok(true)
            }
            Err(err) => Err(self.unwind(child, err)),
        }
    }

    fn auto_repeat(&mut self, child: &SequenceItem, strip: &StripId) -> RunResult<bool> {
        let key = child.key();
        for attempt in 0..=self.settings.remeasure_attempts {
            if attempt > 0 {
                warn!(strip = %strip.name, item = %child.full_name, attempt, "remeasure");
                self.record
                    .statistics
                    .increment_remeasure(&strip.name, &child.full_name);
                self.events.emit(SequenceEvent::StatisticsChanged);
            }
            match self.run_measurement(&key, Some(strip)) {
                Ok(()) => return Ok(true),
                Err(RunError::Fault(err)) if err.is_retryable() => {
                    warn!(strip = %strip.name, item = %child.full_name, error = %err, "analysis failed");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }
}
