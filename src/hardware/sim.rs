//! Simulated bench
//!
//! Provides in-memory implementations of every driver trait for tests and for
//! the CLI `--simulate` mode. Each device keeps its state behind a shared
//! `Arc<Mutex<..>>`, so a test can keep a [`SimBench`] handle, script the
//! devices, and inspect their call logs while the drivers live on worker
//! threads.
//!
//! # Behavior
//!
//! - Table moves travel through `motion_samples` intermediate positions, one
//!   per position read, before settling on the target.
//! - Injected link faults make the next calls fail with
//!   [`BenchError::Resource`], exercising the reopen path of the workers.
//! - Nothing sleeps, all timing comes from the callers.

use super::{
    Axis, DriverRegistry, Electrometer, EnvironDriver, EnvironSnapshot, InstrumentError,
    LcrMeter, NeedleDriver, Resource, ResourceConfig, SourceFunction, SourceMeter,
    SwitchMatrix, TableDriver, Terminal, AXIS_CALIBRATED,
};
use crate::error::{AppResult, BenchError};
use crate::geometry::Position;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Model name under which the simulated drivers register.
pub const SIM_MODEL: &str = "sim";

fn link_fault(remaining: &mut usize, what: &str) -> AppResult<()> {
    if *remaining > 0 {
        *remaining -= 1;
        return Err(BenchError::Resource(format!("simulated link fault: {what}")));
    }
    Ok(())
}

// =============================================================================
// Table
// =============================================================================

/// Logged table command.
#[derive(Debug, Clone, PartialEq)]
pub enum TableMove {
    /// Relative move by delta.
    Relative(Position),
    /// Absolute move to target.
    Absolute(Position),
    /// Axis calibration.
    Calibrate(Axis),
    /// Axis range measurement.
    RangeMeasure(Axis),
}

/// Simulated table state.
#[derive(Debug)]
pub struct SimTableState {
    /// Current position.
    pub position: Position,
    /// Positions still to be reported before the move settles.
    pub trajectory: VecDeque<Position>,
    /// Intermediate samples produced by every move.
    pub motion_samples: usize,
    /// Calibration bitmask per axis.
    pub calibration: [u8; 3],
    /// Calibrate commands leave the axis uncalibrated when false.
    pub calibration_succeeds: bool,
    /// Joystick state.
    pub joystick: bool,
    /// Last applied (accel, velocity).
    pub profile: Option<(f64, f64)>,
    /// Command log.
    pub moves: Vec<TableMove>,
    /// Number of position reads.
    pub position_reads: usize,
    /// Remaining injected link faults on position reads.
    pub link_faults: usize,
    /// Remaining injected open failures.
    pub open_failures: usize,
    /// Number of successful opens.
    pub opened: usize,
}

impl Default for SimTableState {
    fn default() -> Self {
        Self {
            position: Position::default(),
            trajectory: VecDeque::new(),
            motion_samples: 1,
            calibration: [AXIS_CALIBRATED; 3],
            calibration_succeeds: true,
            joystick: false,
            profile: None,
            moves: Vec::new(),
            position_reads: 0,
            link_faults: 0,
            open_failures: 0,
            opened: 0,
        }
    }
}

impl SimTableState {
    fn plan(&mut self, target: Position) {
        let start = self.trajectory.back().copied().unwrap_or(self.position);
        self.trajectory.clear();
        let steps = self.motion_samples.max(1);
        for i in 1..=steps {
            let f = i as f64 / steps as f64;
            self.trajectory.push_back(Position::new(
                start.x + (target.x - start.x) * f,
                start.y + (target.y - start.y) * f,
                start.z + (target.z - start.z) * f,
            ));
        }
    }

    /// Absolute move targets in command order.
    pub fn absolute_targets(&self) -> Vec<Position> {
        self.moves
            .iter()
            .filter_map(|m| match m {
                TableMove::Absolute(target) => Some(*target),
                _ => None,
            })
            .collect()
    }
}

struct SimTable {
    state: Arc<Mutex<SimTableState>>,
}

impl Resource for SimTable {
    fn identify(&mut self) -> AppResult<String> {
        Ok("SIM,table,0,1.0".to_string())
    }
}

impl TableDriver for SimTable {
    fn configure(&mut self) -> AppResult<()> {
        self.state.lock().joystick = false;
        Ok(())
    }

    fn position(&mut self) -> AppResult<Position> {
        let mut state = self.state.lock();
        link_fault(&mut state.link_faults, "table position")?;
        if let Some(next) = state.trajectory.pop_front() {
            state.position = next;
        }
        state.position_reads += 1;
        Ok(state.position)
    }

    fn move_relative(&mut self, delta: Position) -> AppResult<()> {
        let mut state = self.state.lock();
        let base = state.trajectory.back().copied().unwrap_or(state.position);
        state.moves.push(TableMove::Relative(delta));
        state.plan(Position::new(base.x + delta.x, base.y + delta.y, base.z + delta.z));
        Ok(())
    }

    fn move_absolute(&mut self, target: Position) -> AppResult<()> {
        let mut state = self.state.lock();
        state.moves.push(TableMove::Absolute(target));
        state.plan(target);
        Ok(())
    }

    fn calibrate_axis(&mut self, axis: Axis) -> AppResult<()> {
        let mut state = self.state.lock();
        state.moves.push(TableMove::Calibrate(axis));
        let mut target = state.position;
        match axis {
            Axis::X => target.x = 0.0,
            Axis::Y => target.y = 0.0,
            Axis::Z => target.z = 0.0,
        }
        state.plan(target);
        if state.calibration_succeeds {
            state.calibration[axis as usize] |= 0x1;
        } else {
            state.calibration[axis as usize] = 0;
        }
        Ok(())
    }

    fn range_measure_axis(&mut self, axis: Axis) -> AppResult<()> {
        let mut state = self.state.lock();
        state.moves.push(TableMove::RangeMeasure(axis));
        if state.calibration_succeeds {
            state.calibration[axis as usize] |= 0x2;
        }
        Ok(())
    }

    fn calibration_state(&mut self) -> AppResult<[u8; 3]> {
        Ok(self.state.lock().calibration)
    }

    fn set_joystick(&mut self, enabled: bool) -> AppResult<()> {
        self.state.lock().joystick = enabled;
        Ok(())
    }

    fn set_profile(&mut self, accel: f64, velocity: f64) -> AppResult<()> {
        self.state.lock().profile = Some((accel, velocity));
        Ok(())
    }
}

// =============================================================================
// Needle
// =============================================================================

/// Simulated needle positioner state.
#[derive(Debug, Default)]
pub struct SimNeedleState {
    /// Current position.
    pub position: f64,
    /// Offset added to every commanded position, simulates a stuck stage.
    pub error: f64,
    /// Calibration state.
    pub calibrated: bool,
    /// Commanded absolute positions.
    pub moves: Vec<f64>,
    /// Calibrate and range measure commands.
    pub calibrations: usize,
    /// Remaining injected link faults.
    pub link_faults: usize,
}

struct SimNeedle {
    state: Arc<Mutex<SimNeedleState>>,
}

impl Resource for SimNeedle {
    fn identify(&mut self) -> AppResult<String> {
        Ok("SIM,needle,0,1.0".to_string())
    }
}

impl NeedleDriver for SimNeedle {
    fn position(&mut self) -> AppResult<f64> {
        let mut state = self.state.lock();
        link_fault(&mut state.link_faults, "needle position")?;
        Ok(state.position)
    }

    fn move_absolute(&mut self, position: f64) -> AppResult<()> {
        let mut state = self.state.lock();
        state.moves.push(position);
        state.position = position + state.error;
        Ok(())
    }

    fn calibrate(&mut self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calibrations += 1;
        state.position = 0.0;
        Ok(())
    }

    fn range_measure(&mut self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calibrations += 1;
        state.calibrated = true;
        Ok(())
    }

    fn is_calibrated(&mut self) -> AppResult<bool> {
        Ok(self.state.lock().calibrated)
    }
}

// =============================================================================
// Environment box
// =============================================================================

/// Simulated environment box state.
#[derive(Debug, Default)]
pub struct SimEnvironState {
    /// Values reported by the next snapshot.
    pub snapshot: EnvironSnapshot,
    /// Test running indicator.
    pub test_running: bool,
    /// Discharge relay commands in order.
    pub discharge_log: Vec<bool>,
    /// Number of snapshot reads.
    pub snapshot_reads: usize,
    /// Remaining injected link faults.
    pub link_faults: usize,
}

struct SimEnviron {
    state: Arc<Mutex<SimEnvironState>>,
}

impl Resource for SimEnviron {
    fn identify(&mut self) -> AppResult<String> {
        Ok("SIM,environ,0,1.0".to_string())
    }
}

impl EnvironDriver for SimEnviron {
    fn snapshot(&mut self) -> AppResult<EnvironSnapshot> {
        let mut state = self.state.lock();
        link_fault(&mut state.link_faults, "environ snapshot")?;
        state.snapshot_reads += 1;
        state.snapshot.updated = Utc::now();
        Ok(state.snapshot.clone())
    }

    fn box_door_open(&mut self) -> AppResult<bool> {
        Ok(self.state.lock().snapshot.box_door_open)
    }

    fn box_lux(&mut self) -> AppResult<f64> {
        Ok(self.state.lock().snapshot.box_lux)
    }

    fn box_light(&mut self) -> AppResult<bool> {
        Ok(self.state.lock().snapshot.box_light)
    }

    fn set_box_light(&mut self, enabled: bool) -> AppResult<()> {
        let mut state = self.state.lock();
        state.snapshot.box_light = enabled;
        state.snapshot.box_lux = if enabled { 300.0 } else { 0.0 };
        Ok(())
    }

    fn microscope_light(&mut self) -> AppResult<bool> {
        Ok(self.state.lock().snapshot.microscope_light)
    }

    fn set_microscope_light(&mut self, enabled: bool) -> AppResult<()> {
        self.state.lock().snapshot.microscope_light = enabled;
        Ok(())
    }

    fn set_discharge(&mut self, enabled: bool) -> AppResult<()> {
        let mut state = self.state.lock();
        state.discharge_log.push(enabled);
        state.snapshot.discharge = enabled;
        Ok(())
    }

    fn set_test_running(&mut self, enabled: bool) -> AppResult<()> {
        self.state.lock().test_running = enabled;
        Ok(())
    }
}

// =============================================================================
// Source meter
// =============================================================================

/// Simulated source meter state.
#[derive(Debug)]
pub struct SimSourceState {
    /// Output state.
    pub output: bool,
    /// Source function.
    pub function: SourceFunction,
    /// Voltage level.
    pub voltage: f64,
    /// Current level.
    pub current: f64,
    /// Last voltage range.
    pub voltage_range: Option<f64>,
    /// Last current compliance.
    pub compliance: Option<f64>,
    /// Terminal routing.
    pub terminal: Terminal,
    /// Beeper state.
    pub beeper: bool,
    /// Compliance state reported to callers.
    pub compliance_tripped: bool,
    /// Current measured while the output is on.
    pub leakage: f64,
    /// Residual sensor voltage, halved on every read in current mode.
    pub residual_voltage: f64,
    /// Pending error queue entries.
    pub errors: VecDeque<InstrumentError>,
    /// Every voltage level set, in order.
    pub voltage_log: Vec<f64>,
    /// Number of closes.
    pub closed: usize,
}

impl Default for SimSourceState {
    fn default() -> Self {
        Self {
            output: false,
            function: SourceFunction::Voltage,
            voltage: 0.0,
            current: 0.0,
            voltage_range: None,
            compliance: None,
            terminal: Terminal::Rear,
            beeper: true,
            compliance_tripped: false,
            leakage: 1e-9,
            residual_voltage: 0.0,
            errors: VecDeque::new(),
            voltage_log: Vec::new(),
            closed: 0,
        }
    }
}

struct SimSource {
    name: String,
    state: Arc<Mutex<SimSourceState>>,
}

impl Resource for SimSource {
    fn identify(&mut self) -> AppResult<String> {
        Ok(format!("SIM,{},0,1.0", self.name))
    }

    fn close(&mut self) -> AppResult<()> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

impl SourceMeter for SimSource {
    fn reset(&mut self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.output = false;
        state.function = SourceFunction::Voltage;
        state.voltage = 0.0;
        state.current = 0.0;
        state.terminal = Terminal::Front;
        Ok(())
    }

    fn clear(&mut self) -> AppResult<()> {
        self.state.lock().errors.clear();
        Ok(())
    }

    fn next_error(&mut self) -> AppResult<Option<InstrumentError>> {
        Ok(self.state.lock().errors.pop_front())
    }

    fn output(&mut self) -> AppResult<bool> {
        Ok(self.state.lock().output)
    }

    fn set_output(&mut self, enabled: bool) -> AppResult<()> {
        self.state.lock().output = enabled;
        Ok(())
    }

    fn function(&mut self) -> AppResult<SourceFunction> {
        Ok(self.state.lock().function)
    }

    fn set_function(&mut self, function: SourceFunction) -> AppResult<()> {
        self.state.lock().function = function;
        Ok(())
    }

    fn voltage_level(&mut self) -> AppResult<f64> {
        Ok(self.state.lock().voltage)
    }

    fn set_voltage_level(&mut self, voltage: f64) -> AppResult<()> {
        let mut state = self.state.lock();
        state.voltage = voltage;
        state.voltage_log.push(voltage);
        Ok(())
    }

    fn current_level(&mut self) -> AppResult<f64> {
        Ok(self.state.lock().current)
    }

    fn set_current_level(&mut self, current: f64) -> AppResult<()> {
        self.state.lock().current = current;
        Ok(())
    }

    fn set_voltage_range(&mut self, range: f64) -> AppResult<()> {
        self.state.lock().voltage_range = Some(range);
        Ok(())
    }

    fn set_current_compliance(&mut self, compliance: f64) -> AppResult<()> {
        self.state.lock().compliance = Some(compliance);
        Ok(())
    }

    fn compliance_tripped(&mut self) -> AppResult<bool> {
        Ok(self.state.lock().compliance_tripped)
    }

    fn measure_voltage(&mut self) -> AppResult<f64> {
        let mut state = self.state.lock();
        if state.function == SourceFunction::Current {
            let value = state.residual_voltage;
            state.residual_voltage /= 2.0;
            return Ok(value);
        }
        Ok(if state.output { state.voltage } else { 0.0 })
    }

    fn measure_current(&mut self) -> AppResult<f64> {
        let state = self.state.lock();
        Ok(if state.output { state.leakage } else { 0.0 })
    }

    fn set_terminal(&mut self, terminal: Terminal) -> AppResult<()> {
        self.state.lock().terminal = terminal;
        Ok(())
    }

    fn terminal(&mut self) -> AppResult<Terminal> {
        Ok(self.state.lock().terminal)
    }

    fn set_beeper(&mut self, enabled: bool) -> AppResult<()> {
        self.state.lock().beeper = enabled;
        Ok(())
    }
}

// =============================================================================
// LCR meter
// =============================================================================

/// Simulated LCR meter state.
#[derive(Debug, Default)]
pub struct SimLcrState {
    /// Parallel capacitance returned by measurements.
    pub cp: f64,
    /// Parallel resistance returned by measurements.
    pub rp: f64,
    /// Open correction enabled.
    pub open_correction: bool,
    /// Executed open corrections.
    pub open_corrections: usize,
    /// `*OPC?` reads answering "busy" before completion.
    pub busy_reads: usize,
    /// Last frequency.
    pub frequency: f64,
    /// Last amplitude.
    pub amplitude: f64,
    /// Pending error queue entries.
    pub errors: VecDeque<InstrumentError>,
}

struct SimLcr {
    state: Arc<Mutex<SimLcrState>>,
}

impl Resource for SimLcr {
    fn identify(&mut self) -> AppResult<String> {
        Ok("SIM,lcr,0,1.0".to_string())
    }
}

impl LcrMeter for SimLcr {
    fn reset(&mut self) -> AppResult<()> {
        self.state.lock().open_correction = false;
        Ok(())
    }

    fn clear(&mut self) -> AppResult<()> {
        self.state.lock().errors.clear();
        Ok(())
    }

    fn next_error(&mut self) -> AppResult<Option<InstrumentError>> {
        Ok(self.state.lock().errors.pop_front())
    }

    fn set_function_cp_rp(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn set_long_integration(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn set_correction_length(&mut self, _meters: u32) -> AppResult<()> {
        Ok(())
    }

    fn set_open_correction(&mut self, enabled: bool) -> AppResult<()> {
        self.state.lock().open_correction = enabled;
        Ok(())
    }

    fn open_correction(&mut self) -> AppResult<bool> {
        Ok(self.state.lock().open_correction)
    }

    fn execute_open_correction(&mut self) -> AppResult<()> {
        self.state.lock().open_corrections += 1;
        Ok(())
    }

    fn operation_complete(&mut self) -> AppResult<bool> {
        let mut state = self.state.lock();
        if state.busy_reads > 0 {
            state.busy_reads -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn set_amplitude(&mut self, volts: f64) -> AppResult<()> {
        self.state.lock().amplitude = volts;
        Ok(())
    }

    fn set_frequency(&mut self, hertz: f64) -> AppResult<()> {
        self.state.lock().frequency = hertz;
        Ok(())
    }

    fn measure(&mut self) -> AppResult<(f64, f64)> {
        let state = self.state.lock();
        Ok((state.cp, state.rp))
    }
}

// =============================================================================
// Electrometer
// =============================================================================

/// Simulated electrometer state.
#[derive(Debug, Default)]
pub struct SimElectrometerState {
    /// Current returned by reads.
    pub current: f64,
    /// Zero check state.
    pub zero_check: bool,
    /// Pending error queue entries.
    pub errors: VecDeque<InstrumentError>,
}

struct SimElectrometer {
    state: Arc<Mutex<SimElectrometerState>>,
}

impl Resource for SimElectrometer {
    fn identify(&mut self) -> AppResult<String> {
        Ok("SIM,elm,0,1.0".to_string())
    }
}

impl Electrometer for SimElectrometer {
    fn reset(&mut self) -> AppResult<()> {
        self.state.lock().zero_check = true;
        Ok(())
    }

    fn clear(&mut self) -> AppResult<()> {
        self.state.lock().errors.clear();
        Ok(())
    }

    fn next_error(&mut self) -> AppResult<Option<InstrumentError>> {
        Ok(self.state.lock().errors.pop_front())
    }

    fn configure_current(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn set_zero_check(&mut self, enabled: bool) -> AppResult<()> {
        self.state.lock().zero_check = enabled;
        Ok(())
    }

    fn read_current(&mut self) -> AppResult<f64> {
        let state = self.state.lock();
        Ok(if state.zero_check { 0.0 } else { state.current })
    }
}

// =============================================================================
// Switch matrix
// =============================================================================

/// Logged switch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOp {
    /// Opened channels.
    Open(BTreeSet<String>),
    /// Closed channels.
    Close(BTreeSet<String>),
    /// Opened everything.
    OpenAll,
}

/// Simulated switch matrix state.
#[derive(Debug, Default)]
pub struct SimSwitchState {
    /// Closed channels.
    pub closed: BTreeSet<String>,
    /// Command log.
    pub ops: Vec<SwitchOp>,
    /// Channels that refuse to close.
    pub stuck_open: BTreeSet<String>,
}

struct SimSwitch {
    name: String,
    state: Arc<Mutex<SimSwitchState>>,
}

impl Resource for SimSwitch {
    fn identify(&mut self) -> AppResult<String> {
        Ok(format!("SIM,{},0,1.0", self.name))
    }
}

impl SwitchMatrix for SimSwitch {
    fn closed_channels(&mut self) -> AppResult<BTreeSet<String>> {
        Ok(self.state.lock().closed.clone())
    }

    fn close_channels(&mut self, channels: &BTreeSet<String>) -> AppResult<()> {
        let mut state = self.state.lock();
        state.ops.push(SwitchOp::Close(channels.clone()));
        let stuck = state.stuck_open.clone();
        state
            .closed
            .extend(channels.iter().filter(|c| !stuck.contains(*c)).cloned());
        Ok(())
    }

    fn open_channels(&mut self, channels: &BTreeSet<String>) -> AppResult<()> {
        let mut state = self.state.lock();
        state.ops.push(SwitchOp::Open(channels.clone()));
        state.closed.retain(|c| !channels.contains(c));
        Ok(())
    }

    fn open_all(&mut self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.ops.push(SwitchOp::OpenAll);
        state.closed.clear();
        Ok(())
    }
}

// =============================================================================
// Bench
// =============================================================================

/// Shared state of a complete simulated bench.
#[derive(Clone, Default)]
pub struct SimBench {
    /// Table.
    pub table: Arc<Mutex<SimTableState>>,
    /// Needle positioner.
    pub needle: Arc<Mutex<SimNeedleState>>,
    /// Environment box.
    pub environ: Arc<Mutex<SimEnvironState>>,
    /// Main source meter.
    pub smu: Arc<Mutex<SimSourceState>>,
    /// Bias source meter.
    pub bias_smu: Arc<Mutex<SimSourceState>>,
    /// LCR meter.
    pub lcr: Arc<Mutex<SimLcrState>>,
    /// Electrometer.
    pub elm: Arc<Mutex<SimElectrometerState>>,
    /// High voltage switch matrix.
    pub hv_switch: Arc<Mutex<SimSwitchState>>,
    /// Low voltage switch matrix.
    pub lv_switch: Arc<Mutex<SimSwitchState>>,
}

impl SimBench {
    /// Bench in a safe idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the simulated drivers under [`SIM_MODEL`].
    pub fn register(&self, registry: &mut DriverRegistry) {
        let table = Arc::clone(&self.table);
        registry.tables.register(SIM_MODEL, move |_, _| {
            let mut state = table.lock();
            if state.open_failures > 0 {
                state.open_failures -= 1;
                return Err(BenchError::Resource("simulated open failure: table".into()));
            }
            state.opened += 1;
            Ok(Box::new(SimTable {
                state: Arc::clone(&table),
            }))
        });

        let needle = Arc::clone(&self.needle);
        registry.needles.register(SIM_MODEL, move |_, _| {
            Ok(Box::new(SimNeedle {
                state: Arc::clone(&needle),
            }))
        });

        let environ = Arc::clone(&self.environ);
        registry.environs.register(SIM_MODEL, move |_, _| {
            Ok(Box::new(SimEnviron {
                state: Arc::clone(&environ),
            }))
        });

        let smu = Arc::clone(&self.smu);
        let bias_smu = Arc::clone(&self.bias_smu);
        registry.sources.register(SIM_MODEL, move |name, _| {
            let state = match name {
                "smu" => Arc::clone(&smu),
                "bias_smu" => Arc::clone(&bias_smu),
                other => {
                    return Err(BenchError::Configuration(format!(
                        "no simulated source meter named '{other}'"
                    )))
                }
            };
            Ok(Box::new(SimSource {
                name: name.to_string(),
                state,
            }))
        });

        let lcr = Arc::clone(&self.lcr);
        registry.lcrs.register(SIM_MODEL, move |_, _| {
            Ok(Box::new(SimLcr {
                state: Arc::clone(&lcr),
            }))
        });

        let elm = Arc::clone(&self.elm);
        registry.electrometers.register(SIM_MODEL, move |_, _| {
            Ok(Box::new(SimElectrometer {
                state: Arc::clone(&elm),
            }))
        });

        let hv_switch = Arc::clone(&self.hv_switch);
        let lv_switch = Arc::clone(&self.lv_switch);
        registry.switches.register(SIM_MODEL, move |name, _| {
            let state = match name {
                "hv_switch" => Arc::clone(&hv_switch),
                "lv_switch" => Arc::clone(&lv_switch),
                other => {
                    return Err(BenchError::Configuration(format!(
                        "no simulated switch matrix named '{other}'"
                    )))
                }
            };
            Ok(Box::new(SimSwitch {
                name: name.to_string(),
                state,
            }))
        });
    }

    /// Fresh registry containing only the simulated drivers.
    pub fn registry(&self) -> DriverRegistry {
        let mut registry = DriverRegistry::empty();
        self.register(&mut registry);
        registry
    }

    /// Resource table pointing every logical name at the simulation.
    pub fn resources() -> BTreeMap<String, ResourceConfig> {
        [
            "smu", "bias_smu", "lcr", "elm", "hv_switch", "lv_switch", "table", "tango",
            "environ",
        ]
        .into_iter()
        .map(|name| (name.to_string(), ResourceConfig::new(SIM_MODEL, name)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_trajectory() {
        let bench = SimBench::new();
        bench.table.lock().motion_samples = 2;
        let mut table = bench
            .registry()
            .tables
            .create("table", &ResourceConfig::new(SIM_MODEL, ""))
            .unwrap();
        table.move_absolute(Position::new(10.0, 20.0, 0.0)).unwrap();
        assert_eq!(table.position().unwrap(), Position::new(5.0, 10.0, 0.0));
        assert_eq!(table.position().unwrap(), Position::new(10.0, 20.0, 0.0));
        assert_eq!(table.position().unwrap(), Position::new(10.0, 20.0, 0.0));
    }

    #[test]
    fn test_switch_log() {
        let bench = SimBench::new();
        let mut switch = bench
            .registry()
            .switches
            .create("hv_switch", &ResourceConfig::new(SIM_MODEL, ""))
            .unwrap();
        let channels: BTreeSet<String> = ["1A01".to_string()].into();
        switch.close_channels(&channels).unwrap();
        assert_eq!(switch.closed_channels().unwrap(), channels);
        switch.open_all().unwrap();
        assert!(bench.hv_switch.lock().closed.is_empty());
        assert_eq!(bench.hv_switch.lock().ops.len(), 2);
    }

    #[test]
    fn test_injected_link_fault() {
        let bench = SimBench::new();
        bench.table.lock().link_faults = 1;
        let mut table = bench
            .registry()
            .tables
            .create("table", &ResourceConfig::new(SIM_MODEL, ""))
            .unwrap();
        assert!(table.position().unwrap_err().is_link_fault());
        assert!(table.position().is_ok());
    }
}
