//! Hardware driver traits
//!
//! Every physical device of the bench is reached through one of the traits
//! below. Drivers are blocking and `Send`: each one is owned by exactly one
//! thread at a time (a controller worker or the sequence thread) and moved
//! there once, never shared.
//!
//! # Device Kinds
//!
//! - [`TableDriver`] - three axis motorized table carrying the sensor chuck
//! - [`NeedleDriver`] - single axis needle positioner
//! - [`EnvironDriver`] - environment box (door, lights, discharge relay, sensors)
//! - [`SourceMeter`] - voltage/current source measure units (`smu`, `bias_smu`)
//! - [`LcrMeter`] - impedance meter
//! - [`Electrometer`] - low current meter
//! - [`SwitchMatrix`] - high and low voltage switching matrices
//!
//! Drivers are created from a [`ResourceConfig`] through the
//! [`DriverRegistry`], keyed by model name.

pub mod registry;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod sim;

pub use registry::DriverRegistry;

use crate::error::AppResult;
use crate::geometry::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Connection parameters of one hardware link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Driver model name, selects the factory in the registry.
    pub model: String,
    /// Port or instrument address.
    #[serde(default)]
    pub address: String,
    /// Line termination appended to commands.
    #[serde(default = "default_termination")]
    pub termination: String,
    /// Per-command I/O timeout.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_termination() -> String {
    "\r\n".to_string()
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(4)
}

impl ResourceConfig {
    /// Config for `model` with default link settings.
    pub fn new(model: &str, address: &str) -> Self {
        Self {
            model: model.to_string(),
            address: address.to_string(),
            termination: default_termination(),
            timeout: default_io_timeout(),
        }
    }
}

/// Common operations of every device.
pub trait Resource: Send {
    /// Identification string (`*IDN?` or equivalent).
    fn identify(&mut self) -> AppResult<String>;

    /// Release the link.
    fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Table axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    /// X axis.
    X,
    /// Y axis.
    Y,
    /// Z axis.
    Z,
}

impl Axis {
    /// Axis letter.
    pub fn as_str(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

/// Calibration done bitmask value meaning "calibrated and range measured".
pub const AXIS_CALIBRATED: u8 = 0x3;

/// Motorized three axis table.
///
/// Move commands return as soon as the controller accepted them, completion
/// is detected by polling [`TableDriver::position`].
pub trait TableDriver: Resource {
    /// Switch to micrometer units and disable the joystick.
    fn configure(&mut self) -> AppResult<()>;
    /// Current position in micrometers.
    fn position(&mut self) -> AppResult<Position>;
    /// Start a relative move.
    fn move_relative(&mut self, delta: Position) -> AppResult<()>;
    /// Start an absolute move.
    fn move_absolute(&mut self, target: Position) -> AppResult<()>;
    /// Start calibration (move to lower limit) of one axis.
    fn calibrate_axis(&mut self, axis: Axis) -> AppResult<()>;
    /// Start range measurement (move to upper limit) of one axis.
    fn range_measure_axis(&mut self, axis: Axis) -> AppResult<()>;
    /// Calibration done bitmask for x, y and z.
    fn calibration_state(&mut self) -> AppResult<[u8; 3]>;
    /// Enable or disable the joystick.
    fn set_joystick(&mut self, enabled: bool) -> AppResult<()>;
    /// Set acceleration and velocity.
    fn set_profile(&mut self, accel: f64, velocity: f64) -> AppResult<()>;
}

/// Single axis needle positioner.
pub trait NeedleDriver: Resource {
    /// Current position in micrometers.
    fn position(&mut self) -> AppResult<f64>;
    /// Start an absolute move.
    fn move_absolute(&mut self, position: f64) -> AppResult<()>;
    /// Start calibration.
    fn calibrate(&mut self) -> AppResult<()>;
    /// Start range measurement.
    fn range_measure(&mut self) -> AppResult<()>;
    /// True if calibration and range measurement completed.
    fn is_calibrated(&mut self) -> AppResult<bool>;
}

/// One full read-out of the environment box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironSnapshot {
    /// Chuck temperature in °C (PT100 #1).
    pub chuck_temperature: f64,
    /// Chuck block temperature in °C (PT100 #2).
    pub chuck_block_temperature: f64,
    /// Box air temperature in °C.
    pub box_temperature: f64,
    /// Relative humidity of the box in %.
    pub box_humidity: f64,
    /// Illuminance in lux.
    pub box_lux: f64,
    /// Box door state.
    pub box_door_open: bool,
    /// Box light state.
    pub box_light: bool,
    /// Microscope light state.
    pub microscope_light: bool,
    /// Discharge relay state.
    pub discharge: bool,
    /// Time of read-out.
    pub updated: DateTime<Utc>,
}

impl Default for EnvironSnapshot {
    fn default() -> Self {
        Self {
            chuck_temperature: 0.0,
            chuck_block_temperature: 0.0,
            box_temperature: 0.0,
            box_humidity: 0.0,
            box_lux: 0.0,
            box_door_open: false,
            box_light: false,
            microscope_light: false,
            discharge: false,
            updated: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Environment box controller.
pub trait EnvironDriver: Resource {
    /// Read all sensors and relay states.
    fn snapshot(&mut self) -> AppResult<EnvironSnapshot>;
    /// Door state.
    fn box_door_open(&mut self) -> AppResult<bool>;
    /// Illuminance in lux.
    fn box_lux(&mut self) -> AppResult<f64>;
    /// Box light state.
    fn box_light(&mut self) -> AppResult<bool>;
    /// Switch the box light.
    fn set_box_light(&mut self, enabled: bool) -> AppResult<()>;
    /// Microscope light state.
    fn microscope_light(&mut self) -> AppResult<bool>;
    /// Switch the microscope light.
    fn set_microscope_light(&mut self, enabled: bool) -> AppResult<()>;
    /// Assert or release the discharge relay.
    fn set_discharge(&mut self, enabled: bool) -> AppResult<()>;
    /// Toggle the "test running" indicator.
    fn set_test_running(&mut self, enabled: bool) -> AppResult<()>;
}

/// Entry of an instrument error queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentError {
    /// Error code, 0 means no error.
    pub code: i32,
    /// Error message.
    pub message: String,
}

impl std::fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, \"{}\"", self.code, self.message)
    }
}

/// Source function of a source meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFunction {
    /// Source voltage, measure current.
    Voltage,
    /// Source current, measure voltage.
    Current,
}

/// Output terminal routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminal {
    /// Front panel terminals.
    Front,
    /// Rear panel terminals.
    Rear,
}

/// Source measure unit.
pub trait SourceMeter: Resource {
    /// Reset to power-on defaults.
    fn reset(&mut self) -> AppResult<()>;
    /// Clear status and error queue.
    fn clear(&mut self) -> AppResult<()>;
    /// Pop the next error queue entry, `None` if empty.
    fn next_error(&mut self) -> AppResult<Option<InstrumentError>>;
    /// Output state.
    fn output(&mut self) -> AppResult<bool>;
    /// Switch output.
    fn set_output(&mut self, enabled: bool) -> AppResult<()>;
    /// Source function.
    fn function(&mut self) -> AppResult<SourceFunction>;
    /// Select source function.
    fn set_function(&mut self, function: SourceFunction) -> AppResult<()>;
    /// Voltage level in volts.
    fn voltage_level(&mut self) -> AppResult<f64>;
    /// Set voltage level in volts.
    fn set_voltage_level(&mut self, voltage: f64) -> AppResult<()>;
    /// Current level in amperes.
    fn current_level(&mut self) -> AppResult<f64>;
    /// Set current level in amperes.
    fn set_current_level(&mut self, current: f64) -> AppResult<()>;
    /// Set voltage source range in volts.
    fn set_voltage_range(&mut self, range: f64) -> AppResult<()>;
    /// Set current compliance in amperes.
    fn set_current_compliance(&mut self, compliance: f64) -> AppResult<()>;
    /// True if the compliance limit engaged.
    fn compliance_tripped(&mut self) -> AppResult<bool>;
    /// Measure voltage in volts.
    fn measure_voltage(&mut self) -> AppResult<f64>;
    /// Measure current in amperes.
    fn measure_current(&mut self) -> AppResult<f64>;
    /// Route output terminals.
    fn set_terminal(&mut self, terminal: Terminal) -> AppResult<()>;
    /// Output terminal routing.
    fn terminal(&mut self) -> AppResult<Terminal>;
    /// Enable the beeper.
    fn set_beeper(&mut self, enabled: bool) -> AppResult<()>;
}

/// Impedance meter.
pub trait LcrMeter: Resource {
    /// Reset to power-on defaults.
    fn reset(&mut self) -> AppResult<()>;
    /// Clear status and error queue.
    fn clear(&mut self) -> AppResult<()>;
    /// Pop the next error queue entry, `None` if empty.
    fn next_error(&mut self) -> AppResult<Option<InstrumentError>>;
    /// Select parallel capacitance/resistance measurement.
    fn set_function_cp_rp(&mut self) -> AppResult<()>;
    /// Select long integration time.
    fn set_long_integration(&mut self) -> AppResult<()>;
    /// Set cable correction length in meters.
    fn set_correction_length(&mut self, meters: u32) -> AppResult<()>;
    /// Enable or disable open correction.
    fn set_open_correction(&mut self, enabled: bool) -> AppResult<()>;
    /// Open correction state.
    fn open_correction(&mut self) -> AppResult<bool>;
    /// Start an open correction measurement.
    fn execute_open_correction(&mut self) -> AppResult<()>;
    /// True once all pending operations completed (`*OPC?`).
    fn operation_complete(&mut self) -> AppResult<bool>;
    /// Set AC amplitude in volts.
    fn set_amplitude(&mut self, volts: f64) -> AppResult<()>;
    /// Set AC frequency in hertz.
    fn set_frequency(&mut self, hertz: f64) -> AppResult<()>;
    /// Trigger and read the primary/secondary parameter pair.
    fn measure(&mut self) -> AppResult<(f64, f64)>;
}

/// Electrometer.
pub trait Electrometer: Resource {
    /// Reset to power-on defaults.
    fn reset(&mut self) -> AppResult<()>;
    /// Clear status and error queue.
    fn clear(&mut self) -> AppResult<()>;
    /// Pop the next error queue entry, `None` if empty.
    fn next_error(&mut self) -> AppResult<Option<InstrumentError>>;
    /// Select current function with autorange.
    fn configure_current(&mut self) -> AppResult<()>;
    /// Enable or disable zero check.
    fn set_zero_check(&mut self, enabled: bool) -> AppResult<()>;
    /// Read current in amperes.
    fn read_current(&mut self) -> AppResult<f64>;
}

/// Switching matrix.
pub trait SwitchMatrix: Resource {
    /// Currently closed channels.
    fn closed_channels(&mut self) -> AppResult<BTreeSet<String>>;
    /// Close channels.
    fn close_channels(&mut self, channels: &BTreeSet<String>) -> AppResult<()>;
    /// Open channels.
    fn open_channels(&mut self, channels: &BTreeSet<String>) -> AppResult<()>;
    /// Open every channel.
    fn open_all(&mut self) -> AppResult<()>;
}
