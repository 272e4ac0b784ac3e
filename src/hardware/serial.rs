//! Serial drivers for the Venus-1 table controller and the Tango needle stage.
//!
//! Both controllers speak a line based ASCII protocol. Any I/O failure is
//! reported as [`BenchError::Resource`] so the owning worker reopens the link.

use super::{
    Axis, DriverRegistry, NeedleDriver, Resource, ResourceConfig, TableDriver,
};
use crate::error::{AppResult, BenchError};
use crate::geometry::Position;
use serialport::SerialPort;
use std::io::{BufRead, BufReader, Write};
use tracing::debug;

const BAUD_RATE: u32 = 57_600;

/// Line oriented serial link.
pub struct SerialLink {
    name: String,
    termination: String,
    reader: BufReader<Box<dyn SerialPort>>,
}

impl SerialLink {
    /// Open the port described by `config`.
    pub fn open(name: &str, config: &ResourceConfig) -> AppResult<Self> {
        let port = serialport::new(&config.address, BAUD_RATE)
            .timeout(config.timeout)
            .open()
            .map_err(|err| {
                BenchError::Resource(format!("{name}: failed to open {}: {err}", config.address))
            })?;
        debug!(resource = name, address = %config.address, "serial port opened");
        Ok(Self {
            name: name.to_string(),
            termination: config.termination.clone(),
            reader: BufReader::new(port),
        })
    }

    /// Send a command without reading a response.
    pub fn write(&mut self, command: &str) -> AppResult<()> {
        debug!(resource = %self.name, command, "write");
        let line = format!("{command}{}", self.termination);
        let name = &self.name;
        let port = self.reader.get_mut();
        port.write_all(line.as_bytes())
            .and_then(|()| port.flush())
            .map_err(|err| BenchError::Resource(format!("{name}: {err}")))
    }

    /// Send a command and read one response line.
    pub fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command)?;
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|err| BenchError::Resource(format!("{}: {err}", self.name)))?;
        let line = line.trim().to_string();
        debug!(resource = %self.name, command, response = %line, "query");
        Ok(line)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, text: &str) -> AppResult<T> {
    text.trim()
        .parse()
        .map_err(|_| BenchError::HardFault(format!("{name}: unexpected response {text:?}")))
}

// =============================================================================
// Venus-1 table
// =============================================================================

/// Corvus/Venus-1 three axis controller.
pub struct VenusTable {
    link: SerialLink,
}

impl VenusTable {
    fn axis_number(axis: Axis) -> u8 {
        match axis {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
        }
    }
}

impl Resource for VenusTable {
    fn identify(&mut self) -> AppResult<String> {
        self.link.query("identify")
    }
}

impl TableDriver for VenusTable {
    fn configure(&mut self) -> AppResult<()> {
        self.link.write("0 joystick")?;
        for axis in 0..4 {
            let unit: u8 = parse_number("table", &self.link.query(&format!("{axis} getunit"))?)?;
            if unit != 1 {
                return Err(BenchError::HardFault(format!(
                    "invalid table unit {unit} on axis {axis}, expected micrometers"
                )));
            }
        }
        Ok(())
    }

    fn position(&mut self) -> AppResult<Position> {
        let response = self.link.query("pos")?;
        let values = response
            .split_whitespace()
            .map(|value| parse_number::<f64>("table", value))
            .collect::<AppResult<Vec<_>>>()?;
        match values.as_slice() {
            [x, y, z] => Ok(Position::new(*x, *y, *z)),
            _ => Err(BenchError::HardFault(format!(
                "table: unexpected position {response:?}"
            ))),
        }
    }

    fn move_relative(&mut self, delta: Position) -> AppResult<()> {
        self.link
            .write(&format!("{:.3} {:.3} {:.3} rmove", delta.x, delta.y, delta.z))
    }

    fn move_absolute(&mut self, target: Position) -> AppResult<()> {
        self.link
            .write(&format!("{:.3} {:.3} {:.3} move", target.x, target.y, target.z))
    }

    fn calibrate_axis(&mut self, axis: Axis) -> AppResult<()> {
        self.link.write(&format!("{} ncal", Self::axis_number(axis)))
    }

    fn range_measure_axis(&mut self, axis: Axis) -> AppResult<()> {
        self.link.write(&format!("{} nrm", Self::axis_number(axis)))
    }

    fn calibration_state(&mut self) -> AppResult<[u8; 3]> {
        let mut state = [0u8; 3];
        for (slot, axis) in state.iter_mut().zip([Axis::X, Axis::Y, Axis::Z]) {
            let response = self
                .link
                .query(&format!("{} getcaldone", Self::axis_number(axis)))?;
            *slot = parse_number("table", &response)?;
        }
        Ok(state)
    }

    fn set_joystick(&mut self, enabled: bool) -> AppResult<()> {
        self.link.write(&format!("{} joystick", u8::from(enabled)))
    }

    fn set_profile(&mut self, accel: f64, velocity: f64) -> AppResult<()> {
        self.link.write(&format!("{accel:.0} setaccel"))?;
        self.link.write(&format!("{velocity:.0} setvel"))
    }
}

// =============================================================================
// Tango needle stage
// =============================================================================

/// Märzhäuser Tango single axis stage.
pub struct TangoNeedle {
    link: SerialLink,
}

impl Resource for TangoNeedle {
    fn identify(&mut self) -> AppResult<String> {
        self.link.query("?version")
    }
}

impl NeedleDriver for TangoNeedle {
    fn position(&mut self) -> AppResult<f64> {
        let response = self.link.query("?pos x")?;
        parse_number("tango", &response)
    }

    fn move_absolute(&mut self, position: f64) -> AppResult<()> {
        self.link.query(&format!("moa x {position:.3}")).map(|_| ())
    }

    fn calibrate(&mut self) -> AppResult<()> {
        self.link.query("!cal x").map(|_| ())
    }

    fn range_measure(&mut self) -> AppResult<()> {
        self.link.query("!rm x").map(|_| ())
    }

    fn is_calibrated(&mut self) -> AppResult<bool> {
        let response = self.link.query("?statuslimit")?;
        Ok(!response.is_empty() && !response.contains('-'))
    }
}

/// Register the serial drivers.
pub fn register(registry: &mut DriverRegistry) {
    registry.tables.register("venus1", |name, config| {
        Ok(Box::new(VenusTable {
            link: SerialLink::open(name, config)?,
        }))
    });
    registry.needles.register("tango", |name, config| {
        Ok(Box::new(TangoNeedle {
            link: SerialLink::open(name, config)?,
        }))
    });
}
