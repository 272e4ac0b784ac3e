//! Measurement strategies
//!
//! A measurement is the physical procedure behind one sequence item. The
//! orchestrator drives it through the hooks of [`Measurement`], handing each
//! hook a [`MeasurementContext`] with the station, the run record and the
//! abort flag.
//!
//! Hooks signal failures through [`RunError`]:
//!
//! - `BenchError::AnalysisOutOfRange` asks for a remeasurement,
//! - `BenchError::ComplianceTripped` abandons the item,
//! - anything else aborts the run,
//! - `RunError::Aborted` unwinds an operator abort.
//!
//! # Built-in Types
//!
//! | type        | scope | result                         |
//! |-------------|-------|--------------------------------|
//! | `iv`        | item  | bias ramp, current per step    |
//! | `cv`        | item  | bias ramp, LCR Cp/Rp per step  |
//! | `stripscan` | item  | ramps bias for strip items     |
//! | `istrip`    | strip | electrometer current           |
//! | `idark`     | strip | bias current                   |
//! | `idiel`     | strip | SMU current                    |
//! | `rpoly`     | strip | poly resistor                  |
//! | `rint`      | strip | interstrip resistance          |
//! | `cac`       | strip | coupling capacitance           |
//! | `cint`      | strip | interstrip capacitance         |

mod capacitance;
mod current;
mod cv;
mod iv;
pub mod params;
mod registry;
mod resistance;
mod stripscan;

pub use capacitance::{CacMeasurement, CintMeasurement};
pub use current::{IdarkMeasurement, IdielMeasurement, IstripMeasurement};
pub use cv::CvMeasurement;
pub use iv::IvMeasurement;
pub use params::{ParameterKind, ParameterSpec, ParameterValue, Parameters};
pub use registry::{MeasurementFactory, MeasurementRegistry};
pub use resistance::{RintMeasurement, RpolyMeasurement};
pub use stripscan::StripscanMeasurement;

use crate::error::{AppResult, BenchError, RunResult};
use crate::sequence::{EventSink, Row, RunControl, RunRecord, SequenceEvent};
use crate::station::{Station, SwitchUnit};
use crate::util::format_metric;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;

/// Procedure behind a sequence item.
///
/// Every hook defaults to doing nothing.
pub trait Measurement: Send {
    /// Once before the first item of a run.
    fn before_sequence(&mut self, _ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(())
    }

    /// Once after the last item of a run that was not aborted.
    fn after_sequence(&mut self, _ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(())
    }

    /// Before contacting a strip, top level items only.
    fn before_strip(&mut self, _ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(())
    }

    /// After releasing a strip, top level items only.
    fn after_strip(&mut self, _ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(())
    }

    /// Prepare instruments.
    fn initialize(&mut self, _ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(())
    }

    /// Take readings and insert data.
    fn acquire(&mut self, _ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(())
    }

    /// Restore instruments, runs even if `initialize` or `acquire` failed.
    fn finalize(&mut self, _ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(())
    }
}

/// Identity of the item a measurement belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemId {
    /// Data namespace.
    pub namespace: String,
    /// Measurement type.
    pub kind: String,
    /// Item full name.
    pub name: String,
}

/// Currently contacted strip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripId {
    /// Strip name.
    pub name: String,
    /// Padfile index.
    pub index: usize,
}

/// Everything a measurement hook may touch.
pub struct MeasurementContext<'a> {
    /// Bench hardware.
    pub station: &'a mut Station,
    record: &'a mut RunRecord,
    control: &'a RunControl,
    events: &'a EventSink,
    item: &'a ItemId,
    strip: Option<&'a StripId>,
}

impl<'a> MeasurementContext<'a> {
    /// Context for `item`, optionally on `strip`.
    pub fn new(
        station: &'a mut Station,
        record: &'a mut RunRecord,
        control: &'a RunControl,
        events: &'a EventSink,
        item: &'a ItemId,
        strip: Option<&'a StripId>,
    ) -> Self {
        Self {
            station,
            record,
            control,
            events,
            item,
            strip,
        }
    }

    /// Item identity.
    pub fn item(&self) -> &ItemId {
        self.item
    }

    /// Current strip, if any.
    pub fn strip(&self) -> Option<&StripId> {
        self.strip
    }

    /// Shared abort flag.
    pub fn control(&self) -> &RunControl {
        self.control
    }

    /// `Err(Aborted)` once an abort was requested.
    pub fn check_abort(&self) -> RunResult<()> {
        self.control.check_abort()
    }

    /// Publish a status message.
    pub fn message(&self, message: impl Into<String>) {
        self.events.message(message);
    }

    /// Publish progress.
    pub fn progress(&self, value: usize, maximum: usize) {
        self.events.progress(value, maximum);
    }

    /// Close exactly the given channels on both switch matrices.
    pub fn apply_switching(&mut self, switching: &Switching) -> AppResult<()> {
        self.station.switch_apply(SwitchUnit::Hv, &switching.hv)?;
        self.station.switch_apply(SwitchUnit::Lv, &switching.lv)
    }

    /// Insert a row with timestamp, chuck temperature and box humidity.
    ///
    /// A row with an equal `sortkey` value is replaced.
    pub fn insert_data<I>(&mut self, values: I, sortkey: &str)
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        let snapshot = self.station.environ().snapshot();
        let mut row = Row::new();
        row.insert("timestamp".into(), Value::from(Utc::now().timestamp_millis() as f64 / 1e3));
        row.insert(
            "temperature".into(),
            Value::from(snapshot.as_ref().map_or(f64::NAN, |s| s.chuck_temperature)),
        );
        row.insert(
            "humidity".into(),
            Value::from(snapshot.as_ref().map_or(f64::NAN, |s| s.box_humidity)),
        );
        row.extend(values.into_iter().map(|(key, value)| (key.to_string(), value)));
        let ItemId {
            namespace,
            kind,
            name,
        } = self.item;
        self.record.insert_data(namespace, kind, name, row, sortkey);
        self.events.emit(SequenceEvent::DataChanged {
            namespace: namespace.clone(),
            kind: kind.clone(),
            name: name.clone(),
        });
    }

    /// Insert a row for the current strip, keyed by its padfile index.
    pub fn insert_strip_data<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        let (strip, index) = match self.strip {
            Some(strip) => (Value::from(strip.name.clone()), Value::from(strip.index)),
            None => (Value::Null, Value::Null),
        };
        let values: Vec<_> = [("strip", strip), ("strip_index", index)]
            .into_iter()
            .chain(values)
            .collect();
        self.insert_data(values, "strip_index");
    }

    /// Stored open correction baseline of this item.
    pub fn open_correction(&self, key: &str) -> f64 {
        let ItemId {
            namespace,
            kind,
            name,
        } = self.item;
        self.record.open_correction(namespace, kind, name, key)
    }

    /// Store an open correction baseline of this item.
    pub fn set_open_correction(&mut self, key: &str, value: f64) {
        let ItemId {
            namespace,
            kind,
            name,
        } = self.item;
        self.record.set_open_correction(namespace, kind, name, key, value);
    }
}

/// Switch matrix channels of a measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Switching {
    /// High voltage matrix.
    pub hv: BTreeSet<String>,
    /// Low voltage matrix.
    pub lv: BTreeSet<String>,
}

impl Switching {
    /// Read `hv_channels` and `lv_channels`.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            hv: parameters.list("hv_channels")?.iter().cloned().collect(),
            lv: parameters.list("lv_channels")?.iter().cloned().collect(),
        })
    }
}

/// `AnalysisOutOfRange` if `value` violates a non-zero bound.
pub fn check_valid_range(minimum: f64, maximum: f64, value: f64, unit: &str) -> AppResult<()> {
    if (minimum != 0.0 && value < minimum) || (maximum != 0.0 && value > maximum) {
        return Err(BenchError::AnalysisOutOfRange(format!(
            "value out of bounds: {}, [{}, {}]",
            format_metric(value, unit),
            format_metric(minimum, unit),
            format_metric(maximum, unit)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_valid_range() {
        assert!(check_valid_range(0.0, 0.0, 1.0, "A").is_ok());
        assert!(check_valid_range(1e-9, 0.0, 1e-6, "A").is_ok());
        assert!(check_valid_range(0.0, 1e-9, 1e-10, "A").is_ok());
        let err = check_valid_range(1e-9, 1e-6, 1e-3, "A").unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("mA"));
        assert!(check_valid_range(1e-9, 0.0, 1e-12, "A").unwrap_err().is_retryable());
    }
}
