//! Single strip current measurements.

use super::params::{ParameterSpec, Parameters};
use super::{check_valid_range, Measurement, MeasurementContext, Switching};
use crate::error::{AppResult, BenchError, RunResult};
use crate::station::{SourceUnit, Station};
use crate::util::stats::{median_of, SteadyState};
use serde_json::Value;

/// Wait for `read` to settle, `AnalysisOutOfRange` if it never does.
pub(crate) fn require_steady_state<F>(
    ctx: &mut MeasurementContext<'_>,
    what: &str,
    mut read: F,
) -> AppResult<()>
where
    F: FnMut(&mut Station) -> AppResult<f64>,
{
    ctx.message(format!("Steady state check ({what})..."));
    let station = &mut *ctx.station;
    if SteadyState::default().check(|| read(station))? {
        return Ok(());
    }
    let strip = ctx.strip().map_or("-", |strip| strip.name.as_str());
    Err(BenchError::AnalysisOutOfRange(format!(
        "steady state check failed for {what} on strip {strip}"
    )))
}

/// Strip current through the electrometer.
#[derive(Debug, Clone)]
pub struct IstripMeasurement {
    minimum: f64,
    maximum: f64,
    n_samples: usize,
    switching: Switching,
}

impl IstripMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("istrip_i_minimum", "A").default("0").minimum(0.0),
        ParameterSpec::float("istrip_i_maximum", "A").default("0").minimum(0.0),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            minimum: parameters.float("istrip_i_minimum")?,
            maximum: parameters.float("istrip_i_maximum")?,
            n_samples: parameters.count("n_samples")?,
            switching: Switching::from_parameters(parameters)?,
        })
    }
}

impl Measurement for IstripMeasurement {
    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.apply_switching(&self.switching)?;
        ctx.station.elm_set_zero_check(false)?;
        Ok(())
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        require_steady_state(ctx, "Istrip", Station::elm_read_current)?;
        let istrip_i = median_of(self.n_samples, || ctx.station.elm_read_current())?;
        ctx.insert_strip_data([("istrip_i", Value::from(istrip_i))]);
        check_valid_range(self.minimum, self.maximum, istrip_i.abs(), "A")?;
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.station.elm_set_zero_check(true)?;
        Ok(())
    }
}

/// Dark current of the biased sensor.
#[derive(Debug, Clone)]
pub struct IdarkMeasurement {
    minimum: f64,
    maximum: f64,
    n_samples: usize,
    switching: Switching,
}

impl IdarkMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("idark_i_minimum", "A").default("0").minimum(0.0),
        ParameterSpec::float("idark_i_maximum", "A").default("0").minimum(0.0),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            minimum: parameters.float("idark_i_minimum")?,
            maximum: parameters.float("idark_i_maximum")?,
            n_samples: parameters.count("n_samples")?,
            switching: Switching::from_parameters(parameters)?,
        })
    }
}

impl Measurement for IdarkMeasurement {
    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(ctx.apply_switching(&self.switching)?)
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        require_steady_state(ctx, "Idark", |station| {
            station.source(SourceUnit::Bias)?.read_current()
        })?;
        let idark_i = median_of(self.n_samples, || {
            ctx.station.source(SourceUnit::Bias)?.read_current()
        })?;
        let idark_v = ctx.station.source(SourceUnit::Bias)?.read_voltage()?;
        ctx.insert_strip_data([
            ("idark_i", Value::from(idark_i)),
            ("idark_v", Value::from(idark_v)),
        ]);
        check_valid_range(self.minimum, self.maximum, idark_i.abs(), "A")?;
        Ok(())
    }
}

/// Dielectric current through the coupling oxide, sourced by the SMU.
#[derive(Debug, Clone)]
pub struct IdielMeasurement {
    smu_compliance: f64,
    smu_voltage: f64,
    minimum: f64,
    maximum: f64,
    n_samples: usize,
    switching: Switching,
}

impl IdielMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("smu_compliance", "A").default("1 uA").minimum(0.0),
        ParameterSpec::float("smu_voltage", "V").default("10").range(-24.0, 24.0),
        ParameterSpec::float("idiel_i_minimum", "A").default("0").minimum(0.0),
        ParameterSpec::float("idiel_i_maximum", "A").default("0").minimum(0.0),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            smu_compliance: parameters.float("smu_compliance")?,
            smu_voltage: parameters.float("smu_voltage")?,
            minimum: parameters.float("idiel_i_minimum")?,
            maximum: parameters.float("idiel_i_maximum")?,
            n_samples: parameters.count("n_samples")?,
            switching: Switching::from_parameters(parameters)?,
        })
    }
}

impl Measurement for IdielMeasurement {
    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.apply_switching(&self.switching)?;
        let ramp = ctx.station.settings().ramp;
        ctx.station.recover_voltage(SourceUnit::Smu, ramp)?;
        let mut smu = ctx.station.source(SourceUnit::Smu)?;
        smu.set_current_compliance(self.smu_compliance)?;
        smu.set_voltage_range(self.smu_voltage)?;
        smu.set_output(true)?;
        smu.set_voltage(self.smu_voltage)?;
        Ok(())
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        require_steady_state(ctx, "Idiel", |station| {
            station.source(SourceUnit::Smu)?.read_current()
        })?;
        let idiel_i = median_of(self.n_samples, || {
            ctx.station.source(SourceUnit::Smu)?.read_current()
        })?;
        ctx.insert_strip_data([("idiel_i", Value::from(idiel_i))]);
        check_valid_range(self.minimum, self.maximum, idiel_i.abs(), "A")?;
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let ramp = ctx.station.settings().ramp;
        ctx.station.recover_voltage(SourceUnit::Smu, ramp)?;
        ctx.station.source(SourceUnit::Smu)?.set_output(false)?;
        Ok(())
    }
}
