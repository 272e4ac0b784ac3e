//! Poly resistor and interstrip resistance.

use super::current::require_steady_state;
use super::params::{ParameterSpec, Parameters};
use super::{check_valid_range, Measurement, MeasurementContext, Switching};
use crate::error::{AppResult, BenchError, RunResult};
use crate::station::{no_hook, Ramp, SourceUnit, Station, SwitchUnit};
use crate::util::linear_range;
use crate::util::stats::{linear_fit, median_of};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

fn recover_smu(station: &mut Station) -> AppResult<()> {
    let ramp = station.settings().ramp;
    station.recover_voltage(SourceUnit::Smu, ramp)?;
    station.source(SourceUnit::Smu)?.set_output(false)
}

/// Poly silicon bias resistor, SMU voltage over the current corrected
/// by the strip leakage.
#[derive(Debug, Clone)]
pub struct RpolyMeasurement {
    lv_channels_istrip: BTreeSet<String>,
    smu_compliance: f64,
    smu_voltage: f64,
    minimum: f64,
    maximum: f64,
    n_samples: usize,
    switching: Switching,
}

impl RpolyMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::list("lv_channels_istrip").default(""),
        ParameterSpec::float("smu_compliance", "A").default("10 uA").minimum(0.0),
        ParameterSpec::float("smu_voltage", "V").default("-5").range(-24.0, 24.0),
        ParameterSpec::float("rpoly_r_minimum", "ohm").default("0").minimum(0.0),
        ParameterSpec::float("rpoly_r_maximum", "ohm").default("0").minimum(0.0),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            lv_channels_istrip: parameters.list("lv_channels_istrip")?.iter().cloned().collect(),
            smu_compliance: parameters.float("smu_compliance")?,
            smu_voltage: parameters.float("smu_voltage")?,
            minimum: parameters.float("rpoly_r_minimum")?,
            maximum: parameters.float("rpoly_r_maximum")?,
            n_samples: parameters.count("n_samples")?,
            switching: Switching::from_parameters(parameters)?,
        })
    }
}

impl Measurement for RpolyMeasurement {
    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.apply_switching(&self.switching)?;
        let ramp = ctx.station.settings().ramp;
        ctx.station.recover_voltage(SourceUnit::Smu, ramp)?;
        let mut smu = ctx.station.source(SourceUnit::Smu)?;
        smu.set_current_compliance(self.smu_compliance)?;
        smu.set_output(true)?;
        smu.set_voltage_range(self.smu_voltage)?;
        smu.set_voltage(self.smu_voltage)?;
        smu.check_errors()?;
        Ok(())
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        require_steady_state(ctx, "Rpoly", |station| {
            station.source(SourceUnit::Smu)?.read_current()
        })?;
        let rpoly_i = median_of(self.n_samples, || {
            ctx.station.source(SourceUnit::Smu)?.read_current()
        })?;
        let rpoly_u = ctx.station.source(SourceUnit::Smu)?.read_voltage()?;

        // Strip leakage with the resistor disconnected.
        recover_smu(ctx.station)?;
        ctx.station.switch_apply(SwitchUnit::Lv, &self.lv_channels_istrip)?;
        ctx.station.elm_set_zero_check(false)?;
        require_steady_state(ctx, "Istrip", Station::elm_read_current)?;
        let istrip_i = median_of(self.n_samples, || ctx.station.elm_read_current())?;

        let rpoly_r = rpoly_u / (rpoly_i - istrip_i);
        debug!(rpoly_u, rpoly_i, istrip_i, rpoly_r, "rpoly");
        ctx.insert_strip_data([
            ("rpoly_r", Value::from(rpoly_r)),
            ("rpoly_i", Value::from(rpoly_i)),
            ("rpoly_istrip_i", Value::from(istrip_i)),
            ("rpoly_u", Value::from(rpoly_u)),
        ]);
        check_valid_range(self.minimum, self.maximum, rpoly_r, "ohm")?;
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.station.elm_set_zero_check(true)?;
        recover_smu(ctx.station)?;
        Ok(())
    }
}

/// Interstrip resistance from the slope of electrometer current over an
/// SMU voltage ramp.
#[derive(Debug, Clone)]
pub struct RintMeasurement {
    voltage_begin: f64,
    voltage_end: f64,
    voltage_step: f64,
    waiting_time: Duration,
    smu_compliance: f64,
    minimum: f64,
    maximum: f64,
    n_samples: usize,
    switching: Switching,
}

impl RintMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("smu_voltage_begin", "V").default("0").range(-24.0, 24.0),
        ParameterSpec::float("smu_voltage_end", "V").default("5").range(-24.0, 24.0),
        ParameterSpec::float("smu_voltage_step", "V").default("1").range(-24.0, 24.0),
        ParameterSpec::float("smu_waiting_time", "s").default("0").range(0.0, 60.0),
        ParameterSpec::float("smu_compliance", "A").default("50 uA").range(0.0, 100e-6),
        ParameterSpec::float("rint_r_minimum", "ohm").default("0").minimum(0.0),
        ParameterSpec::float("rint_r_maximum", "ohm").default("0").minimum(0.0),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        let measurement = Self {
            voltage_begin: parameters.float("smu_voltage_begin")?,
            voltage_end: parameters.float("smu_voltage_end")?,
            voltage_step: parameters.float("smu_voltage_step")?,
            waiting_time: parameters.duration("smu_waiting_time")?,
            smu_compliance: parameters.float("smu_compliance")?,
            minimum: parameters.float("rint_r_minimum")?,
            maximum: parameters.float("rint_r_maximum")?,
            n_samples: parameters.count("n_samples")?,
            switching: Switching::from_parameters(parameters)?,
        };
        linear_range(measurement.voltage_begin, measurement.voltage_end, measurement.voltage_step)?;
        Ok(measurement)
    }

    fn ramp(&self) -> Ramp {
        Ramp {
            step: self.voltage_step,
            wait: self.waiting_time,
        }
    }
}

impl Measurement for RintMeasurement {
    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.apply_switching(&self.switching)?;
        let ramp = ctx.station.settings().ramp;
        ctx.station.recover_voltage(SourceUnit::Smu, ramp)?;
        {
            let mut smu = ctx.station.source(SourceUnit::Smu)?;
            smu.set_current_compliance(self.smu_compliance)?;
            smu.set_output(true)?;
        }
        ctx.station
            .ramp_voltage(SourceUnit::Smu, self.voltage_begin, self.ramp(), no_hook, no_hook)?;
        ctx.station.source(SourceUnit::Smu)?.check_errors()?;
        ctx.station.elm_set_zero_check(false)?;
        Ok(())
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        require_steady_state(ctx, "Rint", Station::elm_read_current)?;

        let n_samples = self.n_samples;
        let control = ctx.control().clone();
        let mut voltages = Vec::new();
        let mut currents = Vec::new();
        ctx.station.ramp_voltage(
            SourceUnit::Smu,
            self.voltage_end,
            self.ramp(),
            move |_: &mut Station, _, _| control.check_abort(),
            |station: &mut Station, _, voltage| {
                station.source(SourceUnit::Smu)?.check_compliance()?;
                let current = median_of(n_samples, || station.elm_read_current())?;
                voltages.push(voltage);
                currents.push(current);
                Ok(())
            },
        )?;

        let fit = linear_fit(&voltages, &currents).ok_or_else(|| {
            BenchError::AnalysisOutOfRange("rint: not enough ramp points for a fit".into())
        })?;
        let rint_r = 1.0 / fit.slope;
        debug!(slope = fit.slope, rsq = fit.rsq, rint_r, "rint");
        ctx.insert_strip_data([
            ("rint_r", Value::from(rint_r)),
            ("rint_u", Value::from(voltages)),
            ("rint_i", Value::from(currents)),
        ]);
        check_valid_range(self.minimum, self.maximum, rint_r, "ohm")?;
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.station.elm_set_zero_check(true)?;
        recover_smu(ctx.station)?;
        Ok(())
    }
}
