//! Bias ramp with current readings per step.

use super::params::{ParameterSpec, Parameters};
use super::{Measurement, MeasurementContext, Switching};
use crate::error::{AppResult, BenchError, RunResult};
use crate::station::{no_hook, SourceUnit, Station};
use crate::util::linear_range;
use serde_json::Value;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Largest accepted deviation between set and measured bias voltage.
pub(crate) const VOLTAGE_THRESHOLD: f64 = 0.25;

/// Current/voltage curve of the sensor.
#[derive(Debug, Clone)]
pub struct IvMeasurement {
    voltage_begin: f64,
    voltage_end: f64,
    voltage_step: f64,
    waiting_time: Duration,
    compliance: f64,
    switching: Switching,
}

impl IvMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("voltage_begin", "V").default("0").range(-1000.0, 0.0),
        ParameterSpec::float("voltage_end", "V").range(-1000.0, 0.0),
        ParameterSpec::float("voltage_step", "V").default("1").range(-100.0, 100.0),
        ParameterSpec::float("waiting_time", "s").default("1").minimum(0.0),
        ParameterSpec::float("compliance", "A").minimum(0.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        let measurement = Self {
            voltage_begin: parameters.float("voltage_begin")?,
            voltage_end: parameters.float("voltage_end")?,
            voltage_step: parameters.float("voltage_step")?,
            waiting_time: parameters.duration("waiting_time")?,
            compliance: parameters.float("compliance")?,
            switching: Switching::from_parameters(parameters)?,
        };
        linear_range(measurement.voltage_begin, measurement.voltage_end, measurement.voltage_step)?;
        Ok(measurement)
    }
}

/// Sources to a known state, bias on with `compliance`, `setup` for
/// switching, then ramp to `begin`.
pub(crate) fn prepare_bias_ramp(
    ctx: &mut MeasurementContext<'_>,
    compliance: f64,
    begin: f64,
    end: f64,
    setup: impl FnOnce(&mut MeasurementContext<'_>) -> RunResult<()>,
) -> RunResult<()> {
    let ramp = ctx.station.settings().ramp;
    ctx.station.recover_voltage(SourceUnit::Smu, ramp)?;
    ctx.station.source(SourceUnit::Smu)?.set_output(false)?;

    ctx.station.recover_voltage(SourceUnit::Bias, ramp)?;
    {
        let mut bias = ctx.station.source(SourceUnit::Bias)?;
        bias.set_current_compliance(compliance)?;
        bias.set_output(true)?;
    }

    ctx.check_abort()?;
    setup(ctx)?;

    if begin != 0.0 {
        let control = ctx.control().clone();
        ctx.station.ramp_voltage(
            SourceUnit::Bias,
            begin,
            ramp,
            move |_: &mut Station, _, _| control.check_abort(),
            no_hook,
        )?;
    }
    ctx.station.source(SourceUnit::Bias)?.set_voltage_range(end.abs())?;
    Ok(())
}

/// Set `voltage`, wait and read back the bias source.
pub(crate) fn bias_step(
    ctx: &mut MeasurementContext<'_>,
    voltage: f64,
    waiting_time: Duration,
) -> AppResult<(f64, f64)> {
    ctx.station.source(SourceUnit::Bias)?.set_voltage(voltage)?;
    thread::sleep(waiting_time);
    read_bias(ctx, voltage)
}

/// Read current and voltage of the bias source set to `voltage`.
pub(crate) fn read_bias(ctx: &mut MeasurementContext<'_>, voltage: f64) -> AppResult<(f64, f64)> {
    let mut bias = ctx.station.source(SourceUnit::Bias)?;
    let current = bias.read_current()?;
    let measured = bias.read_voltage()?;
    if (voltage - measured).abs() > VOLTAGE_THRESHOLD {
        warn!(voltage = measured, "bias SMU voltage out of expected range");
    }
    Ok((current, measured))
}

/// Hardware and software compliance of the bias source.
pub(crate) fn check_bias_compliance(
    ctx: &mut MeasurementContext<'_>,
    compliance: f64,
    current: f64,
) -> AppResult<()> {
    if ctx.station.source(SourceUnit::Bias)?.compliance_tripped()? {
        return Err(BenchError::ComplianceTripped("bias SMU compliance tripped".into()));
    }
    if compliance <= current.abs() {
        return Err(BenchError::ComplianceTripped(
            "bias SMU compliance tripped (software)".into(),
        ));
    }
    Ok(())
}

impl Measurement for IvMeasurement {
    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let switching = &self.switching;
        prepare_bias_ramp(ctx, self.compliance, self.voltage_begin, self.voltage_end, |ctx| {
            Ok(ctx.apply_switching(switching)?)
        })
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let voltages = linear_range(self.voltage_begin, self.voltage_end, self.voltage_step)?;
        let steps = voltages.len();
        for (step, voltage) in voltages.into_iter().enumerate() {
            ctx.check_abort()?;
            ctx.progress(step, steps);
            ctx.message(format!("Performing IV @{voltage} V"));

            let (current, measured) = bias_step(ctx, voltage, self.waiting_time)?;
            ctx.insert_data(
                [
                    ("index", Value::from(step)),
                    ("bias_voltage", Value::from(voltage)),
                    ("bias_smu_v", Value::from(measured)),
                    ("bias_smu_i", Value::from(current)),
                ],
                "index",
            );
            check_bias_compliance(ctx, self.compliance, current)?;
        }
        Ok(())
    }
}
