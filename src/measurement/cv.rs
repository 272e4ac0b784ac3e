//! Bias ramp with LCR capacitance readings per step.

use super::iv::{check_bias_compliance, prepare_bias_ramp, read_bias};
use super::params::{ParameterSpec, Parameters};
use super::{Measurement, MeasurementContext, Switching};
use crate::error::{AppResult, RunResult};
use crate::station::{SourceUnit, SwitchUnit};
use crate::util::linear_range;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Capacitance/voltage curve of the sensor.
#[derive(Debug, Clone)]
pub struct CvMeasurement {
    voltage_begin: f64,
    voltage_end: f64,
    voltage_step: f64,
    waiting_time: Duration,
    compliance: f64,
    lcr_amplitude: f64,
    lcr_frequency: f64,
    open_correction: bool,
    switching: Switching,
}

impl CvMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("voltage_begin", "V").default("0"),
        ParameterSpec::float("voltage_end", "V").range(-1000.0, 0.0),
        ParameterSpec::float("voltage_step", "V").default("1").range(-100.0, 100.0),
        ParameterSpec::float("waiting_time", "s").default("1").range(0.0, 60.0),
        ParameterSpec::float("compliance", "A").minimum(0.0),
        ParameterSpec::float("lcr_amplitude", "V").default("1").range(0.0, 10.0),
        ParameterSpec::float("lcr_frequency", "Hz").default("1 kHz").minimum(0.0),
        ParameterSpec::bool("open_correction").default("false"),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        let measurement = Self {
            voltage_begin: parameters.float("voltage_begin")?,
            voltage_end: parameters.float("voltage_end")?,
            voltage_step: parameters.float("voltage_step")?,
            waiting_time: parameters.duration("waiting_time")?,
            compliance: parameters.float("compliance")?,
            lcr_amplitude: parameters.float("lcr_amplitude")?,
            lcr_frequency: parameters.float("lcr_frequency")?,
            open_correction: parameters.flag("open_correction")?,
            switching: Switching::from_parameters(parameters)?,
        };
        linear_range(measurement.voltage_begin, measurement.voltage_end, measurement.voltage_step)?;
        Ok(measurement)
    }
}

impl Measurement for CvMeasurement {
    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let open_correction = self.open_correction;
        let switching = self.switching.clone();
        let (amplitude, frequency) = (self.lcr_amplitude, self.lcr_frequency);
        prepare_bias_ramp(
            ctx,
            self.compliance,
            self.voltage_begin,
            self.voltage_end,
            move |ctx| {
                if open_correction {
                    ctx.message("Perform open correction...");
                    ctx.station.switch_apply(SwitchUnit::Hv, &BTreeSet::new())?;
                    ctx.station.safe_discharge()?;
                    ctx.apply_switching(&switching)?;
                    ctx.station.lcr_perform_open_correction()?;
                    ctx.station.lcr_enable_open_correction(true)?;
                    ctx.message("");
                } else {
                    ctx.apply_switching(&switching)?;
                    ctx.station.lcr_enable_open_correction(false)?;
                }
                ctx.station.lcr_set_amplitude(amplitude)?;
                ctx.station.lcr_set_frequency(frequency)?;
                Ok(())
            },
        )
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let voltages = linear_range(self.voltage_begin, self.voltage_end, self.voltage_step)?;
        let steps = voltages.len();
        for (step, voltage) in voltages.into_iter().enumerate() {
            ctx.check_abort()?;
            ctx.progress(step, steps);
            ctx.message(format!("Performing CV @{voltage} V"));

            ctx.station.source(SourceUnit::Bias)?.set_voltage(voltage)?;
            std::thread::sleep(self.waiting_time);
            let (lcr_cp, lcr_rp) = ctx.station.lcr_acquire_filter_reading()?;
            let (current, measured) = read_bias(ctx, voltage)?;
            ctx.insert_data(
                [
                    ("index", Value::from(step)),
                    ("bias_voltage", Value::from(voltage)),
                    ("bias_smu_v", Value::from(measured)),
                    ("bias_smu_i", Value::from(current)),
                    ("lcr_cp", Value::from(lcr_cp)),
                    ("lcr_rp", Value::from(lcr_rp)),
                ],
                "index",
            );
            check_bias_compliance(ctx, self.compliance, current)?;
        }
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let ramp = ctx.station.settings().ramp;
        ctx.station.recover_voltage(SourceUnit::Bias, ramp)?;
        ctx.station.safe_discharge()?;
        Ok(())
    }
}
