//! Biased sensor for per strip measurements.

use super::params::{ParameterSpec, Parameters};
use super::{Measurement, MeasurementContext, Switching};
use crate::error::{AppResult, BenchError, RunResult};
use crate::station::{Ramp, SourceUnit, Station};
use std::time::Duration;
use tracing::info;

/// Ramps the bias source to the scan voltage and keeps it there while the
/// strip items run.
#[derive(Debug, Clone)]
pub struct StripscanMeasurement {
    bias_voltage: f64,
    bias_compliance: f64,
    waiting_time: Duration,
    switching: Switching,
}

impl StripscanMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("bias_voltage", "V").range(-1000.0, 0.0),
        ParameterSpec::float("bias_compliance", "A").minimum(0.0),
        ParameterSpec::float("waiting_time", "s").default("1").range(0.0, 60.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            bias_voltage: parameters.float("bias_voltage")?,
            bias_compliance: parameters.float("bias_compliance")?,
            waiting_time: parameters.duration("waiting_time")?,
            switching: Switching::from_parameters(parameters)?,
        })
    }
}

fn check_bias_compliance(station: &mut Station) -> AppResult<()> {
    if station.source(SourceUnit::Bias)?.compliance_tripped()? {
        return Err(BenchError::ComplianceTripped("bias SMU compliance tripped".into()));
    }
    Ok(())
}

impl Measurement for StripscanMeasurement {
    fn before_strip(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        Ok(check_bias_compliance(ctx.station)?)
    }

    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let ramp = ctx.station.settings().ramp;
        ctx.station.recover_voltage(SourceUnit::Smu, ramp)?;
        ctx.station.source(SourceUnit::Smu)?.set_output(false)?;

        ctx.station.recover_voltage(SourceUnit::Bias, ramp)?;
        {
            let mut bias = ctx.station.source(SourceUnit::Bias)?;
            bias.set_output(true)?;
            bias.set_current_compliance(self.bias_compliance)?;
        }

        if let Some(needle) = ctx.station.needle() {
            info!("needles down");
            needle.move_down()?.wait()?;
        }

        ctx.apply_switching(&self.switching)?;

        let control = ctx.control().clone();
        let ramp = Ramp {
            wait: self.waiting_time,
            ..ramp
        };
        ctx.station.ramp_voltage(
            SourceUnit::Bias,
            self.bias_voltage,
            ramp,
            move |_: &mut Station, _, _| control.check_abort(),
            |station: &mut Station, _, _| Ok(check_bias_compliance(station)?),
        )
    }
}
