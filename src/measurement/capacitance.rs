//! Coupling and interstrip capacitance.

use super::current::require_steady_state;
use super::params::{ParameterSpec, Parameters};
use super::{check_valid_range, Measurement, MeasurementContext, Switching};
use crate::error::{AppResult, RunResult};
use crate::util::stats::{median, median_of};
use serde_json::Value;
use tracing::info;

/// Readings averaged into the open correction baseline.
const OPEN_CORRECTION_SAMPLES: usize = 50;

/// Frequency the LCR is left at after a capacitance item.
const DEFAULT_FREQUENCY: f64 = 1e3;

/// LCR settings and bounds shared by both capacitance types.
#[derive(Debug, Clone)]
struct LcrSetup {
    amplitude: f64,
    frequency: f64,
    minimum: f64,
    maximum: f64,
    n_samples: usize,
    switching: Switching,
}

impl LcrSetup {
    fn from_parameters(parameters: &Parameters, prefix: &str) -> AppResult<Self> {
        Ok(Self {
            amplitude: parameters.float("lcr_amplitude")?,
            frequency: parameters.float("lcr_frequency")?,
            minimum: parameters.float(&format!("{prefix}_cp_minimum"))?,
            maximum: parameters.float(&format!("{prefix}_cp_maximum"))?,
            n_samples: parameters.count("n_samples")?,
            switching: Switching::from_parameters(parameters)?,
        })
    }

    fn configure(&self, ctx: &mut MeasurementContext<'_>) -> AppResult<()> {
        ctx.station.lcr_set_amplitude(self.amplitude)?;
        ctx.station.lcr_set_frequency(self.frequency)
    }

    /// Run the LCR open correction and record the residual Cp.
    fn open_correction(&self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.message("Perform open correction...");
        ctx.apply_switching(&self.switching)?;
        ctx.station.lcr_perform_open_correction()?;
        ctx.station.lcr_enable_open_correction(true)?;
        self.configure(ctx)?;
        let cp = median_of(OPEN_CORRECTION_SAMPLES, || {
            Ok(ctx.station.lcr_acquire_reading()?.0)
        })?;
        info!(item = %ctx.item().name, cp, "open correction");
        ctx.set_open_correction("cp", cp);
        ctx.message("");
        Ok(())
    }

    fn initialize(&self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.apply_switching(&self.switching)?;
        self.configure(ctx)?;
        ctx.station.lcr_enable_open_correction(true)?;
        Ok(())
    }

    /// Median corrected Cp and Rp after the reading settled.
    fn acquire(&self, ctx: &mut MeasurementContext<'_>) -> AppResult<(f64, f64)> {
        let correction = ctx.open_correction("cp");
        require_steady_state(ctx, "Cp", |station| {
            Ok(station.lcr_acquire_reading()?.0 - correction)
        })?;
        let mut rp_values = Vec::with_capacity(self.n_samples);
        let cp = median_of(self.n_samples, || {
            let (cp, rp) = ctx.station.lcr_acquire_reading()?;
            rp_values.push(rp);
            Ok(cp - correction)
        })?;
        Ok((cp, median(&rp_values)))
    }
}

/// Coupling capacitance of a strip.
#[derive(Debug, Clone)]
pub struct CacMeasurement {
    setup: LcrSetup,
}

impl CacMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("lcr_amplitude", "V").default("1").range(0.0, 10.0),
        ParameterSpec::float("lcr_frequency", "Hz").default("1 kHz").minimum(0.0),
        ParameterSpec::float("cac_cp_minimum", "F").default("0").minimum(0.0),
        ParameterSpec::float("cac_cp_maximum", "F").default("0").minimum(0.0),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            setup: LcrSetup::from_parameters(parameters, "cac")?,
        })
    }
}

impl Measurement for CacMeasurement {
    fn before_sequence(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.setup.open_correction(ctx)
    }

    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.setup.initialize(ctx)
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let (cac_cp, cac_rp) = self.setup.acquire(ctx)?;
        ctx.insert_strip_data([
            ("cac_cp", Value::from(cac_cp)),
            ("cac_rp", Value::from(cac_rp)),
        ]);
        check_valid_range(self.setup.minimum, self.setup.maximum, cac_cp, "F")?;
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        ctx.station.lcr_set_frequency(DEFAULT_FREQUENCY)?;
        Ok(())
    }
}

/// Capacitance between neighbouring strips, needles lifted.
#[derive(Debug, Clone)]
pub struct CintMeasurement {
    setup: LcrSetup,
}

impl CintMeasurement {
    /// Parameter schema.
    pub const PARAMETERS: &'static [ParameterSpec] = &[
        ParameterSpec::float("lcr_amplitude", "V").default("1").range(0.0, 10.0),
        ParameterSpec::float("lcr_frequency", "Hz").default("1 MHz").minimum(0.0),
        ParameterSpec::float("cint_cp_minimum", "F").default("0").minimum(0.0),
        ParameterSpec::float("cint_cp_maximum", "F").default("0").minimum(0.0),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
    ];

    /// Build from validated parameters.
    pub fn from_parameters(parameters: &Parameters) -> AppResult<Self> {
        Ok(Self {
            setup: LcrSetup::from_parameters(parameters, "cint")?,
        })
    }
}

impl Measurement for CintMeasurement {
    fn before_sequence(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.setup.open_correction(ctx)
    }

    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.setup.initialize(ctx)?;
        if let Some(needle) = ctx.station.needle() {
            info!("needles up");
            needle.move_up()?.wait()?;
        }
        Ok(())
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        let (cint_cp, cint_rp) = self.setup.acquire(ctx)?;
        ctx.insert_strip_data([
            ("cint_cp", Value::from(cint_cp)),
            ("cint_rp", Value::from(cint_rp)),
        ]);
        check_valid_range(self.setup.minimum, self.setup.maximum, cint_cp, "F")?;
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        if let Some(needle) = ctx.station.needle() {
            info!("needles down");
            needle.move_down()?.wait()?;
        }
        ctx.station.lcr_set_frequency(DEFAULT_FREQUENCY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::RawParameters;

    #[test]
    fn test_frequency_defaults() {
        let cac = CacMeasurement::from_parameters(
            &Parameters::resolve(CacMeasurement::PARAMETERS, &RawParameters::new()).unwrap(),
        )
        .unwrap();
        let cint = CintMeasurement::from_parameters(
            &Parameters::resolve(CintMeasurement::PARAMETERS, &RawParameters::new()).unwrap(),
        )
        .unwrap();
        assert_eq!(cac.setup.frequency, 1e3);
        assert_eq!(cint.setup.frequency, 1e6);
    }
}
