//! Source meter access: safe recover, ramps and the per-unit handle.

use super::{check_errors, Station, StationEvent};
use crate::error::{AppResult, BenchError, RunResult};
use crate::hardware::{SourceFunction, SourceMeter, Terminal};
use crate::util::linear_range;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Source meter selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceUnit {
    /// Measurement SMU, also used for capacitor discharge.
    Smu,
    /// Sensor bias SMU.
    Bias,
}

impl SourceUnit {
    /// Logical resource name.
    pub fn name(self) -> &'static str {
        match self {
            SourceUnit::Smu => "smu",
            SourceUnit::Bias => "bias_smu",
        }
    }
}

/// Step size and dwell time of a voltage ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ramp {
    /// Step in volts, sign is ignored.
    pub step: f64,
    /// Delay after each step.
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
}

impl Default for Ramp {
    fn default() -> Self {
        Self {
            step: 10.0,
            wait: Duration::from_millis(250),
        }
    }
}

impl Ramp {
    /// Ramp with `step` volts and the dwell time of `self`.
    pub fn with_step(self, step: f64) -> Self {
        Self { step, ..self }
    }
}

/// Borrowed handle on one source meter.
pub struct Source<'a> {
    unit: SourceUnit,
    driver: &'a mut dyn SourceMeter,
    events: &'a broadcast::Sender<StationEvent>,
}

impl Source<'_> {
    /// Reset to power-on defaults.
    pub fn reset(&mut self) -> AppResult<()> {
        self.driver.reset()
    }

    /// Clear status and error queue.
    pub fn clear(&mut self) -> AppResult<()> {
        self.driver.clear()
    }

    /// Output state.
    pub fn output(&mut self) -> AppResult<bool> {
        self.driver.output()
    }

    /// Switch the output.
    pub fn set_output(&mut self, enabled: bool) -> AppResult<()> {
        debug!(source = self.unit.name(), enabled, "set output");
        self.driver.set_output(enabled)
    }

    /// Source function.
    pub fn function(&mut self) -> AppResult<SourceFunction> {
        self.driver.function()
    }

    /// Select the source function.
    pub fn set_function(&mut self, function: SourceFunction) -> AppResult<()> {
        self.driver.set_function(function)
    }

    /// Voltage level in volts.
    pub fn voltage(&mut self) -> AppResult<f64> {
        self.driver.voltage_level()
    }

    /// Set the voltage level.
    pub fn set_voltage(&mut self, voltage: f64) -> AppResult<()> {
        self.driver.set_voltage_level(voltage)?;
        if self.unit == SourceUnit::Bias {
            let _ = self.events.send(StationEvent::BiasVoltageChanged(voltage));
        }
        Ok(())
    }

    /// Current level in amperes.
    pub fn current(&mut self) -> AppResult<f64> {
        self.driver.current_level()
    }

    /// Set the current level.
    pub fn set_current(&mut self, current: f64) -> AppResult<()> {
        self.driver.set_current_level(current)
    }

    /// Set the voltage range to cover `voltage`.
    pub fn set_voltage_range(&mut self, voltage: f64) -> AppResult<()> {
        self.driver.set_voltage_range(voltage.abs())
    }

    /// Set the current compliance.
    pub fn set_current_compliance(&mut self, compliance: f64) -> AppResult<()> {
        self.driver.set_current_compliance(compliance)
    }

    /// True if the compliance limit engaged.
    pub fn compliance_tripped(&mut self) -> AppResult<bool> {
        self.driver.compliance_tripped()
    }

    /// Fail with `ComplianceTripped` if the limit engaged.
    pub fn check_compliance(&mut self) -> AppResult<()> {
        if self.driver.compliance_tripped()? {
            return Err(BenchError::ComplianceTripped(format!(
                "{} compliance tripped",
                self.unit.name()
            )));
        }
        Ok(())
    }

    /// Measure current.
    pub fn read_current(&mut self) -> AppResult<f64> {
        self.driver.measure_current()
    }

    /// Measure voltage.
    pub fn read_voltage(&mut self) -> AppResult<f64> {
        self.driver.measure_voltage()
    }

    /// Route the output terminals.
    pub fn set_terminal(&mut self, terminal: Terminal) -> AppResult<()> {
        self.driver.set_terminal(terminal)
    }

    /// Enable or disable the beeper.
    pub fn set_beeper(&mut self, enabled: bool) -> AppResult<()> {
        self.driver.set_beeper(enabled)
    }

    /// Drain the error queue, failing if it was not empty.
    pub fn check_errors(&mut self) -> AppResult<()> {
        let driver = &mut *self.driver;
        check_errors(self.unit.name(), || driver.next_error())
    }
}

impl Station {
    /// Handle on a source meter.
    pub fn source(&mut self, unit: SourceUnit) -> AppResult<Source<'_>> {
        let driver = match unit {
            SourceUnit::Smu => self.smu.as_deref_mut(),
            SourceUnit::Bias => self.bias_smu.as_deref_mut(),
        };
        let driver = driver.ok_or_else(|| super::not_open(unit.name()))?;
        Ok(Source {
            unit,
            driver,
            events: &self.events,
        })
    }

    /// Bring a source to zero and switch its output off.
    ///
    /// An active voltage source is stepped down by the recover voltage step,
    /// an active current source by the recover current step. The unit is left
    /// in voltage mode at 0 V.
    pub fn safe_recover(&mut self, unit: SourceUnit) -> AppResult<()> {
        info!(source = unit.name(), "safe recover");
        let voltage_step = self.settings.recover_voltage_step;
        let current_step = self.settings.recover_current_step;
        let wait = self.settings.recover_wait;
        let settle = self.settings.recover_settle;
        let mut source = self.source(unit)?;
        if source.output()? {
            match source.function()? {
                SourceFunction::Voltage => {
                    let voltage = source.voltage()?;
                    if voltage != 0.0 {
                        info!(source = unit.name(), voltage, "ramping voltage to zero");
                        for value in linear_range(voltage, 0.0, voltage_step)? {
                            source.set_voltage(value)?;
                            thread::sleep(wait);
                        }
                    }
                }
                SourceFunction::Current => {
                    let current = source.current()?;
                    if current != 0.0 {
                        info!(source = unit.name(), current, "ramping current to zero");
                        for value in linear_range(current, 0.0, current_step)? {
                            source.set_current(value)?;
                            thread::sleep(wait);
                        }
                    }
                }
            }
            thread::sleep(settle);
            source.set_output(false)?;
        }
        source.set_function(SourceFunction::Voltage)?;
        source.set_voltage(0.0)
    }

    /// Ramp an active source to zero, or just set zero if inactive.
    pub fn recover_voltage(&mut self, unit: SourceUnit, ramp: Ramp) -> AppResult<()> {
        let mut source = self.source(unit)?;
        let voltage = source.voltage()?;
        if source.output()? && voltage != 0.0 {
            for value in linear_range(voltage, 0.0, ramp.step)? {
                source.set_voltage(value)?;
                thread::sleep(ramp.wait);
            }
            Ok(())
        } else {
            source.set_voltage(0.0)
        }
    }

    /// Ramp a source from its current level to `target`.
    ///
    /// `before` runs ahead of and `after` behind every step with the step
    /// index and voltage, an `Err` from either stops the ramp. The voltage
    /// range is widened before an increasing ramp and narrowed after a
    /// decreasing one.
    pub fn ramp_voltage<B, A>(
        &mut self,
        unit: SourceUnit,
        target: f64,
        ramp: Ramp,
        mut before: B,
        mut after: A,
    ) -> RunResult<()>
    where
        B: FnMut(&mut Station, usize, f64) -> RunResult<()>,
        A: FnMut(&mut Station, usize, f64) -> RunResult<()>,
    {
        let begin = self.source(unit)?.voltage()?;
        let increasing = target.abs() >= begin.abs();
        info!(source = unit.name(), begin, end = target, step = ramp.step, "ramp voltage");
        if increasing {
            self.source(unit)?.set_voltage_range(target)?;
        }
        for (index, voltage) in linear_range(begin, target, ramp.step)?.into_iter().enumerate() {
            before(self, index, voltage)?;
            self.source(unit)?.set_voltage(voltage)?;
            thread::sleep(ramp.wait);
            after(self, index, voltage)?;
        }
        if !increasing {
            self.source(unit)?.set_voltage_range(target)?;
        }
        Ok(())
    }
}

/// Hook that never interrupts a ramp.
pub fn no_hook(_: &mut Station, _: usize, _: f64) -> RunResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchConfig;
    use crate::error::RunError;
    use crate::hardware::sim::SimBench;
    use crate::station::StationSettings;

    fn station(bench: &SimBench) -> Station {
        let config = BenchConfig {
            resources: SimBench::resources(),
            station: StationSettings::immediate(),
            ..BenchConfig::default()
        };
        let mut station = Station::new(bench.registry(), &config).unwrap();
        station.open_resources().unwrap();
        station
    }

    #[test]
    fn test_safe_recover_ramps_active_voltage() {
        let bench = SimBench::new();
        {
            let mut bias = bench.bias_smu.lock();
            bias.output = true;
            bias.voltage = -60.0;
        }
        let mut station = station(&bench);
        let mut events = station.subscribe();
        station.safe_recover(SourceUnit::Bias).unwrap();

        let bias = bench.bias_smu.lock();
        assert_eq!(bias.voltage_log, vec![-60.0, -35.0, -10.0, 0.0, 0.0]);
        assert!(!bias.output);
        assert_eq!(bias.function, SourceFunction::Voltage);
        assert_eq!(
            events.try_recv().unwrap(),
            StationEvent::BiasVoltageChanged(-60.0)
        );
    }

    #[test]
    fn test_safe_recover_inactive_only_sets_zero() {
        let bench = SimBench::new();
        bench.smu.lock().voltage = 5.0;
        let mut station = station(&bench);
        station.safe_recover(SourceUnit::Smu).unwrap();
        assert_eq!(bench.smu.lock().voltage_log, vec![0.0]);
    }

    #[test]
    fn test_ramp_sets_range_before_increasing() {
        let bench = SimBench::new();
        let mut station = station(&bench);
        let mut seen = Vec::new();
        station
            .ramp_voltage(
                SourceUnit::Bias,
                -20.0,
                Ramp::default(),
                |station, _, _| {
                    seen.push(station.source(SourceUnit::Bias)?.voltage()?);
                    Ok(())
                },
                no_hook,
            )
            .unwrap();
        let bias = bench.bias_smu.lock();
        assert_eq!(bias.voltage_log, vec![0.0, -10.0, -20.0]);
        assert_eq!(bias.voltage_range, Some(20.0));
        assert_eq!(seen, vec![0.0, 0.0, -10.0]);
    }

    #[test]
    fn test_ramp_hook_stops_ramp() {
        let bench = SimBench::new();
        let mut station = station(&bench);
        let result = station.ramp_voltage(
            SourceUnit::Smu,
            5.0,
            Ramp::default().with_step(1.0),
            no_hook,
            |_, index, _| {
                if index == 2 {
                    Err(RunError::Aborted)
                } else {
                    Ok(())
                }
            },
        );
        assert_eq!(result, Err(RunError::Aborted));
        assert_eq!(bench.smu.lock().voltage_log, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_recover_voltage() {
        let bench = SimBench::new();
        {
            let mut smu = bench.smu.lock();
            smu.output = true;
            smu.voltage = 20.0;
        }
        let mut station = station(&bench);
        station
            .recover_voltage(SourceUnit::Smu, Ramp::default())
            .unwrap();
        let smu = bench.smu.lock();
        assert_eq!(smu.voltage_log, vec![20.0, 10.0, 0.0]);
        assert!(smu.output);
    }

    #[test]
    fn test_check_compliance() {
        let bench = SimBench::new();
        bench.smu.lock().compliance_tripped = true;
        let mut station = station(&bench);
        let err = station.source(SourceUnit::Smu).unwrap().check_compliance().unwrap_err();
        assert!(err.is_compliance());
    }
}
