//! Capacitor discharge through the SMU front terminals.
//!
//! The discharge relay is asserted, the SMU sources current at its front
//! terminals and the measured voltage is sampled until its mean drops to the
//! threshold. Terminal, function and relay are restored on every exit path.

use super::{SourceUnit, Station};
use crate::error::AppResult;
use crate::hardware::{SourceFunction, Terminal};
use crate::util::{stats, Timer};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Discharge sampling and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DischargeSettings {
    /// Voltage samples per check.
    pub samples: usize,
    /// Delay between samples.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Highest mean voltage considered discharged.
    pub threshold: f64,
    /// Ceiling for the whole discharge.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Settle time after switching.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for DischargeSettings {
    fn default() -> Self {
        Self {
            samples: 8,
            interval: Duration::from_millis(250),
            threshold: 0.3,
            timeout: Duration::from_secs(10),
            settle: Duration::from_secs(1),
        }
    }
}

impl Station {
    /// Recover the bias source, then discharge.
    pub fn safe_discharge(&mut self) -> AppResult<bool> {
        self.safe_recover(SourceUnit::Bias)?;
        info!("discharge capacitor");
        let discharged = self.discharge()?;
        info!(discharged, "discharge capacitor done");
        Ok(discharged)
    }

    /// Discharge the capacitor.
    ///
    /// Returns `false` if the voltage did not drop below the threshold before
    /// the timeout. Relay and SMU state are restored in any case.
    pub fn discharge(&mut self) -> AppResult<bool> {
        let settings = self.settings.discharge.clone();
        self.environ.set_discharge(true)?;
        let outcome = self.discharge_cycle(&settings);
        let restored = self.restore_after_discharge();
        let released = self.environ.set_discharge(false);
        thread::sleep(settings.settle);
        let discharged = outcome?;
        restored?;
        released?;
        if !discharged {
            error!(timeout = settings.timeout.as_secs_f64(), "capacitor discharge timeout");
        }
        Ok(discharged)
    }

    fn discharge_cycle(&mut self, settings: &DischargeSettings) -> AppResult<bool> {
        {
            let mut smu = self.source(SourceUnit::Smu)?;
            smu.set_terminal(Terminal::Front)?;
            smu.set_function(SourceFunction::Current)?;
            smu.set_output(true)?;
            smu.check_errors()?;
        }
        thread::sleep(settings.settle);
        let timer = Timer::new();
        loop {
            if self.check_discharged(settings)? {
                return Ok(true);
            }
            if timer.delta() > settings.timeout {
                return Ok(false);
            }
        }
    }

    fn check_discharged(&mut self, settings: &DischargeSettings) -> AppResult<bool> {
        let mut smu = self.source(SourceUnit::Smu)?;
        let mut samples = Vec::with_capacity(settings.samples);
        for _ in 0..settings.samples {
            samples.push(smu.read_voltage()?);
            thread::sleep(settings.interval);
        }
        Ok(stats::mean(&samples).abs() <= settings.threshold)
    }

    fn restore_after_discharge(&mut self) -> AppResult<()> {
        let mut smu = self.source(SourceUnit::Smu)?;
        let output = smu.set_output(false);
        let function = smu.set_function(SourceFunction::Voltage);
        let terminal = smu.set_terminal(Terminal::Rear);
        output?;
        function?;
        terminal?;
        smu.check_errors()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BenchConfig;
    use crate::hardware::sim::SimBench;
    use crate::hardware::{SourceFunction, Terminal};
    use crate::station::{Station, StationSettings};

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
    fn test_discharge_restores_state() {
        let bench = SimBench::new();
        bench.smu.lock().residual_voltage = 4.0;
        let mut station = station(&bench);
        assert!(station.discharge().unwrap());

        let smu = bench.smu.lock();
        assert!(!smu.output);
        assert_eq!(smu.function, SourceFunction::Voltage);
        assert_eq!(smu.terminal, Terminal::Rear);
        assert_eq!(bench.environ.lock().discharge_log, vec![true, false]);
    }

    #[test]
    fn test_discharge_timeout_still_restores() {
        let bench = SimBench::new();
        bench.smu.lock().residual_voltage = f64::INFINITY;
        let mut station = station(&bench);
        assert!(!station.discharge().unwrap());

        let smu = bench.smu.lock();
        assert!(!smu.output);
        assert_eq!(smu.terminal, Terminal::Rear);
        assert_eq!(bench.environ.lock().discharge_log, vec![true, false]);
    }

    #[test]
    fn test_discharge_error_still_releases_relay() {
        let bench = SimBench::new();
        bench.smu.lock().errors.push_back(crate::hardware::InstrumentError {
            code: -222,
            message: "Data out of range".into(),
        });
        let mut station = station(&bench);
        assert!(station.discharge().is_err());
        assert_eq!(bench.environ.lock().discharge_log, vec![true, false]);
        assert_eq!(bench.smu.lock().terminal, Terminal::Rear);
    }
}
