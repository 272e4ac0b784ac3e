//! Station facade
//!
//! The station owns every instrument link that is only ever driven from the
//! sequence thread (source meters, LCR meter, electrometer, switch matrices)
//! and holds the controllers of the table, the needle stage and the
//! environment box. It wraps them behind safety oriented operations:
//!
//! - [`Station::safe_initialize`]: identity check, sources to zero, switches
//!   released, default measurement modes, discharge, box preconditions.
//! - [`Station::switch_apply`]: minimal open-then-close channel diff.
//! - [`Station::ramp_voltage`]: stepped voltage changes with per-step hooks.
//! - [`Station::safe_discharge`]: capacitor discharge through the SMU.
//! - [`Station::finalize`]: best effort return to a safe idle state.
//!
//! Instrument drivers are opened by [`Station::open_resources`] and closed by
//! [`Station::close_resources`]. Accessing an instrument that is not open is a
//! `Configuration` error.

mod discharge;
mod source;

pub use discharge::DischargeSettings;
pub use source::{no_hook, Ramp, Source, SourceUnit};

use crate::config::{BenchConfig, INSTRUMENT_RESOURCES};
use crate::controller::{EnvironController, NeedleController, TableController};
use crate::error::{AppResult, BenchError};
use crate::hardware::{
    DriverRegistry, Electrometer, InstrumentError, LcrMeter, ResourceConfig, SourceMeter,
    SwitchMatrix,
};
use crate::util::{stats, Timer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Notifications emitted by the station.
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    /// The bias source voltage level changed.
    BiasVoltageChanged(f64),
}

/// Sliding window filter for LCR readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcrFilterSettings {
    /// Readings before giving up.
    pub maximum: usize,
    /// Accepted relative standard deviation.
    pub threshold: f64,
    /// Window size.
    pub size: usize,
    /// Delay between readings.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for LcrFilterSettings {
    fn default() -> Self {
        Self {
            maximum: 64,
            threshold: 0.005,
            size: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Timings and limits of station procedures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSettings {
    /// Voltage step when recovering an active source.
    pub recover_voltage_step: f64,
    /// Current step when recovering an active current source.
    pub recover_current_step: f64,
    /// Delay after each recover step.
    #[serde(with = "humantime_serde")]
    pub recover_wait: Duration,
    /// Delay before switching a recovered output off.
    #[serde(with = "humantime_serde")]
    pub recover_settle: Duration,
    /// Default ramp for [`Station::recover_voltage`] and measurement ramps.
    pub ramp: Ramp,
    /// Delay after an instrument reset.
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
    /// Capacitor discharge.
    pub discharge: DischargeSettings,
    /// Ceiling for an LCR open correction.
    #[serde(with = "humantime_serde")]
    pub open_correction_timeout: Duration,
    /// Poll interval while waiting for the open correction.
    #[serde(with = "humantime_serde")]
    pub open_correction_poll: Duration,
    /// LCR reading filter.
    pub lcr_filter: LcrFilterSettings,
    /// LCR cable correction length in meters.
    pub lcr_correction_length: u32,
    /// Highest illuminance accepted in a closed box.
    pub max_box_lux: f64,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            recover_voltage_step: 25.0,
            recover_current_step: 2.5e-3,
            recover_wait: Duration::from_millis(500),
            recover_settle: Duration::from_secs(1),
            ramp: Ramp::default(),
            reset_settle: Duration::from_millis(500),
            discharge: DischargeSettings::default(),
            open_correction_timeout: Duration::from_secs(16),
            open_correction_poll: Duration::from_millis(500),
            lcr_filter: LcrFilterSettings::default(),
            lcr_correction_length: 4,
            max_box_lux: 0.0,
        }
    }
}

impl StationSettings {
    /// Settings without any delays, for simulated benches.
    pub fn immediate() -> Self {
        Self {
            recover_wait: Duration::ZERO,
            recover_settle: Duration::ZERO,
            ramp: Ramp {
                wait: Duration::ZERO,
                ..Ramp::default()
            },
            reset_settle: Duration::ZERO,
            discharge: DischargeSettings {
                interval: Duration::ZERO,
                settle: Duration::ZERO,
                timeout: Duration::from_millis(200),
                ..DischargeSettings::default()
            },
            open_correction_poll: Duration::from_millis(1),
            lcr_filter: LcrFilterSettings {
                delay: Duration::ZERO,
                ..LcrFilterSettings::default()
            },
            ..Self::default()
        }
    }
}

/// Switch matrix selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchUnit {
    /// High voltage matrix.
    Hv,
    /// Low voltage matrix.
    Lv,
}

impl SwitchUnit {
    /// Logical resource name.
    pub fn name(self) -> &'static str {
        match self {
            SwitchUnit::Hv => "hv_switch",
            SwitchUnit::Lv => "lv_switch",
        }
    }
}

/// Aggregate of the bench hardware.
pub struct Station {
    registry: DriverRegistry,
    resources: BTreeMap<String, ResourceConfig>,
    settings: StationSettings,
    smu: Option<Box<dyn SourceMeter>>,
    bias_smu: Option<Box<dyn SourceMeter>>,
    lcr: Option<Box<dyn LcrMeter>>,
    elm: Option<Box<dyn Electrometer>>,
    hv_switch: Option<Box<dyn SwitchMatrix>>,
    lv_switch: Option<Box<dyn SwitchMatrix>>,
    environ: EnvironController,
    table: Option<TableController>,
    needle: Option<NeedleController>,
    events: broadcast::Sender<StationEvent>,
}

impl Station {
    /// Start the controllers configured in `config`.
    ///
    /// The environment box (`environ`) is mandatory, `table` and `tango` are
    /// started when present. Instruments stay closed until
    /// [`Station::open_resources`].
    pub fn new(registry: DriverRegistry, config: &BenchConfig) -> AppResult<Self> {
        let environ = EnvironController::start(
            "environ",
            &registry,
            config.resource("environ")?,
            config.environ.clone(),
        )?;
        let table = match config.resources.get("table") {
            Some(resource) => Some(TableController::start(
                "table",
                &registry,
                resource.clone(),
                config.table.clone(),
            )?),
            None => None,
        };
        let needle = match config.resources.get("tango") {
            Some(resource) => Some(NeedleController::start(
                "tango",
                &registry,
                resource.clone(),
                config.needle.clone(),
            )?),
            None => None,
        };
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            registry,
            resources: config.resources.clone(),
            settings: config.station.clone(),
            smu: None,
            bias_smu: None,
            lcr: None,
            elm: None,
            hv_switch: None,
            lv_switch: None,
            environ,
            table,
            needle,
            events,
        })
    }

    /// Station timings.
    pub fn settings(&self) -> &StationSettings {
        &self.settings
    }

    /// Subscribe to station notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    /// Environment box controller.
    pub fn environ(&self) -> &EnvironController {
        &self.environ
    }

    /// Table controller, if configured.
    pub fn table(&self) -> Option<&TableController> {
        self.table.as_ref()
    }

    /// Needle controller, if configured.
    pub fn needle(&self) -> Option<&NeedleController> {
        self.needle.as_ref()
    }

    // ---------------------------------------------------------------------
    // Resource lifecycle
    // ---------------------------------------------------------------------

    /// Open every configured instrument link.
    pub fn open_resources(&mut self) -> AppResult<()> {
        let registry = &self.registry;
        let resources = &self.resources;
        for name in INSTRUMENT_RESOURCES {
            let Some(config) = resources.get(name) else {
                warn!(resource = name, "resource not configured");
                continue;
            };
            info!(resource = name, model = %config.model, address = %config.address, "open resource");
            match name {
                "smu" => self.smu = Some(registry.sources.create(name, config)?),
                "bias_smu" => self.bias_smu = Some(registry.sources.create(name, config)?),
                "lcr" => self.lcr = Some(registry.lcrs.create(name, config)?),
                "elm" => self.elm = Some(registry.electrometers.create(name, config)?),
                "hv_switch" => self.hv_switch = Some(registry.switches.create(name, config)?),
                "lv_switch" => self.lv_switch = Some(registry.switches.create(name, config)?),
                _ => {}
            }
        }
        Ok(())
    }

    /// Close every open instrument link.
    ///
    /// Close failures are logged, the first one is returned after all links
    /// were released.
    pub fn close_resources(&mut self) -> AppResult<()> {
        let mut results = Vec::new();
        if let Some(mut driver) = self.smu.take() {
            results.push(("smu", driver.close()));
        }
        if let Some(mut driver) = self.bias_smu.take() {
            results.push(("bias_smu", driver.close()));
        }
        if let Some(mut driver) = self.lcr.take() {
            results.push(("lcr", driver.close()));
        }
        if let Some(mut driver) = self.elm.take() {
            results.push(("elm", driver.close()));
        }
        if let Some(mut driver) = self.hv_switch.take() {
            results.push(("hv_switch", driver.close()));
        }
        if let Some(mut driver) = self.lv_switch.take() {
            results.push(("lv_switch", driver.close()));
        }
        let mut first = None;
        for (name, result) in results {
            info!(resource = name, "closed resource");
            if let Err(err) = result {
                error!(resource = name, error = %err, "failed to close resource");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Query and log the identity of every instrument.
    pub fn check_identities(&mut self) -> AppResult<()> {
        let identities = [
            ("smu", self.smu.as_mut().map(|d| d.identify())),
            ("bias_smu", self.bias_smu.as_mut().map(|d| d.identify())),
            ("lcr", self.lcr.as_mut().map(|d| d.identify())),
            ("elm", self.elm.as_mut().map(|d| d.identify())),
            ("hv_switch", self.hv_switch.as_mut().map(|d| d.identify())),
            ("lv_switch", self.lv_switch.as_mut().map(|d| d.identify())),
        ];
        for (name, identity) in identities {
            let identity = identity.ok_or_else(|| not_open(name))??;
            info!(resource = name, identity = %identity, "identified");
        }
        let identity = self.environ.identify()?;
        info!(resource = "environ", identity = %identity, "identified");
        Ok(())
    }

    /// Bring the bench into a defined state before a run.
    ///
    /// Fails on the first unmet precondition.
    pub fn safe_initialize(&mut self) -> AppResult<()> {
        info!("safe initialize station");
        self.check_identities()?;
        self.safe_recover_box()?;
        self.safe_recover(SourceUnit::Smu)?;
        self.safe_recover(SourceUnit::Bias)?;
        self.switch_release(SwitchUnit::Hv)?;
        self.switch_release(SwitchUnit::Lv)?;
        self.initialize_smu()?;
        self.initialize_bias()?;
        self.initialize_lcr()?;
        self.initialize_elm()?;
        self.safe_discharge()?;
        self.validate_box_state()?;
        info!("safe initialize station done");
        Ok(())
    }

    /// Return everything to a safe idle state and close the instruments.
    ///
    /// Every step is attempted even if an earlier one failed, the first
    /// failure is returned.
    pub fn finalize(&mut self) -> AppResult<()> {
        info!("finalize station");
        let results = [
            self.safe_recover(SourceUnit::Smu),
            self.safe_recover(SourceUnit::Bias),
            self.switch_release(SwitchUnit::Hv),
            self.switch_release(SwitchUnit::Lv),
            self.safe_discharge().map(|_| ()),
            self.close_resources(),
        ];
        let mut first = None;
        for result in results {
            if let Err(err) = result {
                error!(error = %err, "finalize step failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Close instruments and stop every controller thread.
    pub fn shutdown(&mut self) {
        if let Err(err) = self.close_resources() {
            warn!(error = %err, "failed to close resources on shutdown");
        }
        if let Some(table) = self.table.as_mut() {
            table.shutdown();
        }
        if let Some(needle) = self.needle.as_mut() {
            needle.shutdown();
        }
        self.environ.shutdown();
    }

    fn initialize_smu(&mut self) -> AppResult<()> {
        info!("initialize smu");
        let mut smu = self.source(SourceUnit::Smu)?;
        smu.reset()?;
        smu.clear()?;
        smu.set_terminal(crate::hardware::Terminal::Rear)?;
        smu.set_beeper(false)?;
        smu.check_errors()
    }

    fn initialize_bias(&mut self) -> AppResult<()> {
        info!("initialize bias smu");
        self.source(SourceUnit::Bias)?.reset()?;
        thread::sleep(self.settings.reset_settle);
        let mut bias = self.source(SourceUnit::Bias)?;
        bias.set_function(crate::hardware::SourceFunction::Voltage)?;
        bias.set_beeper(false)?;
        bias.check_errors()
    }

    fn initialize_lcr(&mut self) -> AppResult<()> {
        info!("initialize lcr");
        let settle = self.settings.reset_settle;
        let length = self.settings.lcr_correction_length;
        let lcr = self.lcr()?;
        lcr.reset()?;
        thread::sleep(settle);
        lcr.set_function_cp_rp()?;
        lcr.set_long_integration()?;
        lcr.set_correction_length(length)?;
        lcr.set_open_correction(false)?;
        self.lcr_check_errors()
    }

    fn initialize_elm(&mut self) -> AppResult<()> {
        info!("initialize electrometer");
        let settle = self.settings.reset_settle;
        let elm = self.elm()?;
        elm.reset()?;
        thread::sleep(settle);
        elm.configure_current()?;
        elm.set_zero_check(true)?;
        self.elm_check_errors()
    }

    // ---------------------------------------------------------------------
    // Switch matrices
    // ---------------------------------------------------------------------

    fn switch(&mut self, unit: SwitchUnit) -> AppResult<&mut dyn SwitchMatrix> {
        let driver = match unit {
            SwitchUnit::Hv => self.hv_switch.as_deref_mut(),
            SwitchUnit::Lv => self.lv_switch.as_deref_mut(),
        };
        match driver {
            Some(driver) => Ok(driver),
            None => Err(not_open(unit.name())),
        }
    }

    /// Close exactly `channels`.
    ///
    /// Channels no longer requested are opened first, newly requested ones
    /// are closed afterwards. Empty differences issue no command.
    pub fn switch_apply(&mut self, unit: SwitchUnit, channels: &BTreeSet<String>) -> AppResult<()> {
        let switch = self.switch(unit)?;
        let closed = switch.closed_channels()?;
        let to_open: BTreeSet<String> = closed.difference(channels).cloned().collect();
        let to_close: BTreeSet<String> = channels.difference(&closed).cloned().collect();
        if !to_open.is_empty() {
            info!(switch = unit.name(), channels = ?to_open, "open channels");
            switch.open_channels(&to_open)?;
        }
        if !to_close.is_empty() {
            info!(switch = unit.name(), channels = ?to_close, "close channels");
            switch.close_channels(&to_close)?;
        }
        let closed = switch.closed_channels()?;
        if &closed != channels {
            return Err(BenchError::HardFault(format!(
                "{} channel mismatch, expected {:?}, closed {:?}",
                unit.name(),
                channels,
                closed
            )));
        }
        Ok(())
    }

    /// Open every channel and verify.
    pub fn switch_release(&mut self, unit: SwitchUnit) -> AppResult<()> {
        info!(switch = unit.name(), "release all channels");
        let switch = self.switch(unit)?;
        switch.open_all()?;
        let closed = switch.closed_channels()?;
        if !closed.is_empty() {
            return Err(BenchError::HardFault(format!(
                "failed to release {} channels: {:?}",
                unit.name(),
                closed
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // LCR meter
    // ---------------------------------------------------------------------

    fn lcr(&mut self) -> AppResult<&mut dyn LcrMeter> {
        match self.lcr.as_deref_mut() {
            Some(lcr) => Ok(lcr),
            None => Err(not_open("lcr")),
        }
    }

    /// Drain the LCR error queue, failing if it was not empty.
    pub fn lcr_check_errors(&mut self) -> AppResult<()> {
        let lcr = self.lcr()?;
        check_errors("lcr", || lcr.next_error())
    }

    /// Run an open correction and wait for completion.
    pub fn lcr_perform_open_correction(&mut self) -> AppResult<()> {
        let timeout = self.settings.open_correction_timeout;
        let poll = self.settings.open_correction_poll;
        info!("perform lcr open correction");
        let lcr = self.lcr()?;
        lcr.execute_open_correction()?;
        let timer = Timer::new();
        while !lcr.operation_complete()? {
            if timer.delta() > timeout {
                return Err(BenchError::HardFault(format!(
                    "lcr open correction timeout ({:.1} s)",
                    timeout.as_secs_f64()
                )));
            }
            thread::sleep(poll);
        }
        self.lcr_check_errors()
    }

    /// Enable or disable the open correction and verify the read-back.
    pub fn lcr_enable_open_correction(&mut self, enabled: bool) -> AppResult<()> {
        let lcr = self.lcr()?;
        lcr.set_open_correction(enabled)?;
        if lcr.open_correction()? != enabled {
            return Err(BenchError::HardFault(format!(
                "failed to {} lcr open correction",
                if enabled { "enable" } else { "disable" }
            )));
        }
        Ok(())
    }

    /// Set AC amplitude in volts.
    pub fn lcr_set_amplitude(&mut self, volts: f64) -> AppResult<()> {
        self.lcr()?.set_amplitude(volts)
    }

    /// Set AC frequency in hertz.
    pub fn lcr_set_frequency(&mut self, hertz: f64) -> AppResult<()> {
        self.lcr()?.set_frequency(hertz)
    }

    /// Single primary/secondary reading.
    pub fn lcr_acquire_reading(&mut self) -> AppResult<(f64, f64)> {
        self.lcr()?.measure()
    }

    /// Read until the relative standard deviation of the last readings drops
    /// below the configured threshold.
    ///
    /// Returns the last reading, also when the maximum count was reached.
    pub fn lcr_acquire_filter_reading(&mut self) -> AppResult<(f64, f64)> {
        let filter = self.settings.lcr_filter.clone();
        let lcr = self.lcr()?;
        let mut window: Vec<f64> = Vec::with_capacity(filter.size + 1);
        let mut reading = (0.0, 0.0);
        for _ in 0..filter.maximum {
            reading = lcr.measure()?;
            window.push(reading.0);
            if window.len() > filter.size {
                window.remove(0);
            }
            if window.len() >= filter.size && stats::std_mean_filter(&window, filter.threshold) {
                return Ok(reading);
            }
            thread::sleep(filter.delay);
        }
        warn!(maximum = filter.maximum, "maximum lcr sample count reached");
        Ok(reading)
    }

    // ---------------------------------------------------------------------
    // Electrometer
    // ---------------------------------------------------------------------

    fn elm(&mut self) -> AppResult<&mut dyn Electrometer> {
        match self.elm.as_deref_mut() {
            Some(elm) => Ok(elm),
            None => Err(not_open("elm")),
        }
    }

    /// Drain the electrometer error queue, failing if it was not empty.
    pub fn elm_check_errors(&mut self) -> AppResult<()> {
        let elm = self.elm()?;
        check_errors("elm", || elm.next_error())
    }

    /// Enable or disable zero check.
    pub fn elm_set_zero_check(&mut self, enabled: bool) -> AppResult<()> {
        self.elm()?.set_zero_check(enabled)
    }

    /// Read current in amperes.
    pub fn elm_read_current(&mut self) -> AppResult<f64> {
        self.elm()?.read_current()
    }

    // ---------------------------------------------------------------------
    // Environment box
    // ---------------------------------------------------------------------

    /// Switch box and microscope lights off.
    pub fn safe_recover_box(&mut self) -> AppResult<()> {
        info!("dimming box lights");
        self.environ.set_box_light(false)?;
        self.environ.set_microscope_light(false)
    }

    /// Switch box and microscope lights on.
    pub fn box_switch_lights_on(&mut self) -> AppResult<()> {
        info!("switching box and microscope lights on");
        self.environ.set_box_light(true)?;
        self.environ.set_microscope_light(true)
    }

    /// Toggle the "test running" indicator.
    pub fn set_test_running(&mut self, enabled: bool) -> AppResult<()> {
        self.environ.set_test_running(enabled)
    }

    /// Require a closed, dark box and log the climate.
    pub fn validate_box_state(&mut self) -> AppResult<()> {
        if self.environ.box_door_open()? {
            return Err(BenchError::HardFault("box door not closed".into()));
        }
        if self.environ.box_light()? {
            return Err(BenchError::HardFault("box light is switched on".into()));
        }
        let lux = self.environ.box_lux()?;
        if lux > self.settings.max_box_lux {
            return Err(BenchError::HardFault(format!("box light is present ({lux} lux)")));
        }
        let snapshot = self.environ.refresh()?;
        info!(
            chuck_temperature = snapshot.chuck_temperature,
            chuck_block_temperature = snapshot.chuck_block_temperature,
            box_humidity = snapshot.box_humidity,
            "box state validated"
        );
        Ok(())
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn not_open(name: &str) -> BenchError {
    BenchError::Configuration(format!("resource '{name}' is not open"))
}

/// Drain an instrument error queue.
pub(crate) fn check_errors<F>(name: &str, mut next: F) -> AppResult<()>
where
    F: FnMut() -> AppResult<Option<InstrumentError>>,
{
    let mut errors = Vec::new();
    while let Some(err) = next()? {
        errors.push(err.to_string());
        if errors.len() >= 32 {
            break;
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BenchError::HardFault(format!("{name} error: {}", errors.join("; "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimBench, SwitchOp};
    use crate::hardware::InstrumentError;

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

    fn channels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_switch_apply_opens_before_closing() {
        let bench = SimBench::new();
        bench.hv_switch.lock().closed = channels(&["A1", "A2", "B1"]);
        let mut station = station(&bench);

        station
            .switch_apply(SwitchUnit::Hv, &channels(&["A2", "C1", "C2"]))
            .unwrap();

        let state = bench.hv_switch.lock();
        assert_eq!(
            state.ops,
            vec![
                SwitchOp::Open(channels(&["A1", "B1"])),
                SwitchOp::Close(channels(&["C1", "C2"])),
            ]
        );
        assert_eq!(state.closed, channels(&["A2", "C1", "C2"]));
    }

    #[test]
    fn test_switch_apply_unchanged_issues_nothing() {
        let bench = SimBench::new();
        bench.lv_switch.lock().closed = channels(&["A1"]);
        let mut station = station(&bench);
        station.switch_apply(SwitchUnit::Lv, &channels(&["A1"])).unwrap();
        assert!(bench.lv_switch.lock().ops.is_empty());
    }

    #[test]
    fn test_switch_apply_verifies_result() {
        let bench = SimBench::new();
        bench.hv_switch.lock().stuck_open = channels(&["C1"]);
        let mut station = station(&bench);
        let err = station
            .switch_apply(SwitchUnit::Hv, &channels(&["C1"]))
            .unwrap_err();
        assert!(matches!(err, BenchError::HardFault(_)));
    }

    #[test]
    fn test_switch_release() {
        let bench = SimBench::new();
        bench.hv_switch.lock().closed = channels(&["A1"]);
        let mut station = station(&bench);
        station.switch_release(SwitchUnit::Hv).unwrap();
        assert!(bench.hv_switch.lock().closed.is_empty());
        assert_eq!(bench.hv_switch.lock().ops, vec![SwitchOp::OpenAll]);
    }

    #[test]
    fn test_safe_initialize_on_idle_bench() {
        let bench = SimBench::new();
        let mut station = station(&bench);
        station.safe_initialize().unwrap();
        assert_eq!(bench.smu.lock().terminal, crate::hardware::Terminal::Rear);
        assert!(!bench.smu.lock().beeper);
        assert!(bench.elm.lock().zero_check);
        assert!(!bench.lcr.lock().open_correction);
        assert_eq!(bench.environ.lock().discharge_log, vec![true, false]);
    }

    #[test]
    fn test_safe_initialize_rejects_open_door() {
        let bench = SimBench::new();
        bench.environ.lock().snapshot.box_door_open = true;
        let mut station = station(&bench);
        let err = station.safe_initialize().unwrap_err();
        assert_eq!(err, BenchError::HardFault("box door not closed".into()));
    }

    #[test]
    fn test_instrument_error_queue_is_fatal() {
        let bench = SimBench::new();
        let mut station = station(&bench);
        bench.lcr.lock().errors.push_back(InstrumentError {
            code: -113,
            message: "Undefined header".into(),
        });
        let err = station.lcr_check_errors().unwrap_err();
        assert!(err.to_string().contains("-113"));
        assert!(station.lcr_check_errors().is_ok());
    }

    #[test]
    fn test_open_correction_waits_for_completion() {
        let bench = SimBench::new();
        bench.lcr.lock().busy_reads = 3;
        let mut station = station(&bench);
        station.lcr_perform_open_correction().unwrap();
        assert_eq!(bench.lcr.lock().open_corrections, 1);
        assert_eq!(bench.lcr.lock().busy_reads, 0);
    }

    #[test]
    fn test_open_correction_timeout() {
        let bench = SimBench::new();
        bench.lcr.lock().busy_reads = usize::MAX;
        let mut station = station(&bench);
        station.settings.open_correction_timeout = Duration::from_millis(20);
        let err = station.lcr_perform_open_correction().unwrap_err();
        assert!(matches!(err, BenchError::HardFault(_)));
    }

    #[test]
    fn test_filter_reading_on_stable_values() {
        let bench = SimBench::new();
        {
            let mut lcr = bench.lcr.lock();
            lcr.cp = 1e-12;
            lcr.rp = 1e6;
        }
        let mut station = station(&bench);
        assert_eq!(station.lcr_acquire_filter_reading().unwrap(), (1e-12, 1e6));
    }

    #[test]
    fn test_finalize_closes_everything() {
        let bench = SimBench::new();
        let mut station = station(&bench);
        station.finalize().unwrap();
        assert_eq!(bench.smu.lock().closed, 1);
        assert_eq!(bench.bias_smu.lock().closed, 1);
        let err = station.elm_read_current().unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }
}
