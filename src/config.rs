//! Bench configuration using Figment
//!
//! Configuration is layered from:
//! 1. compiled defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `STRIPSCAN_`.
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! STRIPSCAN_SEQUENCE__REMEASURE_ATTEMPTS=2
//! STRIPSCAN_TABLE__POLL_INTERVAL=50ms
//! STRIPSCAN_RESOURCES__SMU__ADDRESS=GPIB0::16::INSTR
//! ```
//!
//! Durations are written in humantime notation (`"250ms"`, `"2s"`).

use crate::controller::{EnvironSettings, NeedleSettings, TableSettings};
use crate::error::{AppResult, BenchError};
use crate::geometry::Position;
use crate::hardware::ResourceConfig;
use crate::sequence::SequenceSettings;
use crate::station::StationSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STRIPSCAN_";

/// Logical resource names the station expects.
pub const INSTRUMENT_RESOURCES: [&str; 6] = ["smu", "bias_smu", "lcr", "elm", "hv_switch", "lv_switch"];

/// Top-level bench configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Hardware links keyed by logical name.
    pub resources: BTreeMap<String, ResourceConfig>,
    /// Table controller.
    pub table: TableSettings,
    /// Needle controller.
    pub needle: NeedleSettings,
    /// Environment controller.
    pub environ: EnvironSettings,
    /// Station timings.
    pub station: StationSettings,
    /// Orchestrator retry policy and contact approach.
    pub sequence: SequenceSettings,
    /// Measured table positions of the padfile reference pads.
    pub alignment: Vec<Position>,
}

impl BenchConfig {
    /// Figment with defaults, `path` (if given) and environment overrides.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(BenchConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if the file cannot be parsed, a value
    /// has the wrong type or validation fails.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and cross-field consistency.
    pub fn validate(&self) -> AppResult<()> {
        for (name, resource) in &self.resources {
            if resource.model.trim().is_empty() {
                return Err(invalid(format!("resource '{name}' has no model")));
            }
        }
        if self.table.poll_interval.is_zero() {
            return Err(invalid("table.poll_interval must be greater than zero"));
        }
        if self.table.movement_timeout < self.table.poll_interval {
            return Err(invalid("table.movement_timeout must exceed table.poll_interval"));
        }
        if self.table.mailbox_capacity == 0 {
            return Err(invalid("table.mailbox_capacity must be at least 1"));
        }
        if self.needle.poll_interval.is_zero() {
            return Err(invalid("needle.poll_interval must be greater than zero"));
        }
        if self.needle.tolerance < 0.0 {
            return Err(invalid("needle.tolerance must not be negative"));
        }
        if self.environ.interval.is_zero() {
            return Err(invalid("environ.interval must be greater than zero"));
        }
        if self.station.discharge.samples == 0 {
            return Err(invalid("station.discharge.samples must be at least 1"));
        }
        if self.station.lcr_filter.size < 2 {
            return Err(invalid("station.lcr_filter.size must be at least 2"));
        }
        if self.station.lcr_filter.maximum < self.station.lcr_filter.size {
            return Err(invalid("station.lcr_filter.maximum must not be below its size"));
        }
        self.sequence.validate()?;
        if !self.alignment.is_empty() && self.alignment.len() < 3 {
            return Err(invalid(format!(
                "alignment requires 3 reference positions, got {}",
                self.alignment.len()
            )));
        }
        Ok(())
    }

    /// Alignment as a fixed triple, if configured.
    pub fn alignment_points(&self) -> Option<[Position; 3]> {
        match self.alignment.as_slice() {
            [a, b, c, ..] => Some([*a, *b, *c]),
            _ => None,
        }
    }

    /// Link configuration of a resource.
    pub fn resource(&self, name: &str) -> AppResult<ResourceConfig> {
        self.resources
            .get(name)
            .cloned()
            .ok_or_else(|| invalid(format!("missing resource '{name}'")))
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|err| BenchError::Serialization(err.to_string()))
    }
}

fn invalid(message: impl Into<String>) -> BenchError {
    BenchError::Configuration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sequence.recontact_offsets, vec![5.0, -5.0, 2.0, -2.0]);
        assert_eq!(config.table.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_toml_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bench.toml",
                r#"
                alignment = [
                    { x = 0.0, y = 0.0, z = 0.0 },
                    { x = 100.0, y = 0.0, z = 0.0 },
                    { x = 0.0, y = 100.0, z = 0.0 },
                ]

                [resources.smu]
                model = "sim"
                address = "GPIB0::16::INSTR"

                [table]
                poll_interval = "50ms"

                [sequence]
                remeasure_attempts = 3
                "#,
            )?;
            jail.set_env("STRIPSCAN_SEQUENCE__RECONTACT_ATTEMPTS", "4");

            let config = BenchConfig::load(Some(Path::new("bench.toml")))
                .map_err(|err| err.to_string())?;
            assert_eq!(config.table.poll_interval, Duration::from_millis(50));
            assert_eq!(config.sequence.remeasure_attempts, 3);
            assert_eq!(config.sequence.recontact_attempts, 4);
            assert_eq!(config.resources["smu"].address, "GPIB0::16::INSTR");
            assert_eq!(config.resources["smu"].termination, "\r\n");
            assert!(config.alignment_points().is_some());
            Ok(())
        });
    }

    #[test]
    fn test_rejects_short_alignment() {
        let config = BenchConfig {
            alignment: vec![Position::default(); 2],
            ..BenchConfig::default()
        };
        assert!(matches!(config.validate(), Err(BenchError::Configuration(_))));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let mut config = BenchConfig::default();
        config.table.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_resource() {
        let config = BenchConfig::default();
        assert!(matches!(config.resource("smu"), Err(BenchError::Configuration(_))));
    }

    #[test]
    fn test_to_toml() {
        let mut config = BenchConfig::default();
        config
            .resources
            .insert("smu".into(), ResourceConfig::new("sim", "smu"));
        let text = config.to_toml().unwrap();
        assert!(text.contains("[resources.smu]"));
        assert!(text.contains("remeasure_attempts"));
    }
}
