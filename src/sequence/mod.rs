//! Sequence orchestration
//!
//! Walks a [`Sequence`] of measurement items and per strip items, contacts
//! strips through the table controller and retries failed strip items in
//! place (remeasure) and by repositioning (recontact). The orchestrator runs
//! on its own thread, see [`SequenceRunner`].

mod contact;
mod control;
mod events;
mod item;
mod pattern;
mod record;
mod runner;
mod strategy;

pub use contact::ContactPlan;
pub use control::RunControl;
pub use events::{EventSink, SequenceEvent};
pub use item::{ItemState, RawParameters, Sequence, SequenceItem};
pub use pattern::{strip_pattern, StripPattern};
pub use record::{NamespaceData, Row, RunRecord, Statistics};
pub use runner::{CompletedRun, SequenceRunner};
pub use strategy::{validate_sequence, RunOptions, RunReport, SequenceStrategy};

use crate::error::{AppResult, BenchError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy and contact approach of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    /// In-place repetitions of a strip item after an analysis failure.
    pub remeasure_attempts: usize,
    /// Repositioning attempts per strip.
    pub recontact_attempts: usize,
    /// X offsets in micrometers cycled over recontact attempts.
    pub recontact_offsets: Vec<f64>,
    /// Z steps of the final contact approach in micrometers.
    pub approach_steps: Vec<f64>,
    /// Delay before every approach step.
    #[serde(with = "humantime_serde")]
    pub approach_delay: Duration,
    /// Z retraction after a strip in micrometers.
    pub retract_offset: f64,
    /// Accepted deviation of the contact position in micrometers.
    pub position_tolerance: f64,
    /// Additional needles of the probe card.
    pub needles: usize,
    /// Never move the table (bench debugging).
    pub skip_table: bool,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            remeasure_attempts: 0,
            recontact_attempts: 0,
            recontact_offsets: vec![5.0, -5.0, 2.0, -2.0],
            approach_steps: vec![20.0, 15.0, 10.0, 5.0],
            approach_delay: Duration::from_millis(250),
            retract_offset: 800.0,
            position_tolerance: 1.0,
            needles: 2,
            skip_table: false,
        }
    }
}

impl SequenceSettings {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if self.recontact_offsets.is_empty() {
            return Err(BenchError::Configuration(
                "sequence.recontact_offsets must not be empty".into(),
            ));
        }
        if self.position_tolerance < 0.0 {
            return Err(BenchError::Configuration(
                "sequence.position_tolerance must not be negative".into(),
            ));
        }
        if self.approach_steps.iter().any(|step| !step.is_finite()) {
            return Err(BenchError::Configuration(
                "sequence.approach_steps must be finite".into(),
            ));
        }
        Ok(())
    }

    /// X offset of contact `attempt`, 0 for the first contact.
    ///
    /// Attempts past the end of the list wrap to its first entry, 0 is only
    /// used for the first contact.
    pub fn recontact_offset(&self, attempt: usize) -> f64 {
        if attempt == 0 || self.recontact_offsets.is_empty() {
            return 0.0;
        }
        self.recontact_offsets[(attempt - 1) % self.recontact_offsets.len()]
    }

    /// Total Z distance covered by the approach steps.
    pub fn approach_distance(&self) -> f64 {
        self.approach_steps.iter().map(|step| step.abs()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recontact_offsets_cycle() {
        let settings = SequenceSettings::default();
        let offsets: Vec<f64> = (0..7).map(|attempt| settings.recontact_offset(attempt)).collect();
        assert_eq!(offsets, vec![0.0, 5.0, -5.0, 2.0, -2.0, 5.0, -5.0]);
    }

    #[test]
    fn test_approach_distance() {
        assert_eq!(SequenceSettings::default().approach_distance(), 50.0);
    }

    #[test]
    fn test_rejects_empty_offsets() {
        let settings = SequenceSettings {
            recontact_offsets: Vec::new(),
            ..SequenceSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
