//! Custom error types for the bench.
//!
//! This module defines the primary error type, `BenchError`, shared by the
//! controllers, the station facade and the sequence orchestrator. Using the
//! `thiserror` crate, it provides a centralized and consistent way to classify
//! failures so the orchestrator can decide between retrying, abandoning a strip
//! or aborting the whole run.
//!
//! ## Error Hierarchy
//!
//! - **`HardFault`**: unexpected driver or communication failure, or a non-empty
//!   instrument error queue. Never retried, aborts the run after finalization.
//! - **`ComplianceTripped`**: a source protection limit engaged. The strip item is
//!   abandoned immediately and never retried.
//! - **`AnalysisOutOfRange`**: steady state not reached or a computed value outside
//!   its configured bounds. The only class that enters the remeasure/recontact ladder.
//! - **`MovementTimeout`** / **`RequestTimeout`**: a blocking wait exceeded its wall
//!   clock ceiling. Reported with HardFault severity.
//! - **`Resource`**: a hardware link could not be opened or failed during I/O. Worker
//!   loops treat it as a signal to close and reopen the link.
//! - **`Configuration`**, **`Validation`**, **`Io`**, **`Serialization`**: ambient
//!   failures from config loading, sequence validation and persistence.
//!
//! `BenchError` is `Clone` because a single captured failure may be observed by
//! more than one [`Reply`](crate::request::Reply) holder.
//!
//! Deliberate aborts are not errors. Sequence code returns [`RunError`], whose
//! `Aborted` variant unwinds to the next check point without being reported.

use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

/// Error taxonomy of the bench.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BenchError {
    /// Unexpected driver/communication failure.
    #[error("Hardware fault: {0}")]
    HardFault(String),

    /// Source protection limit reached.
    #[error("Compliance tripped: {0}")]
    ComplianceTripped(String),

    /// Analysis failed or value outside configured bounds.
    #[error("Analysis out of range: {0}")]
    AnalysisOutOfRange(String),

    /// Position never stabilized within the movement timeout.
    #[error("Movement timeout: {0}")]
    MovementTimeout(String),

    /// A queued request did not complete in time.
    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    /// Hardware link open/close/IO failure.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid sequence, padfile or parameter set.
    #[error("Validation error: {0}")]
    Validation(String),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Encoding/decoding failure of persisted data.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BenchError {
    /// Only analysis failures are worth measuring again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BenchError::AnalysisOutOfRange(_))
    }

    /// Returns true for source protection trips.
    pub fn is_compliance(&self) -> bool {
        matches!(self, BenchError::ComplianceTripped(_))
    }

    /// Returns true if the hardware link should be closed and reopened.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, BenchError::Resource(_))
    }

    /// Returns true for everything that must abort a run.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_compliance()
    }
}

impl From<std::io::Error> for BenchError {
    fn from(err: std::io::Error) -> Self {
        BenchError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(err: serde_json::Error) -> Self {
        BenchError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BenchError {
    fn from(err: serde_yaml::Error) -> Self {
        BenchError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for BenchError {
    fn from(err: figment::Error) -> Self {
        BenchError::Configuration(err.to_string())
    }
}

/// Control flow of sequence and measurement code.
///
/// An abort request unwinds through the same `?` chain as a fault but is never
/// reported as one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    /// The operator requested an abort.
    #[error("Abort requested")]
    Aborted,

    /// A classified failure.
    #[error(transparent)]
    Fault(#[from] BenchError),
}

impl RunError {
    /// Returns the underlying fault, if any.
    pub fn fault(&self) -> Option<&BenchError> {
        match self {
            RunError::Aborted => None,
            RunError::Fault(err) => Some(err),
        }
    }
}

/// Result alias for sequence and measurement code.
pub type RunResult<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::HardFault("smu not responding".to_string());
        assert_eq!(err.to_string(), "Hardware fault: smu not responding");
    }

    #[test]
    fn test_classification() {
        assert!(BenchError::AnalysisOutOfRange("x".into()).is_retryable());
        assert!(!BenchError::ComplianceTripped("x".into()).is_retryable());
        assert!(!BenchError::ComplianceTripped("x".into()).is_fatal());
        assert!(BenchError::MovementTimeout("x".into()).is_fatal());
        assert!(BenchError::RequestTimeout("x".into()).is_fatal());
        assert!(BenchError::Resource("x".into()).is_link_fault());
    }

    #[test]
    fn test_abort_is_not_a_fault() {
        let err: RunError = BenchError::HardFault("boom".into()).into();
        assert!(err.fault().is_some());
        assert!(RunError::Aborted.fault().is_none());
    }
}
