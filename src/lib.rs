//! Core library of the strip sensor characterization bench.
//!
//! The bench contacts the strips of a silicon sensor one at a time with a
//! probe card on a motorized table and runs a sequence of electrical
//! measurements on each of them.
//!
//! - [`controller`]: worker threads owning the table, the needle stage and
//!   the environment box,
//! - [`station`]: synchronous facade over the instruments,
//! - [`measurement`]: the measurement catalogue,
//! - [`sequence`]: the orchestrator with its retry policy,
//! - [`writer`]: persistence of finished runs.

pub mod config;
pub mod controller;
pub mod error;
pub mod geometry;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod request;
pub mod sequence;
pub mod station;
pub mod util;
pub mod writer;
