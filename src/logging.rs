//! Tracing subscriber setup of the `stripscan` binary.
//!
//! `RUST_LOG` directives take precedence over the command line level.

use crate::error::{AppResult, BenchError};
use std::io;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Parse a level name (`error` .. `trace`, case insensitive).
pub fn parse_level(level: &str) -> AppResult<LevelFilter> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| BenchError::Configuration(format!("invalid log level: {level}")))
}

/// Install the global subscriber, plain text or JSON lines on stderr.
pub fn init(level: &str, json: bool) -> AppResult<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(parse_level(level)?.into())
        .from_env_lossy();
    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_thread_names(true)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_thread_names(true)
            .boxed()
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|err| BenchError::Configuration(format!("failed to install logger: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("WARN").unwrap(), LevelFilter::WARN);
        assert!(parse_level("loud").is_err());
    }
}
