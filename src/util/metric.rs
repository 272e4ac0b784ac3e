//! Metric prefixed values such as `"10 uA"` or `"1 kHz"`.

use crate::error::BenchError;
use regex::Regex;
use std::sync::OnceLock;

const PREFIXES: &[(&str, f64)] = &[
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("m", 1e-3),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
];

fn metric_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^\s*([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)\s*([A-Za-zµ]*)\s*$")
            .expect("static metric pattern")
    })
}

fn prefix_scale(prefix: &str) -> Option<f64> {
    PREFIXES
        .iter()
        .find(|(symbol, _)| *symbol == prefix)
        .map(|(_, scale)| *scale)
}

/// Parse a number with optional metric prefix and unit.
///
/// If a unit is given it must match `unit` (case-insensitive).
pub fn parse_metric(text: &str, unit: &str) -> Result<f64, BenchError> {
    let captures = metric_regex()
        .captures(text)
        .ok_or_else(|| BenchError::Validation(format!("invalid metric value: {text:?}")))?;
    let value: f64 = captures[1]
        .parse()
        .map_err(|_| BenchError::Validation(format!("invalid number: {text:?}")))?;
    let suffix = &captures[2];
    if suffix.is_empty() || suffix.eq_ignore_ascii_case(unit) {
        return Ok(value);
    }
    let split = suffix.len().saturating_sub(unit.len());
    let prefix = match (suffix.get(..split), suffix.get(split..)) {
        _ if unit.is_empty() => suffix,
        (Some(prefix), Some(tail)) if !prefix.is_empty() && tail.eq_ignore_ascii_case(unit) => {
            prefix
        }
        _ => {
            return Err(BenchError::Validation(format!(
                "invalid unit in {text:?}, expected {unit:?}"
            )))
        }
    };
    prefix_scale(prefix)
        .map(|scale| value * scale)
        .ok_or_else(|| BenchError::Validation(format!("invalid metric prefix in {text:?}")))
}

/// Format a value with the closest metric prefix, e.g. `1.500 uA`.
pub fn format_metric(value: f64, unit: &str) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value:.3} {unit}");
    }
    let magnitude = value.abs();
    let scales = PREFIXES
        .iter()
        .filter(|(symbol, _)| *symbol != "µ")
        .copied()
        .chain(std::iter::once(("", 1.0)));
    let mut scales: Vec<(&str, f64)> = scales.collect();
    scales.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (symbol, scale) in scales {
        if magnitude >= scale {
            return format!("{:.3} {}{}", value / scale, symbol, unit);
        }
    }
    format!("{value:.3e} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= b.abs() * 1e-12
    }

    #[test]
    fn test_parse_plain_numbers() {
        assert_eq!(parse_metric("42", "V").unwrap(), 42.0);
        assert_eq!(parse_metric("-1.5e-3", "A").unwrap(), -1.5e-3);
        assert_eq!(parse_metric("5 V", "V").unwrap(), 5.0);
    }

    #[test]
    fn test_parse_prefixed_values() {
        assert!(close(parse_metric("10 uA", "A").unwrap(), 10e-6));
        assert!(close(parse_metric("1 kHz", "Hz").unwrap(), 1e3));
        assert!(close(parse_metric("1 MHz", "Hz").unwrap(), 1e6));
        assert!(close(parse_metric("2 Mohm", "ohm").unwrap(), 2e6));
    }

    #[test]
    fn test_parse_rejects_wrong_unit() {
        assert!(parse_metric("10 uV", "A").is_err());
        assert!(parse_metric("ten", "A").is_err());
    }

    #[test]
    fn test_format_metric() {
        assert_eq!(format_metric(1.5e-6, "A"), "1.500 uA");
        assert_eq!(format_metric(2.0, "V"), "2.000 V");
        assert_eq!(format_metric(0.0, "V"), "0.000 V");
    }
}
