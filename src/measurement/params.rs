//! Declarative parameter schemas of measurement types.
//!
//! Every measurement type publishes a static table of [`ParameterSpec`]s.
//! Raw values from a sequence file are checked against it once, before a run
//! starts, and turned into typed [`Parameters`].

use crate::error::{AppResult, BenchError};
use crate::sequence::RawParameters;
use crate::util::{parse_metric, tokenize};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParameterKind {
    /// Number with physical unit, accepts metric strings like `"10 uA"`.
    Float {
        /// Unit symbol.
        unit: &'static str,
    },
    /// Integer count.
    Int,
    /// Flag.
    Bool,
    /// Free text.
    Text,
    /// List of names, e.g. switch channels.
    List,
}

/// Descriptor of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: &'static str,
    /// Value type.
    pub kind: ParameterKind,
    /// Default in sequence file notation, required if `None`.
    pub default: Option<&'static str>,
    /// Inclusive lower bound.
    pub minimum: Option<f64>,
    /// Inclusive upper bound.
    pub maximum: Option<f64>,
}

impl ParameterSpec {
    const fn new(name: &'static str, kind: ParameterKind) -> Self {
        Self {
            name,
            kind,
            default: None,
            minimum: None,
            maximum: None,
        }
    }

    /// Float parameter in `unit`.
    pub const fn float(name: &'static str, unit: &'static str) -> Self {
        Self::new(name, ParameterKind::Float { unit })
    }

    /// Integer parameter.
    pub const fn int(name: &'static str) -> Self {
        Self::new(name, ParameterKind::Int)
    }

    /// Boolean parameter.
    pub const fn bool(name: &'static str) -> Self {
        Self::new(name, ParameterKind::Bool)
    }

    /// Text parameter.
    pub const fn text(name: &'static str) -> Self {
        Self::new(name, ParameterKind::Text)
    }

    /// List parameter.
    pub const fn list(name: &'static str) -> Self {
        Self::new(name, ParameterKind::List)
    }

    /// Set the default.
    pub const fn default(self, value: &'static str) -> Self {
        Self {
            default: Some(value),
            ..self
        }
    }

    /// Set the lower bound.
    pub const fn minimum(self, value: f64) -> Self {
        Self {
            minimum: Some(value),
            ..self
        }
    }

    /// Set the upper bound.
    pub const fn maximum(self, value: f64) -> Self {
        Self {
            maximum: Some(value),
            ..self
        }
    }

    /// Set both bounds.
    pub const fn range(self, minimum: f64, maximum: f64) -> Self {
        self.minimum(minimum).maximum(maximum)
    }

    /// True if the parameter has no default.
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    fn resolve(&self, raw: &Value) -> AppResult<ParameterValue> {
        let value = match self.kind {
            ParameterKind::Float { unit } => ParameterValue::Float(match raw {
                Value::Number(number) => number.as_f64().ok_or_else(|| self.invalid(raw))?,
                Value::String(text) => parse_metric(text, unit)
                    .map_err(|err| BenchError::Validation(format!("{}: {err}", self.name)))?,
                _ => return Err(self.invalid(raw)),
            }),
            ParameterKind::Int => ParameterValue::Int(match raw {
                Value::Number(number) => match (number.as_i64(), number.as_f64()) {
                    (Some(value), _) => value,
                    (None, Some(value)) if value.fract() == 0.0 => value as i64,
                    _ => return Err(self.invalid(raw)),
                },
                Value::String(text) => text.trim().parse().map_err(|_| self.invalid(raw))?,
                _ => return Err(self.invalid(raw)),
            }),
            ParameterKind::Bool => ParameterValue::Bool(match raw {
                Value::Bool(value) => *value,
                Value::String(text) => match text.trim().to_lowercase().as_str() {
                    "true" | "yes" | "on" => true,
                    "false" | "no" | "off" => false,
                    _ => return Err(self.invalid(raw)),
                },
                _ => return Err(self.invalid(raw)),
            }),
            ParameterKind::Text => ParameterValue::Text(match raw {
                Value::String(text) => text.clone(),
                Value::Number(number) => number.to_string(),
                _ => return Err(self.invalid(raw)),
            }),
            ParameterKind::List => ParameterValue::List(match raw {
                Value::Array(values) => values
                    .iter()
                    .map(|value| match value {
                        Value::String(text) => Ok(text.clone()),
                        Value::Number(number) => Ok(number.to_string()),
                        _ => Err(self.invalid(raw)),
                    })
                    .collect::<AppResult<_>>()?,
                Value::String(text) => tokenize(text, ',').map(str::to_string).collect(),
                Value::Null => Vec::new(),
                _ => return Err(self.invalid(raw)),
            }),
        };
        self.check_bounds(&value)?;
        Ok(value)
    }

    fn check_bounds(&self, value: &ParameterValue) -> AppResult<()> {
        let number = match value {
            ParameterValue::Float(value) => *value,
            ParameterValue::Int(value) => *value as f64,
            _ => return Ok(()),
        };
        if let Some(minimum) = self.minimum {
            if number < minimum {
                return Err(BenchError::Validation(format!(
                    "{} out of range: {number} < {minimum}",
                    self.name
                )));
            }
        }
        if let Some(maximum) = self.maximum {
            if number > maximum {
                return Err(BenchError::Validation(format!(
                    "{} out of range: {number} > {maximum}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn invalid(&self, raw: &Value) -> BenchError {
        BenchError::Validation(format!("invalid value for {}: {raw}", self.name))
    }
}

/// Switch channel parameters shared by every measurement type.
pub const SWITCHING_PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::list("hv_channels").default(""),
    ParameterSpec::list("lv_channels").default(""),
];

/// Resolved parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Number in base units.
    Float(f64),
    /// Integer.
    Int(i64),
    /// Flag.
    Bool(bool),
    /// Text.
    Text(String),
    /// Names.
    List(Vec<String>),
}

/// Typed parameters of one measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Parameters {
    values: BTreeMap<String, ParameterValue>,
}

impl Parameters {
    /// Check `raw` against `specs` and the shared switching parameters.
    ///
    /// Unknown names, missing required values, wrong types and out of range
    /// values are `Validation` errors.
    pub fn resolve(specs: &[ParameterSpec], raw: &RawParameters) -> AppResult<Self> {
        let all = || specs.iter().chain(SWITCHING_PARAMETERS.iter());
        if let Some(name) = raw.keys().find(|name| all().all(|spec| spec.name != name.as_str())) {
            return Err(BenchError::Validation(format!("unknown parameter: {name}")));
        }
        let mut values = BTreeMap::new();
        for spec in all() {
            let value = match (raw.get(spec.name), spec.default) {
                (Some(value), _) => spec.resolve(value)?,
                (None, Some(default)) => spec.resolve(&Value::String(default.to_string()))?,
                (None, None) => {
                    return Err(BenchError::Validation(format!(
                        "missing required parameter: {}",
                        spec.name
                    )))
                }
            };
            values.insert(spec.name.to_string(), value);
        }
        Ok(Self { values })
    }

    fn get(&self, name: &str) -> AppResult<&ParameterValue> {
        self.values
            .get(name)
            .ok_or_else(|| BenchError::Validation(format!("no such parameter: {name}")))
    }

    fn mismatch(name: &str, expected: &str) -> BenchError {
        BenchError::Validation(format!("parameter {name} is not a {expected}"))
    }

    /// Float value.
    pub fn float(&self, name: &str) -> AppResult<f64> {
        match self.get(name)? {
            ParameterValue::Float(value) => Ok(*value),
            ParameterValue::Int(value) => Ok(*value as f64),
            _ => Err(Self::mismatch(name, "number")),
        }
    }

    /// Integer value as count.
    pub fn count(&self, name: &str) -> AppResult<usize> {
        match self.get(name)? {
            ParameterValue::Int(value) if *value >= 0 => Ok(*value as usize),
            _ => Err(Self::mismatch(name, "count")),
        }
    }

    /// Float value in seconds as duration.
    pub fn duration(&self, name: &str) -> AppResult<Duration> {
        let seconds = self.float(name)?;
        Duration::try_from_secs_f64(seconds.max(0.0))
            .map_err(|_| BenchError::Validation(format!("invalid duration for {name}: {seconds}")))
    }

    /// Flag value.
    pub fn flag(&self, name: &str) -> AppResult<bool> {
        match self.get(name)? {
            ParameterValue::Bool(value) => Ok(*value),
            _ => Err(Self::mismatch(name, "flag")),
        }
    }

    /// Text value.
    pub fn text(&self, name: &str) -> AppResult<&str> {
        match self.get(name)? {
            ParameterValue::Text(value) => Ok(value),
            _ => Err(Self::mismatch(name, "text")),
        }
    }

    /// List value.
    pub fn list(&self, name: &str) -> AppResult<&[String]> {
        match self.get(name)? {
            ParameterValue::List(value) => Ok(value),
            _ => Err(Self::mismatch(name, "list")),
        }
    }

    /// Values as JSON object, for run headers.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.values).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SPECS: &[ParameterSpec] = &[
        ParameterSpec::float("voltage_end", "V").range(-1000.0, 0.0),
        ParameterSpec::float("compliance", "A").minimum(0.0),
        ParameterSpec::float("lcr_frequency", "Hz").default("1 kHz"),
        ParameterSpec::int("n_samples").default("5").minimum(1.0),
        ParameterSpec::bool("open_correction").default("false"),
    ];

    fn raw(value: Value) -> RawParameters {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_with_defaults() {
        let params = Parameters::resolve(
            SPECS,
            &raw(json!({"voltage_end": -100, "compliance": "10 uA", "hv_channels": ["1A01", "1B02"]})),
        )
        .unwrap();
        assert_eq!(params.float("voltage_end").unwrap(), -100.0);
        assert!((params.float("compliance").unwrap() - 10e-6).abs() < 1e-18);
        assert_eq!(params.float("lcr_frequency").unwrap(), 1e3);
        assert_eq!(params.count("n_samples").unwrap(), 5);
        assert!(!params.flag("open_correction").unwrap());
        assert_eq!(params.list("hv_channels").unwrap(), ["1A01", "1B02"]);
        assert!(params.list("lv_channels").unwrap().is_empty());
    }

    #[test]
    fn test_missing_required() {
        let err = Parameters::resolve(SPECS, &raw(json!({"voltage_end": -100}))).unwrap_err();
        assert!(err.to_string().contains("compliance"));
    }

    #[test]
    fn test_unknown_parameter() {
        let err = Parameters::resolve(
            SPECS,
            &raw(json!({"voltage_end": -100, "compliance": 1e-6, "colour": "red"})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_out_of_range() {
        assert!(Parameters::resolve(SPECS, &raw(json!({"voltage_end": 100, "compliance": 1e-6}))).is_err());
        assert!(Parameters::resolve(
            SPECS,
            &raw(json!({"voltage_end": -1, "compliance": 1e-6, "n_samples": 0}))
        )
        .is_err());
    }

    #[test]
    fn test_list_from_text() {
        let params = Parameters::resolve(
            SPECS,
            &raw(json!({"voltage_end": -1, "compliance": 1e-6, "lv_channels": "1A01, 2B03"})),
        )
        .unwrap();
        assert_eq!(params.list("lv_channels").unwrap(), ["1A01", "2B03"]);
    }
}
