//! Measurement type → parameter schema and factory.

use super::params::{ParameterSpec, Parameters};
use super::{
    CacMeasurement, CintMeasurement, CvMeasurement, IdarkMeasurement, IdielMeasurement,
    IstripMeasurement, IvMeasurement, Measurement, RintMeasurement, RpolyMeasurement,
    StripscanMeasurement,
};
use crate::error::{AppResult, BenchError};
use crate::sequence::RawParameters;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a measurement from validated parameters.
pub type MeasurementFactory =
    Arc<dyn Fn(&Parameters) -> AppResult<Box<dyn Measurement>> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    parameters: Vec<ParameterSpec>,
    factory: MeasurementFactory,
}

/// Known measurement types.
#[derive(Clone, Default)]
pub struct MeasurementRegistry {
    entries: BTreeMap<String, Entry>,
}

impl MeasurementRegistry {
    /// Registry without any type.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in catalogue.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("iv", IvMeasurement::PARAMETERS, |p| {
            Ok(Box::new(IvMeasurement::from_parameters(p)?))
        });
        registry.register("cv", CvMeasurement::PARAMETERS, |p| {
            Ok(Box::new(CvMeasurement::from_parameters(p)?))
        });
        registry.register("stripscan", StripscanMeasurement::PARAMETERS, |p| {
            Ok(Box::new(StripscanMeasurement::from_parameters(p)?))
        });
        registry.register("istrip", IstripMeasurement::PARAMETERS, |p| {
            Ok(Box::new(IstripMeasurement::from_parameters(p)?))
        });
        registry.register("idark", IdarkMeasurement::PARAMETERS, |p| {
            Ok(Box::new(IdarkMeasurement::from_parameters(p)?))
        });
        registry.register("idiel", IdielMeasurement::PARAMETERS, |p| {
            Ok(Box::new(IdielMeasurement::from_parameters(p)?))
        });
        registry.register("rpoly", RpolyMeasurement::PARAMETERS, |p| {
            Ok(Box::new(RpolyMeasurement::from_parameters(p)?))
        });
        registry.register("rint", RintMeasurement::PARAMETERS, |p| {
            Ok(Box::new(RintMeasurement::from_parameters(p)?))
        });
        registry.register("cac", CacMeasurement::PARAMETERS, |p| {
            Ok(Box::new(CacMeasurement::from_parameters(p)?))
        });
        registry.register("cint", CintMeasurement::PARAMETERS, |p| {
            Ok(Box::new(CintMeasurement::from_parameters(p)?))
        });
        registry
    }

    /// Register a type, replacing any previous one.
    pub fn register<F>(&mut self, kind: &str, parameters: &[ParameterSpec], factory: F)
    where
        F: Fn(&Parameters) -> AppResult<Box<dyn Measurement>> + Send + Sync + 'static,
    {
        self.entries.insert(
            kind.to_string(),
            Entry {
                parameters: parameters.to_vec(),
                factory: Arc::new(factory),
            },
        );
    }

    /// Registered type names.
    pub fn kinds(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// True if `kind` is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// Parameter schema of `kind`.
    pub fn parameters(&self, kind: &str) -> AppResult<&[ParameterSpec]> {
        Ok(&self.entry(kind)?.parameters)
    }

    /// Check `raw` against the schema of `kind`.
    pub fn validate(&self, kind: &str, raw: &RawParameters) -> AppResult<Parameters> {
        Parameters::resolve(&self.entry(kind)?.parameters, raw)
    }

    /// Validate and build a measurement.
    pub fn create(&self, kind: &str, raw: &RawParameters) -> AppResult<Box<dyn Measurement>> {
        let entry = self.entry(kind)?;
        let parameters = Parameters::resolve(&entry.parameters, raw)?;
        (entry.factory)(&parameters)
    }

    fn entry(&self, kind: &str) -> AppResult<&Entry> {
        self.entries
            .get(kind)
            .ok_or_else(|| BenchError::Validation(format!("no such measurement type: {kind}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_catalogue() {
        let registry = MeasurementRegistry::builtin();
        for kind in ["iv", "cv", "stripscan", "istrip", "idark", "idiel", "rpoly", "rint", "cac", "cint"] {
            assert!(registry.contains(kind), "{kind}");
        }
        assert!(registry.parameters("iv").unwrap().iter().any(|spec| spec.name == "voltage_end"));
    }

    #[test]
    fn test_create_validates() {
        let registry = MeasurementRegistry::builtin();
        let raw: RawParameters = serde_json::from_value(json!({"voltage_end": -10})).unwrap();
        assert!(matches!(registry.create("iv", &raw), Err(BenchError::Validation(_))));
        let raw: RawParameters =
            serde_json::from_value(json!({"voltage_end": -10, "compliance": "1 uA"})).unwrap();
        assert!(registry.create("iv", &raw).is_ok());
        assert!(registry.create("frobnicate", &raw).is_err());
    }

    #[test]
    fn test_create_rejects_unbounded_ramp() {
        let registry = MeasurementRegistry::builtin();
        let raw: RawParameters = serde_json::from_value(json!({
            "voltage_end": -1000,
            "voltage_step": 1e-300,
            "compliance": "1 uA",
        }))
        .unwrap();
        for kind in ["iv", "cv"] {
            assert!(matches!(registry.create(kind, &raw), Err(BenchError::Validation(_))), "{kind}");
        }
        let raw: RawParameters =
            serde_json::from_value(json!({"smu_voltage_end": 10, "smu_voltage_step": 1e-300})).unwrap();
        assert!(matches!(registry.create("rint", &raw), Err(BenchError::Validation(_))));
    }

    #[test]
    fn test_strip_types_have_defaults() {
        let registry = MeasurementRegistry::builtin();
        for kind in ["istrip", "idark", "idiel", "rpoly", "rint", "cac", "cint"] {
            assert!(registry.create(kind, &RawParameters::new()).is_ok(), "{kind}");
        }
    }
}
