//! Model name → driver factory lookup.

use super::{
    Electrometer, EnvironDriver, LcrMeter, NeedleDriver, ResourceConfig, SourceMeter,
    SwitchMatrix, TableDriver,
};
use crate::error::{AppResult, BenchError};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory creating a driver from its logical name and link config.
pub type Factory<T> = Arc<dyn Fn(&str, &ResourceConfig) -> AppResult<Box<T>> + Send + Sync>;

/// Factories of one device kind keyed by model.
pub struct FactoryMap<T: ?Sized> {
    kind: &'static str,
    factories: HashMap<String, Factory<T>>,
}

impl<T: ?Sized> Clone for FactoryMap<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            factories: self.factories.clone(),
        }
    }
}

impl<T: ?Sized> FactoryMap<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: HashMap::new(),
        }
    }

    /// Register a factory, replacing any previous one for `model`.
    pub fn register<F>(&mut self, model: &str, factory: F)
    where
        F: Fn(&str, &ResourceConfig) -> AppResult<Box<T>> + Send + Sync + 'static,
    {
        self.factories.insert(model.to_string(), Arc::new(factory));
    }

    /// Create a driver for the resource `name`.
    pub fn create(&self, name: &str, config: &ResourceConfig) -> AppResult<Box<T>> {
        let factory = self.factories.get(&config.model).ok_or_else(|| {
            BenchError::Configuration(format!(
                "no {} driver for model '{}' ({name})",
                self.kind, config.model
            ))
        })?;
        factory(name, config)
    }

    /// Registered model names.
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.factories.keys().cloned().collect();
        models.sort();
        models
    }
}

/// Registry of every driver kind the bench knows.
#[derive(Clone)]
pub struct DriverRegistry {
    /// Table drivers.
    pub tables: FactoryMap<dyn TableDriver>,
    /// Needle positioner drivers.
    pub needles: FactoryMap<dyn NeedleDriver>,
    /// Environment box drivers.
    pub environs: FactoryMap<dyn EnvironDriver>,
    /// Source meter drivers.
    pub sources: FactoryMap<dyn SourceMeter>,
    /// LCR meter drivers.
    pub lcrs: FactoryMap<dyn LcrMeter>,
    /// Electrometer drivers.
    pub electrometers: FactoryMap<dyn Electrometer>,
    /// Switch matrix drivers.
    pub switches: FactoryMap<dyn SwitchMatrix>,
}

impl DriverRegistry {
    /// Registry without any factories.
    pub fn empty() -> Self {
        Self {
            tables: FactoryMap::new("table"),
            needles: FactoryMap::new("needle"),
            environs: FactoryMap::new("environment"),
            sources: FactoryMap::new("source meter"),
            lcrs: FactoryMap::new("LCR meter"),
            electrometers: FactoryMap::new("electrometer"),
            switches: FactoryMap::new("switch matrix"),
        }
    }

    /// Registry with the drivers compiled into this build.
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::empty();
        #[cfg(feature = "instrument_serial")]
        super::serial::register(&mut registry);
        registry
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
