//! Sequence tree: item states, items and the YAML sequence format.
//!
//! A sequence file looks like:
//!
//! ```yaml
//! version: "1.0"
//! name: Default
//! measurements:
//!   - type: stripscan
//!     name: Stripscan
//!     namespace: sensor_a
//!     strips: "1-10"
//!     parameters:
//!       bias_voltage: -300
//!       bias_compliance: 10 uA
//!     strip_measurements:
//!       - type: istrip
//!         name: Istrip
//!         interval: 2
//! ```

use crate::error::{AppResult, BenchError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Raw parameter values of an item.
pub type RawParameters = BTreeMap<String, serde_json::Value>;

/// Execution state of a sequence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Waiting to run.
    Pending,
    /// Running.
    Active,
    /// Suspended while active.
    Halted,
    /// Completed.
    Success,
    /// Stopped by an abort request.
    Aborted,
    /// A source protection limit engaged.
    Compliance,
    /// Failed.
    Failed,
    /// Disabled, or a child of a disabled item.
    Ignored,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Pending => "Pending",
            ItemState::Active => "Active",
            ItemState::Halted => "Halted",
            ItemState::Success => "Success",
            ItemState::Aborted => "Aborted",
            ItemState::Compliance => "Compliance",
            ItemState::Failed => "Failed",
            ItemState::Ignored => "Ignored",
        };
        f.pad(name)
    }
}

/// One measurement of a sequence, either top level or per strip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceItem {
    /// Measurement type, selects the registered strategy.
    pub kind: String,
    /// Display name.
    pub name: String,
    /// `Parent/Child` path of names.
    pub full_name: String,
    /// Data namespace.
    pub namespace: String,
    /// Free text.
    pub description: String,
    /// Disabled items are not run.
    pub enabled: bool,
    /// Strip expression, top level items only.
    pub strips: String,
    /// Run on every n-th strip, strip items only.
    pub interval: usize,
    /// Raw parameter values.
    pub parameters: RawParameters,
    /// Strip items.
    pub children: Vec<SequenceItem>,
    /// Current state.
    pub state: ItemState,
}

impl SequenceItem {
    /// Top level item.
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            full_name: name.to_string(),
            namespace: String::new(),
            description: String::new(),
            enabled: true,
            strips: String::new(),
            interval: 1,
            parameters: RawParameters::new(),
            children: Vec::new(),
            state: ItemState::Pending,
        }
    }

    /// Set the namespace of this item and its children.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        for child in &mut self.children {
            child.namespace = namespace.to_string();
        }
        self
    }

    /// Set the strip expression.
    pub fn with_strips(mut self, strips: &str) -> Self {
        self.strips = strips.to_string();
        self
    }

    /// Set a parameter.
    pub fn with_parameter(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    /// Append a strip item, adopting name path and namespace.
    pub fn with_child(mut self, mut child: SequenceItem) -> Self {
        child.full_name = format!("{}/{}", self.full_name, child.name);
        child.namespace = self.namespace.clone();
        self.children.push(child);
        self
    }

    /// Set the strip interval.
    pub fn with_interval(mut self, interval: usize) -> Self {
        self.interval = interval;
        self
    }

    /// Enable or disable.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Identity key `namespace/type/full_name`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.kind, self.full_name)
    }
}

/// Ordered list of top level items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sequence {
    /// Sequence name.
    pub name: String,
    /// Format version.
    pub version: Option<String>,
    /// Free text.
    pub description: String,
    /// Top level items.
    pub items: Vec<SequenceItem>,
}

impl Sequence {
    /// Parse a YAML sequence definition.
    pub fn from_yaml(text: &str) -> AppResult<Self> {
        let file: SequenceFile = serde_yaml::from_str(text)
            .map_err(|err| BenchError::Validation(format!("invalid sequence: {err}")))?;
        file.into_sequence()
    }

    /// Load a YAML sequence file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Iterate over every item, strip items after their parent.
    pub fn iter(&self) -> impl Iterator<Item = &SequenceItem> {
        self.items
            .iter()
            .flat_map(|item| std::iter::once(item).chain(item.children.iter()))
    }

    /// Find an item by key.
    pub fn find(&self, key: &str) -> Option<&SequenceItem> {
        self.iter().find(|item| item.key() == key)
    }

    /// Reset states honoring disabled parents.
    pub fn reset_states(&mut self) {
        for item in &mut self.items {
            item.state = enabled_state(item.enabled);
            let parent_enabled = item.enabled;
            for child in &mut item.children {
                child.state = enabled_state(parent_enabled && child.enabled);
            }
        }
    }
}

fn enabled_state(enabled: bool) -> ItemState {
    if enabled {
        ItemState::Pending
    } else {
        ItemState::Ignored
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequenceFile {
    #[serde(default)]
    version: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    measurements: Vec<MeasurementEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MeasurementEntry {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    description: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    strips: String,
    #[serde(default)]
    parameters: RawParameters,
    #[serde(default)]
    strip_measurements: Vec<StripEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StripEntry {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    description: String,
    #[serde(default = "default_interval")]
    interval: usize,
    #[serde(default)]
    parameters: RawParameters,
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> usize {
    1
}

impl SequenceFile {
    fn into_sequence(self) -> AppResult<Sequence> {
        if let Some(version) = &self.version {
            let pattern = Regex::new(r"^\d+\.\d+$")
                .map_err(|err| BenchError::Validation(err.to_string()))?;
            if !pattern.is_match(version) {
                return Err(BenchError::Validation(format!(
                    "invalid sequence version: {version:?}"
                )));
            }
        }
        let items = self
            .measurements
            .into_iter()
            .map(|entry| {
                let mut item = SequenceItem::new(&entry.kind, &entry.name)
                    .with_namespace(&entry.namespace)
                    .with_strips(&entry.strips)
                    .with_enabled(entry.enabled);
                item.description = entry.description;
                item.parameters = entry.parameters;
                for strip in entry.strip_measurements {
                    let mut child = SequenceItem::new(&strip.kind, &strip.name)
                        .with_interval(strip.interval)
                        .with_enabled(strip.enabled);
                    child.description = strip.description;
                    child.parameters = strip.parameters;
                    item = item.with_child(child);
                }
                item
            })
            .collect();
        Ok(Sequence {
            name: self.name,
            version: self.version,
            description: self.description,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEQUENCE: &str = r#"
version: "1.0"
name: Default
measurements:
  - type: iv
    name: IV
    namespace: sensor
    parameters:
      voltage_end: -100
      compliance: 10 uA
  - type: stripscan
    name: Stripscan
    namespace: sensor
    enabled: false
    strips: "1-4"
    parameters:
      bias_voltage: -300
      bias_compliance: 1 uA
    strip_measurements:
      - type: istrip
        name: Istrip
        interval: 2
"#;

    #[test]
    fn test_load_yaml() {
        let sequence = Sequence::from_yaml(SEQUENCE).unwrap();
        assert_eq!(sequence.name, "Default");
        assert_eq!(sequence.items.len(), 2);
        let iv = &sequence.items[0];
        assert_eq!(iv.key(), "sensor/iv/IV");
        assert_eq!(iv.parameters["compliance"], serde_json::json!("10 uA"));
        let istrip = &sequence.items[1].children[0];
        assert_eq!(istrip.full_name, "Stripscan/Istrip");
        assert_eq!(istrip.namespace, "sensor");
        assert_eq!(istrip.interval, 2);
        assert!(sequence.find("sensor/istrip/Stripscan/Istrip").is_some());
    }

    #[test]
    fn test_reset_propagates_disabled_parent() {
        let mut sequence = Sequence::from_yaml(SEQUENCE).unwrap();
        sequence.items[0].state = ItemState::Success;
        sequence.reset_states();
        assert_eq!(sequence.items[0].state, ItemState::Pending);
        assert_eq!(sequence.items[1].state, ItemState::Ignored);
        assert_eq!(sequence.items[1].children[0].state, ItemState::Ignored);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let text = "name: x\nmeasurements:\n  - type: iv\n    name: IV\n    colour: red\n";
        assert!(matches!(Sequence::from_yaml(text), Err(BenchError::Validation(_))));
    }

    #[test]
    fn test_rejects_bad_version() {
        let text = "version: one\nname: x\nmeasurements: []\n";
        assert!(Sequence::from_yaml(text).is_err());
    }
}
