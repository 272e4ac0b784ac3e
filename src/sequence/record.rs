//! Data collected during a run: rows, open corrections and retry statistics.

use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One data row.
pub type Row = Map<String, Value>;

/// Rows of one namespace: `type -> item name -> rows`.
pub type NamespaceData = BTreeMap<String, BTreeMap<String, Vec<Row>>>;

/// Retry counters keyed by strip, then by item full name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// In-place repetitions.
    pub remeasure_counter: BTreeMap<String, BTreeMap<String, usize>>,
    /// Repositioning attempts.
    pub recontact_counter: BTreeMap<String, BTreeMap<String, usize>>,
}

impl Statistics {
    /// Count one remeasurement.
    pub fn increment_remeasure(&mut self, strip: &str, name: &str) {
        *self
            .remeasure_counter
            .entry(strip.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default() += 1;
    }

    /// Count one recontact.
    pub fn increment_recontact(&mut self, strip: &str, name: &str) {
        *self
            .recontact_counter
            .entry(strip.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default() += 1;
    }

    /// Remeasure count of `strip`/`name`.
    pub fn remeasures(&self, strip: &str, name: &str) -> usize {
        lookup(&self.remeasure_counter, strip, name)
    }

    /// Recontact count of `strip`/`name`.
    pub fn recontacts(&self, strip: &str, name: &str) -> usize {
        lookup(&self.recontact_counter, strip, name)
    }

    /// True if nothing was counted.
    pub fn is_empty(&self) -> bool {
        self.remeasure_counter.is_empty() && self.recontact_counter.is_empty()
    }

    /// Log `count/max` for every counter.
    pub fn log(&self, remeasure_attempts: usize, recontact_attempts: usize) {
        if !self.remeasure_counter.is_empty() {
            let maximum = remeasure_attempts * (recontact_attempts + 1);
            info!("remeasurement statistics");
            for (strip, counter) in &self.remeasure_counter {
                for (name, count) in counter {
                    info!("strip {strip:?}, {name:?}: {count}/{maximum}");
                }
            }
        }
        if !self.recontact_counter.is_empty() {
            info!("recontact statistics");
            for (strip, counter) in &self.recontact_counter {
                for (name, count) in counter {
                    info!("strip {strip:?}, {name:?}: {count}/{recontact_attempts}");
                }
            }
        }
    }
}

fn lookup(counter: &BTreeMap<String, BTreeMap<String, usize>>, strip: &str, name: &str) -> usize {
    counter
        .get(strip)
        .and_then(|names| names.get(name))
        .copied()
        .unwrap_or(0)
}

/// Everything a run produces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunRecord {
    /// Run header (operator, sensor, timestamps, options).
    pub parameters: Row,
    /// Open correction baselines `namespace -> type -> name -> key -> value`.
    pub open_corrections: BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>>,
    /// Rows by namespace.
    pub data: BTreeMap<String, NamespaceData>,
    /// Retry counters.
    pub statistics: Statistics,
}

impl RunRecord {
    /// Empty record with `parameters` as header.
    pub fn new(parameters: Row) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    /// Insert `row`, replacing any row with the same `sortkey` value, and
    /// keep rows ordered by `sortkey`.
    pub fn insert_data(&mut self, namespace: &str, kind: &str, name: &str, row: Row, sortkey: &str) {
        debug!(namespace, kind, name, "insert data");
        let rows = self
            .data
            .entry(namespace.to_string())
            .or_default()
            .entry(kind.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default();
        let key = row.get(sortkey).cloned().unwrap_or(Value::Null);
        rows.retain(|existing| existing.get(sortkey).unwrap_or(&Value::Null) != &key);
        rows.push(row);
        rows.sort_by(|a, b| {
            compare_values(
                a.get(sortkey).unwrap_or(&Value::Null),
                b.get(sortkey).unwrap_or(&Value::Null),
            )
        });
    }

    /// Rows of `namespace/kind/name`.
    pub fn rows(&self, namespace: &str, kind: &str, name: &str) -> &[Row] {
        self.data
            .get(namespace)
            .and_then(|types| types.get(kind))
            .and_then(|names| names.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Store an open correction baseline.
    pub fn set_open_correction(&mut self, namespace: &str, kind: &str, name: &str, key: &str, value: f64) {
        self.open_corrections
            .entry(namespace.to_string())
            .or_default()
            .entry(kind.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Stored open correction baseline, 0 if none.
    pub fn open_correction(&self, namespace: &str, kind: &str, name: &str, key: &str) -> f64 {
        self.open_corrections
            .get(namespace)
            .and_then(|types| types.get(kind))
            .and_then(|names| names.get(name))
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0.0)
    }

    /// Header handed to writers, open corrections included.
    pub fn header(&self) -> Row {
        let mut header = self.parameters.clone();
        if let Ok(corrections) = serde_json::to_value(&self.open_corrections) {
            header.insert("open_corrections".to_string(), corrections);
        }
        header
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[test]
    fn test_insert_replaces_and_sorts() {
        let mut record = RunRecord::default();
        record.insert_data("ns", "istrip", "Istrip", row(json!({"strip_index": 4, "i": 1.0})), "strip_index");
        record.insert_data("ns", "istrip", "Istrip", row(json!({"strip_index": 1, "i": 2.0})), "strip_index");
        record.insert_data("ns", "istrip", "Istrip", row(json!({"strip_index": 4, "i": 3.0})), "strip_index");

        let rows = record.rows("ns", "istrip", "Istrip");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["strip_index"], json!(1));
        assert_eq!(rows[1]["i"], json!(3.0));
    }

    #[test]
    fn test_open_corrections() {
        let mut record = RunRecord::default();
        assert_eq!(record.open_correction("ns", "cac", "Cac", "cp"), 0.0);
        record.set_open_correction("ns", "cac", "Cac", "cp", 1.5e-12);
        assert_eq!(record.open_correction("ns", "cac", "Cac", "cp"), 1.5e-12);
        assert_eq!(
            record.header()["open_corrections"]["ns"]["cac"]["Cac"]["cp"],
            json!(1.5e-12)
        );
    }

    #[test]
    fn test_statistics() {
        let mut statistics = Statistics::default();
        assert!(statistics.is_empty());
        statistics.increment_remeasure("3", "Stripscan/Istrip");
        statistics.increment_remeasure("3", "Stripscan/Istrip");
        statistics.increment_recontact("3", "Stripscan/Istrip");
        assert_eq!(statistics.remeasures("3", "Stripscan/Istrip"), 2);
        assert_eq!(statistics.recontacts("3", "Stripscan/Istrip"), 1);
        assert_eq!(statistics.recontacts("4", "Stripscan/Istrip"), 0);
    }

    #[test]
    #[traced_test]
    fn test_statistics_log() {
        let mut statistics = Statistics::default();
        statistics.increment_remeasure("3", "Stripscan/Istrip");
        statistics.increment_remeasure("3", "Stripscan/Istrip");
        statistics.increment_recontact("3", "Stripscan/Istrip");
        statistics.log(2, 1);
        assert!(logs_contain("remeasurement statistics"));
        assert!(logs_contain("\"Stripscan/Istrip\": 2/4"));
        assert!(logs_contain("\"Stripscan/Istrip\": 1/1"));
    }
}
