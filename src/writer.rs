//! Persistence of finished runs.

use crate::error::{AppResult, BenchError};
use crate::sequence::{NamespaceData, Row, RunRecord, Statistics};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Receives the record of every run exactly once, aborted and failed runs
/// included.
pub trait Writer: Send {
    /// Persist `record`.
    fn write(&mut self, record: &RunRecord) -> AppResult<()>;
}

/// File name used for items without a namespace.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Serialize)]
struct Document<'a> {
    namespace: &'a str,
    header: &'a Row,
    statistics: &'a Statistics,
    data: &'a NamespaceData,
}

/// Writes one pretty printed JSON document per namespace.
///
/// Files are named `<namespace>.json` below the output directory, which is
/// created on demand.
#[derive(Debug, Clone)]
pub struct JsonWriter {
    directory: PathBuf,
}

impl JsonWriter {
    /// Writer into `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Output directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the document for `namespace`.
    pub fn path(&self, namespace: &str) -> PathBuf {
        let name = if namespace.trim().is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        self.directory.join(format!("{name}.json"))
    }
}

impl Writer for JsonWriter {
    fn write(&mut self, record: &RunRecord) -> AppResult<()> {
        fs::create_dir_all(&self.directory).map_err(|err| {
            BenchError::Io(format!(
                "failed to create output directory {}: {err}",
                self.directory.display()
            ))
        })?;
        let header = record.header();
        for (namespace, data) in &record.data {
            let document = Document {
                namespace,
                header: &header,
                statistics: &record.statistics,
                data,
            };
            let path = self.path(namespace);
            let text = serde_json::to_string_pretty(&document)?;
            fs::write(&path, text).map_err(|err| {
                BenchError::Io(format!("failed to write {}: {err}", path.display()))
            })?;
            info!(path = %path.display(), "written");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn row(index: usize, value: f64) -> Row {
        let mut row = Row::new();
        row.insert("strip_index".into(), json!(index));
        row.insert("istrip_i".into(), json!(value));
        row
    }

    #[test]
    fn test_one_file_per_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let mut header = Row::new();
        header.insert("operator".into(), json!("Monty"));
        let mut record = RunRecord::new(header);
        record.insert_data("sensor", "istrip", "Scan/Istrip", row(2, 1e-9), "strip_index");
        record.insert_data("sensor", "istrip", "Scan/Istrip", row(0, 2e-9), "strip_index");
        record.insert_data("", "iv", "IV", row(0, 0.0), "strip_index");
        record.statistics.increment_remeasure("S1", "Scan/Istrip");

        let mut writer = JsonWriter::new(dir.path().join("out"));
        writer.write(&record).unwrap();

        let text = fs::read_to_string(dir.path().join("out/sensor.json")).unwrap();
        let document: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(document["header"]["operator"], "Monty");
        assert_eq!(document["statistics"]["remeasure_counter"]["S1"]["Scan/Istrip"], 1);
        let rows = document["data"]["istrip"]["Scan/Istrip"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["strip_index"], 0);
        assert!(dir.path().join("out/default.json").exists());
    }

    #[test]
    fn test_empty_record_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JsonWriter::new(dir.path());
        writer.write(&RunRecord::default()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
