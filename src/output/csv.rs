//! CSV exporter
//!
//! One file per run. The header is `item_id` followed by the sorted union of
//! the records' top-level keys; nested values are written as JSON.

use super::{Exporter, OutputError, OutputResult};
use crate::StructuredRecord;
use csv::Writer;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column holding the item id
const ITEM_ID_COLUMN: &str = "item_id";
/// Column used for records that are not JSON objects
const RECORD_COLUMN: &str = "record";

/// Writes one CSV file per run into an output directory
#[derive(Debug, Clone)]
pub struct CsvExporter {
    output_dir: PathBuf,
}

impl CsvExporter {
    /// Create an exporter writing into `output_dir`
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Output directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the file written for `batch_id`
    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        self.output_dir.join(format!("receipts_{batch_id}.csv"))
    }
}

/// Sorted union of the top-level keys, `item_id` excluded
fn columns(records: &[StructuredRecord]) -> Vec<String> {
    let mut keys = BTreeSet::new();
    for record in records {
        match &record.record {
            Value::Object(map) => {
                keys.extend(map.keys().filter(|k| *k != ITEM_ID_COLUMN).cloned());
            }
            _ => {
                keys.insert(RECORD_COLUMN.to_string());
            }
        }
    }
    keys.into_iter().collect()
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(nested) => nested.to_string(),
    }
}

/// Render records as CSV bytes
pub fn render(records: &[StructuredRecord]) -> OutputResult<Vec<u8>> {
    let columns = columns(records);
    let mut writer = Writer::from_writer(Vec::new());

    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push(ITEM_ID_COLUMN.to_string());
    header.extend(columns.iter().cloned());
    writer
        .write_record(&header)
        .map_err(|e| OutputError::CsvError(format!("Failed to write header: {e}")))?;

    for record in records {
        let mut row = Vec::with_capacity(header.len());
        row.push(record.item_id.clone());
        for column in &columns {
            let value = match &record.record {
                Value::Object(map) => map.get(column),
                other if column == RECORD_COLUMN => Some(other),
                _ => None,
            };
            row.push(cell(value));
        }
        writer.write_record(&row).map_err(|e| {
            OutputError::CsvError(format!("Failed to write row for {}: {e}", record.item_id))
        })?;
    }

    writer
        .into_inner()
        .map_err(|e| OutputError::CsvError(format!("Failed to flush CSV: {e}")))
}

impl Exporter for CsvExporter {
    fn export(&self, batch_id: &str, records: &[StructuredRecord]) -> OutputResult<Vec<PathBuf>> {
        let bytes = render(records)?;

        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| OutputError::IoError(format!("Failed to create directory: {e}")))?;
        let path = self.path_for(batch_id);

        let mut temp_file = tempfile::NamedTempFile::new_in(&self.output_dir)
            .map_err(|e| OutputError::IoError(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(&bytes)
            .map_err(|e| OutputError::IoError(format!("Failed to write CSV: {e}")))?;
        temp_file
            .persist(&path)
            .map_err(|e| OutputError::IoError(format!("Failed to persist CSV: {}", e.error)))?;

        debug!(path = %path.display(), bytes = bytes.len(), "CSV written");
        info!(
            path = %path.display(),
            records = records.len(),
            "Exported records"
        );
        Ok(vec![path])
    }
}
