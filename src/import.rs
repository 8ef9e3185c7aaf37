// 📥 CSV Import - bulk readings for one source
//
// Expected layout, header required:
//
//   timestamp,value
//   1700000000,2150
//   1700000060,2175
//
// Rows go through the regular ingestion path, so the same validation and
// latest-value rules apply as for live readings.

use crate::engine::DataPoints;
use crate::error::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingRow {
    pub timestamp: i64,
    pub value: i64,
}

/// Outcome of an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub accepted: usize,
    pub rejected: usize,
}

pub fn load_readings(csv_path: &Path) -> anyhow::Result<Vec<ReadingRow>> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open CSV file {}", csv_path.display()))?;
    read_readings(file)
}

pub fn read_readings<R: Read>(reader: R) -> anyhow::Result<Vec<ReadingRow>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let mut readings = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: ReadingRow =
            result.with_context(|| format!("Failed to parse reading on row {}", line + 1))?;
        readings.push(row);
    }

    Ok(readings)
}

/// Record `readings` for `public_id`.
///
/// Rows with an invalid timestamp are counted and skipped; store failures
/// abort the import.
pub fn import_readings(
    engine: &DataPoints,
    public_id: &str,
    readings: &[ReadingRow],
) -> Result<ImportSummary> {
    if engine.registry().resolve(public_id).is_none() {
        return Err(Error::NotFound(public_id.to_string()));
    }

    let mut summary = ImportSummary::default();
    for row in readings {
        match engine.record(public_id, row.value, Some(row.timestamp)) {
            Ok(()) => summary.accepted += 1,
            Err(Error::InvalidTimestamp(ts)) => {
                warn!("Skipping reading with timestamp {}", ts);
                summary.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        "Imported {} readings for {} ({} rejected)",
        summary.accepted, public_id, summary.rejected
    );
    Ok(summary)
}
