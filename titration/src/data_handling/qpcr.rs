use std::fs::File;

use csv::ReaderBuilder;
use tracing::{debug, info};

use crate::models::{CqMeasurement, QpcrError};

// The qPCR export is positional, not header-driven: the instrument software
// writes a fixed well-table layout.
const GENE_COL: usize = 2;
const GUIDE_COL: usize = 4;
const CQ_COL: usize = 5;

/// Raw Cq well table from the qPCR instrument export.
pub struct QpcrDataset {
    pub path: String,
}

impl QpcrDataset {
    pub fn load(&self) -> Result<Vec<CqMeasurement>, QpcrError> {
        info!("Reading qPCR data from: {}", &self.path);
        let file = File::open(&self.path)?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut measurements = Vec::new();
        let mut skipped = 0usize;
        for (i, record) in reader.records().enumerate() {
            // 1-based data row, past the header
            let line = i + 2;
            let record = record.map_err(|e| QpcrError::MalformedRow {
                line,
                reason: format!("{e}"),
            })?;

            let gene = record.get(GENE_COL).unwrap_or("").trim();
            let cq_raw = record.get(CQ_COL).unwrap_or("").trim();
            if gene.is_empty() || cq_raw.is_empty() {
                skipped += 1;
                continue;
            }

            let guide = record.get(GUIDE_COL).unwrap_or("").trim();
            if guide.is_empty() {
                return Err(QpcrError::MalformedRow {
                    line,
                    reason: format!("gene `{gene}` has a Cq value but no guide identifier"),
                });
            }
            let cq: f64 = cq_raw.parse().map_err(|_| QpcrError::MalformedRow {
                line,
                reason: format!("Cq value `{cq_raw}` is not numeric"),
            })?;

            measurements.push(CqMeasurement {
                gene: gene.to_string(),
                guide: guide.to_string(),
                cq,
            });
        }
        debug!(
            "loaded {} Cq measurements, skipped {} empty rows",
            measurements.len(),
            skipped
        );
        Ok(measurements)
    }
}
