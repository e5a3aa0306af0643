use bio_seq::prelude::*;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::helper_functions::read_csv;
use crate::models::Dataset;

const SPACER_LEN: usize = 20;

/// sgRNA count table: one row per guide (`guide`, `gene`, `sequence`), one
/// count column per sequenced sample.
pub struct SgrnaCountDataset {
    pub path: String,
}

impl Dataset for SgrnaCountDataset {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading sgRNA counts from: {}", &self.path);
        let df = read_csv(&self.path)?;
        for required in ["guide", "gene", "sequence"] {
            if df.column(required).is_err() {
                return Err(PolarsError::ColumnNotFound(
                    format!("count table needs `{required}`").into(),
                ));
            }
        }
        debug!("loaded {} guides", df.height());
        Ok(df)
    }
}

/// Checks every spacer parses as DNA of the expected length; returns the
/// number of valid spacers. Bad rows are logged, not fatal: they come from
/// library synthesis artifacts and get zero counts anyway.
pub fn validate_spacers(df: &DataFrame) -> PolarsResult<usize> {
    let seqs = df.column("sequence")?.str()?;
    let mut valid = 0usize;
    for (i, opt) in seqs.into_iter().enumerate() {
        match opt.map(|s| s.parse::<Seq<Dna>>()) {
            Some(Ok(spacer)) if spacer.len() == SPACER_LEN => valid += 1,
            Some(Ok(spacer)) => {
                warn!("guide row {i}: spacer length {} (expected {SPACER_LEN})", spacer.len())
            }
            Some(Err(_)) => warn!("guide row {i}: spacer is not valid DNA"),
            None => warn!("guide row {i}: missing spacer sequence"),
        }
    }
    Ok(valid)
}

/// Reads-per-million normalization: adds a `<sample>_rpm` column per sample.
pub fn rpm_normalize(df: DataFrame, sample_cols: &[&str]) -> PolarsResult<DataFrame> {
    let mut lf = df.lazy();
    for &sample in sample_cols {
        let counts = col(sample).cast(DataType::Float64);
        lf = lf.with_column(
            (counts.clone() / counts.sum() * lit(1.0e6)).alias(format!("{sample}_rpm")),
        );
    }
    lf.collect()
}

/// Per-guide log2 fold change between two RPM-normalized samples, with a
/// pseudocount to keep dropouts finite.
pub fn log2_fold_change(
    df: DataFrame,
    initial_rpm: &str,
    final_rpm: &str,
    pseudocount: f64,
) -> PolarsResult<DataFrame> {
    let t0 = df.column(initial_rpm)?.f64()?;
    let tf = df.column(final_rpm)?.f64()?;
    let lfc: Float64Chunked = t0
        .into_iter()
        .zip(tf.into_iter())
        .map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => {
                Some(((b + pseudocount) / (a + pseudocount)).ln() / std::f64::consts::LN_2)
            }
            _ => None,
        })
        .collect();
    df.hstack(&[lfc.with_name("log2fc".into()).into_series().into_column()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> DataFrame {
        df![
            "guide" => &["g1", "g2"],
            "gene" => &["folA", "folA"],
            "sequence" => &["ACGTACGTACGTACGTACGT", "TTTTACGTACGTACGTAC"],
            "t0" => &[900u32, 100],
            "tf" => &[150u32, 50],
        ]
        .unwrap()
    }

    #[test]
    fn spacer_validation_counts_only_full_length() {
        // second spacer is 18 nt
        assert_eq!(validate_spacers(&counts()).unwrap(), 1);
    }

    #[test]
    fn rpm_sums_to_a_million() {
        let df = rpm_normalize(counts(), &["t0", "tf"]).unwrap();
        let total: f64 = df
            .column("t0_rpm")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .sum();
        assert!((total - 1.0e6).abs() < 1e-6);
    }

    #[test]
    fn depleted_guide_has_negative_lfc() {
        let df = rpm_normalize(counts(), &["t0", "tf"]).unwrap();
        let df = log2_fold_change(df, "t0_rpm", "tf_rpm", 0.5).unwrap();
        let lfc = df.column("log2fc").unwrap().f64().unwrap();
        // g1: 900k rpm -> 750k rpm, depleted relative to library
        assert!(lfc.get(0).unwrap() < 0.0);
        // g2: 100k rpm -> 250k rpm, enriched
        assert!(lfc.get(1).unwrap() > 0.0);
    }
}
