use polars::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::helper_functions::read_csv;
use crate::models::Dataset;

/// Turbidostat growth-rate time series. Long format: one row per
/// (condition, timepoint), condition labels like `folA-g2_aTc-12.5nM`.
pub struct GrowthRateDataset {
    pub path: String,
}

/// Inducer concentration in nM, read off the condition label. Labels without
/// an aTc field are uninduced controls.
pub fn parse_atc_nm(label: &str) -> f64 {
    // compiled per call; these tables are hundreds of rows
    let re = Regex::new(r"aTc[-_]([0-9]+(?:\.[0-9]+)?)\s*nM").expect("aTc pattern");
    match re.captures(label).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().parse().unwrap_or_else(|_| {
            warn!("condition `{label}`: unparseable aTc field, treating as 0");
            0.0
        }),
        None => 0.0,
    }
}

/// Condition label with the inducer suffix stripped, i.e. the strain/guide part.
pub fn condition_strain(label: &str) -> String {
    let re = Regex::new(r"^(.*?)[-_]aTc").expect("strain pattern");
    match re.captures(label).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().to_string(),
        None => label.to_string(),
    }
}

impl Dataset for GrowthRateDataset {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading turbidostat growth rates from: {}", &self.path);
        let df = read_csv(&self.path)?;
        for required in ["condition", "time_h", "growth_rate"] {
            if df.column(required).is_err() {
                return Err(PolarsError::ColumnNotFound(
                    format!("growth-rate table needs `{required}`").into(),
                ));
            }
        }

        let cond = df.column("condition")?.str()?;
        let atc: Float64Chunked = cond
            .into_iter()
            .map(|opt| opt.map(parse_atc_nm))
            .collect();
        let strain: StringChunked = cond
            .into_iter()
            .map(|opt| opt.map(condition_strain))
            .collect();

        let df = df.hstack(&[
            atc.with_name("atc_nm".into()).into_series().into_column(),
            strain
                .with_name("strain".into())
                .into_series()
                .into_column(),
        ])?;
        debug!("loaded {} growth-rate rows", df.height());
        Ok(df)
    }
}

/// Steady-state growth rate per condition: mean and SEM over the trailing
/// `window_h` hours of each condition's series.
pub fn steady_state_summary(df: &DataFrame, window_h: f64) -> PolarsResult<DataFrame> {
    let summary = df
        .clone()
        .lazy()
        .filter(
            col("time_h").gt_eq(col("time_h").max().over([col("condition")]) - lit(window_h)),
        )
        .group_by([col("condition"), col("strain"), col("atc_nm")])
        .agg([
            col("growth_rate").mean().alias("rate_mean"),
            col("growth_rate").std(1).alias("rate_std"),
            col("growth_rate").count().alias("n"),
        ])
        .sort(["strain", "atc_nm"], Default::default())
        .collect()?;

    // SEM from the aggregated std and count
    let std = summary.column("rate_std")?.f64()?;
    let n = summary.column("n")?.cast(&DataType::Float64)?;
    let n = n.f64()?;
    let sem: Float64Chunked = std
        .into_iter()
        .zip(n.into_iter())
        .map(|(s, c)| match (s, c) {
            (Some(s), Some(c)) if c > 1.0 => Some(s / c.sqrt()),
            _ => None,
        })
        .collect();
    summary.hstack(&[sem.with_name("rate_sem".into()).into_series().into_column()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atc_parsing() {
        assert!((parse_atc_nm("folA-g2_aTc-12.5nM") - 12.5).abs() < 1e-12);
        assert!((parse_atc_nm("folA-g2_aTc_100nM") - 100.0).abs() < 1e-12);
        assert_eq!(parse_atc_nm("folA-g2_uninduced"), 0.0);
        assert_eq!(condition_strain("folA-g2_aTc-12.5nM"), "folA-g2");
        assert_eq!(condition_strain("blank"), "blank");
    }

    #[test]
    fn trailing_window_summary() {
        let df = df![
            "condition" => &["g1_aTc-1nM"; 6],
            "strain" => &["g1"; 6],
            "atc_nm" => &[1.0; 6],
            "time_h" => &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0],
            "growth_rate" => &[0.1, 0.3, 0.5, 0.60, 0.62, 0.61],
        ]
        .unwrap();
        // trailing 4 h picks up the last three points only
        let summary = steady_state_summary(&df, 4.0).unwrap();
        assert_eq!(summary.height(), 1);
        let mean = summary.column("rate_mean").unwrap().f64().unwrap().get(0).unwrap();
        assert!((mean - 0.61).abs() < 1e-9);
        let sem = summary.column("rate_sem").unwrap().f64().unwrap().get(0).unwrap();
        assert!(sem > 0.0 && sem < 0.01);
    }
}
