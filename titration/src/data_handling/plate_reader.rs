use polars::prelude::*;
use tracing::{debug, info};

use crate::helper_functions::read_csv;
use crate::models::Dataset;

/// Plate-reader OD kinetics in long format: one row per (well, timepoint).
pub struct PlateReaderDataset {
    pub path: String,
    pub blank_wells: Vec<String>,
}

// Corrected OD below this is indistinguishable from blank noise
const OD_FLOOR: f64 = 5e-3;

impl Dataset for PlateReaderDataset {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading plate-reader kinetics from: {}", &self.path);
        let df = read_csv(&self.path)?;
        for required in ["well", "time_h", "od"] {
            if df.column(required).is_err() {
                return Err(PolarsError::ColumnNotFound(
                    format!("plate-reader table needs `{required}`").into(),
                ));
            }
        }
        debug!("loaded {} OD readings", df.height());
        Ok(df)
    }
}

impl PlateReaderDataset {
    /// Subtract the per-timepoint mean OD of the blank wells, then drop the
    /// blank wells themselves.
    pub fn blank_correct(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        if self.blank_wells.is_empty() {
            return df
                .lazy()
                .with_column(col("od").alias("od_corr"))
                .collect();
        }
        let is_blank = self
            .blank_wells
            .iter()
            .fold(lit(false), |acc, w| acc.or(col("well").eq(lit(w.clone()))));

        let blank_means = df
            .clone()
            .lazy()
            .filter(is_blank.clone())
            .group_by([col("time_h")])
            .agg([col("od").mean().alias("blank_od")]);

        df.lazy()
            .join(
                blank_means,
                [col("time_h")],
                [col("time_h")],
                JoinArgs::new(JoinType::Left),
            )
            .with_column((col("od") - col("blank_od")).alias("od_corr"))
            .filter(is_blank.not())
            .collect()
    }
}

fn ols_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let cov: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let var: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
    cov / var
}

/// Maximum specific growth rate (1/h): the steepest sliding-window slope of
/// ln(OD) against time. `None` means the well never cleared the OD floor,
/// i.e. did not grow.
pub fn max_specific_growth_rate(time: &[f64], od: &[f64], window: usize) -> Option<f64> {
    if time.len() != od.len() || window < 3 || time.len() < window {
        return None;
    }
    let mut best: Option<f64> = None;
    for start in 0..=time.len() - window {
        let t = &time[start..start + window];
        let o = &od[start..start + window];
        if o.iter().any(|&v| v <= OD_FLOOR) {
            continue;
        }
        let ln_od: Vec<f64> = o.iter().map(|v| v.ln()).collect();
        let slope = ols_slope(t, &ln_od);
        best = Some(best.map_or(slope, |b| b.max(slope)));
    }
    best
}

/// Per-well maximum specific growth rate over blank-corrected kinetics.
/// Non-growing wells get a null rate rather than an error.
pub fn well_growth_rates(df: &DataFrame, window: usize) -> PolarsResult<DataFrame> {
    let mut wells = Vec::new();
    let mut rates: Vec<Option<f64>> = Vec::new();

    for part in df.partition_by(["well"], true)? {
        let part = part.sort(["time_h"], Default::default())?;
        let well = part
            .column("well")?
            .str()?
            .get(0)
            .unwrap_or_default()
            .to_string();
        let time_col = part.column("time_h")?.cast(&DataType::Float64)?;
        let time: Vec<f64> = time_col.f64()?.into_no_null_iter().collect();
        let od: Vec<f64> = part.column("od_corr")?.f64()?.into_no_null_iter().collect();

        let rate = max_specific_growth_rate(&time, &od, window);
        if rate.is_none() {
            debug!("well {well}: no growth above OD floor");
        }
        wells.push(well);
        rates.push(rate);
    }

    df!["well" => wells, "max_growth_rate" => rates]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_exponential_rate() {
        // OD = 0.02 * e^(0.6 t), so the log-linear slope is 0.6 everywhere
        let time: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let od: Vec<f64> = time.iter().map(|t| 0.02 * (0.6 * t).exp()).collect();
        let rate = max_specific_growth_rate(&time, &od, 5).unwrap();
        assert!((rate - 0.6).abs() < 1e-9);
    }

    #[test]
    fn flat_well_is_non_growing() {
        let time: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let od = vec![0.001; 10];
        assert!(max_specific_growth_rate(&time, &od, 5).is_none());
    }

    #[test]
    fn blank_correction_subtracts_blank_mean() {
        let df = df![
            "well" => &["B1", "B1", "A1", "A1"],
            "time_h" => &[0.0, 1.0, 0.0, 1.0],
            "od" => &[0.05, 0.05, 0.15, 0.25],
        ]
        .unwrap();
        let ds = PlateReaderDataset {
            path: String::new(),
            blank_wells: vec!["B1".to_string()],
        };
        let corrected = ds.blank_correct(df).unwrap();
        assert_eq!(corrected.height(), 2);
        let od_corr: Vec<f64> = corrected
            .column("od_corr")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!((od_corr[0] - 0.1).abs() < 1e-12);
        assert!((od_corr[1] - 0.2).abs() < 1e-12);
    }
}
