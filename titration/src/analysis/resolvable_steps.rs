//! Counts how many distinct expression levels a guide series actually
//! resolves: walking the fold changes in ascending order, a new step opens
//! only when a guide separates from the current step's anchor by more than
//! the propagated error allows at the chosen confidence.

use std::cmp::Ordering;

use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::models::FoldChange;

/// Two-sided z threshold for the given confidence level.
fn z_threshold(confidence: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("standard normal");
    normal.inverse_cdf(1.0 - (1.0 - confidence) / 2.0)
}

/// Number of resolvable expression steps among `folds` at `confidence`
/// (e.g. 0.95). Guides whose means sit within the combined error of the
/// current step collapse into it.
pub fn count_resolvable_steps(folds: &[FoldChange], confidence: f64) -> usize {
    if folds.is_empty() {
        return 0;
    }
    let z = z_threshold(confidence);

    let mut sorted: Vec<&FoldChange> = folds.iter().collect();
    sorted.sort_by(|a, b| {
        a.fold_change
            .partial_cmp(&b.fold_change)
            .unwrap_or(Ordering::Equal)
    });

    let mut steps = 1usize;
    let mut anchor = sorted[0];
    for fc in &sorted[1..] {
        let gap = fc.fold_change - anchor.fold_change;
        let noise = (fc.sem.powi(2) + anchor.sem.powi(2)).sqrt();
        if gap > z * noise {
            steps += 1;
            anchor = fc;
        }
    }
    debug!("{} guides resolve {} steps at {:.0}% confidence", folds.len(), steps, confidence * 100.0);
    steps
}
