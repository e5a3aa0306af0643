//! ΔΔCq relative-expression pipeline.
//!
//! Converts raw Cq replicates into fold-change estimates with propagated
//! uncertainty, normalized against one housekeeping gene and one
//! non-targeting (uninduced baseline) guide. This is the one computation the
//! qPCR notebooks repeated near-verbatim; here it is a single pure function
//! plus a batch wrapper over typed measurements.

use std::collections::BTreeMap;
use std::f64::consts::LN_2;

use tracing::{debug, warn};

use crate::models::{CqMeasurement, CurationNote, FoldChange, GroupRole, GroupStats, QpcrError};

/// Mean and SEM of one replicate group. Fewer than 2 values leaves the SEM
/// undefined, which is fatal.
pub fn mean_sem(values: &[f64], role: GroupRole) -> Result<GroupStats, QpcrError> {
    let n = values.len();
    if n < 2 {
        return Err(QpcrError::InsufficientReplicates { role, n });
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0);
    let sem = (var / nf).sqrt();
    Ok(GroupStats { mean, sem, n })
}

fn delta(reference: GroupStats, target: GroupStats) -> (f64, f64) {
    let mean = reference.mean - target.mean;
    let sem = (reference.sem.powi(2) + target.sem.powi(2)).sqrt();
    (mean, sem)
}

/// ΔΔCq for one gene under one guide, given the four raw replicate groups.
///
/// Returns `(fold_change, fold_change_sem)`. The SEM is first-order error
/// propagation through the exponentiation: `ln(2) * ddCq_sem * 2^ddCq`.
pub fn relative_expression(
    target: &[f64],
    reference_gene: &[f64],
    target_baseline: &[f64],
    reference_gene_baseline: &[f64],
) -> Result<(f64, f64), QpcrError> {
    let t = mean_sem(target, GroupRole::Target)?;
    let r = mean_sem(reference_gene, GroupRole::ReferenceGene)?;
    let tb = mean_sem(target_baseline, GroupRole::TargetBaseline)?;
    let rb = mean_sem(reference_gene_baseline, GroupRole::ReferenceGeneBaseline)?;

    let (d_cq, d_sem) = delta(r, t);
    let (d_cq_base, d_sem_base) = delta(rb, tb);

    let dd_cq = d_cq - d_cq_base;
    let dd_sem = (d_sem.powi(2) + d_sem_base.powi(2)).sqrt();

    let fold_change = dd_cq.exp2();
    let fold_change_sem = LN_2 * dd_sem * fold_change;
    Ok((fold_change, fold_change_sem))
}

type GroupKey = (String, String);

fn group_replicates(measurements: &[CqMeasurement]) -> BTreeMap<GroupKey, Vec<f64>> {
    let mut groups: BTreeMap<GroupKey, Vec<f64>> = BTreeMap::new();
    for m in measurements {
        groups
            .entry((m.gene.clone(), m.guide.clone()))
            .or_default()
            .push(m.cq);
    }
    groups
}

fn apply_curation(groups: &mut BTreeMap<GroupKey, Vec<f64>>, curation: &[CurationNote]) {
    for note in curation {
        let key = (note.gene.to_string(), note.guide.to_string());
        match groups.get_mut(&key) {
            Some(values) if note.replicate < values.len() => {
                let dropped = values.remove(note.replicate);
                warn!(
                    "excluding replicate {} (Cq {:.2}) of {}/{}: {}",
                    note.replicate, dropped, note.gene, note.guide, note.reason
                );
            }
            Some(values) => warn!(
                "curation note for {}/{} replicate {} but group has {} values",
                note.gene,
                note.guide,
                note.replicate,
                values.len()
            ),
            None => warn!(
                "curation note for {}/{} but no such replicate group",
                note.gene, note.guide
            ),
        }
    }
}

/// Batch entry point: fold change for every (gene, guide) pair in the dataset
/// other than the reference gene itself. Curated exclusions are applied before
/// aggregation. Either required reference group being absent is fatal.
pub fn fold_changes(
    measurements: &[CqMeasurement],
    reference_gene: &str,
    reference_guide: &str,
    curation: &[CurationNote],
) -> Result<Vec<FoldChange>, QpcrError> {
    let mut groups = group_replicates(measurements);
    apply_curation(&mut groups, curation);
    debug!(
        "{} replicate groups after curation ({} measurements)",
        groups.len(),
        measurements.len()
    );

    let mut out = Vec::new();
    for ((gene, guide), target) in &groups {
        if gene == reference_gene {
            continue;
        }
        let ref_gene = groups
            .get(&(reference_gene.to_string(), guide.clone()))
            .ok_or_else(|| QpcrError::MissingReference {
                gene: reference_gene.to_string(),
                guide: guide.clone(),
            })?;
        let target_base = groups
            .get(&(gene.clone(), reference_guide.to_string()))
            .ok_or_else(|| QpcrError::MissingReference {
                gene: gene.clone(),
                guide: reference_guide.to_string(),
            })?;
        let ref_gene_base = groups
            .get(&(reference_gene.to_string(), reference_guide.to_string()))
            .ok_or_else(|| QpcrError::MissingReference {
                gene: reference_gene.to_string(),
                guide: reference_guide.to_string(),
            })?;

        let (fold_change, sem) =
            relative_expression(target, ref_gene, target_base, ref_gene_base)?;
        out.push(FoldChange {
            gene: gene.clone(),
            guide: guide.clone(),
            fold_change,
            sem,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meas(gene: &str, guide: &str, cqs: &[f64]) -> Vec<CqMeasurement> {
        cqs.iter()
            .map(|&cq| CqMeasurement {
                gene: gene.to_string(),
                guide: guide.to_string(),
                cq,
            })
            .collect()
    }

    #[test]
    fn worked_example_doubles() {
        // hcaT under guide [23,23], gene [22,22], both baselines [23,23]:
        // ddCq = (23-22) - (23-23) = 1.0, fold change 2.0
        let (fc, sem) =
            relative_expression(&[22.0, 22.0], &[23.0, 23.0], &[23.0, 23.0], &[23.0, 23.0])
                .unwrap();
        assert!((fc - 2.0).abs() < 1e-12);
        assert!(sem.abs() < 1e-12);
    }

    #[test]
    fn own_baseline_folds_to_one() {
        let gene = [21.3, 21.5, 21.4];
        let hcat = [23.1, 23.0, 23.2];
        let (fc, _) = relative_expression(&gene, &hcat, &gene, &hcat).unwrap();
        assert!((fc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_offset_scales_by_two_to_the_k() {
        let gene = [22.0, 22.2, 21.8];
        let hcat = [23.0, 23.1, 22.9];
        let base_gene = [23.0, 23.2, 22.8];
        let base_hcat = [23.0, 23.1, 22.9];
        let (fc, _) = relative_expression(&gene, &hcat, &base_gene, &base_hcat).unwrap();

        let k = 1.5;
        let shifted: Vec<f64> = gene.iter().map(|c| c - k).collect();
        let (fc_shifted, _) =
            relative_expression(&shifted, &hcat, &base_gene, &base_hcat).unwrap();
        assert!((fc_shifted / fc - k.exp2()).abs() < 1e-9);
    }

    #[test]
    fn fold_change_strictly_positive() {
        let cases: [[f64; 2]; 4] = [[40.0, 39.5], [5.0, 5.5], [33.3, 12.1], [0.0, 0.1]];
        for gene in &cases {
            let (fc, _) =
                relative_expression(gene, &[23.0, 23.1], &[23.0, 23.0], &[23.0, 23.1]).unwrap();
            assert!(fc > 0.0, "fold change {fc} not strictly positive");
        }
    }

    #[test]
    fn singleton_group_is_insufficient() {
        let err = relative_expression(&[22.0], &[23.0, 23.0], &[23.0, 23.0], &[23.0, 23.0])
            .unwrap_err();
        assert!(matches!(
            err,
            QpcrError::InsufficientReplicates {
                role: GroupRole::Target,
                n: 1
            }
        ));
    }

    #[test]
    fn missing_reference_gene_group() {
        let mut data = meas("folA", "folA_g1", &[22.0, 22.1]);
        data.extend(meas("folA", "nt_1", &[23.0, 23.1]));
        data.extend(meas("hcaT", "nt_1", &[23.0, 23.0]));
        // no hcaT measurements under folA_g1
        let err = fold_changes(&data, "hcaT", "nt_1", &[]).unwrap_err();
        match err {
            QpcrError::MissingReference { gene, guide } => {
                assert_eq!(gene, "hcaT");
                assert_eq!(guide, "folA_g1");
            }
            other => panic!("expected MissingReference, got {other:?}"),
        }
    }

    #[test]
    fn batch_matches_pure_function() {
        let mut data = meas("folA", "folA_g1", &[22.0, 22.2]);
        data.extend(meas("hcaT", "folA_g1", &[23.0, 23.1]));
        data.extend(meas("folA", "nt_1", &[21.0, 21.1]));
        data.extend(meas("hcaT", "nt_1", &[23.0, 23.0]));

        let folds = fold_changes(&data, "hcaT", "nt_1", &[]).unwrap();
        let by_guide: Vec<&FoldChange> =
            folds.iter().filter(|f| f.guide == "folA_g1").collect();
        assert_eq!(by_guide.len(), 1);

        let (expected, _) = relative_expression(
            &[22.0, 22.2],
            &[23.0, 23.1],
            &[21.0, 21.1],
            &[23.0, 23.0],
        )
        .unwrap();
        assert!((by_guide[0].fold_change - expected).abs() < 1e-12);
    }

    #[test]
    fn curation_drops_the_flagged_replicate() {
        let mut data = meas("folA", "folA_g1", &[22.0, 22.0, 35.0]);
        data.extend(meas("hcaT", "folA_g1", &[23.0, 23.0]));
        data.extend(meas("folA", "nt_1", &[23.0, 23.0]));
        data.extend(meas("hcaT", "nt_1", &[23.0, 23.0]));

        let note = CurationNote {
            gene: "folA",
            guide: "folA_g1",
            replicate: 2,
            reason: "secondary melt-curve peak",
        };
        let folds = fold_changes(&data, "hcaT", "nt_1", &[note]).unwrap();
        let f = folds.iter().find(|f| f.guide == "folA_g1").unwrap();
        // with the 35.0 outlier gone this is the worked example again
        assert!((f.fold_change - 2.0).abs() < 1e-12);
    }
}
