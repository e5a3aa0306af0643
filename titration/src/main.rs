use std::collections::BTreeMap;
use std::fs::{create_dir_all, File};

use anyhow::{Context, Result};
use ndarray::Array2;
use polars::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::analysis::dose_response::{fit_hill, HillFit};
use crate::analysis::heatmap_order::cluster_row_order;
use crate::analysis::relative_expression::fold_changes;
use crate::analysis::resolvable_steps::count_resolvable_steps;
use crate::data_handling::growth_rates::{steady_state_summary, GrowthRateDataset};
use crate::data_handling::plate_reader::{well_growth_rates, PlateReaderDataset};
use crate::data_handling::qpcr::QpcrDataset;
use crate::data_handling::sgrna_counts::{
    log2_fold_change, rpm_normalize, validate_spacers, SgrnaCountDataset,
};
use crate::helper_functions::{dataframe_to_csv, project_root};
use crate::models::{CurationNote, Dataset, FoldChange};

mod analysis;
mod data_handling;
mod helper_functions;
mod models;

const REFERENCE_GENE: &str = "hcaT";
const REFERENCE_GUIDE: &str = "nt-1";
const STEP_CONFIDENCE: f64 = 0.95;
const STEADY_STATE_WINDOW_H: f64 = 6.0;
const GROWTH_RATE_WINDOW: usize = 5;

/// The one replicate excluded by manual melt-curve inspection. The call is
/// not reproducible from the data files, so it lives here as data.
const CURATION: &[CurationNote] = &[CurationNote {
    gene: "folA",
    guide: "folA-g3",
    replicate: 2,
    reason: "secondary melt-curve peak on manual inspection",
}];

fn main() -> Result<()> {
    // Setup logging and output locations
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting the titratable-knockdown analysis pipeline");
    let root = project_root();
    create_dir_all("./results")?;

    let data_path = |rel: &str| root.join(rel).to_string_lossy().into_owned();

    // qPCR: ΔΔCq fold changes with curated exclusions applied up front
    let qpcr = QpcrDataset {
        path: data_path("data/qpcr/knockdown_cq.csv"),
    };
    let measurements = qpcr.load().context("loading qPCR dataset")?;
    let folds = fold_changes(&measurements, REFERENCE_GENE, REFERENCE_GUIDE, CURATION)
        .context("computing relative expression")?;
    write_fold_changes(&folds)?;

    // Resolvable expression steps per gene
    let mut per_gene: BTreeMap<&str, Vec<FoldChange>> = BTreeMap::new();
    for f in &folds {
        per_gene.entry(f.gene.as_str()).or_default().push(f.clone());
    }
    let mut genes = Vec::new();
    let mut steps = Vec::new();
    for (gene, gene_folds) in &per_gene {
        let n = count_resolvable_steps(gene_folds, STEP_CONFIDENCE);
        info!("{gene}: {} guides, {n} resolvable steps", gene_folds.len());
        genes.push(gene.to_string());
        steps.push(n as u32);
    }
    let mut steps_df = df!["gene" => genes, "resolvable_steps" => steps]?;
    dataframe_to_csv(&mut steps_df, "./results/resolvable_steps.csv", true)?;

    // Turbidostat: steady-state rates, dose-response fits, heatmap ordering
    let growth = GrowthRateDataset {
        path: data_path("data/turbidostat/growth_rates.csv"),
    };
    let growth_df = growth.load().context("loading growth-rate dataset")?;
    let mut summary = steady_state_summary(&growth_df, STEADY_STATE_WINDOW_H)?;
    dataframe_to_csv(&mut summary, "./results/growth_steady_state.csv", true)?;

    let titrations = per_strain_titrations(&summary)?;
    let mut fits: BTreeMap<String, HillFit> = BTreeMap::new();
    for (strain, points) in &titrations {
        if points.len() < 5 {
            warn!("{strain}: only {} doses, skipping dose-response fit", points.len());
            continue;
        }
        let (x, y): (Vec<f64>, Vec<f64>) = points.iter().copied().unzip();
        match fit_hill(&x, &y) {
            Ok(fit) => {
                info!(
                    "{strain}: ec50 {:.2} nM, hill {:.2}, r² {:.4}",
                    fit.ec50, fit.hill, fit.r_squared
                );
                fits.insert(strain.clone(), fit);
            }
            Err(e) => warn!("{strain}: dose-response fit failed: {e}"),
        }
    }
    serde_json::to_writer_pretty(File::create("./results/dose_response.json")?, &fits)?;

    let order = heatmap_row_order(&titrations);
    serde_json::to_writer_pretty(File::create("./results/heatmap_order.json")?, &order)?;

    // Plate reader: blank correction and per-well growth rates
    let plate = PlateReaderDataset {
        path: data_path("data/plate_reader/od_kinetics.csv"),
        blank_wells: vec!["H11".to_string(), "H12".to_string()],
    };
    let od = plate.load().context("loading plate-reader dataset")?;
    let corrected = plate.blank_correct(od)?;
    let mut rates = well_growth_rates(&corrected, GROWTH_RATE_WINDOW)?;
    dataframe_to_csv(&mut rates, "./results/plate_growth_rates.csv", true)?;

    // sgRNA library counts
    let counts = SgrnaCountDataset {
        path: data_path("data/sgrna/library_counts.csv"),
    };
    let counts_df = counts.load().context("loading sgRNA count table")?;
    let valid = validate_spacers(&counts_df)?;
    info!("{valid}/{} spacers pass validation", counts_df.height());
    let normalized = rpm_normalize(counts_df, &["t0", "t_final"])?;
    let mut enriched = log2_fold_change(normalized, "t0_rpm", "t_final_rpm", 0.5)?;
    dataframe_to_csv(&mut enriched, "./results/sgrna_log2fc.csv", true)?;

    info!("Pipeline finished; tables written to ./results");
    Ok(())
}

fn write_fold_changes(folds: &[FoldChange]) -> Result<()> {
    let mut df = df![
        "gene" => folds.iter().map(|f| f.gene.clone()).collect::<Vec<_>>(),
        "guide" => folds.iter().map(|f| f.guide.clone()).collect::<Vec<_>>(),
        "fold_change" => folds.iter().map(|f| f.fold_change).collect::<Vec<_>>(),
        "sem" => folds.iter().map(|f| f.sem).collect::<Vec<_>>(),
    ]?;
    dataframe_to_csv(&mut df, "./results/fold_changes.csv", true)?;
    serde_json::to_writer_pretty(File::create("./results/fold_changes.json")?, folds)?;
    Ok(())
}

/// (dose, steady-state rate) series per strain, doses ascending.
fn per_strain_titrations(summary: &DataFrame) -> Result<BTreeMap<String, Vec<(f64, f64)>>> {
    let strain = summary.column("strain")?.str()?;
    let atc = summary.column("atc_nm")?.f64()?;
    let rate = summary.column("rate_mean")?.f64()?;

    let mut map: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    for i in 0..summary.height() {
        if let (Some(s), Some(x), Some(y)) = (strain.get(i), atc.get(i), rate.get(i)) {
            map.entry(s.to_string()).or_default().push((x, y));
        }
    }
    for points in map.values_mut() {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
    Ok(map)
}

/// Strains in dendrogram leaf order. Strains missing doses from the shared
/// grid are left out rather than padded.
fn heatmap_row_order(titrations: &BTreeMap<String, Vec<(f64, f64)>>) -> Vec<String> {
    let Some(grid_len) = titrations.values().map(Vec::len).max() else {
        return Vec::new();
    };
    let mut names = Vec::new();
    let mut rows = Vec::new();
    for (strain, points) in titrations {
        if points.len() != grid_len {
            warn!("{strain}: incomplete dose grid, left out of the heatmap");
            continue;
        }
        names.push(strain.clone());
        rows.push(points.iter().map(|&(_, y)| y).collect::<Vec<f64>>());
    }
    if names.is_empty() {
        return Vec::new();
    }

    let mut profiles = Array2::<f64>::zeros((names.len(), grid_len));
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            profiles[[i, j]] = v;
        }
    }
    cluster_row_order(&profiles)
        .into_iter()
        .map(|i| names[i].clone())
        .collect()
}
