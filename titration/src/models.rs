use std::fmt;

use polars::prelude::*;
use serde::Serialize;
use thiserror::Error;

/// One qPCR well: a raw cycle-threshold reading for a target gene under one guide.
#[derive(Debug, Clone, PartialEq)]
pub struct CqMeasurement {
    pub gene: String,
    pub guide: String,
    pub cq: f64,
}

/// Mean and standard error of one replicate group.
#[derive(Debug, Clone, Copy)]
pub struct GroupStats {
    pub mean: f64,
    pub sem: f64,
    pub n: usize,
}

/// Linearized relative expression for one (gene, guide) pair.
#[derive(Debug, Clone, Serialize)]
pub struct FoldChange {
    pub gene: String,
    pub guide: String,
    pub fold_change: f64,
    pub sem: f64,
}

/// Which of the four replicate groups a ΔΔCq computation was looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Target,
    ReferenceGene,
    TargetBaseline,
    ReferenceGeneBaseline,
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupRole::Target => "target gene",
            GroupRole::ReferenceGene => "reference gene",
            GroupRole::TargetBaseline => "target gene under reference guide",
            GroupRole::ReferenceGeneBaseline => "reference gene under reference guide",
        };
        f.write_str(s)
    }
}

/// A manually curated replicate exclusion, e.g. a well whose melt curve showed
/// a secondary peak. These come from inspection external to the data files and
/// are applied before aggregation, never inferred.
#[derive(Debug, Clone)]
pub struct CurationNote {
    pub gene: &'static str,
    pub guide: &'static str,
    pub replicate: usize,
    pub reason: &'static str,
}

/// Errors in the qPCR relative-expression pipeline. All of these are fatal for
/// the affected dataset; the fix is upstream re-curation, then a rerun.
#[derive(Debug, Error)]
pub enum QpcrError {
    #[error("missing reference group: gene `{gene}` under guide `{guide}`")]
    MissingReference { gene: String, guide: String },

    #[error("{role}: {n} replicate(s), SEM needs at least 2")]
    InsufficientReplicates { role: GroupRole, n: usize },

    #[error("row {line}: {reason}")]
    MalformedRow { line: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An input dataset that materializes as a polars frame.
pub trait Dataset {
    fn load(&self) -> PolarsResult<DataFrame>;
}
