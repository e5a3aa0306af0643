//! Row ordering for the knockdown heatmaps: average-linkage clustering over
//! per-gene titration profiles, leaves read off the dendrogram left to right.

use kodama::{linkage, Method};
use ndarray::Array2;
use tracing::debug;

fn euclidean(a: ndarray::ArrayView1<f64>, b: ndarray::ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Dendrogram leaf order of the rows of `profiles` (rows are genes, columns
/// the shared dose grid). Rows with similar titration behavior end up
/// adjacent.
pub fn cluster_row_order(profiles: &Array2<f64>) -> Vec<usize> {
    let n = profiles.nrows();
    if n < 2 {
        return (0..n).collect();
    }

    // condensed upper-triangular distance matrix, the layout kodama expects
    let mut condensed = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n - 1 {
        for j in i + 1..n {
            condensed.push(euclidean(profiles.row(i), profiles.row(j)));
        }
    }

    let dendrogram = linkage(&mut condensed, n, Method::Average);
    debug!("clustered {n} profiles in {} merge steps", dendrogram.steps().len());

    // clusters 0..n are the leaves; step k forms cluster n+k
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    for step in dendrogram.steps() {
        let mut merged = members[step.cluster1].clone();
        merged.extend_from_slice(&members[step.cluster2]);
        members.push(merged);
    }
    members.pop().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn similar_rows_end_up_adjacent() {
        // rows 0/2 are near-duplicates, as are rows 1/3
        let profiles = array![
            [1.0, 0.8, 0.3, 0.1],
            [1.0, 1.0, 0.9, 0.9],
            [1.0, 0.82, 0.28, 0.12],
            [1.0, 0.98, 0.92, 0.88],
        ];
        let order = cluster_row_order(&profiles);
        assert_eq!(order.len(), 4);

        let pos = |row: usize| order.iter().position(|&r| r == row).unwrap();
        assert_eq!(pos(0).abs_diff(pos(2)), 1);
        assert_eq!(pos(1).abs_diff(pos(3)), 1);
    }

    #[test]
    fn degenerate_inputs() {
        let one = Array2::<f64>::zeros((1, 4));
        assert_eq!(cluster_row_order(&one), vec![0]);
        let none = Array2::<f64>::zeros((0, 4));
        assert!(cluster_row_order(&none).is_empty());
    }
}
