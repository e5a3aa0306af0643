//! Hill-equation dose-response fit for titration curves (knockdown or growth
//! rate versus inducer concentration), by damped Gauss-Newton over the normal
//! equations.

use anyhow::{anyhow, bail, Result};
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use serde::Serialize;
use tracing::debug;

const MAX_OUTER: usize = 200;
const MAX_DAMPING: usize = 12;

/// Fitted 4-parameter Hill curve
/// `y = bottom + (top - bottom) * x^h / (ec50^h + x^h)`.
/// `bottom` is the zero-dose asymptote, `top` the saturating one, so a
/// knockdown curve simply fits with `top < bottom`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HillFit {
    pub bottom: f64,
    pub top: f64,
    pub ec50: f64,
    pub hill: f64,
    pub r_squared: f64,
}

fn hill(x: f64, p: &[f64; 4]) -> f64 {
    let [bottom, top, ec50, h] = *p;
    if x <= 0.0 {
        return bottom;
    }
    let u = (x / ec50).powf(h);
    bottom + (top - bottom) * u / (1.0 + u)
}

fn jacobian_row(x: f64, p: &[f64; 4]) -> [f64; 4] {
    let [bottom, top, ec50, h] = *p;
    if x <= 0.0 {
        return [1.0, 0.0, 0.0, 0.0];
    }
    let u = (x / ec50).powf(h);
    let s = u / (1.0 + u);
    let ds_du = 1.0 / (1.0 + u).powi(2);
    [
        1.0 - s,
        s,
        (top - bottom) * ds_du * (-h * u / ec50),
        (top - bottom) * ds_du * u * (x / ec50).ln(),
    ]
}

fn sse(x: &[f64], y: &[f64], p: &[f64; 4]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - hill(xi, p)).powi(2))
        .sum()
}

fn clamp(p: &mut [f64; 4]) {
    p[2] = p[2].abs().max(1e-9);
    p[3] = p[3].clamp(1e-3, 50.0);
}

fn initial_guess(x: &[f64], y: &[f64]) -> [f64; 4] {
    // zero-dose level from the lowest dose, plateau from the highest
    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));
    let bottom = y[order[0]];
    let top = y[order[order.len() - 1]];

    let logs: Vec<f64> = x.iter().filter(|&&v| v > 0.0).map(|v| v.ln()).collect();
    let ec50 = if logs.is_empty() {
        1.0
    } else {
        (logs.iter().sum::<f64>() / logs.len() as f64).exp()
    };
    [bottom, top, ec50, 1.0]
}

/// Least-squares Hill fit. Needs at least 5 finite (dose, response) points,
/// doses non-negative with at least two distinct positive values.
pub fn fit_hill(x: &[f64], y: &[f64]) -> Result<HillFit> {
    if x.len() != y.len() {
        bail!("dose and response lengths differ ({} vs {})", x.len(), y.len());
    }
    if x.len() < 5 {
        bail!("{} points is too few for a 4-parameter fit", x.len());
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) || x.iter().any(|&v| v < 0.0) {
        bail!("doses must be finite and non-negative, responses finite");
    }

    let n = x.len();
    let mut p = initial_guess(x, y);
    clamp(&mut p);
    let mut cur_sse = sse(x, y, &p);
    let mut lambda = 1e-3;

    for iter in 0..MAX_OUTER {
        let mut j = Array2::<f64>::zeros((n, 4));
        let mut r = Array1::<f64>::zeros(n);
        for (i, (&xi, &yi)) in x.iter().zip(y).enumerate() {
            let row = jacobian_row(xi, &p);
            for k in 0..4 {
                j[[i, k]] = row[k];
            }
            r[i] = yi - hill(xi, &p);
        }
        let jtj = j.t().dot(&j);
        let jtr = j.t().dot(&r);

        let mut improved = false;
        for _ in 0..MAX_DAMPING {
            let mut a = jtj.clone();
            // Marquardt damping on the diagonal
            for k in 0..4 {
                a[[k, k]] = a[[k, k]] * (1.0 + lambda) + 1e-12;
            }
            let a_inv = match a.inv() {
                Ok(inv) => inv,
                Err(_) => {
                    lambda *= 10.0;
                    continue;
                }
            };
            let step = a_inv.dot(&jtr);
            let mut cand = [p[0] + step[0], p[1] + step[1], p[2] + step[2], p[3] + step[3]];
            clamp(&mut cand);
            let cand_sse = sse(x, y, &cand);
            if cand_sse.is_finite() && cand_sse < cur_sse {
                let delta = cur_sse - cand_sse;
                p = cand;
                cur_sse = cand_sse;
                lambda = (lambda / 3.0).max(1e-12);
                improved = true;
                if delta < 1e-12 * (1.0 + cur_sse) {
                    debug!("hill fit converged after {iter} iterations, sse {cur_sse:.3e}");
                    return Ok(finish(p, cur_sse, y));
                }
                break;
            }
            lambda *= 3.0;
        }
        if !improved {
            break;
        }
    }

    if !cur_sse.is_finite() {
        return Err(anyhow!("hill fit diverged"));
    }
    Ok(finish(p, cur_sse, y))
}

fn finish(p: [f64; 4], cur_sse: f64, y: &[f64]) -> HillFit {
    let mean_y = y.iter().sum::<f64>() / y.len() as f64;
    let sst: f64 = y.iter().map(|v| (v - mean_y).powi(2)).sum();
    let r_squared = if sst > 0.0 { 1.0 - cur_sse / sst } else { 1.0 };
    HillFit {
        bottom: p[0],
        top: p[1],
        ec50: p[2],
        hill: p[3],
        r_squared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_knockdown_curve() {
        // growth rate falling from 0.9 to 0.2 with ec50 5 nM, hill 2
        let truth = [0.9, 0.2, 5.0, 2.0];
        let x: Vec<f64> = vec![0.0, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0];
        let y: Vec<f64> = x.iter().map(|&xi| hill(xi, &truth)).collect();

        let fit = fit_hill(&x, &y).unwrap();
        assert!((fit.ec50 - 5.0).abs() / 5.0 < 0.02, "ec50 {}", fit.ec50);
        assert!((fit.hill - 2.0).abs() / 2.0 < 0.05, "hill {}", fit.hill);
        assert!(fit.r_squared > 0.9999);
        assert!(fit.top < fit.bottom);
    }

    #[test]
    fn too_few_points_is_an_error() {
        assert!(fit_hill(&[0.0, 1.0, 2.0], &[1.0, 0.8, 0.5]).is_err());
    }

    #[test]
    fn rejects_non_finite_input() {
        let x = vec![0.0, 1.0, 2.0, 4.0, 8.0];
        let y = vec![1.0, f64::NAN, 0.5, 0.3, 0.2];
        assert!(fit_hill(&x, &y).is_err());
    }
}
