//! # RD Plot Data
//!
//! Computes what an RD plot shows: evenly spaced bin means of the outcome on
//! each side of the cutoff and a global polynomial fitted separately on each
//! side. Rendering lives in `plot::rd_plot`.

use crate::ols::{OlsError, evaluate_polynomial, fit_design, polynomial_design};
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RdPlotError {
    #[error("There are no observations on the {0} side of the cutoff.")]
    EmptySide(&'static str),
    #[error("Outcome has {outcome} values but the running variable has {running}.")]
    LengthMismatch { outcome: usize, running: usize },
    #[error("Polynomial fit failed: {0}")]
    Ols(#[from] OlsError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RdPlotOptions {
    pub cutoff: f64,
    pub order: usize,
    /// Bins per side; defaults to the number of distinct running values on
    /// that side, at most `MAX_DEFAULT_BINS`.
    pub bins_per_side: Option<usize>,
    pub curve_points: usize,
}

pub const MAX_DEFAULT_BINS: usize = 20;

impl Default for RdPlotOptions {
    fn default() -> Self {
        Self {
            cutoff: 0.0,
            order: 4,
            bins_per_side: None,
            curve_points: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    /// Midpoint of the bin's running-variable interval.
    pub center: f64,
    pub mean: f64,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct SideFit {
    pub n_obs: usize,
    pub bins: Vec<Bin>,
    pub order: usize,
    pub curve_x: Vec<f64>,
    pub curve_y: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct RdPlotData {
    pub cutoff: f64,
    pub left: SideFit,
    pub right: SideFit,
}

impl RdPlotData {
    /// Difference between the two fitted curves at the cutoff.
    pub fn jump_at_cutoff(&self) -> Option<f64> {
        let left = self.left.curve_y.last()?;
        let right = self.right.curve_y.first()?;
        Some(right - left)
    }
}

fn distinct_count(values: &[f64]) -> usize {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    sorted.len()
}

fn bin_side(x: &[f64], y: &[f64], lo: f64, hi: f64, nbins: usize) -> Vec<Bin> {
    let width = (hi - lo) / nbins as f64;
    let mut sums = vec![0.0; nbins];
    let mut counts = vec![0usize; nbins];
    for (&xi, &yi) in x.iter().zip(y) {
        let idx = if width > 0.0 {
            (((xi - lo) / width).floor() as usize).min(nbins - 1)
        } else {
            0
        };
        sums[idx] += yi;
        counts[idx] += 1;
    }
    (0..nbins)
        .filter(|&b| counts[b] > 0)
        .map(|b| Bin {
            center: lo + width * (b as f64 + 0.5),
            mean: sums[b] / counts[b] as f64,
            count: counts[b],
        })
        .collect()
}

fn fit_side(
    x: &[f64],
    y: &[f64],
    lo: f64,
    hi: f64,
    options: &RdPlotOptions,
) -> Result<SideFit, RdPlotError> {
    let distinct = distinct_count(x);
    let nbins = options
        .bins_per_side
        .unwrap_or_else(|| distinct.min(MAX_DEFAULT_BINS))
        .max(1);
    let bins = bin_side(x, y, lo, hi, nbins);

    // The polynomial needs more distinct points than coefficients.
    let order = options.order.min(distinct.saturating_sub(2));
    if order < options.order {
        log::warn!(
            "Reducing the RD plot polynomial order from {} to {order} on a side with {distinct} distinct values.",
            options.order
        );
    }
    // Fit in (x - cutoff) / reach so high powers stay well conditioned.
    let reach = x
        .iter()
        .map(|v| (v - options.cutoff).abs())
        .fold(0.0, f64::max);
    let reach = if reach > 0.0 { reach } else { 1.0 };
    let xs: Array1<f64> = x.iter().map(|v| (v - options.cutoff) / reach).collect();
    let ys = Array1::from_vec(y.to_vec());
    let (design, names) = polynomial_design(xs.view(), 0.0, order);
    let coefficients = if distinct >= 2 {
        fit_design(ys.view(), design.view(), names, true)?.estimates()
    } else {
        Array1::from_elem(1, ys.mean().unwrap_or(f64::NAN))
    };

    let points = options.curve_points.max(2);
    let step = (hi - lo) / (points - 1) as f64;
    let curve_x: Vec<f64> = (0..points).map(|i| lo + step * i as f64).collect();
    let curve_y = curve_x
        .iter()
        .map(|&xv| evaluate_polynomial(&coefficients, (xv - options.cutoff) / reach, 0.0))
        .collect();
    Ok(SideFit {
        n_obs: x.len(),
        bins,
        order,
        curve_x,
        curve_y,
    })
}

pub fn rdplot(
    outcome: ArrayView1<'_, f64>,
    running: ArrayView1<'_, f64>,
    options: &RdPlotOptions,
) -> Result<RdPlotData, RdPlotError> {
    if outcome.len() != running.len() {
        return Err(RdPlotError::LengthMismatch {
            outcome: outcome.len(),
            running: running.len(),
        });
    }
    let cutoff = options.cutoff;
    let (mut lx, mut ly, mut rx, mut ry) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    for (&x, &y) in running.iter().zip(outcome.iter()) {
        if x >= cutoff {
            rx.push(x);
            ry.push(y);
        } else {
            lx.push(x);
            ly.push(y);
        }
    }
    if lx.is_empty() {
        return Err(RdPlotError::EmptySide("left"));
    }
    if rx.is_empty() {
        return Err(RdPlotError::EmptySide("right"));
    }
    let min = lx.iter().copied().fold(f64::INFINITY, f64::min);
    let max = rx.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let left = fit_side(&lx, &ly, min, cutoff, options)?;
    let right = fit_side(&rx, &ry, cutoff, max, options)?;
    log::info!(
        "RD plot: {} bins and order {} on the left, {} bins and order {} on the right.",
        left.bins.len(),
        left.order,
        right.bins.len(),
        right.order
    );
    Ok(RdPlotData { cutoff, left, right })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ages() -> Array1<f64> {
        (-10..=10)
            .flat_map(|a| std::iter::repeat_n(a as f64, 4))
            .collect()
    }

    #[test]
    fn linear_sides_recover_the_jump() {
        let running = ages();
        let outcome = running.mapv(|x| 10.0 + 0.5 * x + if x >= 0.0 { 2.0 } else { 0.0 });
        let options = RdPlotOptions {
            order: 1,
            ..RdPlotOptions::default()
        };
        let data = rdplot(outcome.view(), running.view(), &options).unwrap();
        assert_abs_diff_eq!(data.jump_at_cutoff().unwrap(), 2.0, epsilon = 1e-8);
        assert_eq!(data.left.n_obs, 40);
        assert_eq!(data.right.n_obs, 44);
        assert_eq!(data.left.curve_x.len(), 100);
    }

    #[test]
    fn default_bins_follow_distinct_values() {
        let running = ages();
        let outcome = running.mapv(|x| x * x);
        let data = rdplot(outcome.view(), running.view(), &RdPlotOptions::default()).unwrap();
        assert_eq!(data.left.bins.len(), 10);
        assert_eq!(data.right.bins.len(), 11);
        let total: usize = data.left.bins.iter().map(|b| b.count).sum();
        assert_eq!(total, 40);
    }

    #[test]
    fn explicit_bin_count_is_respected() {
        let running = ages();
        let outcome = running.clone();
        let options = RdPlotOptions {
            bins_per_side: Some(2),
            ..RdPlotOptions::default()
        };
        let data = rdplot(outcome.view(), running.view(), &options).unwrap();
        assert_eq!(data.left.bins.len(), 2);
        assert_eq!(data.right.bins.len(), 2);
    }

    #[test]
    fn order_is_reduced_on_sparse_sides() {
        let running = Array1::from_vec(vec![-2.0, -1.0, -1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let outcome = running.mapv(|x| x + 1.0);
        let data = rdplot(outcome.view(), running.view(), &RdPlotOptions::default()).unwrap();
        assert_eq!(data.left.order, 0);
        assert_eq!(data.right.order, 4);
    }

    #[test]
    fn one_sided_data_is_rejected() {
        let running = Array1::from_vec(vec![1.0, 2.0, 3.0]);
        let outcome = Array1::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            rdplot(outcome.view(), running.view(), &RdPlotOptions::default()),
            Err(RdPlotError::EmptySide("left"))
        ));
    }
}
