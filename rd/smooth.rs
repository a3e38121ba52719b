//! LOESS trend lines for the scatter plots.
//!
//! Each grid point gets its own weighted polynomial fit over the nearest
//! `span * n` observations, weighted by the tricube kernel of the scaled
//! distance. The fitted value at the grid point is the local intercept.

use crate::faer_ndarray::{FaerCholesky, FaerEigh};
use ndarray::{Array1, Array2, ArrayView1};
use thiserror::Error;

/// Smallest acceptable eigenvalue ratio of a local weighted Gram matrix.
const LOCAL_CONDITION_FLOOR: f64 = 1e-10;

#[derive(Error, Debug, PartialEq)]
pub enum SmoothError {
    #[error("LOESS of degree {degree} needs at least {required} distinct x values, found {found}.")]
    TooFewPoints { degree: usize, required: usize, found: usize },
    #[error("x has {x} values but y has {y}.")]
    LengthMismatch { x: usize, y: usize },
    #[error("LOESS span must be positive, got {0}.")]
    InvalidSpan(f64),
    #[error("LOESS input contains non-finite values.")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoessOptions {
    pub span: f64,
    pub degree: usize,
    pub grid_points: usize,
}

impl Default for LoessOptions {
    fn default() -> Self {
        Self {
            span: 0.75,
            degree: 2,
            grid_points: 80,
        }
    }
}

/// A smoothed curve evaluated on an even grid.
#[derive(Debug, Clone)]
pub struct Curve {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u * u;
        t * t * t
    }
}

/// Weighted least squares intercept of a degree-`degree` polynomial in `(x - x0) / h`.
fn local_intercept(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>, weights: &[f64], x0: f64, h: f64, degree: usize) -> Option<f64> {
    let k = degree + 1;
    let mut gram = Array2::<f64>::zeros((k, k));
    let mut rhs = Array1::<f64>::zeros(k);
    let mut powers = vec![0.0; 2 * k - 1];
    for ((&xi, &yi), &w) in x.iter().zip(y.iter()).zip(weights) {
        if w == 0.0 {
            continue;
        }
        let u = (xi - x0) / h;
        let mut p = w;
        for power in powers.iter_mut() {
            *power = p;
            p *= u;
        }
        for a in 0..k {
            rhs[a] += powers[a] * yi;
            for b in 0..k {
                gram[[a, b]] += powers[a + b];
            }
        }
    }
    let eigenvalues = gram.symmetric_eigenvalues().ok()?;
    let largest = eigenvalues.last().copied().unwrap_or(0.0);
    if !(largest > 0.0) || eigenvalues[0] / largest < LOCAL_CONDITION_FLOOR {
        return None;
    }
    let beta = gram.cholesky().ok()?.solve_vec(&rhs);
    beta[0].is_finite().then_some(beta[0])
}

fn distinct_count(x: ArrayView1<'_, f64>) -> usize {
    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    sorted.len()
}

/// Fits a LOESS curve of `y` on `x`, evaluated on `grid_points` points
/// spanning the range of `x`.
pub fn loess(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>, options: &LoessOptions) -> Result<Curve, SmoothError> {
    if x.len() != y.len() {
        return Err(SmoothError::LengthMismatch { x: x.len(), y: y.len() });
    }
    if !(options.span > 0.0) {
        return Err(SmoothError::InvalidSpan(options.span));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(SmoothError::NonFinite);
    }
    let distinct = distinct_count(x);
    if distinct < options.degree + 1 || distinct < 2 {
        return Err(SmoothError::TooFewPoints {
            degree: options.degree,
            required: (options.degree + 1).max(2),
            found: distinct,
        });
    }

    let n = x.len();
    let neighbours = ((options.span * n as f64).ceil() as usize).clamp(options.degree + 1, n);
    let lo = x.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let points = options.grid_points.max(2);
    let step = (hi - lo) / (points - 1) as f64;

    let mut curve = Curve {
        x: Vec::with_capacity(points),
        y: Vec::with_capacity(points),
    };
    let mut distances = vec![0.0; n];
    let mut weights = vec![0.0; n];
    for g in 0..points {
        let x0 = lo + step * g as f64;
        for (d, &xi) in distances.iter_mut().zip(x.iter()) {
            *d = (xi - x0).abs();
        }
        let mut sorted = distances.clone();
        sorted.sort_by(f64::total_cmp);
        let mut h = sorted[neighbours - 1];
        if options.span > 1.0 {
            h *= options.span;
        }
        // A zero radius only happens with heavily tied x; widen to the next distinct distance.
        if h <= 0.0 {
            h = sorted.iter().copied().find(|&d| d > 0.0).unwrap_or(1.0);
        }
        let radius = h * (1.0 + 1e-10);
        for (w, &d) in weights.iter_mut().zip(&distances) {
            *w = tricube(d / radius);
        }

        let value = (0..=options.degree)
            .rev()
            .find_map(|degree| local_intercept(x, y, &weights, x0, h, degree));
        let value = match value {
            Some(v) => v,
            None => {
                log::debug!("LOESS fell back to the global mean at x = {x0}.");
                y.mean().unwrap_or(f64::NAN)
            }
        };
        curve.x.push(x0);
        curve.y.push(value);
    }
    Ok(curve)
}
