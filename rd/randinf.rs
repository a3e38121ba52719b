//! # Randomization Inference for RD Designs
//!
//! Treats the units inside a window around the cutoff as if assignment
//! (`running >= cutoff`) had been randomized among them, and tests the effect
//! of crossing the cutoff with the permutation engine in `randomization`.
//!
//! - Sharp designs report the difference in means together with randomization
//!   and asymptotic p-values.
//! - Fuzzy designs with the Anderson-Rubin statistic test a hypothesised
//!   effect on the adjusted outcome `y - tau0 * d`. That test has no point
//!   estimate, and none is reported.
//! - Fuzzy designs with the TSLS statistic additionally report the Wald
//!   ratio of reduced form to first stage.
//!
//! With a polynomial order `p > 0`, each side's outcome (and treatment) is
//! replaced by the residuals of a degree-`p` fit in `running - cutoff` plus
//! that fit's intercept.

use crate::ols::{OlsError, fit_design, polynomial_design};
use crate::randomization::{
    TestStatistic, asymptotic_p_value, diff_in_means, mean, permutation_p_value, statistic_value,
};
use crate::winselect::{WindowSelectError, WindowSelectOptions, select_window};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

const WINDOW_TOLERANCE: f64 = 1e-9;

/// First stages smaller than this in absolute value are treated as zero.
const FIRST_STAGE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum RandInfError {
    #[error("The window [{left}, {right}] contains no observations on the {side} side of the cutoff.")]
    EmptySide { side: &'static str, left: f64, right: f64 },
    #[error("The window [{left}, {right}] does not straddle the cutoff {cutoff}.")]
    InvalidWindow { left: f64, right: f64, cutoff: f64 },
    #[error("Dimension mismatch: '{name}' has {found} rows, expected {expected}.")]
    DimensionMismatch { name: String, expected: usize, found: usize },
    #[error("No window bounds were given and no covariates are available to select one.")]
    WindowRequired,
    #[error("The first stage inside the window is zero; the TSLS estimate is undefined.")]
    WeakFirstStage,
    #[error("Polynomial adjustment failed: {0}")]
    Polynomial(#[from] OlsError),
    #[error("Window selection failed: {0}")]
    WindowSelection(#[from] WindowSelectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub left: f64,
    pub right: f64,
}

impl Window {
    pub fn contains(&self, x: f64) -> bool {
        x >= self.left - WINDOW_TOLERANCE && x <= self.right + WINDOW_TOLERANCE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuzzyStatistic {
    #[serde(rename = "ar")]
    AndersonRubin,
    #[serde(rename = "tsls")]
    Tsls,
}

impl FuzzyStatistic {
    pub fn label(self) -> &'static str {
        match self {
            FuzzyStatistic::AndersonRubin => "Anderson-Rubin",
            FuzzyStatistic::Tsls => "TSLS",
        }
    }
}

/// Treatment actually received, for fuzzy designs.
#[derive(Debug, Clone, Copy)]
pub struct Fuzzy<'a> {
    pub treatment: ArrayView1<'a, f64>,
    pub statistic: FuzzyStatistic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandInfOptions {
    pub cutoff: f64,
    pub order: usize,
    pub statistic: TestStatistic,
    /// Fixed window; selected from covariates when absent.
    pub window: Option<Window>,
    /// Effect under the sharp null hypothesis.
    pub null_tau: f64,
    pub reps: usize,
    pub seed: u64,
    pub window_selection: WindowSelectOptions,
}

impl Default for RandInfOptions {
    fn default() -> Self {
        Self {
            cutoff: 0.0,
            order: 0,
            statistic: TestStatistic::DiffMeans,
            window: None,
            null_tau: 0.0,
            reps: 1000,
            seed: 666,
            window_selection: WindowSelectOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RandInfResult {
    pub window: Window,
    pub n_control: usize,
    pub n_treated: usize,
    pub order: usize,
    pub statistic: TestStatistic,
    pub fuzzy: Option<FuzzyStatistic>,
    pub null_tau: f64,
    pub reps: usize,
    pub observed_statistic: f64,
    /// Point estimate; always `None` for the Anderson-Rubin statistic.
    pub estimate: Option<f64>,
    pub randomization_p: Option<f64>,
    pub asymptotic_p: Option<f64>,
    /// Difference in mean treatment across the cutoff, for fuzzy designs.
    pub first_stage: Option<f64>,
}

fn check_length(name: &str, expected: usize, found: usize) -> Result<(), RandInfError> {
    if expected == found {
        Ok(())
    } else {
        Err(RandInfError::DimensionMismatch {
            name: name.to_string(),
            expected,
            found,
        })
    }
}

/// Replaces each side's values by the residuals of a polynomial fit plus its intercept.
fn polynomial_adjust(
    values: &[f64],
    running: &[f64],
    treated: &[bool],
    cutoff: f64,
    order: usize,
) -> Result<Vec<f64>, OlsError> {
    let mut adjusted = values.to_vec();
    for side in [false, true] {
        let idx: Vec<usize> = (0..values.len()).filter(|&i| treated[i] == side).collect();
        let reach = idx
            .iter()
            .map(|&i| (running[i] - cutoff).abs())
            .fold(0.0, f64::max);
        let reach = if reach > 0.0 { reach } else { 1.0 };
        let x: Array1<f64> = idx.iter().map(|&i| (running[i] - cutoff) / reach).collect();
        let y: Array1<f64> = idx.iter().map(|&i| values[i]).collect();
        let (design, names) = polynomial_design(x.view(), 0.0, order);
        let fit = fit_design(y.view(), design.view(), names, true)?;
        let intercept = fit.coefficients[0].estimate;
        for (pos, &i) in idx.iter().enumerate() {
            adjusted[i] = fit.residuals[pos] + intercept;
        }
    }
    Ok(adjusted)
}

/// Just-identified IV estimate with a binary instrument, and its
/// homoskedastic normal-approximation p-value.
fn wald_estimate(y: &[f64], d: &[f64], z: &[bool]) -> Result<(f64, f64, f64), RandInfError> {
    let first_stage = diff_in_means(d, z);
    if !(first_stage.abs() > FIRST_STAGE_TOLERANCE) {
        return Err(RandInfError::WeakFirstStage);
    }
    let reduced_form = diff_in_means(y, z);
    let beta = reduced_form / first_stage;

    let n = y.len() as f64;
    let (y_bar, d_bar) = (mean(y), mean(d));
    let z_num: Vec<f64> = z.iter().map(|&t| if t { 1.0 } else { 0.0 }).collect();
    let z_bar = mean(&z_num);
    let alpha = y_bar - beta * d_bar;
    let sigma2 = y
        .iter()
        .zip(d)
        .map(|(yi, di)| (yi - alpha - beta * di).powi(2))
        .sum::<f64>()
        / (n - 2.0).max(1.0);
    let szz: f64 = z_num.iter().map(|zi| (zi - z_bar).powi(2)).sum();
    let szd: f64 = z_num.iter().zip(d).map(|(zi, di)| (zi - z_bar) * (di - d_bar)).sum();
    let se = (sigma2 * szz).sqrt() / szd.abs();
    let p = if se > 0.0 {
        Normal::new(0.0, 1.0)
            .map(|normal| 2.0 * normal.sf((beta / se).abs()))
            .unwrap_or(f64::NAN)
    } else {
        0.0
    };
    Ok((beta, p, first_stage))
}

/// Randomization inference on the units of the (given or selected) window.
pub fn randinf(
    outcome: ArrayView1<'_, f64>,
    running: ArrayView1<'_, f64>,
    options: &RandInfOptions,
    fuzzy: Option<Fuzzy<'_>>,
    covariates: Option<ArrayView2<'_, f64>>,
) -> Result<RandInfResult, RandInfError> {
    let n = running.len();
    check_length("outcome", n, outcome.len())?;
    if let Some(f) = &fuzzy {
        check_length("fuzzy treatment", n, f.treatment.len())?;
    }
    if let Some(cov) = &covariates {
        check_length("covariates", n, cov.nrows())?;
    }

    let cutoff = options.cutoff;
    let window = match options.window {
        Some(window) => window,
        None => {
            let cov = covariates.ok_or(RandInfError::WindowRequired)?;
            let selection = select_window(running, cov, &options.window_selection)?;
            let (left, right) = selection.selected_window();
            Window { left, right }
        }
    };
    if !(window.left < cutoff && window.right >= cutoff) {
        return Err(RandInfError::InvalidWindow {
            left: window.left,
            right: window.right,
            cutoff,
        });
    }

    let members: Vec<usize> = (0..n).filter(|&i| window.contains(running[i])).collect();
    let x: Vec<f64> = members.iter().map(|&i| running[i]).collect();
    let z: Vec<bool> = x.iter().map(|&xi| xi >= cutoff).collect();
    let n_treated = z.iter().filter(|&&t| t).count();
    let n_control = z.len() - n_treated;
    for (count, side) in [(n_control, "left"), (n_treated, "right")] {
        if count == 0 {
            return Err(RandInfError::EmptySide {
                side,
                left: window.left,
                right: window.right,
            });
        }
    }
    log::info!(
        "Randomization inference on [{}, {}]: {n_control} control and {n_treated} treated units.",
        window.left,
        window.right
    );

    let mut y: Vec<f64> = members.iter().map(|&i| outcome[i]).collect();
    let mut d: Option<Vec<f64>> = fuzzy
        .as_ref()
        .map(|f| members.iter().map(|&i| f.treatment[i]).collect());
    if options.order > 0 {
        y = polynomial_adjust(&y, &x, &z, cutoff, options.order)?;
        if let Some(treatment) = d.as_mut() {
            *treatment = polynomial_adjust(treatment, &x, &z, cutoff, options.order)?;
        }
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let tau = options.null_tau;
    let received: Vec<f64> = match &d {
        Some(treatment) => treatment.clone(),
        None => z.iter().map(|&t| if t { 1.0 } else { 0.0 }).collect(),
    };
    let adjusted: Vec<f64> = y.iter().zip(&received).map(|(yi, di)| yi - tau * di).collect();
    let randomization_p =
        permutation_p_value(options.statistic, &adjusted, &z, options.reps, &mut rng);
    let randomization_p = (!randomization_p.is_nan()).then_some(randomization_p);

    let fuzzy_statistic = fuzzy.map(|f| f.statistic);
    let result = match fuzzy_statistic {
        None => RandInfResult {
            observed_statistic: statistic_value(options.statistic, &adjusted, &z),
            estimate: Some(diff_in_means(&y, &z)),
            asymptotic_p: Some(asymptotic_p_value(options.statistic, &adjusted, &z)),
            first_stage: None,
            ..base_result(window, n_control, n_treated, options, None, randomization_p)
        },
        Some(FuzzyStatistic::AndersonRubin) => RandInfResult {
            observed_statistic: statistic_value(options.statistic, &adjusted, &z),
            estimate: None,
            asymptotic_p: Some(asymptotic_p_value(options.statistic, &adjusted, &z)),
            first_stage: Some(diff_in_means(&received, &z)),
            ..base_result(window, n_control, n_treated, options, fuzzy_statistic, randomization_p)
        },
        Some(FuzzyStatistic::Tsls) => {
            let (beta, p, first_stage) = wald_estimate(&y, &received, &z)?;
            RandInfResult {
                observed_statistic: beta,
                estimate: Some(beta),
                asymptotic_p: Some(p),
                first_stage: Some(first_stage),
                ..base_result(window, n_control, n_treated, options, fuzzy_statistic, randomization_p)
            }
        }
    };
    log::info!(
        "Observed statistic {:.4}, randomization p-value {}.",
        result.observed_statistic,
        result
            .randomization_p
            .map_or_else(|| "n/a".to_string(), |p| format!("{p:.3}"))
    );
    Ok(result)
}

fn base_result(
    window: Window,
    n_control: usize,
    n_treated: usize,
    options: &RandInfOptions,
    fuzzy: Option<FuzzyStatistic>,
    randomization_p: Option<f64>,
) -> RandInfResult {
    RandInfResult {
        window,
        n_control,
        n_treated,
        order: options.order,
        statistic: options.statistic,
        fuzzy,
        null_tau: options.null_tau,
        reps: options.reps,
        observed_statistic: f64::NAN,
        estimate: None,
        randomization_p,
        asymptotic_p: None,
        first_stage: None,
    }
}
