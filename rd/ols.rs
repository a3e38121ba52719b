//! # Ordinary Least Squares
//!
//! Closed-form least squares through the normal equations `(XᵀX)β = Xᵀy`,
//! factorised with a Cholesky decomposition. Alongside the coefficients the
//! fit carries the usual inferential summary: standard errors, t statistics
//! with Student-t p-values, R², adjusted R² and the overall F test.
//!
//! Collinear designs are rejected before factorisation by inspecting the
//! spectrum of the column-scaled Gram matrix.

use crate::faer_ndarray::{FaerCholesky, FaerEigh, FaerLinalgError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use thiserror::Error;

/// Smallest admissible ratio between the extreme eigenvalues of the scaled
/// Gram matrix before the design is declared singular.
const SINGULARITY_THRESHOLD: f64 = 1e-12;

pub const INTERCEPT: &str = "(Intercept)";

#[derive(Error, Debug)]
pub enum OlsError {
    #[error("Predictor '{name}' has {found} values but the response has {expected}.")]
    DimensionMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("The design is singular: predictors are collinear ({0}).")]
    Singular(String),
    #[error("{observations} observations are not enough to estimate {parameters} parameters.")]
    InsufficientObservations {
        observations: usize,
        parameters: usize,
    },
    #[error("Non-finite values found in '{0}'.")]
    NonFinite(String),
    #[error("A model needs at least one predictor or an intercept.")]
    EmptyModel,
    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// A named predictor column.
#[derive(Debug, Clone)]
pub struct Regressor<'a> {
    pub name: String,
    pub values: ArrayView1<'a, f64>,
}

impl<'a> Regressor<'a> {
    pub fn new(name: impl Into<String>, values: ArrayView1<'a, f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone)]
pub struct OlsFit {
    pub coefficients: Vec<Coefficient>,
    pub has_intercept: bool,
    pub n_obs: usize,
    pub df_residual: usize,
    pub residual_std_error: f64,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    /// Overall F test against the intercept-only (or empty) model; absent for
    /// intercept-only fits.
    pub f_statistic: Option<(f64, usize, usize)>,
    pub f_p_value: Option<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
}

impl OlsFit {
    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    pub fn estimates(&self) -> Array1<f64> {
        self.coefficients.iter().map(|c| c.estimate).collect()
    }
}

/// Two-sided p-value of a t statistic with `df` degrees of freedom.
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if t.is_nan() {
        return f64::NAN;
    }
    StudentsT::new(0.0, 1.0, df)
        .map(|dist| 2.0 * dist.sf(t.abs()))
        .unwrap_or(f64::NAN)
}

fn f_upper_tail(f: f64, df1: f64, df2: f64) -> f64 {
    if f.is_nan() {
        return f64::NAN;
    }
    if f.is_infinite() {
        return 0.0;
    }
    FisherSnedecor::new(df1, df2)
        .map(|dist| dist.sf(f))
        .unwrap_or(f64::NAN)
}

/// Assembles the design matrix, prepending a column of ones when requested.
fn design_matrix(
    n: usize,
    regressors: &[Regressor<'_>],
    intercept: bool,
) -> Result<(Array2<f64>, Vec<String>), OlsError> {
    let k = regressors.len() + usize::from(intercept);
    let mut x = Array2::zeros((n, k));
    let mut names = Vec::with_capacity(k);
    let mut col = 0;
    if intercept {
        x.column_mut(0).fill(1.0);
        names.push(INTERCEPT.to_string());
        col = 1;
    }
    for regressor in regressors {
        if regressor.values.len() != n {
            return Err(OlsError::DimensionMismatch {
                name: regressor.name.clone(),
                expected: n,
                found: regressor.values.len(),
            });
        }
        if regressor.values.iter().any(|v| !v.is_finite()) {
            return Err(OlsError::NonFinite(regressor.name.clone()));
        }
        x.column_mut(col).assign(&regressor.values);
        names.push(regressor.name.clone());
        col += 1;
    }
    Ok((x, names))
}

/// Rejects designs whose scaled Gram matrix is numerically rank deficient.
fn check_rank(gram: &Array2<f64>, names: &[String]) -> Result<(), OlsError> {
    let scale: Array1<f64> = gram.diag().mapv(f64::sqrt);
    if let Some(idx) = scale.iter().position(|&s| s == 0.0) {
        return Err(OlsError::Singular(format!("'{}' is identically zero", names[idx])));
    }
    let scaled = Array2::from_shape_fn(gram.dim(), |(i, j)| gram[[i, j]] / (scale[i] * scale[j]));
    let eigenvalues = scaled.symmetric_eigenvalues()?;
    let smallest = eigenvalues[0];
    let largest = eigenvalues[eigenvalues.len() - 1];
    if !(smallest > SINGULARITY_THRESHOLD * largest) {
        return Err(OlsError::Singular(format!(
            "eigenvalue ratio {:.3e} of the scaled cross-product matrix",
            smallest / largest
        )));
    }
    Ok(())
}

/// Fits `response ~ regressors` (plus an intercept when `intercept` is set).
pub fn fit_ols(
    response: ArrayView1<'_, f64>,
    regressors: &[Regressor<'_>],
    intercept: bool,
) -> Result<OlsFit, OlsError> {
    let n = response.len();
    if regressors.is_empty() && !intercept {
        return Err(OlsError::EmptyModel);
    }
    if response.iter().any(|v| !v.is_finite()) {
        return Err(OlsError::NonFinite("response".to_string()));
    }
    let (x, names) = design_matrix(n, regressors, intercept)?;
    fit_design(response, x.view(), names, intercept)
}

/// Fits a pre-assembled design matrix whose columns are named by `names`.
pub fn fit_design(
    response: ArrayView1<'_, f64>,
    x: ArrayView2<'_, f64>,
    names: Vec<String>,
    has_intercept: bool,
) -> Result<OlsFit, OlsError> {
    let (n, k) = x.dim();
    if response.len() != n {
        return Err(OlsError::DimensionMismatch {
            name: "response".to_string(),
            expected: n,
            found: response.len(),
        });
    }
    if n <= k {
        return Err(OlsError::InsufficientObservations {
            observations: n,
            parameters: k,
        });
    }

    let gram = x.t().dot(&x);
    check_rank(&gram, &names)?;
    let factor = gram
        .cholesky()
        .map_err(|e| OlsError::Singular(e.to_string()))?;
    let xty = x.t().dot(&response);
    let beta = factor.solve_vec(&xty);

    let fitted = x.dot(&beta);
    let residuals = &response - &fitted;
    let rss = residuals.dot(&residuals);
    let df_residual = n - k;
    let sigma2 = rss / df_residual as f64;
    let covariance = factor.inverse() * sigma2;

    let coefficients = names
        .into_iter()
        .enumerate()
        .map(|(j, name)| {
            let estimate = beta[j];
            let std_error = covariance[[j, j]].max(0.0).sqrt();
            let t_value = estimate / std_error;
            Coefficient {
                name,
                estimate,
                std_error,
                t_value,
                p_value: student_t_two_sided(t_value, df_residual as f64),
            }
        })
        .collect();

    let tss = if has_intercept {
        let mean = response.mean().unwrap_or(0.0);
        response.iter().map(|y| (y - mean).powi(2)).sum::<f64>()
    } else {
        response.dot(&response)
    };
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { f64::NAN };
    let df_model = k - usize::from(has_intercept);
    let df_total = n - usize::from(has_intercept);
    let adj_r_squared = 1.0 - (1.0 - r_squared) * df_total as f64 / df_residual as f64;

    let (f_statistic, f_p_value) = if df_model > 0 {
        let f = ((tss - rss) / df_model as f64) / sigma2;
        let f = if sigma2 == 0.0 { f64::INFINITY } else { f };
        (
            Some((f, df_model, df_residual)),
            Some(f_upper_tail(f, df_model as f64, df_residual as f64)),
        )
    } else {
        (None, None)
    };

    log::debug!(
        "OLS fit: n={n}, k={k}, rss={rss:.6e}, r2={r_squared:.4}"
    );

    Ok(OlsFit {
        coefficients,
        has_intercept,
        n_obs: n,
        df_residual,
        residual_std_error: sigma2.sqrt(),
        r_squared,
        adj_r_squared,
        f_statistic,
        f_p_value,
        fitted,
        residuals,
    })
}

/// Design with columns `(x - center)^1 .. (x - center)^order` and an intercept.
pub fn polynomial_design(x: ArrayView1<'_, f64>, center: f64, order: usize) -> (Array2<f64>, Vec<String>) {
    let mut design = Array2::ones((x.len(), order + 1));
    for power in 1..=order {
        let column = x.mapv(|v| (v - center).powi(power as i32));
        design.index_axis_mut(Axis(1), power).assign(&column);
    }
    let names = std::iter::once(INTERCEPT.to_string())
        .chain((1..=order).map(|p| format!("x^{p}")))
        .collect();
    (design, names)
}

/// Evaluates a polynomial in `(x - center)` with coefficients in ascending power.
pub fn evaluate_polynomial(coefficients: &Array1<f64>, x: f64, center: f64) -> f64 {
    let dx = x - center;
    coefficients.iter().rev().fold(0.0, |acc, c| acc * dx + c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn recovers_exact_linear_relationship() {
        let x = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let noise = array![0.1, -0.1, 0.05, -0.05, 0.0];
        let y = x.mapv(|v| 2.0 + 3.0 * v) + &noise;
        let fit = fit_ols(y.view(), &[Regressor::new("x", x.view())], true).unwrap();

        let slope = fit.coefficient("x").unwrap();
        let intercept = fit.coefficient(INTERCEPT).unwrap();
        assert_abs_diff_eq!(slope.estimate, 2.985, epsilon = 1e-10);
        assert_abs_diff_eq!(intercept.estimate, 2.045, epsilon = 1e-10);
        assert!(fit.r_squared > 0.999);
        assert_eq!(fit.df_residual, 3);
        assert!(slope.p_value < 1e-4);
    }

    #[test]
    fn standard_errors_match_textbook_formula() {
        let x = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let y = array![1.2, 1.9, 3.2, 3.8, 5.1, 6.3];
        let fit = fit_ols(y.view(), &[Regressor::new("x", x.view())], true).unwrap();

        let x_mean = x.mean().unwrap();
        let sxx: f64 = x.iter().map(|v| (v - x_mean).powi(2)).sum();
        let sigma = fit.residual_std_error;
        let expected_se = sigma / sxx.sqrt();
        assert_abs_diff_eq!(fit.coefficient("x").unwrap().std_error, expected_se, epsilon = 1e-10);

        let (f, df1, df2) = fit.f_statistic.unwrap();
        let t = fit.coefficient("x").unwrap().t_value;
        assert_abs_diff_eq!(f, t * t, epsilon = 1e-8);
        assert_eq!((df1, df2), (1, 4));
    }

    #[test]
    fn refitting_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(20);
        let x1: Array1<f64> = (0..50).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let x2: Array1<f64> = (0..50).map(|_| rng.gen_range(0.0..10.0)).collect();
        let y: Array1<f64> = (0..50)
            .map(|i| 1.0 + 0.5 * x1[i] - 0.2 * x2[i] + rng.gen_range(-0.3..0.3))
            .collect();
        let regressors = [Regressor::new("x1", x1.view()), Regressor::new("x2", x2.view())];
        let first = fit_ols(y.view(), &regressors, true).unwrap();
        let second = fit_ols(y.view(), &regressors, true).unwrap();
        assert_eq!(first.coefficients, second.coefficients);
    }

    #[test]
    fn collinear_predictors_are_singular() {
        let x1 = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let x2 = x1.mapv(|v| 2.0 * v);
        let y = array![1.0, 3.0, 2.0, 5.0, 4.0];
        let err = fit_ols(
            y.view(),
            &[Regressor::new("x1", x1.view()), Regressor::new("x2", x2.view())],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, OlsError::Singular(_)), "got {err:?}");
    }

    #[test]
    fn constant_predictor_collides_with_intercept() {
        let x = array![1.0, 1.0, 1.0, 1.0];
        let y = array![1.0, 2.0, 3.0, 4.0];
        let err = fit_ols(y.view(), &[Regressor::new("x", x.view())], true).unwrap_err();
        assert!(matches!(err, OlsError::Singular(_)), "got {err:?}");
    }

    #[test]
    fn too_few_observations_is_an_error() {
        let x = array![1.0, 2.0];
        let y = array![1.0, 2.0];
        let err = fit_ols(y.view(), &[Regressor::new("x", x.view())], true).unwrap_err();
        assert!(matches!(err, OlsError::InsufficientObservations { .. }));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let x = array![1.0, 2.0, 3.0];
        let y = array![1.0, 2.0, 3.0, 4.0];
        let err = fit_ols(y.view(), &[Regressor::new("x", x.view())], true).unwrap_err();
        assert!(matches!(err, OlsError::DimensionMismatch { .. }));
    }

    #[test]
    fn intercept_only_model_estimates_the_mean() {
        let y = array![2.0, 4.0, 6.0, 8.0];
        let fit = fit_ols(y.view(), &[], true).unwrap();
        assert_abs_diff_eq!(fit.coefficients[0].estimate, 5.0, epsilon = 1e-12);
        assert!(fit.f_statistic.is_none());
    }

    #[test]
    fn binary_treatment_coefficient_is_difference_in_means() {
        let d = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let y = array![1.0, 2.0, 3.0, 5.0, 6.0, 7.0];
        let fit = fit_ols(y.view(), &[Regressor::new("retired", d.view())], true).unwrap();
        assert_abs_diff_eq!(fit.coefficient("retired").unwrap().estimate, 4.0, epsilon = 1e-10);
    }

    #[test]
    fn polynomial_helpers_round_trip_a_quadratic() {
        let x = array![-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0];
        let y = x.mapv(|v: f64| 1.0 - 0.5 * v + 0.25 * v * v);
        let (design, names) = polynomial_design(x.view(), 0.0, 2);
        let fit = fit_design(y.view(), design.view(), names, true).unwrap();
        let beta = fit.estimates();
        assert_abs_diff_eq!(evaluate_polynomial(&beta, 4.0, 0.0), 1.0 - 2.0 + 4.0, epsilon = 1e-8);
    }
}
