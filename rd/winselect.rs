//! # Window Selection
//!
//! Scans a sequence of nested windows around the cutoff and tests, inside each
//! one, whether the pre-treatment covariates are balanced between the units
//! just below and just above the cutoff. A window passes when the smallest
//! balance p-value across covariates exceeds the significance level.
//!
//! Every window draws its permutations from its own seeded stream, so the
//! scan can run in parallel and its results do not depend on how many
//! windows are requested.

use crate::randomization::{TestStatistic, asymptotic_p_value, permutation_p_value, stream_rng};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::io::IsTerminal;
use thiserror::Error;

/// Balance level used when none is configured.
pub const DEFAULT_LEVEL: f64 = 0.15;

/// Slack when deciding whether a running value lies on a window boundary.
const BOUNDARY_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum WindowSelectError {
    #[error(
        "No scanned window reached the balance level {level}; the largest half-width tried was {largest}."
    )]
    NoValidWindow { level: f64, largest: f64 },
    #[error("Dimension mismatch: the running variable has {running} rows but the covariates have {covariates}.")]
    DimensionMismatch { running: usize, covariates: usize },
    #[error("Window selection needs at least one covariate.")]
    NoCovariates,
    #[error("Invalid window selection option: {0}")]
    InvalidOption(String),
    #[error("There are no observations on the {0} side of the cutoff.")]
    EmptySide(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSelectOptions {
    pub cutoff: f64,
    /// Smallest half-width; derived from `obsmin` when absent.
    pub wmin: Option<f64>,
    pub wstep: f64,
    pub nwindows: usize,
    pub obsmin: usize,
    pub level: Option<f64>,
    pub statistic: TestStatistic,
    pub approximate: bool,
    pub reps: usize,
    pub seed: u64,
}

impl Default for WindowSelectOptions {
    fn default() -> Self {
        Self {
            cutoff: 0.0,
            wmin: None,
            wstep: 1.0,
            nwindows: 10,
            obsmin: 10,
            level: None,
            statistic: TestStatistic::DiffMeans,
            approximate: false,
            reps: 1000,
            seed: 666,
        }
    }
}

impl WindowSelectOptions {
    pub fn effective_level(&self) -> f64 {
        self.level.unwrap_or(DEFAULT_LEVEL)
    }
}

/// Balance test outcome for one scanned window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowBalance {
    pub half_width: f64,
    pub left: f64,
    pub right: f64,
    pub n_control: usize,
    pub n_treated: usize,
    /// Minimum balance p-value over covariates; `None` when a side is empty.
    pub p_value: Option<f64>,
    /// Index of the covariate attaining the minimum p-value.
    pub binding_covariate: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct WindowSelection {
    pub windows: Vec<WindowBalance>,
    pub selected: usize,
    pub level: f64,
    pub statistic: TestStatistic,
    pub approximate: bool,
}

impl WindowSelection {
    pub fn selected(&self) -> &WindowBalance {
        &self.windows[self.selected]
    }

    /// Bounds `(left, right)` of the selected window.
    pub fn selected_window(&self) -> (f64, f64) {
        let w = self.selected();
        (w.left, w.right)
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Distance to the `obsmin`-th closest unit on one side of the cutoff, or to
/// the farthest one when the side holds fewer units.
fn side_reach(distances: &mut [f64], obsmin: usize) -> Option<f64> {
    if distances.is_empty() {
        return None;
    }
    distances.sort_by(f64::total_cmp);
    let idx = obsmin.clamp(1, distances.len()) - 1;
    Some(distances[idx])
}

/// Smallest half-width holding at least `obsmin` units on each side.
fn default_wmin(running: ArrayView1<'_, f64>, cutoff: f64, obsmin: usize) -> Result<f64, WindowSelectError> {
    let (mut below, mut above): (Vec<f64>, Vec<f64>) = (Vec::new(), Vec::new());
    for &x in running {
        if x >= cutoff {
            above.push(x - cutoff);
        } else {
            below.push(cutoff - x);
        }
    }
    let left = side_reach(&mut below, obsmin).ok_or(WindowSelectError::EmptySide("left"))?;
    let right = side_reach(&mut above, obsmin).ok_or(WindowSelectError::EmptySide("right"))?;
    Ok(left.max(right))
}

fn balance_in_window(
    running: ArrayView1<'_, f64>,
    covariates: ArrayView2<'_, f64>,
    half_width: f64,
    stream: u64,
    options: &WindowSelectOptions,
) -> WindowBalance {
    let cutoff = options.cutoff;
    let members: Vec<usize> = running
        .iter()
        .enumerate()
        .filter(|&(_, &x)| (x - cutoff).abs() <= half_width + BOUNDARY_TOLERANCE)
        .map(|(i, _)| i)
        .collect();
    let treated: Vec<bool> = members.iter().map(|&i| running[i] >= cutoff).collect();
    let n_treated = treated.iter().filter(|&&t| t).count();
    let n_control = treated.len() - n_treated;

    let mut balance = WindowBalance {
        half_width,
        left: cutoff - half_width,
        right: cutoff + half_width,
        n_control,
        n_treated,
        p_value: None,
        binding_covariate: None,
    };
    if n_control == 0 || n_treated == 0 {
        return balance;
    }

    let mut rng = stream_rng(options.seed, stream);
    for (j, column) in covariates.axis_iter(Axis(1)).enumerate() {
        let values: Vec<f64> = members.iter().map(|&i| column[i]).collect();
        let p = if options.approximate {
            asymptotic_p_value(options.statistic, &values, &treated)
        } else {
            permutation_p_value(options.statistic, &values, &treated, options.reps, &mut rng)
        };
        let p = if p.is_nan() { 1.0 } else { p };
        if balance.p_value.is_none_or(|current| p < current) {
            balance.p_value = Some(p);
            balance.binding_covariate = Some(j);
        }
    }
    balance
}

/// Scans `nwindows` symmetric windows and selects the smallest balanced one.
pub fn select_window(
    running: ArrayView1<'_, f64>,
    covariates: ArrayView2<'_, f64>,
    options: &WindowSelectOptions,
) -> Result<WindowSelection, WindowSelectError> {
    if covariates.nrows() != running.len() {
        return Err(WindowSelectError::DimensionMismatch {
            running: running.len(),
            covariates: covariates.nrows(),
        });
    }
    if covariates.ncols() == 0 {
        return Err(WindowSelectError::NoCovariates);
    }
    if !(options.wstep > 0.0) {
        return Err(WindowSelectError::InvalidOption(format!(
            "wstep must be positive, got {}",
            options.wstep
        )));
    }
    if options.nwindows == 0 {
        return Err(WindowSelectError::InvalidOption("nwindows must be at least 1".to_string()));
    }
    let level = options.effective_level();
    if !(level > 0.0 && level < 1.0) {
        return Err(WindowSelectError::InvalidOption(format!(
            "level must lie in (0, 1), got {level}"
        )));
    }
    if !options.approximate && options.reps == 0 {
        return Err(WindowSelectError::InvalidOption(
            "randomization p-values need at least one replication".to_string(),
        ));
    }

    let wmin = match options.wmin {
        Some(w) if w > 0.0 => w,
        Some(w) => {
            return Err(WindowSelectError::InvalidOption(format!(
                "wmin must be positive, got {w}"
            )));
        }
        None => default_wmin(running, options.cutoff, options.obsmin)?,
    };
    log::info!(
        "Scanning {} windows from half-width {wmin} in steps of {} ({}, level {level}).",
        options.nwindows,
        options.wstep,
        options.statistic.label()
    );

    let pb = create_progress_bar(options.nwindows as u64, "balance tests");
    let windows: Vec<WindowBalance> = (0..options.nwindows)
        .into_par_iter()
        .map(|k| {
            let half_width = wmin + k as f64 * options.wstep;
            let balance = balance_in_window(running, covariates, half_width, k as u64, options);
            pb.inc(1);
            balance
        })
        .collect();
    pb.finish_and_clear();

    let selected = windows
        .iter()
        .position(|w| w.p_value.is_some_and(|p| p > level))
        .ok_or(WindowSelectError::NoValidWindow {
            level,
            largest: wmin + (options.nwindows - 1) as f64 * options.wstep,
        })?;
    log::info!(
        "Selected window [{}, {}] with minimum balance p-value {:.3}.",
        windows[selected].left,
        windows[selected].right,
        windows[selected].p_value.unwrap_or(f64::NAN)
    );

    Ok(WindowSelection {
        windows,
        selected,
        level,
        statistic: options.statistic,
        approximate: options.approximate,
    })
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn integer_ages(per_age: usize) -> Array1<f64> {
        (-10..=9)
            .flat_map(|a| std::iter::repeat_n(a as f64, per_age))
            .collect()
    }

    fn options(wmin: f64, nwindows: usize) -> WindowSelectOptions {
        WindowSelectOptions {
            wmin: Some(wmin),
            nwindows,
            reps: 200,
            ..WindowSelectOptions::default()
        }
    }

    #[test]
    fn balanced_covariates_select_the_smallest_window() {
        let running = integer_ages(5);
        let covariates = Array2::from_elem((running.len(), 2), 1.0);
        let selection = select_window(running.view(), covariates.view(), &options(1.0, 5)).unwrap();

        assert_eq!(selection.selected, 0);
        assert_abs_diff_eq!(selection.selected().half_width, 1.0);
        assert_eq!(selection.selected_window(), (-1.0, 1.0));
        assert_eq!(selection.windows.len(), 5);
        assert_abs_diff_eq!(selection.level, DEFAULT_LEVEL);
    }

    #[test]
    fn window_membership_is_closed_at_both_ends() {
        let running = integer_ages(3);
        let covariates = Array2::from_elem((running.len(), 1), 0.0);
        let selection = select_window(running.view(), covariates.view(), &options(2.0, 1)).unwrap();
        let window = selection.selected();
        // Ages -2, -1 below and 0, 1, 2 above, three units each.
        assert_eq!(window.n_control, 6);
        assert_eq!(window.n_treated, 9);
    }

    #[test]
    fn imbalanced_covariate_pushes_selection_outward() {
        // Half-integer ages, so every window holds the same number of ages per side.
        let running: Array1<f64> = (-10..10)
            .flat_map(|a| std::iter::repeat_n(a as f64 + 0.5, 20))
            .collect();
        // Flagged units sit just above the cutoff and one age further below it.
        let covariate: Array1<f64> = running.mapv(|x| if x == 0.5 || x == -1.5 { 1.0 } else { 0.0 });
        let covariates = covariate.insert_axis(Axis(1));
        let mut opts = options(1.0, 10);
        opts.approximate = true;
        let selection = select_window(running.view(), covariates.view(), &opts).unwrap();

        assert_eq!(selection.selected, 1);
        let first = &selection.windows[0];
        assert_abs_diff_eq!(first.p_value.unwrap(), 0.0);
        assert_eq!(first.binding_covariate, Some(0));
        assert_abs_diff_eq!(selection.selected().p_value.unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn enlarging_the_scan_keeps_the_selection() {
        let running = integer_ages(8);
        let mut rng = StdRng::seed_from_u64(17);
        let covariates = Array2::from_shape_fn((running.len(), 2), |_| rng.gen_range(0.0..1.0));

        let short = select_window(running.view(), covariates.view(), &options(1.0, 4));
        let long = select_window(running.view(), covariates.view(), &options(1.0, 9));
        match (short, long) {
            (Ok(short), Ok(long)) => {
                assert_eq!(short.selected, long.selected);
                assert_eq!(short.windows[..], long.windows[..4]);
            }
            (Err(_), Ok(long)) => assert!(long.selected >= 4),
            (Err(_), Err(_)) => {}
            (Ok(_), Err(e)) => panic!("Enlarged scan lost a valid window: {e}"),
        }
    }

    #[test]
    fn default_wmin_reaches_obsmin_on_both_sides() {
        let running = Array1::from_vec(vec![-3.0, -2.0, -1.0, 0.0, 0.5, 4.0]);
        let wmin = default_wmin(running.view(), 0.0, 2).unwrap();
        // Second closest below is 2.0, second closest above is 0.5.
        assert_abs_diff_eq!(wmin, 2.0);
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let running = Array1::from_vec(vec![-1.0, 1.0]);
        let covariates = Array2::zeros((3, 1));
        assert!(matches!(
            select_window(running.view(), covariates.view(), &options(1.0, 2)),
            Err(WindowSelectError::DimensionMismatch { running: 2, covariates: 3 })
        ));
    }

    #[test]
    fn missing_covariates_are_rejected() {
        let running = Array1::from_vec(vec![-1.0, 1.0]);
        let covariates = Array2::zeros((2, 0));
        assert!(matches!(
            select_window(running.view(), covariates.view(), &options(1.0, 2)),
            Err(WindowSelectError::NoCovariates)
        ));
    }

    #[test]
    fn non_positive_step_is_rejected() {
        let running = integer_ages(2);
        let covariates = Array2::zeros((running.len(), 1));
        let mut opts = options(1.0, 3);
        opts.wstep = 0.0;
        assert!(matches!(
            select_window(running.view(), covariates.view(), &opts),
            Err(WindowSelectError::InvalidOption(_))
        ));
    }

    #[test]
    fn one_sided_windows_are_never_selected() {
        let running = Array1::from_vec(vec![-5.0, -4.0, 2.0, 3.0]);
        let covariates = Array2::from_elem((4, 1), 1.0);
        let selection = select_window(running.view(), covariates.view(), &options(1.0, 4)).unwrap();
        assert!(selection.windows[..3].iter().all(|w| w.p_value.is_none()));
        assert_eq!(selection.selected, 3);
        assert_eq!(selection.selected().n_control, 1);
    }

    #[test]
    fn unsatisfiable_level_is_an_error() {
        let running = integer_ages(10);
        let covariate: Array1<f64> = running.mapv(|x| if x >= 0.0 { 1.0 } else { 0.0 });
        let covariates = covariate.insert_axis(Axis(1));
        let mut opts = options(1.0, 3);
        opts.approximate = true;
        assert!(matches!(
            select_window(running.view(), covariates.view(), &opts),
            Err(WindowSelectError::NoValidWindow { .. })
        ));
    }
}
