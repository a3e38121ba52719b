//! # Randomization Inference Engine
//!
//! Two-sample test statistics comparing treated and control units, their
//! asymptotic p-values, and permutation p-values under complete randomization
//! (the number of treated units is held fixed while labels are reshuffled).
//!
//! Both the covariate-balance scan in `winselect` and the RD estimator in
//! `randinf` are built on this module.

use itertools::Itertools;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Tolerance used when comparing permuted statistics with the observed one,
/// so that exact ties are not lost to rounding.
const TIE_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatistic {
    /// Difference in means, treated minus control.
    #[serde(rename = "diffmeans")]
    DiffMeans,
    /// Two-sample Kolmogorov-Smirnov distance.
    #[serde(rename = "ksmirnov")]
    KolmogorovSmirnov,
    /// Standardised Wilcoxon rank-sum statistic.
    #[serde(rename = "ranksum")]
    RankSum,
}

impl TestStatistic {
    pub fn label(self) -> &'static str {
        match self {
            TestStatistic::DiffMeans => "Diff. in means",
            TestStatistic::KolmogorovSmirnov => "Kolmogorov-Smirnov",
            TestStatistic::RankSum => "Rank sum",
        }
    }
}

/// Splits `values` by assignment into (treated, control).
fn split(values: &[f64], treated: &[bool]) -> (Vec<f64>, Vec<f64>) {
    let (t, c): (Vec<(f64, bool)>, Vec<(f64, bool)>) = values
        .iter()
        .copied()
        .zip(treated.iter().copied())
        .partition(|&(_, is_treated)| is_treated);
    (
        t.into_iter().map(|(v, _)| v).collect(),
        c.into_iter().map(|(v, _)| v).collect(),
    )
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance; zero for fewer than two values.
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

pub fn diff_in_means(values: &[f64], treated: &[bool]) -> f64 {
    let (t, c) = split(values, treated);
    mean(&t) - mean(&c)
}

fn ks_distance(treated: &[f64], control: &[f64]) -> f64 {
    if treated.is_empty() || control.is_empty() {
        return f64::NAN;
    }
    let t_sorted: Vec<f64> = treated.iter().copied().sorted_by(f64::total_cmp).collect();
    let c_sorted: Vec<f64> = control.iter().copied().sorted_by(f64::total_cmp).collect();
    let (nt, nc) = (t_sorted.len() as f64, c_sorted.len() as f64);
    let (mut i, mut j) = (0usize, 0usize);
    let mut distance: f64 = 0.0;
    while i < t_sorted.len() && j < c_sorted.len() {
        let x = t_sorted[i].min(c_sorted[j]);
        while i < t_sorted.len() && t_sorted[i] <= x {
            i += 1;
        }
        while j < c_sorted.len() && c_sorted[j] <= x {
            j += 1;
        }
        distance = distance.max((i as f64 / nt - j as f64 / nc).abs());
    }
    distance
}

/// Mid-ranks (1-based) of the pooled sample, ties receiving their average rank.
fn mid_ranks(values: &[f64]) -> Vec<f64> {
    let order: Vec<usize> = (0..values.len())
        .sorted_by(|&a, &b| values[a].total_cmp(&values[b]))
        .collect();
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let average = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = average;
        }
        start = end;
    }
    ranks
}

fn rank_sum_z(values: &[f64], treated: &[bool]) -> f64 {
    let n = values.len() as f64;
    let nt = treated.iter().filter(|&&t| t).count() as f64;
    let nc = n - nt;
    if nt == 0.0 || nc == 0.0 {
        return f64::NAN;
    }
    let ranks = mid_ranks(values);
    let w: f64 = ranks
        .iter()
        .zip(treated)
        .filter(|&(_, &t)| t)
        .map(|(r, _)| r)
        .sum();
    let expected = nt * (n + 1.0) / 2.0;
    let variance = nt * nc * (n + 1.0) / 12.0;
    (w - expected) / variance.sqrt()
}

/// Value of `statistic` for the given outcome and assignment.
pub fn statistic_value(statistic: TestStatistic, values: &[f64], treated: &[bool]) -> f64 {
    match statistic {
        TestStatistic::DiffMeans => diff_in_means(values, treated),
        TestStatistic::KolmogorovSmirnov => {
            let (t, c) = split(values, treated);
            ks_distance(&t, &c)
        }
        TestStatistic::RankSum => rank_sum_z(values, treated),
    }
}

fn standard_normal_two_sided(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    Normal::new(0.0, 1.0)
        .map(|normal| 2.0 * normal.sf(z.abs()))
        .unwrap_or(f64::NAN)
}

/// Asymptotic Kolmogorov distribution tail, `P(K > lambda)`.
fn kolmogorov_tail(lambda: f64) -> f64 {
    if lambda < 1e-3 {
        return 1.0;
    }
    let mut total = 0.0;
    for j in 1..=100 {
        let jf = j as f64;
        let term = (-2.0 * jf * jf * lambda * lambda).exp();
        total += if j % 2 == 1 { term } else { -term };
        if term < 1e-12 {
            break;
        }
    }
    (2.0 * total).clamp(0.0, 1.0)
}

/// Large-sample p-value for `statistic`.
pub fn asymptotic_p_value(statistic: TestStatistic, values: &[f64], treated: &[bool]) -> f64 {
    let (t, c) = split(values, treated);
    if t.is_empty() || c.is_empty() {
        return f64::NAN;
    }
    match statistic {
        TestStatistic::DiffMeans => {
            let diff = mean(&t) - mean(&c);
            let se = (sample_variance(&t) / t.len() as f64 + sample_variance(&c) / c.len() as f64)
                .sqrt();
            if se == 0.0 {
                return if diff.abs() < TIE_TOLERANCE { 1.0 } else { 0.0 };
            }
            standard_normal_two_sided(diff / se)
        }
        TestStatistic::KolmogorovSmirnov => {
            let d = ks_distance(&t, &c);
            let (nt, nc) = (t.len() as f64, c.len() as f64);
            let en = (nt * nc / (nt + nc)).sqrt();
            kolmogorov_tail((en + 0.12 + 0.11 / en) * d)
        }
        TestStatistic::RankSum => {
            let z = rank_sum_z(values, treated);
            if z.is_nan() { 1.0 } else { standard_normal_two_sided(z) }
        }
    }
}

/// Permutation p-value: the share of `reps` reshuffled assignments whose
/// absolute statistic is at least the observed absolute statistic.
pub fn permutation_p_value(
    statistic: TestStatistic,
    values: &[f64],
    treated: &[bool],
    reps: usize,
    rng: &mut StdRng,
) -> f64 {
    if reps == 0 {
        return f64::NAN;
    }
    let observed = statistic_value(statistic, values, treated).abs();
    if observed.is_nan() {
        return f64::NAN;
    }
    let mut shuffled = treated.to_vec();
    let mut exceed = 0usize;
    for _ in 0..reps {
        shuffled.shuffle(rng);
        let permuted = statistic_value(statistic, values, &shuffled).abs();
        if permuted >= observed - TIE_TOLERANCE {
            exceed += 1;
        }
    }
    exceed as f64 / reps as f64
}

/// Deterministic generator for stream `stream` of a run seeded with `seed`.
pub fn stream_rng(seed: u64, stream: u64) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assignment(n_control: usize, n_treated: usize) -> Vec<bool> {
        std::iter::repeat(false)
            .take(n_control)
            .chain(std::iter::repeat(true).take(n_treated))
            .collect()
    }

    #[test]
    fn diff_in_means_is_treated_minus_control() {
        let values = [1.0, 2.0, 3.0, 10.0, 12.0];
        let treated = assignment(3, 2);
        assert_abs_diff_eq!(diff_in_means(&values, &treated), 9.0, epsilon = 1e-12);
    }

    #[test]
    fn ks_distance_of_separated_samples_is_one() {
        let values = [1.0, 2.0, 3.0, 10.0, 12.0];
        let treated = assignment(3, 2);
        let d = statistic_value(TestStatistic::KolmogorovSmirnov, &values, &treated);
        assert_abs_diff_eq!(d, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn ks_distance_of_identical_samples_is_zero() {
        let values = [1.0, 2.0, 3.0, 1.0, 2.0, 3.0];
        let treated = assignment(3, 3);
        let d = statistic_value(TestStatistic::KolmogorovSmirnov, &values, &treated);
        assert_abs_diff_eq!(d, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn mid_ranks_average_ties() {
        let ranks = mid_ranks(&[5.0, 1.0, 5.0, 3.0]);
        assert_eq!(ranks, vec![3.5, 1.0, 3.5, 2.0]);
    }

    #[test]
    fn rank_sum_is_positive_when_treated_values_are_larger() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let treated = assignment(3, 3);
        assert!(statistic_value(TestStatistic::RankSum, &values, &treated) > 0.0);
    }

    #[test]
    fn constant_values_have_permutation_p_value_one() {
        let values = vec![4.0; 20];
        let treated = assignment(10, 10);
        let mut rng = stream_rng(666, 0);
        for statistic in [
            TestStatistic::DiffMeans,
            TestStatistic::KolmogorovSmirnov,
            TestStatistic::RankSum,
        ] {
            let p = permutation_p_value(statistic, &values, &treated, 200, &mut rng);
            assert_abs_diff_eq!(p, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn strong_separation_has_small_permutation_p_value() {
        let values: Vec<f64> = (0..40).map(|i| if i < 20 { i as f64 } else { 100.0 + i as f64 }).collect();
        let treated = assignment(20, 20);
        let mut rng = stream_rng(666, 0);
        let p = permutation_p_value(TestStatistic::DiffMeans, &values, &treated, 500, &mut rng);
        assert!(p < 0.01, "p = {p}");
    }

    #[test]
    fn same_stream_reproduces_p_values() {
        let values: Vec<f64> = (0..30).map(|i| ((i * 7) % 11) as f64).collect();
        let treated = assignment(15, 15);
        let p1 = permutation_p_value(TestStatistic::DiffMeans, &values, &treated, 300, &mut stream_rng(1, 4));
        let p2 = permutation_p_value(TestStatistic::DiffMeans, &values, &treated, 300, &mut stream_rng(1, 4));
        assert_eq!(p1, p2);
    }

    #[test]
    fn asymptotic_diff_in_means_matches_normal_reference() {
        // Treated mean 2, control mean 0, equal variances, four units per arm.
        let values = [-1.0, 1.0, -1.0, 1.0, 1.0, 3.0, 1.0, 3.0];
        let treated = assignment(4, 4);
        let p = asymptotic_p_value(TestStatistic::DiffMeans, &values, &treated);
        let variance = sample_variance(&[-1.0, 1.0, -1.0, 1.0]);
        let z = 2.0 / (2.0 * variance / 4.0).sqrt();
        let expected = 2.0 * Normal::new(0.0, 1.0).unwrap().sf(z);
        assert_abs_diff_eq!(p, expected, epsilon = 1e-12);
    }

    #[test]
    fn kolmogorov_tail_is_monotone() {
        assert_abs_diff_eq!(kolmogorov_tail(0.0), 1.0, epsilon = 1e-12);
        assert!(kolmogorov_tail(0.5) > kolmogorov_tail(1.0));
        assert!(kolmogorov_tail(2.0) < 0.001);
    }
}
