use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};

pub const HEADER: &str = "physical_health,mental_health,retired,eligible,age_offset,born_in_country,ethnicity_white,school_leaving_age,region";

/// Writes a synthetic survey to `dir/name`: `per_age` respondents at each age
/// offset in -10..=10, eligibility at offset >= 0, partial take-up of
/// retirement, and a physical health drop of two points for retirees.
/// Covariates are drawn independently of age.
pub fn write_survey(dir: &Path, name: &str, per_age: usize, seed: u64) -> PathBuf {
    write_survey_with(dir, name, per_age, seed, |_, _, rng| {
        format!(
            "{},{},{},{}",
            u8::from(rng.gen_bool(0.9)),
            u8::from(rng.gen_bool(0.85)),
            rng.gen_range(15..=18),
            rng.gen_range(1..=12),
        )
    })
}

/// Survey whose only varying covariate, `born_in_country`, differs across the
/// cutoff within one year of it but has equal means on both sides of the
/// two-year window: all 0 at age -1 and 1, all 1 at ages -2 and 0, half 1 at
/// age 2. Balance tests therefore fail at half-width 1 and pass exactly at 2.
pub fn write_balanced_at_two(dir: &Path, name: &str, per_age: usize, seed: u64) -> PathBuf {
    write_survey_with(dir, name, per_age, seed, move |age, i, _| {
        let born_in_country = match age {
            -1 | 1 => 0,
            2 => u8::from(i < per_age / 2),
            _ => 1,
        };
        format!("{born_in_country},1,16,5")
    })
}

/// Shared writer; `covariates(age, index_within_age, rng)` renders the four
/// covariate cells of one row.
pub fn write_survey_with<F>(dir: &Path, name: &str, per_age: usize, seed: u64, mut covariates: F) -> PathBuf
where
    F: FnMut(i32, usize, &mut StdRng) -> String,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let mut lines = vec![HEADER.to_string()];
    for age in -10..=10 {
        for i in 0..per_age {
            let eligible = u8::from(age >= 0);
            let take_up = if eligible == 1 { 0.7 } else { 0.1 };
            let retired = u8::from(rng.gen_bool(take_up));
            let physical = 50.0 - 0.1 * age as f64 - 2.0 * retired as f64 + rng.gen_range(-3.0..3.0);
            let mental = 48.0 + 0.5 * retired as f64 + rng.gen_range(-3.0..3.0);
            let cells = covariates(age, i, &mut rng);
            lines.push(format!(
                "{physical:.3},{mental:.3},{retired},{eligible},{age},{cells}"
            ));
        }
    }
    let path = dir.join(name);
    fs::write(&path, lines.join("\n") + "\n").expect("write survey");
    path
}
