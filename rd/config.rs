//! Analysis configuration, read from and written to TOML.
//!
//! Every section has defaults, so an empty file (or no file at all) describes
//! the standard analysis: physical health as the outcome, cutoff at the state
//! pension age, a symmetric window of four years on each side.

use crate::data::{MENTAL_HEALTH, PHYSICAL_HEALTH};
use crate::randinf::{FuzzyStatistic, RandInfOptions, Window};
use crate::randomization::TestStatistic;
use crate::winselect::WindowSelectOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading or writing configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which health score is the outcome of the models and the RD estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Physical,
    Mental,
}

impl Outcome {
    /// Canonical column name of the outcome in the observation and aggregate tables.
    pub fn column(self) -> &'static str {
        match self {
            Outcome::Physical => PHYSICAL_HEALTH,
            Outcome::Mental => MENTAL_HEALTH,
        }
    }
}

/// Column names as they appear in the input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub physical_health: String,
    pub mental_health: String,
    pub retired: String,
    pub eligible: String,
    pub age_offset: String,
    /// Pre-treatment covariates used for window selection.
    pub covariates: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            physical_health: "physical_health".to_string(),
            mental_health: "mental_health".to_string(),
            retired: "retired".to_string(),
            eligible: "eligible".to_string(),
            age_offset: "age_offset".to_string(),
            covariates: vec![
                "born_in_country".to_string(),
                "ethnicity_white".to_string(),
                "school_leaving_age".to_string(),
                "region".to_string(),
            ],
        }
    }
}

impl DataConfig {
    /// File column names in loading order: the five fixed columns, then covariates.
    pub fn required_columns(&self) -> Vec<String> {
        [
            &self.physical_health,
            &self.mental_health,
            &self.retired,
            &self.eligible,
            &self.age_offset,
        ]
        .into_iter()
        .cloned()
        .chain(self.covariates.iter().cloned())
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignConfig {
    pub cutoff: f64,
    pub outcome: Outcome,
    /// Canonical column used as the fuzzy treatment in the RD estimates.
    pub fuzzy_treatment: String,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self {
            cutoff: 0.0,
            outcome: Outcome::Physical,
            fuzzy_treatment: crate::data::ELIGIBLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub wmin: Option<f64>,
    pub wstep: f64,
    pub nwindows: usize,
    pub obsmin: usize,
    pub level: Option<f64>,
    pub statistic: TestStatistic,
    pub approximate: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            wmin: None,
            wstep: 1.0,
            nwindows: 10,
            obsmin: 10,
            level: None,
            statistic: TestStatistic::DiffMeans,
            approximate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandInfConfig {
    /// Left window bound; when either bound is absent the window is selected from covariates.
    pub wl: Option<f64>,
    pub wr: Option<f64>,
    pub order: usize,
    pub statistic: TestStatistic,
    pub fuzzy: FuzzyStatistic,
    /// Statistic for the second, aggregated-level invocation.
    pub aggregated_fuzzy: FuzzyStatistic,
    pub null_tau: f64,
}

impl Default for RandInfConfig {
    fn default() -> Self {
        Self {
            wl: Some(-4.0),
            wr: Some(4.0),
            order: 0,
            statistic: TestStatistic::DiffMeans,
            fuzzy: FuzzyStatistic::AndersonRubin,
            aggregated_fuzzy: FuzzyStatistic::Tsls,
            null_tau: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub reps: usize,
    pub seed: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self { reps: 1000, seed: 666 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotConfig {
    pub output_dir: PathBuf,
    pub loess_span: f64,
    pub loess_degree: usize,
    pub histogram_bin_width: f64,
    pub rdplot_order: usize,
    pub rdplot_bins: Option<usize>,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("plots"),
            loess_span: 0.75,
            loess_degree: 2,
            histogram_bin_width: 1.0,
            rdplot_order: 4,
            rdplot_bins: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub data: DataConfig,
    pub design: DesignConfig,
    pub window: WindowConfig,
    pub randinf: RandInfConfig,
    pub inference: InferenceConfig,
    pub plots: PlotConfig,
}

impl AnalysisConfig {
    /// Saves the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a configuration from a TOML file and validates it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.covariates.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one pre-treatment covariate is required".to_string(),
            ));
        }
        if !(self.window.wstep > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "window.wstep must be positive, got {}",
                self.window.wstep
            )));
        }
        if let Some(level) = self.window.level {
            if !(level > 0.0 && level < 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "window.level must lie in (0, 1), got {level}"
                )));
            }
        }
        if let (Some(wl), Some(wr)) = (self.randinf.wl, self.randinf.wr) {
            if !(wl < self.design.cutoff && wr >= self.design.cutoff) {
                return Err(ConfigError::Invalid(format!(
                    "randinf window [{wl}, {wr}] must straddle the cutoff {}",
                    self.design.cutoff
                )));
            }
        }
        if self.inference.reps == 0 {
            return Err(ConfigError::Invalid("inference.reps must be at least 1".to_string()));
        }
        if !(self.plots.loess_span > 0.0) || !(self.plots.histogram_bin_width > 0.0) {
            return Err(ConfigError::Invalid(
                "plots.loess_span and plots.histogram_bin_width must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window_select_options(&self) -> WindowSelectOptions {
        WindowSelectOptions {
            cutoff: self.design.cutoff,
            wmin: self.window.wmin,
            wstep: self.window.wstep,
            nwindows: self.window.nwindows,
            obsmin: self.window.obsmin,
            level: self.window.level,
            statistic: self.window.statistic,
            approximate: self.window.approximate,
            reps: self.inference.reps,
            seed: self.inference.seed,
        }
    }

    /// The fixed window from `[randinf]`, if both bounds are configured.
    pub fn fixed_window(&self) -> Option<Window> {
        match (self.randinf.wl, self.randinf.wr) {
            (Some(left), Some(right)) => Some(Window { left, right }),
            _ => None,
        }
    }

    pub fn randinf_options(&self) -> RandInfOptions {
        RandInfOptions {
            cutoff: self.design.cutoff,
            order: self.randinf.order,
            statistic: self.randinf.statistic,
            window: self.fixed_window(),
            null_tau: self.randinf.null_tau,
            reps: self.inference.reps,
            seed: self.inference.seed,
            window_selection: self.window_select_options(),
        }
    }
}
