//! # Analysis Pipeline
//!
//! Runs the whole study in order: load, aggregate, chart, regress, RD plot,
//! window selection, and the two randomization-inference estimates (one on
//! individual rows, one on the per-age aggregate). The first step that fails
//! aborts the run.

use crate::aggregate::{AggregateError, AggregateTable, aggregate};
use crate::config::{AnalysisConfig, ConfigError};
use crate::data::{AGE_OFFSET, ColumnSource, DataError, ObservationTable, RETIRED, load_observations};
use crate::ols::{OlsError, OlsFit, Regressor, fit_ols};
use crate::plot::{PlotError, PlotSpec, histogram, rd_plot, scatter_with_trend};
use crate::randinf::{Fuzzy, FuzzyStatistic, RandInfError, RandInfOptions, RandInfResult, Window, randinf};
use crate::rdplot::{RdPlotData, RdPlotError, RdPlotOptions, rdplot};
use crate::report;
use crate::smooth::LoessOptions;
use crate::winselect::{WindowSelectError, WindowSelection, select_window};
use ndarray::ArrayView1;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Plot(#[from] PlotError),
    #[error("Regression failed: {0}")]
    Ols(#[from] OlsError),
    #[error(transparent)]
    RdPlot(#[from] RdPlotError),
    #[error(transparent)]
    WindowSelect(#[from] WindowSelectError),
    #[error(transparent)]
    RandInf(#[from] RandInfError),
    #[error("The column '{0}' is not available in the {1} table.")]
    UnknownColumn(String, &'static str),
}

/// Everything a full run computes, in pipeline order.
#[derive(Debug)]
pub struct AnalysisReport {
    pub observations: usize,
    pub aggregate: AggregateTable,
    pub plots: Vec<PathBuf>,
    pub outcome: &'static str,
    pub simple_model: OlsFit,
    pub controlled_model: OlsFit,
    pub rdplot: RdPlotData,
    pub covariate_names: Vec<String>,
    pub window_selection: WindowSelection,
    pub individual: RandInfResult,
    pub aggregated: RandInfResult,
}

impl AnalysisReport {
    pub fn render(&self) -> Result<String, AnalysisError> {
        let sections = [
            format!("Loaded {} complete observations.\n", self.observations),
            format!("Aggregate table by age offset:\n{}", report::format_aggregate(&self.aggregate)?),
            format!(
                "Charts written:\n{}",
                self.plots
                    .iter()
                    .map(|p| format!("  {}\n", p.display()))
                    .collect::<String>()
            ),
            report::format_ols(&format!("{} ~ {RETIRED}", self.outcome), &self.simple_model),
            report::format_ols(
                &format!("{} ~ {RETIRED} + {AGE_OFFSET}", self.outcome),
                &self.controlled_model,
            ),
            report::format_rdplot(&self.rdplot),
            report::format_window_selection(&self.window_selection, &self.covariate_names),
            report::format_randinf(
                "Randomization inference, individual level",
                &self.individual,
            ),
            report::format_randinf(
                "Randomization inference, aggregated by age offset",
                &self.aggregated,
            ),
        ];
        Ok(sections.join("\n"))
    }
}

fn require_column<'a, S: ColumnSource + ?Sized>(
    source: &'a S,
    name: &str,
    table: &'static str,
) -> Result<ArrayView1<'a, f64>, AnalysisError> {
    source
        .column(name)
        .ok_or_else(|| AnalysisError::UnknownColumn(name.to_string(), table))
}

/// Draws the propensity, outcome and age histogram charts plus the RD plot.
pub fn render_charts(
    table: &ObservationTable,
    aggregated: &AggregateTable,
    rd: &RdPlotData,
    config: &AnalysisConfig,
) -> Result<Vec<PathBuf>, AnalysisError> {
    let dir = &config.plots.output_dir;
    let cutoff = config.design.cutoff;
    let outcome = config.design.outcome.column();
    let smoothing = LoessOptions {
        span: config.plots.loess_span,
        degree: config.plots.loess_degree,
        ..LoessOptions::default()
    };
    let spec = |title: &str, y_label: &str| PlotSpec {
        cutoff,
        ..PlotSpec::new(title, "Age relative to state pension age", y_label)
    };

    let propensity = dir.join("retirement_propensity.svg");
    scatter_with_trend(
        aggregated,
        AGE_OFFSET,
        RETIRED,
        &spec("Share retired by age offset", "Share retired"),
        &smoothing,
        &propensity,
    )?;
    let health = dir.join(format!("{outcome}_by_age.svg"));
    scatter_with_trend(
        aggregated,
        AGE_OFFSET,
        outcome,
        &spec("Mean health score by age offset", outcome),
        &smoothing,
        &health,
    )?;
    let hist = dir.join("age_offset_histogram.svg");
    histogram(
        table,
        AGE_OFFSET,
        &spec("Respondents by age offset", "Count"),
        config.plots.histogram_bin_width,
        &hist,
    )?;
    let rd_path = dir.join("rdplot.svg");
    rd_plot(rd, &spec("Regression discontinuity plot", outcome), &rd_path)?;
    Ok(vec![propensity, health, hist, rd_path])
}

/// `outcome ~ retired` and `outcome ~ retired + age_offset` on individual rows.
pub fn fit_models(table: &ObservationTable, config: &AnalysisConfig) -> Result<(OlsFit, OlsFit), AnalysisError> {
    let outcome = require_column(table, config.design.outcome.column(), "observation")?;
    let retired = Regressor::new(RETIRED, table.retired.view());
    let age = Regressor::new(AGE_OFFSET, table.age_offset.view());
    let simple = fit_ols(outcome, std::slice::from_ref(&retired), true)?;
    let controlled = fit_ols(outcome, &[retired, age], true)?;
    Ok((simple, controlled))
}

pub fn rd_plot_data(table: &ObservationTable, config: &AnalysisConfig) -> Result<RdPlotData, AnalysisError> {
    let outcome = require_column(table, config.design.outcome.column(), "observation")?;
    let options = RdPlotOptions {
        cutoff: config.design.cutoff,
        order: config.plots.rdplot_order,
        bins_per_side: config.plots.rdplot_bins,
        ..RdPlotOptions::default()
    };
    Ok(rdplot(outcome, table.age_offset.view(), &options)?)
}

pub fn window_selection(table: &ObservationTable, config: &AnalysisConfig) -> Result<WindowSelection, AnalysisError> {
    Ok(select_window(
        table.age_offset.view(),
        table.covariates.view(),
        &config.window_select_options(),
    )?)
}

/// Randomization inference on individual rows with the configured fuzzy statistic.
///
/// Without a fixed window, the window is selected from the covariates.
pub fn individual_randinf(
    table: &ObservationTable,
    config: &AnalysisConfig,
    window: Option<Window>,
) -> Result<RandInfResult, AnalysisError> {
    let outcome = require_column(table, config.design.outcome.column(), "observation")?;
    let treatment = require_column(table, &config.design.fuzzy_treatment, "observation")?;
    let mut options = config.randinf_options();
    if window.is_some() {
        options.window = window;
    }
    let fuzzy = Fuzzy {
        treatment,
        statistic: config.randinf.fuzzy,
    };
    Ok(randinf(
        outcome,
        table.age_offset.view(),
        &options,
        Some(fuzzy),
        Some(table.covariates.view()),
    )?)
}

/// Randomization inference on the per-age aggregate, which supplies the
/// point estimate the Anderson-Rubin test does not.
pub fn aggregated_randinf(
    aggregated: &AggregateTable,
    config: &AnalysisConfig,
    window: Window,
    statistic: FuzzyStatistic,
) -> Result<RandInfResult, AnalysisError> {
    let outcome = require_column(aggregated, config.design.outcome.column(), "aggregate")?;
    let treatment = require_column(aggregated, &config.design.fuzzy_treatment, "aggregate")?;
    let options = RandInfOptions {
        window: Some(window),
        ..config.randinf_options()
    };
    let fuzzy = Fuzzy { treatment, statistic };
    Ok(randinf(outcome, aggregated.group.view(), &options, Some(fuzzy), None)?)
}

/// Runs every step on the data at `data_path`.
pub fn run_analysis(data_path: &Path, config: &AnalysisConfig) -> Result<AnalysisReport, AnalysisError> {
    config.validate()?;
    let table = load_observations(data_path, &config.data)?;
    let aggregated = aggregate(&table, AGE_OFFSET)?;

    let rd = rd_plot_data(&table, config)?;
    let plots = render_charts(&table, &aggregated, &rd, config)?;
    let (simple_model, controlled_model) = fit_models(&table, config)?;

    let selection = window_selection(&table, config)?;
    let window = config.fixed_window().unwrap_or_else(|| {
        let (left, right) = selection.selected_window();
        Window { left, right }
    });
    log::info!("Estimating on the window [{}, {}].", window.left, window.right);

    let individual = individual_randinf(&table, config, Some(window))?;
    let aggregated_result =
        aggregated_randinf(&aggregated, config, window, config.randinf.aggregated_fuzzy)?;

    Ok(AnalysisReport {
        observations: table.len(),
        aggregate: aggregated,
        plots,
        outcome: config.design.outcome.column(),
        simple_model,
        controlled_model,
        rdplot: rd,
        covariate_names: table.covariate_names.clone(),
        window_selection: selection,
        individual,
        aggregated: aggregated_result,
    })
}
