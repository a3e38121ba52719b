//! Plain-text summaries printed by the binary.

use crate::aggregate::{AggregateError, AggregateTable};
use crate::ols::OlsFit;
use crate::randinf::RandInfResult;
use crate::rdplot::RdPlotData;
use crate::winselect::WindowSelection;
use itertools::Itertools;

fn significance_stars(p: f64) -> &'static str {
    match p {
        p if p < 0.001 => "***",
        p if p < 0.01 => "**",
        p if p < 0.05 => "*",
        p if p < 0.1 => ".",
        _ => "",
    }
}

fn format_p(p: f64) -> String {
    if p.is_nan() {
        "NA".to_string()
    } else if p < 2e-16 {
        "<2e-16".to_string()
    } else if p < 1e-4 {
        format!("{p:.2e}")
    } else {
        format!("{p:.4}")
    }
}

fn format_optional(value: Option<f64>, digits: usize) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v:.digits$}"))
}

/// Linear-interpolation quantile of sorted data.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64)
}

fn join_lines(lines: &[String]) -> String {
    format!("{}\n", lines.join("\n"))
}

/// Regression summary in the layout of a statistical package's `summary(lm)`.
pub fn format_ols(formula: &str, fit: &OlsFit) -> String {
    let sorted: Vec<f64> = fit.residuals.iter().copied().sorted_by(f64::total_cmp).collect();
    let name_width = fit
        .coefficients
        .iter()
        .map(|c| c.name.len())
        .max()
        .unwrap_or(0)
        .max(11);

    let mut lines = vec![
        "Call:".to_string(),
        format!("lm(formula = {formula})"),
        String::new(),
        "Residuals:".to_string(),
        format!("{:>10}{:>10}{:>10}{:>10}{:>10}", "Min", "1Q", "Median", "3Q", "Max"),
        [0.0, 0.25, 0.5, 0.75, 1.0]
            .iter()
            .map(|&q| format!("{:>10.4}", quantile(&sorted, q)))
            .join(""),
        String::new(),
        "Coefficients:".to_string(),
        format!(
            "{:<name_width$} {:>12} {:>12} {:>9} {:>10}",
            "", "Estimate", "Std. Error", "t value", "Pr(>|t|)"
        ),
    ];
    lines.extend(fit.coefficients.iter().map(|c| {
        format!(
            "{:<name_width$} {:>12.5} {:>12.5} {:>9.3} {:>10} {}",
            c.name,
            c.estimate,
            c.std_error,
            c.t_value,
            format_p(c.p_value),
            significance_stars(c.p_value)
        )
    }));
    lines.extend([
        "---".to_string(),
        "Signif. codes:  0 '***' 0.001 '**' 0.01 '*' 0.05 '.' 0.1 ' ' 1".to_string(),
        String::new(),
        format!(
            "Residual standard error: {:.4} on {} degrees of freedom",
            fit.residual_std_error, fit.df_residual
        ),
        format!(
            "Multiple R-squared:  {:.4},\tAdjusted R-squared:  {:.4}",
            fit.r_squared, fit.adj_r_squared
        ),
    ]);
    if let (Some((f, df1, df2)), Some(p)) = (fit.f_statistic, fit.f_p_value) {
        lines.push(format!(
            "F-statistic: {f:.2} on {df1} and {df2} DF,  p-value: {}",
            format_p(p)
        ));
    }
    join_lines(&lines)
}

/// One line per scanned window, marking the selected one.
pub fn format_window_selection(selection: &WindowSelection, covariate_names: &[String]) -> String {
    let mut lines = vec![
        format!(
            "Window selection ({}, {} p-values, level {})",
            selection.statistic.label(),
            if selection.approximate { "asymptotic" } else { "randomization" },
            selection.level
        ),
        format!(
            "{:>10} {:>10} {:>10} {:>8} {:>8} {:>10}  {}",
            "Window", "Left", "Right", "Obs<c", "Obs>=c", "Min p", "Binding covariate"
        ),
    ];
    lines.extend(selection.windows.iter().enumerate().map(|(k, w)| {
        let covariate = w
            .binding_covariate
            .and_then(|j| covariate_names.get(j))
            .map_or("", String::as_str);
        let marker = if k == selection.selected { " <- selected" } else { "" };
        format!(
            "{:>10.3} {:>10.3} {:>10.3} {:>8} {:>8} {:>10}  {}{}",
            w.half_width,
            w.left,
            w.right,
            w.n_control,
            w.n_treated,
            format_optional(w.p_value, 3),
            covariate,
            marker
        )
    }));
    let (left, right) = selection.selected_window();
    lines.push(format!("Recommended window: [{left:.3}; {right:.3}]"));
    join_lines(&lines)
}

pub fn format_randinf(title: &str, result: &RandInfResult) -> String {
    let mut lines = vec![
        title.to_string(),
        format!(
            "Window: [{:.3}; {:.3}]  Obs left: {}  Obs right: {}",
            result.window.left, result.window.right, result.n_control, result.n_treated
        ),
        format!(
            "Order of polynomial: {}  Statistic: {}  Replications: {}  Null hypothesis: tau = {}",
            result.order,
            result
                .fuzzy
                .map_or_else(|| result.statistic.label(), |f| f.label()),
            result.reps,
            result.null_tau
        ),
    ];
    if let Some(first_stage) = result.first_stage {
        lines.push(format!("First stage (difference in treatment): {first_stage:.4}"));
    }
    lines.push(format!(
        "{:>14} {:>14} {:>14} {:>14}",
        "Estimate", "Statistic", "Finite sample", "Large sample"
    ));
    lines.push(format!(
        "{:>14} {:>14.4} {:>14} {:>14}",
        format_optional(result.estimate, 4),
        result.observed_statistic,
        result.randomization_p.map_or_else(|| "NA".to_string(), format_p),
        result.asymptotic_p.map_or_else(|| "NA".to_string(), format_p)
    ));
    if result.estimate.is_none() && result.fuzzy.is_some() {
        lines.push(
            "The Anderson-Rubin statistic tests the null hypothesis only; no point estimate is available."
                .to_string(),
        );
    }
    join_lines(&lines)
}

pub fn format_rdplot(data: &RdPlotData) -> String {
    let row = |label: &str, left: usize, right: usize| format!("{label:<24}{left:>10}{right:>10}");
    let mut lines = vec![
        format!("RD plot (cutoff {})", data.cutoff),
        format!("{:<24}{:>10}{:>10}", "", "Left", "Right"),
        row("Number of obs", data.left.n_obs, data.right.n_obs),
        row("Number of bins", data.left.bins.len(), data.right.bins.len()),
        row("Polynomial order", data.left.order, data.right.order),
    ];
    if let Some(jump) = data.jump_at_cutoff() {
        lines.push(format!("Jump in fitted values at the cutoff: {jump:.4}"));
    }
    join_lines(&lines)
}

pub fn format_aggregate(table: &AggregateTable) -> Result<String, AggregateError> {
    Ok(format!("{}", table.to_dataframe()?))
}
