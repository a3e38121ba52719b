//! # Chart Rendering
//!
//! SVG charts drawn with `plotters`. Every chart carries a vertical reference
//! line at the cutoff of the running variable.

use crate::data::ColumnSource;
use crate::rdplot::RdPlotData;
use crate::smooth::{LoessOptions, SmoothError, loess};
use plotters::prelude::*;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("The column '{0}' is not available for plotting.")]
    MissingColumn(String),
    #[error("Nothing to plot: '{0}' has no values.")]
    NoData(String),
    #[error("Failed to render chart: {0}")]
    Render(String),
    #[error("Failed to prepare the output location: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to smooth the trend line: {0}")]
    Smooth(#[from] SmoothError),
}

fn render_error<E: Display>(err: E) -> PlotError {
    PlotError::Render(err.to_string())
}

/// Titles and geometry shared by all charts.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSpec {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub cutoff: f64,
    pub size: (u32, u32),
}

impl PlotSpec {
    pub fn new(title: impl Into<String>, x_label: impl Into<String>, y_label: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            x_label: x_label.into(),
            y_label: y_label.into(),
            cutoff: 0.0,
            size: (800, 600),
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), PlotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Padded `[lo, hi]` range of `values`, widened to include `include`.
fn axis_range(values: impl IntoIterator<Item = f64>, include: Option<f64>) -> (f64, f64) {
    let (mut lo, mut hi) = values
        .into_iter()
        .chain(include)
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() || !hi.is_finite() {
        return (-1.0, 1.0);
    }
    if hi - lo < f64::EPSILON {
        lo -= 1.0;
        hi += 1.0;
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}

fn column_values<S: ColumnSource + ?Sized>(source: &S, name: &str) -> Result<Vec<f64>, PlotError> {
    let values = source
        .column(name)
        .ok_or_else(|| PlotError::MissingColumn(name.to_string()))?
        .to_vec();
    if values.is_empty() {
        return Err(PlotError::NoData(name.to_string()));
    }
    Ok(values)
}

/// Scatter of `y_column` against `x_column` with a LOESS trend line.
pub fn scatter_with_trend<S: ColumnSource + ?Sized>(
    source: &S,
    x_column: &str,
    y_column: &str,
    spec: &PlotSpec,
    smoothing: &LoessOptions,
    path: &Path,
) -> Result<(), PlotError> {
    let xs = column_values(source, x_column)?;
    let ys = column_values(source, y_column)?;
    let trend = loess(
        ndarray::ArrayView1::from(&xs[..]),
        ndarray::ArrayView1::from(&ys[..]),
        smoothing,
    )?;

    ensure_parent(path)?;
    let (x_lo, x_hi) = axis_range(xs.iter().copied(), Some(spec.cutoff));
    let (y_lo, y_hi) = axis_range(ys.iter().chain(&trend.y).copied(), None);

    let root = SVGBackend::new(path, spec.size).into_drawing_area();
    root.fill(&WHITE).map_err(render_error)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(&spec.title, ("sans-serif", 20))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)
        .map_err(render_error)?;
    chart
        .configure_mesh()
        .x_desc(spec.x_label.as_str())
        .y_desc(spec.y_label.as_str())
        .draw()
        .map_err(render_error)?;

    chart
        .draw_series(
            xs.iter()
                .zip(&ys)
                .map(|(&x, &y)| Circle::new((x, y), 3, BLUE.mix(0.6).filled())),
        )
        .map_err(render_error)?;
    chart
        .draw_series(LineSeries::new(
            trend.x.iter().copied().zip(trend.y.iter().copied()),
            RED.stroke_width(2),
        ))
        .map_err(render_error)?;
    chart
        .draw_series(LineSeries::new(
            [(spec.cutoff, y_lo), (spec.cutoff, y_hi)],
            BLACK.stroke_width(1),
        ))
        .map_err(render_error)?;

    root.present().map_err(render_error)?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

/// Counts per bin, with bins of `bin_width` centred on multiples of `bin_width`.
fn histogram_counts(values: &[f64], bin_width: f64) -> Vec<(f64, f64, usize)> {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let first_edge = (lo / bin_width).round() * bin_width - bin_width / 2.0;
    let nbins = (((hi - first_edge) / bin_width).floor() as usize) + 1;
    let mut counts = vec![0usize; nbins];
    for &v in values {
        let idx = (((v - first_edge) / bin_width).floor() as usize).min(nbins - 1);
        counts[idx] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let left = first_edge + i as f64 * bin_width;
            (left, left + bin_width, c)
        })
        .collect()
}

pub fn histogram<S: ColumnSource + ?Sized>(
    source: &S,
    column: &str,
    spec: &PlotSpec,
    bin_width: f64,
    path: &Path,
) -> Result<(), PlotError> {
    let values = column_values(source, column)?;
    if !(bin_width > 0.0) {
        return Err(PlotError::Render(format!("bin width must be positive, got {bin_width}")));
    }
    let bins = histogram_counts(&values, bin_width);
    let max_count = bins.iter().map(|&(_, _, c)| c).max().unwrap_or(0) as f64;

    ensure_parent(path)?;
    let (x_lo, x_hi) = axis_range(
        bins.iter().flat_map(|&(l, r, _)| [l, r]),
        Some(spec.cutoff),
    );
    let y_hi = (max_count * 1.05).max(1.0);

    let root = SVGBackend::new(path, spec.size).into_drawing_area();
    root.fill(&WHITE).map_err(render_error)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(&spec.title, ("sans-serif", 20))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_lo..x_hi, 0.0..y_hi)
        .map_err(render_error)?;
    chart
        .configure_mesh()
        .x_desc(spec.x_label.as_str())
        .y_desc(spec.y_label.as_str())
        .draw()
        .map_err(render_error)?;

    chart
        .draw_series(bins.iter().map(|&(l, r, c)| {
            Rectangle::new([(l, 0.0), (r, c as f64)], BLUE.mix(0.5).filled())
        }))
        .map_err(render_error)?;
    chart
        .draw_series(LineSeries::new(
            [(spec.cutoff, 0.0), (spec.cutoff, y_hi)],
            RED.stroke_width(2),
        ))
        .map_err(render_error)?;

    root.present().map_err(render_error)?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

/// Bin means and the fitted polynomial on each side of the cutoff.
pub fn rd_plot(data: &RdPlotData, spec: &PlotSpec, path: &Path) -> Result<(), PlotError> {
    let sides = [&data.left, &data.right];
    let bin_points: Vec<(f64, f64)> = sides
        .iter()
        .flat_map(|side| side.bins.iter().map(|b| (b.center, b.mean)))
        .collect();
    if bin_points.is_empty() {
        return Err(PlotError::NoData("rd plot bins".to_string()));
    }

    ensure_parent(path)?;
    let (x_lo, x_hi) = axis_range(
        sides.iter().flat_map(|side| side.curve_x.iter().copied()),
        Some(data.cutoff),
    );
    let (y_lo, y_hi) = axis_range(
        bin_points
            .iter()
            .map(|&(_, y)| y)
            .chain(sides.iter().flat_map(|side| side.curve_y.iter().copied())),
        None,
    );

    let root = SVGBackend::new(path, spec.size).into_drawing_area();
    root.fill(&WHITE).map_err(render_error)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(&spec.title, ("sans-serif", 20))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)
        .map_err(render_error)?;
    chart
        .configure_mesh()
        .x_desc(spec.x_label.as_str())
        .y_desc(spec.y_label.as_str())
        .draw()
        .map_err(render_error)?;

    chart
        .draw_series(
            bin_points
                .iter()
                .map(|&(x, y)| Circle::new((x, y), 4, BLACK.filled())),
        )
        .map_err(render_error)?;
    for side in sides {
        chart
            .draw_series(LineSeries::new(
                side.curve_x.iter().copied().zip(side.curve_y.iter().copied()),
                RED.stroke_width(2),
            ))
            .map_err(render_error)?;
    }
    chart
        .draw_series(LineSeries::new(
            [(data.cutoff, y_lo), (data.cutoff, y_hi)],
            BLACK.stroke_width(1),
        ))
        .map_err(render_error)?;

    root.present().map_err(render_error)?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateTable;
    use crate::rdplot::{RdPlotOptions, rdplot};
    use ndarray::Array1;
    use tempfile::tempdir;

    fn table() -> AggregateTable {
        let group: Array1<f64> = (-5..=5).map(|a| a as f64).collect();
        let retired = group.mapv(|a| if a >= 0.0 { 0.9 } else { 0.1 });
        AggregateTable {
            group_column: "age_offset".to_string(),
            count: Array1::from_elem(group.len(), 10.0),
            eligible: retired.clone(),
            physical_health: group.mapv(|a| 50.0 - 0.2 * a),
            mental_health: group.mapv(|a| 48.0 + 0.1 * a),
            retired,
            group,
        }
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn scatter_writes_an_svg_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/propensity.svg");
        let spec = PlotSpec::new("Retirement propensity", "Age offset", "Share retired");
        scatter_with_trend(&table(), "age_offset", "retired", &spec, &LoessOptions::default(), &path).unwrap();
        let svg = read(&path);
        assert!(svg.contains("<svg"));
        assert!(svg.contains("<circle"));
    }

    #[test]
    fn histogram_writes_an_svg_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hist.svg");
        let spec = PlotSpec::new("Age offset", "Age offset", "Count");
        histogram(&table(), "age_offset", &spec, 1.0, &path).unwrap();
        assert!(read(&path).contains("<rect"));
    }

    #[test]
    fn rd_plot_writes_an_svg_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rd.svg");
        let t = table();
        let options = RdPlotOptions {
            order: 1,
            ..RdPlotOptions::default()
        };
        let data = rdplot(t.physical_health.view(), t.group.view(), &options).unwrap();
        rd_plot(&data, &PlotSpec::new("RD plot", "Age offset", "Physical health"), &path).unwrap();
        assert!(read(&path).contains("<svg"));
    }

    #[test]
    fn unknown_column_is_reported() {
        let dir = tempdir().unwrap();
        let spec = PlotSpec::new("x", "x", "y");
        let result = histogram(&table(), "cohort", &spec, 1.0, &dir.path().join("h.svg"));
        assert!(matches!(result, Err(PlotError::MissingColumn(name)) if name == "cohort"));
    }

    #[test]
    fn integer_values_sit_in_centred_bins() {
        let counts = histogram_counts(&[-2.0, -1.0, -1.0, 0.0, 3.0], 1.0);
        assert_eq!(counts.len(), 6);
        assert_eq!(counts[0], (-2.5, -1.5, 1));
        assert_eq!(counts[1].2, 2);
        assert_eq!(counts[5].2, 1);
    }

    #[test]
    fn constant_values_get_a_nonempty_axis() {
        let (lo, hi) = axis_range([2.0, 2.0], None);
        assert!(lo < 2.0 && hi > 2.0);
    }
}
