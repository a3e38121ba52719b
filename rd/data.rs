//! # Data Loading and Validation Module
//!
//! This module is the only place user-provided survey data enters the program.
//! It reads a tabular file with `polars`, checks it against the configured
//! column names, performs listwise deletion of incomplete rows, and hands the
//! result to the statistical core as `ndarray` columns.
//!
//! - Formats: Stata `.dta`, CSV, TSV, Parquet and Arrow IPC, chosen by file
//!   extension.
//! - Column names come from `DataConfig`; internally every column is addressed
//!   by its canonical name (`physical_health`, `retired`, ...).
//! - Failures are assumed to be user-input errors and are reported through
//!   `DataError` with enough context to correct the input file.

use crate::config::DataConfig;
use crate::dta::{DtaError, read_dta};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const PHYSICAL_HEALTH: &str = "physical_health";
pub const MENTAL_HEALTH: &str = "mental_health";
pub const RETIRED: &str = "retired";
pub const ELIGIBLE: &str = "eligible";
pub const AGE_OFFSET: &str = "age_offset";

/// Named-column lookup shared by the observation and aggregate tables, so that
/// plots and grouping can be driven by column names.
pub trait ColumnSource {
    fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>>;
    fn column_names(&self) -> Vec<String>;
    fn n_rows(&self) -> usize;
}

/// One row per survey respondent, all columns numeric and complete.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    pub physical_health: Array1<f64>,
    pub mental_health: Array1<f64>,
    /// Retirement indicator (treatment actually received).
    pub retired: Array1<f64>,
    /// State pension eligibility indicator.
    pub eligible: Array1<f64>,
    /// Age relative to the state pension age; the running variable.
    pub age_offset: Array1<f64>,
    /// Pre-treatment covariates, column-bound in configured order.
    /// Shape: [n_rows, covariate_names.len()].
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
}

impl ObservationTable {
    pub fn len(&self) -> usize {
        self.age_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.age_offset.is_empty()
    }
}

impl ColumnSource for ObservationTable {
    fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        match name {
            PHYSICAL_HEALTH => Some(self.physical_health.view()),
            MENTAL_HEALTH => Some(self.mental_health.view()),
            RETIRED => Some(self.retired.view()),
            ELIGIBLE => Some(self.eligible.view()),
            AGE_OFFSET => Some(self.age_offset.view()),
            other => self
                .covariate_names
                .iter()
                .position(|c| c == other)
                .map(|idx| self.covariates.column(idx)),
        }
    }

    fn column_names(&self) -> Vec<String> {
        [PHYSICAL_HEALTH, MENTAL_HEALTH, RETIRED, ELIGIBLE, AGE_OFFSET]
            .iter()
            .map(|s| s.to_string())
            .chain(self.covariate_names.iter().cloned())
            .collect()
    }

    fn n_rows(&self) -> usize {
        self.len()
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("The input file '{0}' does not exist.")]
    FileNotFound(String),
    #[error(
        "Unsupported input format '{0}'. Use .dta, .csv, .tsv, .parquet or .arrow/.ipc/.feather."
    )]
    UnsupportedFormat(String),
    #[error("The input file could not be parsed: {0}")]
    Format(#[from] PolarsError),
    #[error("The Stata file could not be read: {0}")]
    Stata(#[from] DtaError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. All analysis columns must be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("No complete rows remain after removing rows with missing values.")]
    EmptyTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Stata,
    Delimited(u8),
    Parquet,
    Ipc,
}

fn detect_format(path: &Path) -> Result<InputFormat, DataError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "dta" => Ok(InputFormat::Stata),
        "csv" => Ok(InputFormat::Delimited(b',')),
        "tsv" | "tab" | "txt" => Ok(InputFormat::Delimited(b'\t')),
        "parquet" => Ok(InputFormat::Parquet),
        "arrow" | "ipc" | "feather" => Ok(InputFormat::Ipc),
        _ => Err(DataError::UnsupportedFormat(path.display().to_string())),
    }
}

fn read_frame(path: &Path) -> Result<DataFrame, DataError> {
    if !path.exists() {
        return Err(DataError::FileNotFound(path.display().to_string()));
    }
    let df = match detect_format(path)? {
        InputFormat::Stata => read_dta(path)?,
        InputFormat::Delimited(separator) => CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(
                        CsvParseOptions::default()
                            .with_separator(separator)
                            .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                    ),
            )
            .finish()?,
        InputFormat::Parquet => ParquetReader::new(File::open(path)?).finish()?,
        InputFormat::Ipc => IpcReader::new(File::open(path)?).finish()?,
    };
    Ok(df)
}

/// Extracts a column as `f64`, keeping nulls so the caller can delete rows listwise.
fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let series = df
        .column(column_name)
        .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;

    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };

    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    // A lossy cast turns unparsable cells into nulls that were not there before.
    if casted.null_count() > series.null_count() {
        return Err(wrong_type());
    }

    let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
    if values.iter().flatten().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

/// Loads the observation table from `path` using the column names in `config`.
pub fn load_observations(path: &Path, config: &DataConfig) -> Result<ObservationTable, DataError> {
    log::info!("Loading survey data from '{}'", path.display());
    let df = read_frame(path)?;
    log::info!(
        "Read {} rows and {} columns.",
        df.height(),
        df.width()
    );

    let present: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let required = config.required_columns();
    if let Some(missing) = required.iter().find(|c| !present.contains(c)) {
        return Err(DataError::ColumnNotFound(missing.clone()));
    }

    let columns: Vec<Vec<Option<f64>>> = required
        .iter()
        .map(|name| extract_numeric_column(&df, name))
        .collect::<Result<_, _>>()?;

    let complete_rows: Vec<usize> = (0..df.height())
        .filter(|&row| columns.iter().all(|col| col[row].is_some()))
        .collect();
    let dropped = df.height() - complete_rows.len();
    if dropped > 0 {
        log::warn!(
            "Dropped {dropped} of {} rows with missing values in analysis columns.",
            df.height()
        );
    }
    if complete_rows.is_empty() {
        return Err(DataError::EmptyTable);
    }

    let dense = |col: &[Option<f64>]| -> Array1<f64> {
        complete_rows.iter().map(|&row| col[row].unwrap_or(f64::NAN)).collect()
    };

    // Order of `required_columns`: five fixed columns, then covariates.
    let n = complete_rows.len();
    let n_cov = config.covariates.len();
    let covariate_values: Vec<f64> = complete_rows
        .iter()
        .flat_map(|&row| columns[5..].iter().map(move |col| col[row].unwrap_or(f64::NAN)))
        .collect();
    let covariates = Array2::from_shape_vec((n, n_cov), covariate_values)
        .map_err(|e| DataError::Io(std::io::Error::other(e.to_string())))?;

    let table = ObservationTable {
        physical_health: dense(&columns[0]),
        mental_health: dense(&columns[1]),
        retired: dense(&columns[2]),
        eligible: dense(&columns[3]),
        age_offset: dense(&columns[4]),
        covariates,
        covariate_names: config.covariates.clone(),
    };

    let offsets = table.age_offset.iter().copied().minmax().into_option();
    if let Some((lo, hi)) = offsets {
        log::info!("Age offset ranges from {lo} to {hi} across {n} complete rows.");
    }
    Ok(table)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::dta::fixtures::{FixtureColumn, legacy_114, tagged_118};
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::{Builder, NamedTempFile};

    const HEADER: &str =
        "sf12pcs,sf12mcs,retired,eligible,age_spa,born_uk,white,school_age,region";

    fn create_test_file(suffix: &str, content: &str) -> io::Result<NamedTempFile> {
        let mut file = Builder::new().suffix(suffix).tempfile()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn test_config() -> DataConfig {
        DataConfig {
            physical_health: "sf12pcs".to_string(),
            mental_health: "sf12mcs".to_string(),
            retired: "retired".to_string(),
            eligible: "eligible".to_string(),
            age_offset: "age_spa".to_string(),
            covariates: vec![
                "born_uk".to_string(),
                "white".to_string(),
                "school_age".to_string(),
                "region".to_string(),
            ],
        }
    }

    fn rows(lines: &[&str]) -> String {
        std::iter::once(HEADER).chain(lines.iter().copied()).join("\n")
    }

    #[test]
    fn loads_complete_csv() {
        let content = rows(&[
            "50.1,48.0,0,0,-2,1,1,16,3",
            "47.5,52.5,1,1,0,0,1,18,7",
            "45.0,55.0,1,1,3,1,0,15,1",
        ]);
        let file = create_test_file(".csv", &content).unwrap();
        let table = load_observations(file.path(), &test_config()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.covariates.shape(), &[3, 4]);
        assert_abs_diff_eq!(table.physical_health[0], 50.1, epsilon = 1e-12);
        assert_abs_diff_eq!(table.mental_health[2], 55.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.age_offset[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.covariates[[1, 2]], 18.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.covariates[[2, 3]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn tab_separated_files_are_supported() {
        let content = rows(&["50,48,0,0,-1,1,1,16,3", "47,52,1,1,1,0,1,18,7"]).replace(',', "\t");
        let file = create_test_file(".tsv", &content).unwrap();
        let table = load_observations(file.path(), &test_config()).unwrap();
        assert_eq!(table.len(), 2);
        assert_abs_diff_eq!(table.retired[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rows_with_missing_values_are_dropped() {
        let content = rows(&[
            "50.1,48.0,0,0,-2,1,1,16,3",
            "NA,52.5,1,1,0,0,1,18,7",
            "45.0,55.0,1,1,3,1,0,,1",
            "44.0,51.0,1,1,4,1,0,17,2",
        ]);
        let file = create_test_file(".csv", &content).unwrap();
        let table = load_observations(file.path(), &test_config()).unwrap();
        assert_eq!(table.len(), 2);
        assert_abs_diff_eq!(table.age_offset[0], -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.age_offset[1], 4.0, epsilon = 1e-12);
    }

    fn stata_survey() -> Vec<(&'static str, FixtureColumn)> {
        vec![
            ("sf12pcs", FixtureColumn::Double(vec![Some(50.1), Some(47.5), None, Some(44.0)])),
            ("sf12mcs", FixtureColumn::Double(vec![Some(48.0), Some(52.5), Some(55.0), Some(51.0)])),
            ("retired", FixtureColumn::Byte(vec![Some(0), Some(1), Some(1), Some(1)])),
            ("eligible", FixtureColumn::Byte(vec![Some(0), Some(1), Some(1), Some(1)])),
            ("age_spa", FixtureColumn::Byte(vec![Some(-2), Some(0), Some(3), Some(4)])),
            ("born_uk", FixtureColumn::Byte(vec![Some(1), Some(0), Some(1), Some(1)])),
            ("white", FixtureColumn::Byte(vec![Some(1), Some(1), Some(0), Some(0)])),
            ("school_age", FixtureColumn::Byte(vec![Some(16), Some(18), Some(15), None])),
            ("region", FixtureColumn::Byte(vec![Some(3), Some(7), Some(1), Some(2)])),
            ("interviewer", FixtureColumn::Str(4, vec!["ab", "cd", "ef", "gh"])),
        ]
    }

    fn write_binary(suffix: &str, bytes: &[u8]) -> io::Result<NamedTempFile> {
        let mut file = Builder::new().suffix(suffix).tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn loads_stata_file_with_listwise_deletion() {
        let file = write_binary(".dta", &tagged_118(&stata_survey())).unwrap();
        let table = load_observations(file.path(), &test_config()).unwrap();

        // Row 3 lacks sf12pcs and row 4 lacks school_age.
        assert_eq!(table.len(), 2);
        assert_eq!(table.age_offset.to_vec(), vec![-2.0, 0.0]);
        assert_abs_diff_eq!(table.physical_health[1], 47.5, epsilon = 1e-12);
        assert_abs_diff_eq!(table.covariates[[1, 2]], 18.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.covariates[[0, 3]], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn legacy_stata_file_loads_like_the_tagged_release() {
        let tagged = write_binary(".dta", &tagged_118(&stata_survey())).unwrap();
        let legacy = write_binary(".DTA", &legacy_114(&stata_survey(), true)).unwrap();
        let a = load_observations(tagged.path(), &test_config()).unwrap();
        let b = load_observations(legacy.path(), &test_config()).unwrap();
        assert_eq!(a.physical_health, b.physical_health);
        assert_eq!(a.covariates, b.covariates);
    }

    #[test]
    fn corrupt_stata_file_is_reported() {
        let file = write_binary(".dta", b"<stata_dta><header><release>118").unwrap();
        let err = load_observations(file.path(), &test_config()).unwrap_err();
        assert!(matches!(err, DataError::Stata(_)), "got {err:?}");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_observations(Path::new("/nonexistent/survey.csv"), &test_config())
            .unwrap_err();
        assert!(matches!(err, DataError::FileNotFound(_)), "got {err:?}");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = create_test_file(".sav", "whatever").unwrap();
        let err = load_observations(file.path(), &test_config()).unwrap_err();
        assert!(matches!(err, DataError::UnsupportedFormat(_)), "got {err:?}");
    }

    #[test]
    fn missing_column_is_reported() {
        let content = "sf12pcs,sf12mcs,retired,eligible,born_uk,white,school_age,region\n\
                       50,48,0,0,1,1,16,3";
        let file = create_test_file(".csv", content).unwrap();
        match load_observations(file.path(), &test_config()).unwrap_err() {
            DataError::ColumnNotFound(col) => assert_eq!(col, "age_spa"),
            other => panic!("Expected ColumnNotFound(age_spa), got {:?}", other),
        }
    }

    #[test]
    fn text_column_is_rejected() {
        let content = rows(&["50,48,no,0,-1,1,1,16,3", "47,52,yes,1,1,0,1,18,7"]);
        let file = create_test_file(".csv", &content).unwrap();
        match load_observations(file.path(), &test_config()).unwrap_err() {
            DataError::ColumnWrongType { column_name, .. } => assert_eq!(column_name, "retired"),
            other => panic!("Expected ColumnWrongType(retired), got {:?}", other),
        }
    }

    #[test]
    fn all_rows_incomplete_is_an_error() {
        let content = rows(&["NA,48,0,0,-1,1,1,16,3"]);
        let file = create_test_file(".csv", &content).unwrap();
        let err = load_observations(file.path(), &test_config()).unwrap_err();
        assert!(matches!(err, DataError::EmptyTable), "got {err:?}");
    }

    #[test]
    fn column_source_resolves_canonical_and_covariate_names() {
        let content = rows(&["50,48,0,0,-1,1,1,16,3", "47,52,1,1,1,0,1,18,7"]);
        let file = create_test_file(".csv", &content).unwrap();
        let table = load_observations(file.path(), &test_config()).unwrap();

        assert_eq!(table.column(AGE_OFFSET).unwrap().to_vec(), vec![-1.0, 1.0]);
        assert_eq!(table.column("school_age").unwrap().to_vec(), vec![16.0, 18.0]);
        assert!(table.column("sf12pcs").is_none());
        assert_eq!(table.column_names().len(), 9);
    }
}
