//! Per-age aggregation of the observation table.
//!
//! Rows are grouped by an integral column (the age offset in practice) and the
//! retirement, eligibility and health columns are averaged within each group.

use crate::data::{
    ColumnSource, ELIGIBLE, MENTAL_HEALTH, ObservationTable, PHYSICAL_HEALTH, RETIRED,
};
use ndarray::{Array1, ArrayView1};
use polars::prelude::{Column, DataFrame, PolarsError};
use std::collections::BTreeMap;
use thiserror::Error;

pub const COUNT: &str = "count";

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Cannot aggregate an empty table.")]
    EmptyInput,
    #[error("The grouping column '{0}' does not exist.")]
    MissingColumn(String),
    #[error("Grouping column '{column}' holds the non-integral value {value}.")]
    NonIntegralGroup { column: String, value: f64 },
    #[error("Failed to build the aggregate data frame: {0}")]
    Frame(#[from] PolarsError),
}

/// One row per distinct group value, sorted ascending.
#[derive(Debug, Clone)]
pub struct AggregateTable {
    pub group_column: String,
    pub group: Array1<f64>,
    pub count: Array1<f64>,
    pub retired: Array1<f64>,
    pub eligible: Array1<f64>,
    pub physical_health: Array1<f64>,
    pub mental_health: Array1<f64>,
}

impl AggregateTable {
    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    /// The table as a polars `DataFrame`, for display.
    pub fn to_dataframe(&self) -> Result<DataFrame, AggregateError> {
        let column = |name: &str, values: &Array1<f64>| {
            Column::new(name.into(), values.to_vec())
        };
        let df = DataFrame::new(vec![
            column(&self.group_column, &self.group),
            column(COUNT, &self.count),
            column(RETIRED, &self.retired),
            column(ELIGIBLE, &self.eligible),
            column(PHYSICAL_HEALTH, &self.physical_health),
            column(MENTAL_HEALTH, &self.mental_health),
        ])?;
        Ok(df)
    }
}

impl ColumnSource for AggregateTable {
    fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        match name {
            COUNT => Some(self.count.view()),
            RETIRED => Some(self.retired.view()),
            ELIGIBLE => Some(self.eligible.view()),
            PHYSICAL_HEALTH => Some(self.physical_health.view()),
            MENTAL_HEALTH => Some(self.mental_health.view()),
            other if other == self.group_column => Some(self.group.view()),
            _ => None,
        }
    }

    fn column_names(&self) -> Vec<String> {
        vec![
            self.group_column.clone(),
            COUNT.to_string(),
            RETIRED.to_string(),
            ELIGIBLE.to_string(),
            PHYSICAL_HEALTH.to_string(),
            MENTAL_HEALTH.to_string(),
        ]
    }

    fn n_rows(&self) -> usize {
        self.len()
    }
}

#[derive(Default)]
struct GroupSums {
    count: usize,
    retired: f64,
    eligible: f64,
    physical: f64,
    mental: f64,
}

/// Groups `table` by `group_column` and averages the four outcome and
/// treatment columns within each group.
pub fn aggregate(table: &ObservationTable, group_column: &str) -> Result<AggregateTable, AggregateError> {
    if table.is_empty() {
        return Err(AggregateError::EmptyInput);
    }
    let groups = table
        .column(group_column)
        .ok_or_else(|| AggregateError::MissingColumn(group_column.to_string()))?;

    let mut sums: BTreeMap<i64, GroupSums> = BTreeMap::new();
    for (row, &value) in groups.iter().enumerate() {
        if value.fract() != 0.0 {
            return Err(AggregateError::NonIntegralGroup {
                column: group_column.to_string(),
                value,
            });
        }
        let entry = sums.entry(value as i64).or_default();
        entry.count += 1;
        entry.retired += table.retired[row];
        entry.eligible += table.eligible[row];
        entry.physical += table.physical_health[row];
        entry.mental += table.mental_health[row];
    }

    let mean = |select: fn(&GroupSums) -> f64| -> Array1<f64> {
        sums.values().map(|g| select(g) / g.count as f64).collect()
    };
    let aggregated = AggregateTable {
        group_column: group_column.to_string(),
        group: sums.keys().map(|&k| k as f64).collect(),
        count: sums.values().map(|g| g.count as f64).collect(),
        retired: mean(|g| g.retired),
        eligible: mean(|g| g.eligible),
        physical_health: mean(|g| g.physical),
        mental_health: mean(|g| g.mental),
    };
    log::info!(
        "Aggregated {} rows into {} groups by '{}'.",
        table.len(),
        aggregated.len(),
        group_column
    );
    Ok(aggregated)
}
