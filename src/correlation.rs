//! Cleaning of raw observation tables and Pearson correlation.
//!
//! This module owns everything between "a table handed over by some loader"
//! and "a validated correlation matrix the fitter is allowed to see":
//! numeric column selection, missing-value imputation, standardization, and
//! the correlation computation itself.

use log::warn;
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;

use crate::error::FactorAnalysisError;

/// A single named column of raw input data.
///
/// Missing numeric cells are encoded as `NaN`. Text columns carry whatever
/// the loader could not parse as a number; they are dropped before analysis.
#[derive(Debug, Clone)]
pub enum Column {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl Column {
    fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Text(values) => values.len(),
        }
    }
}

/// A rectangular table of named columns, as produced by an external loader.
#[derive(Debug, Clone)]
pub struct DataTable {
    names: Vec<String>,
    columns: Vec<Column>,
    n_rows: usize,
}

impl DataTable {
    /// Builds a table from `(name, column)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the columns do not all have the same length.
    pub fn from_columns(
        columns: Vec<(String, Column)>,
    ) -> Result<Self, FactorAnalysisError> {
        let n_rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        for (name, column) in &columns {
            if column.len() != n_rows {
                return Err(FactorAnalysisError::InvalidInput(format!(
                    "column '{}' has {} rows, expected {}",
                    name,
                    column.len(),
                    n_rows
                )));
            }
        }
        let (names, columns) = columns.into_iter().unzip();
        Ok(DataTable {
            names,
            columns,
            n_rows,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }
}

/// The numeric portion of a [`DataTable`], ready for imputation and scaling.
#[derive(Debug, Clone)]
pub struct NumericTable {
    pub names: Vec<String>,
    /// Shape `(n_observations, n_variables)`; `NaN` marks a missing cell.
    pub data: Array2<f64>,
}

/// Missing-value handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impute {
    /// List-wise deletion: remove every row containing a missing value.
    Drop,
    /// Replace missing cells with their column mean.
    Mean,
    /// Replace missing cells with their column median.
    Median,
}

impl Impute {
    /// Parses a configuration string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for anything but `drop`, `mean`, or `median`;
    /// an analysis with missing data cannot proceed without one of them.
    pub fn from_config(value: &str) -> Result<Self, FactorAnalysisError> {
        match value.to_ascii_lowercase().as_str() {
            "drop" => Ok(Impute::Drop),
            "mean" => Ok(Impute::Mean),
            "median" => Ok(Impute::Median),
            other => Err(FactorAnalysisError::InvalidInput(format!(
                "`impute` must be one of 'drop', 'mean', or 'median'; got '{}'",
                other
            ))),
        }
    }
}

/// Keeps the numeric columns of a table and reports the dropped ones.
///
/// The dropped column names are returned alongside the retained data and
/// logged at `warn` level; losing a column is informational, not fatal.
pub fn select_numeric(table: &DataTable) -> (NumericTable, Vec<String>) {
    let mut names = Vec::new();
    let mut numeric: Vec<&[f64]> = Vec::new();
    let mut dropped = Vec::new();

    for (name, column) in table.names.iter().zip(&table.columns) {
        match column {
            Column::Numeric(values) => {
                names.push(name.clone());
                numeric.push(values);
            }
            Column::Text(_) => dropped.push(name.clone()),
        }
    }

    if !dropped.is_empty() {
        warn!(
            "The following non-numeric columns were removed: {}.",
            dropped.join(", ")
        );
    }

    let data = Array2::from_shape_fn((table.n_rows, numeric.len()), |(row, col)| {
        numeric[col][row]
    });

    (NumericTable { names, data }, dropped)
}

/// Returns true if any cell of the matrix is missing (`NaN`).
pub fn has_missing(data: &Array2<f64>) -> bool {
    data.iter().any(|v| v.is_nan())
}

/// Applies the configured missing-value strategy.
///
/// `Mean` and `Median` substitute the per-column statistic computed over the
/// non-missing cells; `Drop` removes every row containing a missing value.
pub fn impute(data: &Array2<f64>, strategy: Impute) -> Array2<f64> {
    match strategy {
        Impute::Drop => {
            let kept: Vec<usize> = (0..data.nrows())
                .filter(|&row| !data.row(row).iter().any(|v| v.is_nan()))
                .collect();
            let mut out = Array2::zeros((kept.len(), data.ncols()));
            for (new_row, &old_row) in kept.iter().enumerate() {
                out.row_mut(new_row).assign(&data.row(old_row));
            }
            out
        }
        Impute::Mean | Impute::Median => {
            let mut out = data.clone();
            for mut column in out.columns_mut() {
                let present: Vec<f64> =
                    column.iter().copied().filter(|v| !v.is_nan()).collect();
                if present.is_empty() {
                    continue;
                }
                let fill = match strategy {
                    Impute::Mean => present.iter().sum::<f64>() / present.len() as f64,
                    Impute::Median => median(present),
                    Impute::Drop => unreachable!(),
                };
                for value in column.iter_mut() {
                    if value.is_nan() {
                        *value = fill;
                    }
                }
            }
            out
        }
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Scales every column to zero mean and unit (population) variance.
///
/// # Errors
///
/// Returns `InvalidInput` when the table has no rows left, or when any
/// column cannot be scaled (zero variance or a non-finite statistic),
/// naming the offending columns.
pub fn standardize(
    data: &Array2<f64>,
    names: &[String],
) -> Result<Array2<f64>, FactorAnalysisError> {
    let n = data.nrows();
    if n == 0 {
        return Err(FactorAnalysisError::InvalidInput(
            "no observations remain after cleaning".to_string(),
        ));
    }

    let means = data.mean_axis(Axis(0)).ok_or_else(|| {
        FactorAnalysisError::InvalidInput(
            "no observations remain after cleaning".to_string(),
        )
    })?;
    let stds = data.map_axis(Axis(0), |column| column.std(0.0));

    let mut unscalable = Vec::new();
    for (j, std) in stds.iter().enumerate() {
        if !std.is_finite() || *std == 0.0 {
            unscalable.push(names[j].clone());
        }
    }
    if !unscalable.is_empty() {
        return Err(FactorAnalysisError::InvalidInput(format!(
            "could not scale the data; these columns have zero variance or \
             non-finite values: {}",
            unscalable.join(", ")
        )));
    }

    let mut out = data.clone();
    for (j, mut column) in out.columns_mut().into_iter().enumerate() {
        column.mapv_inplace(|v| (v - means[j]) / stds[j]);
    }
    Ok(out)
}

/// A validated Pearson correlation matrix with its variable names.
///
/// Construction enforces the invariant the rest of the pipeline relies on:
/// every entry is finite. A zero-variance input column produces an undefined
/// correlation and is rejected here, before fitting can proceed.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationMatrix {
    matrix: Array2<f64>,
    names: Vec<String>,
}

impl CorrelationMatrix {
    /// Validates and wraps a precomputed correlation matrix.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the matrix is not square, the names do not
    /// match its order, or any entry is null/infinite.
    pub fn new(
        matrix: Array2<f64>,
        names: Vec<String>,
    ) -> Result<Self, FactorAnalysisError> {
        let p = matrix.nrows();
        if matrix.ncols() != p {
            return Err(FactorAnalysisError::InvalidInput(format!(
                "correlation matrix must be square; got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if names.len() != p {
            return Err(FactorAnalysisError::InvalidInput(format!(
                "{} variable names supplied for a {}x{} correlation matrix",
                names.len(),
                p,
                p
            )));
        }

        let mut offending = Vec::new();
        for j in 0..p {
            if matrix.column(j).iter().any(|v| !v.is_finite()) {
                offending.push(names[j].clone());
            }
        }
        if !offending.is_empty() {
            return Err(FactorAnalysisError::InvalidInput(format!(
                "the correlation matrix cannot have features that are null or \
                 infinite; check for zero standard deviation in: {}",
                offending.join(", ")
            )));
        }

        Ok(CorrelationMatrix { matrix, names })
    }

    /// Number of variables.
    pub fn order(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Computes the Pearson correlation matrix of `data`.
///
/// This is the single hard precondition gating the rest of the pipeline:
/// any non-finite correlation (a zero-variance column) fails validation in
/// [`CorrelationMatrix::new`] before the fitter runs.
///
/// # Errors
///
/// Returns `InvalidInput` for fewer than two observations or for
/// non-finite correlation entries.
pub fn correlate(
    data: &Array2<f64>,
    names: &[String],
) -> Result<CorrelationMatrix, FactorAnalysisError> {
    let n = data.nrows();
    let p = data.ncols();
    if n < 2 {
        return Err(FactorAnalysisError::InvalidInput(format!(
            "at least 2 observations are required to correlate; got {}",
            n
        )));
    }

    let means = data.mean_axis(Axis(0)).ok_or_else(|| {
        FactorAnalysisError::InvalidInput(
            "cannot correlate an empty table".to_string(),
        )
    })?;
    let mut centered = data.clone();
    for (j, mut column) in centered.columns_mut().into_iter().enumerate() {
        column.mapv_inplace(|v| v - means[j]);
    }

    // cov = X'X / n on centered data; r_ij = cov_ij / (s_i * s_j). A zero
    // standard deviation divides through to NaN and fails validation below.
    let cov = centered.t().dot(&centered) / n as f64;
    let stds: Array1<f64> = (0..p).map(|j| cov[[j, j]].sqrt()).collect();

    let mut corr = Array2::zeros((p, p));
    for i in 0..p {
        for j in 0..p {
            corr[[i, j]] = if i == j {
                if stds[i] > 0.0 {
                    1.0
                } else {
                    f64::NAN
                }
            } else {
                cov[[i, j]] / (stds[i] * stds[j])
            };
        }
    }

    CorrelationMatrix::new(corr, names.to_vec())
}
