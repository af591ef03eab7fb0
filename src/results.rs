//! The immutable result of one analysis run and the statistics derived
//! from it.
//!
//! Every derived quantity (communalities, uniqueness, eigenvalues, variance
//! decomposition) is a pure function of the stored correlation matrix and
//! final loadings; nothing here is recomputed-into or overwritten by later
//! analysis calls.

use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};
use serde::Serialize;

use crate::correlation::CorrelationMatrix;
use crate::error::FactorAnalysisError;
use crate::fitter::Loadings;

/// Original and common-factor eigenvalues, both sorted descending.
#[derive(Debug, Clone, Serialize)]
pub struct Eigenvalues {
    /// Eigenvalues of the correlation matrix.
    pub original: Array1<f64>,
    /// Eigenvalues of the correlation matrix with its diagonal replaced by
    /// the communalities.
    pub common_factor: Array1<f64>,
}

/// Variance explained per factor: three aligned rows in factor order.
#[derive(Debug, Clone, Serialize)]
pub struct FactorVariance {
    /// Sum of squared loadings per factor.
    pub ss_loadings: Array1<f64>,
    /// SS loadings divided by the number of variables.
    pub proportion: Array1<f64>,
    /// Running sum of the proportions.
    pub cumulative: Array1<f64>,
}

/// A labeled numeric table, the shape external adapters persist verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct OutputTable {
    pub row_labels: Vec<String>,
    pub column_labels: Vec<String>,
    pub values: Array2<f64>,
}

/// Everything one analysis run produced. Returned by value; independent
/// runs never share or overwrite each other's results.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    correlation: CorrelationMatrix,
    loadings: Loadings,
    rotation_matrix: Option<Array2<f64>>,
    warnings: Vec<String>,
}

impl AnalysisResult {
    pub(crate) fn new(
        correlation: CorrelationMatrix,
        loadings: Loadings,
        rotation_matrix: Option<Array2<f64>>,
        warnings: Vec<String>,
    ) -> Self {
        AnalysisResult {
            correlation,
            loadings,
            rotation_matrix,
            warnings,
        }
    }

    pub fn correlation(&self) -> &CorrelationMatrix {
        &self.correlation
    }

    /// Final (possibly rotated) loading matrix.
    pub fn loadings(&self) -> &Loadings {
        &self.loadings
    }

    /// The applied rotation, `None` when rotation was disabled. Orthogonal
    /// for Varimax; general invertible for Promax.
    pub fn rotation_matrix(&self) -> Option<&Array2<f64>> {
        self.rotation_matrix.as_ref()
    }

    /// Non-fatal diagnostics accumulated during fitting and rotation
    /// (convergence warnings, fallbacks). Empty on a clean run.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Per-variable communality: the row sums of squared loadings.
    pub fn communalities(&self) -> Array1<f64> {
        self.loadings
            .values()
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|v| v * v).sum())
            .collect()
    }

    /// Per-variable uniqueness: `1 - communality`.
    pub fn uniqueness(&self) -> Array1<f64> {
        self.communalities().mapv(|h2| 1.0 - h2)
    }

    /// Original and common-factor eigenvalues, each sorted descending.
    ///
    /// # Errors
    ///
    /// Returns `Linalg` if either eigendecomposition fails.
    pub fn eigenvalues(&self) -> Result<Eigenvalues, FactorAnalysisError> {
        let original = descending_eigenvalues(
            self.correlation.matrix().clone(),
            "original eigenvalues",
        )?;

        let mut reduced = self.correlation.matrix().clone();
        let communalities = self.communalities();
        for (i, h2) in communalities.iter().enumerate() {
            reduced[[i, i]] = *h2;
        }
        let common_factor =
            descending_eigenvalues(reduced, "common-factor eigenvalues")?;

        Ok(Eigenvalues {
            original,
            common_factor,
        })
    }

    /// SS loadings, proportion of variance, and cumulative proportion per
    /// factor.
    pub fn factor_variance(&self) -> FactorVariance {
        let p = self.loadings.n_variables() as f64;
        let ss_loadings: Array1<f64> = self
            .loadings
            .values()
            .columns()
            .into_iter()
            .map(|col| col.iter().map(|v| v * v).sum())
            .collect();
        let proportion = ss_loadings.mapv(|ss| ss / p);

        let mut running = 0.0;
        let cumulative = proportion.mapv(|share| {
            running += share;
            running
        });

        FactorVariance {
            ss_loadings,
            proportion,
            cumulative,
        }
    }

    /// Loadings table: one row per variable, one column per factor.
    pub fn loadings_table(&self) -> OutputTable {
        OutputTable {
            row_labels: self.loadings.variables().to_vec(),
            column_labels: self.loadings.factors().to_vec(),
            values: self.loadings.values().clone(),
        }
    }

    /// Eigenvalues table: original and common-factor, one column each.
    pub fn eigenvalues_table(&self) -> Result<OutputTable, FactorAnalysisError> {
        let eigenvalues = self.eigenvalues()?;
        let p = eigenvalues.original.len();
        let mut values = Array2::zeros((p, 2));
        values.column_mut(0).assign(&eigenvalues.original);
        values.column_mut(1).assign(&eigenvalues.common_factor);
        Ok(OutputTable {
            row_labels: (1..=p).map(|i| i.to_string()).collect(),
            column_labels: vec![
                "Original_Eigenvalues".to_string(),
                "Common_Factor_Eigenvalues".to_string(),
            ],
            values,
        })
    }

    /// Communalities and uniqueness: one row per variable.
    pub fn communalities_table(&self) -> OutputTable {
        let communalities = self.communalities();
        let uniqueness = self.uniqueness();
        let p = communalities.len();
        let mut values = Array2::zeros((p, 2));
        values.column_mut(0).assign(&communalities);
        values.column_mut(1).assign(&uniqueness);
        OutputTable {
            row_labels: self.loadings.variables().to_vec(),
            column_labels: vec!["Communalities".to_string(), "Uniqueness".to_string()],
            values,
        }
    }

    /// Variance decomposition: three rows (SS loadings, proportion,
    /// cumulative proportion), one column per factor.
    pub fn variance_table(&self) -> OutputTable {
        let variance = self.factor_variance();
        let k = variance.ss_loadings.len();
        let mut values = Array2::zeros((3, k));
        values.row_mut(0).assign(&variance.ss_loadings);
        values.row_mut(1).assign(&variance.proportion);
        values.row_mut(2).assign(&variance.cumulative);
        OutputTable {
            row_labels: vec![
                "SS Loadings".to_string(),
                "Proportion Var".to_string(),
                "Cumulative Var".to_string(),
            ],
            column_labels: self.loadings.factors().to_vec(),
            values,
        }
    }
}

fn descending_eigenvalues(
    matrix: Array2<f64>,
    context: &str,
) -> Result<Array1<f64>, FactorAnalysisError> {
    let (values, _) = matrix
        .eigh(UPLO::Lower)
        .map_err(|e| FactorAnalysisError::linalg(context, e))?;
    let mut values = values.to_vec();
    values.reverse();
    Ok(Array1::from(values))
}
