// Exploratory factor analysis (MINRES / ML extraction, Varimax / Promax rotation)

#![doc = include_str!("../README.md")]

use log::debug;

pub mod correlation;
pub mod diagnostics;
pub mod error;
pub mod fitter;
pub mod results;
pub mod rotation;

pub use correlation::{
    correlate, has_missing, impute, select_numeric, standardize, Column,
    CorrelationMatrix, DataTable, Impute, NumericTable,
};
pub use diagnostics::{bartlett_sphericity, kmo, smc, BartlettTest};
pub use error::FactorAnalysisError;
pub use fitter::{fit, FactorFit, Loadings, Method};
pub use results::{AnalysisResult, Eigenvalues, FactorVariance, OutputTable};
pub use rotation::{
    promax, varimax, Rotation, RotationOutput, PROMAX_POWER,
    VARIMAX_MAX_ITERATIONS, VARIMAX_TOLERANCE,
};

/// Configuration surface for one analysis run.
///
/// The defaults mirror the established behavior of this analysis: three
/// factors, MINRES extraction seeded from SMC, psi bounded in
/// `[0.005, 1]`, Promax rotation with Kaiser normalization, and median
/// imputation for missing cells.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Number of factors to extract; must satisfy `1 <= k < p`.
    pub n_factors: usize,
    /// Extraction method. See [`Method::from_config`] for the lenient
    /// string parsing (unrecognized values fall back to MINRES).
    pub method: Method,
    /// Rotation of the extracted loadings; `None` skips rotation and the
    /// associated Kaiser normalization. See [`Rotation::from_config`].
    pub rotation: Option<Rotation>,
    /// Seed the optimizer from squared multiple correlations instead of a
    /// flat 0.5 start.
    pub use_smc: bool,
    /// Box constraints applied to every psi dimension; `None` disables
    /// them.
    pub bounds: Option<(f64, f64)>,
    /// Kaiser normalization around rotation (and the square-root
    /// communality scaling inside Promax).
    pub normalize: bool,
    /// Missing-value strategy; `None` with missing data present is a fatal
    /// configuration error.
    pub impute: Option<Impute>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            n_factors: 3,
            method: Method::MinRes,
            rotation: Some(Rotation::Promax),
            use_smc: true,
            bounds: Some((0.005, 1.0)),
            normalize: true,
            impute: Some(Impute::Median),
        }
    }
}

/// Entry point for running a complete analysis.
///
/// The analyzer itself is stateless: every call to [`analyze`] returns an
/// owned [`AnalysisResult`], so repeated or concurrent use never overwrites
/// an earlier run's output.
///
/// [`analyze`]: FactorAnalyzer::analyze
#[derive(Debug, Default)]
pub struct FactorAnalyzer;

impl FactorAnalyzer {
    pub fn new() -> Self {
        FactorAnalyzer
    }

    /// Runs the full pipeline: numeric selection, imputation,
    /// standardization, correlation, extraction, and optional rotation.
    ///
    /// Non-fatal conditions (optimizer or rotation non-convergence,
    /// Promax's pseudo-inverse fallback) are accumulated on
    /// [`AnalysisResult::warnings`] and mirrored to the `log` facade.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` — no numeric columns, missing data without an
    ///   imputation strategy, a zero-variance column, `n_factors` outside
    ///   `1..p`, or malformed bounds.
    /// * `SingularMatrix` — SMC seeding requested on a correlation matrix
    ///   that cannot be inverted.
    pub fn analyze(
        &self,
        table: &DataTable,
        options: &AnalysisOptions,
    ) -> Result<AnalysisResult, FactorAnalysisError> {
        let (numeric, dropped) = select_numeric(table);
        if numeric.names.is_empty() {
            return Err(FactorAnalysisError::InvalidInput(
                "the table contains no numeric columns".to_string(),
            ));
        }
        if !dropped.is_empty() {
            debug!(
                "analysis proceeding on {} of {} columns",
                numeric.names.len(),
                table.n_columns()
            );
        }

        let mut data = numeric.data;
        if has_missing(&data) {
            let strategy = options.impute.ok_or_else(|| {
                FactorAnalysisError::InvalidInput(
                    "the data contain missing values, but no impute strategy \
                     ('drop', 'mean', or 'median') was configured"
                        .to_string(),
                )
            })?;
            data = impute(&data, strategy);
        }

        let scaled = standardize(&data, &numeric.names)?;
        let corr = correlate(&scaled, &numeric.names)?;

        debug!(
            "extracting {} factors from {} variables ({:?})",
            options.n_factors,
            corr.order(),
            options.method
        );
        let fitted = fit(
            &corr,
            options.n_factors,
            options.method,
            options.use_smc,
            options.bounds,
        )?;
        let mut warnings = fitted.warnings;

        let (loadings, rotation_matrix) = match options.rotation {
            None => (fitted.loadings, None),
            Some(Rotation::Varimax) => {
                let rotated = varimax(
                    &fitted.loadings,
                    options.normalize,
                    VARIMAX_MAX_ITERATIONS,
                    VARIMAX_TOLERANCE,
                )?;
                warnings.extend(rotated.warnings);
                (rotated.loadings, Some(rotated.rotation_matrix))
            }
            Some(Rotation::Promax) => {
                let rotated = promax(&fitted.loadings, options.normalize, PROMAX_POWER)?;
                warnings.extend(rotated.warnings);
                (rotated.loadings, Some(rotated.rotation_matrix))
            }
        };

        Ok(AnalysisResult::new(corr, loadings, rotation_matrix, warnings))
    }
}
