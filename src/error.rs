use thiserror::Error;

/// Errors surfaced by the analysis pipeline.
///
/// Numerical non-convergence is deliberately absent: the optimizer and the
/// rotation loop degrade to their best available solution and report through
/// the warning channel on [`crate::AnalysisResult`] instead of aborting.
#[derive(Debug, Error)]
pub enum FactorAnalysisError {
    /// Validation failure raised before fitting proceeds: non-finite
    /// correlation entries (zero-variance columns), an unrecognized rotation,
    /// missing data without a usable imputation strategy, and similar
    /// configuration or input defects.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A required matrix inversion failed. Raised from SMC and KMO, which
    /// have no fallback; Promax catches the equivalent condition internally
    /// and substitutes a pseudo-inverse.
    #[error("singular matrix while computing {0}")]
    SingularMatrix(String),

    /// A LAPACK routine (eigendecomposition, SVD, least squares) reported
    /// failure outside the inversion paths covered by `SingularMatrix`.
    #[error("linear algebra failure in {context}: {message}")]
    Linalg { context: String, message: String },
}

impl FactorAnalysisError {
    pub(crate) fn linalg<E: std::fmt::Display>(context: &str, err: E) -> Self {
        FactorAnalysisError::Linalg {
            context: context.to_string(),
            message: err.to_string(),
        }
    }
}
