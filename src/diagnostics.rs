//! Sampling-adequacy and sphericity diagnostics computed from a
//! correlation matrix: squared multiple correlations (SMC), the
//! Kaiser-Meyer-Olkin measure, and Bartlett's sphericity test.

use ndarray::{Array1, Array2};
use ndarray_linalg::{Determinant, Inverse};
use serde::Serialize;

use crate::correlation::CorrelationMatrix;
use crate::error::FactorAnalysisError;

/// Squared multiple correlation per variable: each variable's R² when
/// regressed on all the others, computed as `1 - 1/diag(R⁻¹)`.
///
/// With `sort` the `(name, value)` pairs are returned sorted ascending by
/// value; otherwise they keep the input variable order.
///
/// # Errors
///
/// Returns `SingularMatrix` when the correlation matrix cannot be inverted.
pub fn smc(
    corr: &CorrelationMatrix,
    sort: bool,
) -> Result<Vec<(String, f64)>, FactorAnalysisError> {
    let values = smc_values(corr)?;
    let mut pairs: Vec<(String, f64)> = corr
        .names()
        .iter()
        .cloned()
        .zip(values.iter().copied())
        .collect();
    if sort {
        pairs.sort_by(|a, b| {
            a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    Ok(pairs)
}

/// SMC values in input variable order, for internal consumers (the fitter's
/// starting guess).
pub(crate) fn smc_values(
    corr: &CorrelationMatrix,
) -> Result<Array1<f64>, FactorAnalysisError> {
    let inverse = invert(corr.matrix(), "squared multiple correlations")?;
    Ok(inverse.diag().mapv(|d| 1.0 - 1.0 / d))
}

/// Kaiser-Meyer-Olkin measure of sampling adequacy.
///
/// Inverts the correlation matrix to obtain the anti-image (partial
/// correlation) matrix `A` with
/// `A[i,j] = -R⁻¹[i,j] / sqrt(R⁻¹[i,i] * R⁻¹[j,j])`, then reports
///
/// ```text
/// KMO = (Σ R² - Σ diag(R)²) / (Σ R² - Σ diag(R)² + Σ A² - Σ diag(A)²)
/// ```
///
/// which lies in [0, 1] for well-conditioned inputs.
///
/// # Errors
///
/// Returns `SingularMatrix` when the correlation matrix cannot be inverted.
pub fn kmo(corr: &CorrelationMatrix) -> Result<f64, FactorAnalysisError> {
    let r = corr.matrix();
    let inverse = invert(r, "Kaiser-Meyer-Olkin")?;
    let p = corr.order();

    let mut anti_image = Array2::ones((p, p));
    for i in 0..p {
        for j in i..p {
            let value =
                -inverse[[i, j]] / (inverse[[i, i]] * inverse[[j, j]]).sqrt();
            anti_image[[i, j]] = value;
            anti_image[[j, i]] = value;
        }
    }

    let sq_sum = |m: &Array2<f64>| m.iter().map(|v| v * v).sum::<f64>();
    let diag_sq_sum = |m: &Array2<f64>| m.diag().iter().map(|v| v * v).sum::<f64>();

    let numerator = sq_sum(r) - diag_sq_sum(r);
    let denominator = numerator + sq_sum(&anti_image) - diag_sq_sum(&anti_image);
    Ok(numerator / denominator)
}

/// Outcome of Bartlett's sphericity test.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BartlettTest {
    pub chi_square: f64,
    pub degrees_of_freedom: f64,
    /// The chi-square *density* evaluated at `chi_square`, NOT the upper-tail
    /// probability. This matches the behavior this engine reproduces; treat
    /// it as a descriptive statistic rather than a conventional p-value.
    pub p_value: f64,
}

/// Bartlett's test of the hypothesis that the correlation matrix is the
/// identity:
///
/// ```text
/// χ² = -(n - 1 - (2p + 5)/6) * ln(det R),   df = p(p - 1)/2
/// ```
///
/// # Errors
///
/// Returns `SingularMatrix` when `det R` is non-positive, which would make
/// the log undefined.
pub fn bartlett_sphericity(
    corr: &CorrelationMatrix,
    n_obs: usize,
) -> Result<BartlettTest, FactorAnalysisError> {
    let p = corr.order() as f64;
    let n = n_obs as f64;

    let det = corr
        .matrix()
        .det()
        .map_err(|_| {
            FactorAnalysisError::SingularMatrix(
                "Bartlett sphericity determinant".to_string(),
            )
        })?;
    if det <= 0.0 {
        return Err(FactorAnalysisError::SingularMatrix(format!(
            "Bartlett sphericity: determinant is {:.3e}",
            det
        )));
    }

    let chi_square = -(n - 1.0 - (2.0 * p + 5.0) / 6.0) * det.ln();
    let degrees_of_freedom = p * (p - 1.0) / 2.0;
    let p_value = chi_square_density(chi_square, degrees_of_freedom);

    Ok(BartlettTest {
        chi_square,
        degrees_of_freedom,
        p_value,
    })
}

fn invert(
    matrix: &Array2<f64>,
    context: &str,
) -> Result<Array2<f64>, FactorAnalysisError> {
    matrix
        .inv()
        .map_err(|_| FactorAnalysisError::SingularMatrix(context.to_string()))
}

/// Chi-square probability density at `x` with `df` degrees of freedom.
fn chi_square_density(x: f64, df: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let half_df = df / 2.0;
    ((half_df - 1.0) * x.ln() - x / 2.0 - half_df * 2.0_f64.ln() - ln_gamma(half_df)).exp()
}

/// Natural log of the gamma function (Lanczos approximation, g = 7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507343278686905,
        -0.13857109526572012,
        9.984_369_578_019_572e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection formula keeps the approximation accurate on (0, 0.5).
        let pi = std::f64::consts::PI;
        pi.ln() - (pi * x).sin().ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut acc = 0.999_999_999_999_809_9;
        for (i, &c) in COEFFS.iter().enumerate() {
            acc += c / (x + (i + 1) as f64);
        }
        let t = x + 7.5;
        0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
    }
}
