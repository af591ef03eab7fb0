//! Factor extraction: fits the uniqueness vector by bounded quasi-Newton
//! minimization of the ULS/MINRES or Maximum-Likelihood objective, then
//! normalizes the converged solution into an unrotated loading matrix.

use log::warn;
use ndarray::{s, Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};
use serde::Serialize;
use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

use crate::correlation::CorrelationMatrix;
use crate::diagnostics::smc_values;
use crate::error::FactorAnalysisError;

/// Iteration cap for the uniqueness optimization.
const MAX_OPTIMIZER_ITERATIONS: usize = 1000;

/// Gradient-norm tolerance for the optimizer.
const OPTIMIZER_TOLERANCE: f64 = 1e-5;

/// Relative step for the central-difference gradient.
const GRADIENT_STEP: f64 = 1e-6;

/// Returned from objective evaluations that cannot produce a finite value
/// (eigendecomposition failure, non-positive psi with bounds disabled).
/// Large but finite so the line search can back away from it.
const OBJECTIVE_PENALTY: f64 = 1e300;

/// Factor extraction method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Unweighted least squares (MINRES).
    MinRes,
    /// Maximum likelihood.
    Ml,
}

impl Method {
    /// Parses a configuration string, falling back to MINRES with a warning
    /// for anything unrecognized.
    pub fn from_config(value: &str) -> Method {
        match value.to_ascii_lowercase().as_str() {
            "minres" => Method::MinRes,
            "ml" => Method::Ml,
            other => {
                warn!(
                    "'{}' is not a valid extraction method; MINRES will be \
                     used instead.",
                    other
                );
                Method::MinRes
            }
        }
    }
}

/// A factor loading matrix with its row (variable) and column (factor)
/// labels. Columns are named `Factor1..FactorK`.
#[derive(Debug, Clone, Serialize)]
pub struct Loadings {
    values: Array2<f64>,
    variables: Vec<String>,
    factors: Vec<String>,
}

impl Loadings {
    pub(crate) fn new(values: Array2<f64>, variables: Vec<String>) -> Self {
        let factors = (1..=values.ncols())
            .map(|i| format!("Factor{}", i))
            .collect();
        Loadings {
            values,
            variables,
            factors,
        }
    }

    /// Shape `(n_variables, n_factors)`.
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn factors(&self) -> &[String] {
        &self.factors
    }

    pub fn n_variables(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_factors(&self) -> usize {
        self.values.ncols()
    }

    /// A new loading matrix carrying the same labels; rotation replaces
    /// loadings wholesale rather than mutating in place.
    pub(crate) fn replaced(&self, values: Array2<f64>) -> Self {
        Loadings {
            values,
            variables: self.variables.clone(),
            factors: self.factors.clone(),
        }
    }
}

/// Outcome of one extraction run.
#[derive(Debug, Clone)]
pub struct FactorFit {
    /// Unrotated loading matrix, `(p, k)`, input variable order.
    pub loadings: Loadings,
    /// Converged uniqueness vector (psi), length `p`.
    pub psi: Array1<f64>,
    /// Whether the optimizer met its tolerance within the iteration cap.
    pub converged: bool,
    /// Optimizer iterations consumed.
    pub iterations: usize,
    /// Objective value at the returned psi.
    pub objective: f64,
    /// Non-fatal diagnostics (convergence warnings). Mirrored to the `log`
    /// facade; fitting always proceeds with the best psi found.
    pub warnings: Vec<String>,
}

/// Fits `n_factors` common factors to a validated correlation matrix.
///
/// The uniqueness vector is optimized with BFGS inside the configured box
/// (default `[0.005, 1]`), realized by a smooth per-dimension tanh
/// reparameterization so the quasi-Newton step never leaves the bounds.
/// Non-convergence is not an error: the best available solution is
/// normalized into loadings and a warning is recorded.
///
/// # Errors
///
/// * `InvalidInput` for `n_factors` outside `1..p` or malformed bounds.
/// * `SingularMatrix` when SMC seeding requires an inverse that does not
///   exist.
pub fn fit(
    corr: &CorrelationMatrix,
    n_factors: usize,
    method: Method,
    use_smc: bool,
    bounds: Option<(f64, f64)>,
) -> Result<FactorFit, FactorAnalysisError> {
    let p = corr.order();
    if n_factors < 1 || n_factors >= p {
        return Err(FactorAnalysisError::InvalidInput(format!(
            "n_factors must satisfy 1 <= k < {} (the number of variables); got {}",
            p, n_factors
        )));
    }
    let transform = BoundsMap::new(bounds)?;

    // Starting guess: diag(R) - SMC when seeded, flat 0.5 otherwise.
    let start: Array1<f64> = if use_smc {
        let smc = smc_values(corr)?;
        corr.matrix().diag().to_owned() - smc
    } else {
        Array1::from_elem(p, 0.5)
    };

    let matrix = corr.matrix();
    let objective = |psi: &Array1<f64>| -> f64 {
        match method {
            Method::MinRes => uls_objective(psi, matrix, n_factors),
            Method::Ml => ml_objective(psi, matrix, n_factors),
        }
    };
    let objective_z = |z: &Array1<f64>| objective(&transform.constrained(z));

    let cost_and_grad = |z: &Array1<f64>| -> (f64, Array1<f64>) {
        let value = objective_z(z);
        let mut gradient = Array1::zeros(z.len());
        let mut probe = z.clone();
        for i in 0..z.len() {
            let h = GRADIENT_STEP * z[i].abs().max(1.0);
            probe[i] = z[i] + h;
            let upper = objective_z(&probe);
            probe[i] = z[i] - h;
            let lower = objective_z(&probe);
            probe[i] = z[i];
            gradient[i] = (upper - lower) / (2.0 * h);
        }
        (value, gradient)
    };

    let z0 = transform.unconstrained(&start);
    let mut warnings = Vec::new();

    let mut solver = Bfgs::new(z0.clone(), cost_and_grad)
        .with_tolerance(OPTIMIZER_TOLERANCE)
        .with_max_iterations(MAX_OPTIMIZER_ITERATIONS)
        .with_rng_seed(0x5EED_u64);

    let (z_best, objective_value, iterations, converged) = match solver.run() {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => (final_point, final_value, iterations as usize, true),
        Err(BfgsError::MaxIterationsReached { last_solution }) => {
            let message = format!(
                "failed to converge within {} iterations; using the best psi found",
                MAX_OPTIMIZER_ITERATIONS
            );
            warn!("{}", message);
            warnings.push(message);
            let BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            } = *last_solution;
            (final_point, final_value, iterations as usize, false)
        }
        Err(BfgsError::LineSearchFailed { last_solution, .. }) => {
            let message =
                "line search stalled before meeting tolerance; using the best psi found"
                    .to_string();
            warn!("{}", message);
            warnings.push(message);
            let BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            } = *last_solution;
            (final_point, final_value, iterations as usize, false)
        }
        Err(other) => {
            let message = format!(
                "optimizer failed ({:?}); falling back to the starting guess",
                other
            );
            warn!("{}", message);
            warnings.push(message);
            let value = objective_z(&z0);
            (z0.clone(), value, 0, false)
        }
    };

    let psi = transform.constrained(&z_best);
    let values = match method {
        Method::MinRes => normalize_uls(&psi, matrix, n_factors)?,
        Method::Ml => normalize_ml(&psi, matrix, n_factors)?,
    };

    Ok(FactorFit {
        loadings: Loadings::new(values, corr.names().to_vec()),
        psi,
        converged,
        iterations,
        objective: objective_value,
        warnings,
    })
}

/// ULS/MINRES objective: substitute `1 - psi` on the diagonal, rebuild the
/// rank-`k` model from the dominant eigenpairs, and sum squared residuals
/// over the FULL matrix (diagonal included; deliberately not restricted to
/// the lower triangle).
pub(crate) fn uls_objective(
    psi: &Array1<f64>,
    corr: &Array2<f64>,
    n_factors: usize,
) -> f64 {
    let p = corr.nrows();
    let mut m = corr.clone();
    for i in 0..p {
        m[[i, i]] = 1.0 - psi[i];
    }

    let (values, vectors) = match m.eigh(UPLO::Lower) {
        Ok(pair) => pair,
        Err(_) => return OBJECTIVE_PENALTY,
    };

    // Eigenvalues arrive ascending; walk the top k with their eigenvectors,
    // flooring each value at eps*100 against non-positive artifacts.
    let floor = f64::EPSILON * 100.0;
    let mut loadings = Array2::zeros((p, n_factors));
    for j in 0..n_factors {
        let idx = p - 1 - j;
        let scale = values[idx].max(floor).sqrt();
        let column = vectors.column(idx).mapv(|v| v * scale);
        loadings.column_mut(j).assign(&column);
    }

    let model = loadings.dot(&loadings.t());
    let residual = &m - &model;
    residual.iter().map(|r| r * r).sum()
}

/// ML objective: eigendecompose `diag(1/sqrt(psi)) R diag(1/sqrt(psi))`,
/// retain the p-k smallest eigenvalues (ascending order with the largest k
/// dropped, then reversed to descending), and score
/// `-(sum(ln v - v) - k + p)`.
pub(crate) fn ml_objective(
    psi: &Array1<f64>,
    corr: &Array2<f64>,
    n_factors: usize,
) -> f64 {
    let p = corr.nrows();
    if psi.iter().any(|&v| !v.is_finite() || v <= 0.0) {
        return OBJECTIVE_PENALTY;
    }

    let sstar = scaled_by_inv_sqrt_psi(psi, corr);
    let (values, _) = match sstar.eigh(UPLO::Lower) {
        Ok(pair) => pair,
        Err(_) => return OBJECTIVE_PENALTY,
    };

    // Ascending order with the last (largest) k dropped, reversed: the p-k
    // smallest eigenvalues in descending order. This selection is distinct
    // from the normalization step's descending top-k on purpose.
    let retained = values.slice(s![..p - n_factors]);
    let mut sum = 0.0;
    for &v in retained.iter().rev() {
        if v <= 0.0 {
            return OBJECTIVE_PENALTY;
        }
        sum += v.ln() - v;
    }
    -(sum - n_factors as f64 + p as f64)
}

/// Final ULS loadings from a converged psi: dominant `k` eigenpairs of the
/// diagonal-substituted matrix, eigenvalues clipped at zero.
fn normalize_uls(
    psi: &Array1<f64>,
    corr: &Array2<f64>,
    n_factors: usize,
) -> Result<Array2<f64>, FactorAnalysisError> {
    let p = corr.nrows();
    let mut m = corr.clone();
    for i in 0..p {
        m[[i, i]] = 1.0 - psi[i];
    }

    let (values, vectors) = m
        .eigh(UPLO::Lower)
        .map_err(|e| FactorAnalysisError::linalg("ULS loading normalization", e))?;

    let mut loadings = Array2::zeros((p, n_factors));
    for j in 0..n_factors {
        let idx = p - 1 - j;
        let scale = values[idx].max(0.0).sqrt();
        let column = vectors.column(idx).mapv(|v| v * scale);
        loadings.column_mut(j).assign(&column);
    }
    Ok(loadings)
}

/// Final ML loadings from a converged psi: descending top-`k` eigenpairs of
/// the psi-scaled matrix, eigenvalues reduced by one and clipped at zero,
/// then rescaled back by `sqrt(psi)` row-wise.
fn normalize_ml(
    psi: &Array1<f64>,
    corr: &Array2<f64>,
    n_factors: usize,
) -> Result<Array2<f64>, FactorAnalysisError> {
    let p = corr.nrows();
    let sstar = scaled_by_inv_sqrt_psi(psi, corr);
    let (values, vectors) = sstar
        .eigh(UPLO::Lower)
        .map_err(|e| FactorAnalysisError::linalg("ML loading normalization", e))?;

    let mut loadings = Array2::zeros((p, n_factors));
    for j in 0..n_factors {
        let idx = p - 1 - j;
        let scale = (values[idx] - 1.0).max(0.0).sqrt();
        let column = vectors.column(idx).mapv(|v| v * scale);
        loadings.column_mut(j).assign(&column);
    }

    for (i, mut row) in loadings.rows_mut().into_iter().enumerate() {
        let scale = psi[i].sqrt();
        row.mapv_inplace(|v| v * scale);
    }
    Ok(loadings)
}

fn scaled_by_inv_sqrt_psi(psi: &Array1<f64>, corr: &Array2<f64>) -> Array2<f64> {
    let p = corr.nrows();
    Array2::from_shape_fn((p, p), |(i, j)| corr[[i, j]] / (psi[i] * psi[j]).sqrt())
}

/// Smooth bijection between the optimizer's unconstrained coordinates and
/// the bounded psi box: `psi = mid + half * tanh(z / half)` per dimension,
/// so every trial point the line search produces already satisfies the
/// bounds. `None` disables the box (identity map).
struct BoundsMap {
    bounds: Option<(f64, f64)>,
}

impl BoundsMap {
    fn new(bounds: Option<(f64, f64)>) -> Result<Self, FactorAnalysisError> {
        if let Some((lower, upper)) = bounds {
            if !lower.is_finite() || !upper.is_finite() || lower >= upper {
                return Err(FactorAnalysisError::InvalidInput(format!(
                    "psi bounds must be finite with lower < upper; got ({}, {})",
                    lower, upper
                )));
            }
        }
        Ok(BoundsMap { bounds })
    }

    fn constrained(&self, z: &Array1<f64>) -> Array1<f64> {
        match self.bounds {
            None => z.clone(),
            Some((lower, upper)) => {
                let mid = (lower + upper) / 2.0;
                let half = (upper - lower) / 2.0;
                z.mapv(|v| mid + half * (v / half).tanh())
            }
        }
    }

    fn unconstrained(&self, psi: &Array1<f64>) -> Array1<f64> {
        match self.bounds {
            None => psi.clone(),
            Some((lower, upper)) => {
                let mid = (lower + upper) / 2.0;
                let half = (upper - lower) / 2.0;
                psi.mapv(|v| {
                    let ratio = (v - mid) / half;
                    let inside = if ratio <= -1.0 {
                        next_toward_zero(-1.0)
                    } else if ratio >= 1.0 {
                        next_toward_zero(1.0)
                    } else {
                        ratio
                    };
                    (half * stable_atanh(inside)).clamp(-1e6, 1e6)
                })
            }
        }
    }
}

#[inline]
fn stable_atanh(x: f64) -> f64 {
    // atanh(x) = 0.5 * [ln(1 + x) - ln(1 - x)], accurate near |x| = 1.
    0.5 * ((1.0 + x).ln() - (1.0 - x).ln())
}

#[inline]
fn next_toward_zero(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else if x > 0.0 {
        f64::from_bits(x.to_bits() - 1)
    } else {
        f64::from_bits(x.to_bits() + 1)
    }
}
