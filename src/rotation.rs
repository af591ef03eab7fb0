//! Varimax (orthogonal) and Promax (oblique) rotation of a loading matrix.
//!
//! Rotation never mutates its input: it returns a replacement loading
//! matrix together with the rotation that produced it.

use log::warn;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Inverse, LeastSquaresSvd, SVD};

use crate::error::FactorAnalysisError;
use crate::fitter::Loadings;

/// Iteration cap for the Varimax loop.
pub const VARIMAX_MAX_ITERATIONS: usize = 500;

/// Relative convergence tolerance for the Varimax loop.
pub const VARIMAX_TOLERANCE: f64 = 1e-5;

/// Default exponent for the Promax target transform.
pub const PROMAX_POWER: i32 = 4;

/// Rotation applied to the unrotated loading matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Varimax,
    Promax,
}

impl Rotation {
    /// Parses a configuration string; `"none"` selects no rotation.
    ///
    /// # Errors
    ///
    /// Unlike the extraction method, an unrecognized rotation is a fatal
    /// configuration error.
    pub fn from_config(value: &str) -> Result<Option<Rotation>, FactorAnalysisError> {
        match value.to_ascii_lowercase().as_str() {
            "varimax" => Ok(Some(Rotation::Varimax)),
            "promax" => Ok(Some(Rotation::Promax)),
            "none" => Ok(None),
            other => Err(FactorAnalysisError::InvalidInput(format!(
                "`rotation` must be 'varimax', 'promax', or 'none'; got '{}'",
                other
            ))),
        }
    }
}

/// A rotated loading matrix and the rotation that produced it.
#[derive(Debug, Clone)]
pub struct RotationOutput {
    pub loadings: Loadings,
    /// `(k, k)`; orthogonal for Varimax, general invertible for Promax.
    pub rotation_matrix: Array2<f64>,
    /// Whether the Varimax loop met its tolerance within the iteration cap.
    pub converged: bool,
    /// Non-fatal diagnostics (cap exhaustion, pseudo-inverse fallback).
    pub warnings: Vec<String>,
}

/// Varimax rotation: iteratively maximizes the variance of squared
/// loadings per factor.
///
/// With fewer than two factors rotation is undefined; the loadings are
/// returned unchanged with an identity rotation. `normalize` applies
/// Kaiser row normalization before the loop and undoes it after.
///
/// The loop updates the rotation from the SVD of
/// `X' (B³ - B diag(diag(B'B))/p)` with `B = X R`, and stops when the
/// singular-value sum `d` satisfies `d/d_old < 1 + tolerance`. Exhausting
/// `max_iter` is non-fatal and reported through the warning channel.
pub fn varimax(
    loadings: &Loadings,
    normalize: bool,
    max_iter: usize,
    tolerance: f64,
) -> Result<RotationOutput, FactorAnalysisError> {
    let p = loadings.n_variables();
    let k = loadings.n_factors();
    if k < 2 {
        return Ok(RotationOutput {
            loadings: loadings.clone(),
            rotation_matrix: Array2::eye(k),
            converged: true,
            warnings: Vec::new(),
        });
    }

    let mut x = loadings.values().clone();

    // Kaiser normalization: scale every variable's loadings to unit length.
    let norms = if normalize {
        let norms = x.map_axis(Axis(1), |row| row.dot(&row).sqrt());
        for (i, mut row) in x.rows_mut().into_iter().enumerate() {
            row.mapv_inplace(|v| v / norms[i]);
        }
        Some(norms)
    } else {
        None
    };

    let mut rotation: Array2<f64> = Array2::eye(k);
    let mut d = 0.0;
    let mut converged = false;

    for _ in 0..max_iter {
        let old_d = d;

        let basis = x.dot(&rotation);
        let column_sq: Array1<f64> = basis.map_axis(Axis(0), |col| col.dot(&col));

        // B^3 - B diag(diag(B'B)) / p, elementwise cube.
        let mut inner = basis.mapv(|v| v * v * v);
        for (j, mut column) in inner.columns_mut().into_iter().enumerate() {
            let adjust = column_sq[j] / p as f64;
            column.zip_mut_with(&basis.column(j), |target, &b| *target -= b * adjust);
        }

        let transformed = x.t().dot(&inner);
        let (u, s, vt) = transformed
            .svd(true, true)
            .map_err(|e| FactorAnalysisError::linalg("Varimax rotation", e))?;
        let (u, vt) = match (u, vt) {
            (Some(u), Some(vt)) => (u, vt),
            _ => {
                return Err(FactorAnalysisError::linalg(
                    "Varimax rotation",
                    "SVD did not return singular vectors",
                ))
            }
        };

        rotation = u.dot(&vt);
        d = s.sum();

        if old_d != 0.0 && d / old_d < 1.0 + tolerance {
            converged = true;
            break;
        }
    }

    let mut warnings = Vec::new();
    if !converged {
        let message = format!(
            "Varimax did not meet tolerance {} within {} iterations; using the \
             final rotation",
            tolerance, max_iter
        );
        warn!("{}", message);
        warnings.push(message);
    }

    let mut rotated = x.dot(&rotation);
    if let Some(norms) = norms {
        for (i, mut row) in rotated.rows_mut().into_iter().enumerate() {
            row.mapv_inplace(|v| v * norms[i]);
        }
    }

    Ok(RotationOutput {
        loadings: loadings.replaced(rotated),
        rotation_matrix: rotation,
        converged,
        warnings,
    })
}

/// Promax rotation: sharpens a Varimax solution by regressing a
/// power-transformed target on it, yielding an oblique rotation.
///
/// With fewer than two factors the loadings are returned unchanged with an
/// identity rotation. `normalize` applies the square-root-communality
/// pre/post scaling and is passed through to the inner Varimax.
///
/// The coefficient rescaling inverts `C'C`; when that matrix is singular a
/// pseudo-inverse is substituted rather than failing.
pub fn promax(
    loadings: &Loadings,
    normalize: bool,
    power: i32,
) -> Result<RotationOutput, FactorAnalysisError> {
    let k = loadings.n_factors();
    if k < 2 {
        return Ok(RotationOutput {
            loadings: loadings.clone(),
            rotation_matrix: Array2::eye(k),
            converged: true,
            warnings: Vec::new(),
        });
    }

    // Pre-normalization by the square root of each variable's communality.
    let (weights, communalities) = if normalize {
        let h2 = loadings
            .values()
            .map_axis(Axis(1), |row| row.dot(&row));
        let mut weights = loadings.values().clone();
        for (i, mut row) in weights.rows_mut().into_iter().enumerate() {
            row.mapv_inplace(|v| v / h2[i].sqrt());
        }
        (weights, Some(h2))
    } else {
        (loadings.values().clone(), None)
    };

    let varimax_output = varimax(
        &loadings.replaced(weights),
        normalize,
        VARIMAX_MAX_ITERATIONS,
        VARIMAX_TOLERANCE,
    )?;
    let mut warnings = varimax_output.warnings;
    let x = varimax_output.loadings.values().clone();

    // Target exaggerating large loadings relative to small ones.
    let y = x.mapv(|v| v * v.abs().powi(power - 1));

    // No-intercept multivariate regression of the target on the Varimax
    // solution.
    let mut coef = x
        .least_squares(&y)
        .map_err(|e| FactorAnalysisError::linalg("Promax regression", e))?
        .solution;

    let cross = coef.t().dot(&coef);
    let diag_inv: Array1<f64> = match cross.inv() {
        Ok(inverse) => inverse.diag().to_owned(),
        Err(_) => {
            let message =
                "Promax coefficient cross-product is singular; substituting a \
                 pseudo-inverse"
                    .to_string();
            warn!("{}", message);
            warnings.push(message);
            pseudo_inverse(&cross)?.diag().to_owned()
        }
    };

    for (j, mut column) in coef.columns_mut().into_iter().enumerate() {
        let scale = diag_inv[j].sqrt();
        column.mapv_inplace(|v| v * scale);
    }

    let mut rotated = x.dot(&coef);
    if let Some(h2) = communalities {
        for (i, mut row) in rotated.rows_mut().into_iter().enumerate() {
            row.mapv_inplace(|v| v * h2[i].sqrt());
        }
    }

    let rotation_matrix = varimax_output.rotation_matrix.dot(&coef);

    Ok(RotationOutput {
        loadings: loadings.replaced(rotated),
        rotation_matrix,
        converged: varimax_output.converged,
        warnings,
    })
}

/// Moore-Penrose pseudo-inverse via SVD, zeroing singular values below a
/// scale-relative threshold.
fn pseudo_inverse(matrix: &Array2<f64>) -> Result<Array2<f64>, FactorAnalysisError> {
    let (u, s, vt) = matrix
        .svd(true, true)
        .map_err(|e| FactorAnalysisError::linalg("pseudo-inverse", e))?;
    let (u, vt) = match (u, vt) {
        (Some(u), Some(vt)) => (u, vt),
        _ => {
            return Err(FactorAnalysisError::linalg(
                "pseudo-inverse",
                "SVD did not return singular vectors",
            ))
        }
    };

    let cutoff = s.iter().cloned().fold(0.0, f64::max)
        * matrix.nrows().max(matrix.ncols()) as f64
        * f64::EPSILON;

    let mut scaled_ut = u.t().to_owned();
    for (i, mut row) in scaled_ut.rows_mut().into_iter().enumerate() {
        let inv = if i < s.len() && s[i] > cutoff {
            1.0 / s[i]
        } else {
            0.0
        };
        row.mapv_inplace(|v| v * inv);
    }
    Ok(vt.t().dot(&scaled_ut))
}
