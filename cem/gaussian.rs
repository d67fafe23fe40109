//! Multivariate normal log-densities via a Cholesky factor.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Diag, SolveTriangular, UPLO};
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GaussianError {
    #[error(
        "Covariance matrix is not positive definite even after regularization. Cholesky failed: {0}"
    )]
    NotPositiveDefinite(LinalgError),

    #[error("Triangular solve against the Cholesky factor failed: {0}")]
    TriangularSolveFailed(LinalgError),

    #[error("Dimension mismatch: mean has length {mean}, covariance is {rows}x{cols}.")]
    DimensionMismatch {
        mean: usize,
        rows: usize,
        cols: usize,
    },
}

/// A multivariate normal prepared for repeated density evaluation.
#[derive(Debug, Clone)]
pub struct MultivariateNormal {
    mean: Array1<f64>,
    /// Lower Cholesky factor `L` with `L Lᵀ = Σ`.
    chol_lower: Array2<f64>,
    log_det: f64,
}

impl MultivariateNormal {
    pub fn new(mean: ArrayView1<f64>, covariance: ArrayView2<f64>) -> Result<Self, GaussianError> {
        let (rows, cols) = covariance.dim();
        if rows != cols || rows != mean.len() {
            return Err(GaussianError::DimensionMismatch {
                mean: mean.len(),
                rows,
                cols,
            });
        }
        let chol_lower = covariance
            .cholesky(UPLO::Lower)
            .map_err(GaussianError::NotPositiveDefinite)?;
        // log|Σ| = 2 * sum(log(diag(L)))
        let log_det = 2.0 * chol_lower.diag().mapv(f64::ln).sum();
        Ok(Self {
            mean: mean.to_owned(),
            chol_lower,
            log_det,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    /// Log-density of every row of `x` (shape `[n, p]`).
    pub fn log_pdf_rows(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GaussianError> {
        let p = self.dim();
        let centered_t = (&x - &self.mean.view().insert_axis(Axis(0)))
            .reversed_axes()
            .as_standard_layout()
            .to_owned();
        // Columns of z are L⁻¹(xᵢ − μ); squared column norms are Mahalanobis distances.
        let z = self
            .chol_lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &centered_t)
            .map_err(GaussianError::TriangularSolveFailed)?;
        let mahalanobis = z.mapv(|v| v * v).sum_axis(Axis(0));
        let norm_const = p as f64 * (2.0 * PI).ln() + self.log_det;
        Ok(mahalanobis.mapv(|m| -0.5 * (norm_const + m)))
    }
}

/// Adds `ridge` to the diagonal of a square matrix in place.
pub fn add_ridge(matrix: &mut Array2<f64>, ridge: f64) {
    matrix.diag_mut().mapv_inplace(|d| d + ridge);
}

/// Numerically stable `ln(Σ exp(vᵢ))`. Returns `-inf` when every entry is `-inf`.
pub fn log_sum_exp<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64> + Clone,
{
    let max_val = values.clone().into_iter().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max_val.is_infinite() {
        return max_val;
    }
    max_val
        + values
            .into_iter()
            .map(|v| (v - max_val).exp())
            .sum::<f64>()
            .ln()
}
