use lgss_core::{Error, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use super::kalman::SingularPolicy;

/// Natural log of `2*pi` as an f64 constant.
pub(super) const LN_2PI: f64 = 1.837_877_066_409_345_3;

#[inline]
pub(super) fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (p + p.transpose())
}

/// Moore-Penrose pseudo-inverse with a size-scaled cutoff on singular values.
pub(super) fn pinv(a: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let svd = a.clone().svd(true, true);
    let eps = svd_cutoff(&svd.singular_values, a.nrows().max(a.ncols()));
    svd.pseudo_inverse(eps)
        .map_err(|e| Error::Computation(format!("pseudo-inverse failed: {e}")))
}

fn svd_cutoff(singular_values: &DVector<f64>, n: usize) -> f64 {
    let max_sv = singular_values.iter().cloned().fold(0.0f64, f64::max);
    // pseudo_inverse rejects a negative cutoff; zero is fine for an all-zero matrix.
    (max_sv * (n as f64) * f64::EPSILON).max(0.0)
}

/// Factorization of a covariance that has to be inverted (innovation or predicted).
pub(super) enum CovFactor {
    Cholesky(Cholesky<f64, Dyn>),
    Pseudo { inv: DMatrix<f64>, log_pdet: f64 },
}

impl CovFactor {
    pub(super) fn solve_vec(&self, b: &DVector<f64>) -> DVector<f64> {
        match self {
            CovFactor::Cholesky(c) => c.solve(b),
            CovFactor::Pseudo { inv, .. } => inv * b,
        }
    }

    pub(super) fn solve_mat(&self, b: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            CovFactor::Cholesky(c) => c.solve(b),
            CovFactor::Pseudo { inv, .. } => inv * b,
        }
    }

    /// `ln|A|`, or the log pseudo-determinant when factored by SVD.
    pub(super) fn log_det(&self) -> f64 {
        match self {
            CovFactor::Cholesky(c) => {
                let l = c.l_dirty();
                (0..l.nrows()).map(|i| 2.0 * l[(i, i)].ln()).sum()
            }
            CovFactor::Pseudo { log_pdet, .. } => *log_pdet,
        }
    }
}

fn cholesky_checked(a: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    let chol = a.clone().cholesky()?;
    let l = chol.l_dirty();
    let ok = (0..l.nrows()).all(|i| {
        let d = l[(i, i)];
        d.is_finite() && d > 0.0
    });
    ok.then_some(chol)
}

/// Factor a symmetric covariance for solves, honouring the singular-matrix policy.
pub(super) fn factorize(
    a: &DMatrix<f64>,
    policy: SingularPolicy,
    timestep: Option<usize>,
    matrix: &str,
) -> Result<CovFactor> {
    if let Some(chol) = cholesky_checked(a) {
        return Ok(CovFactor::Cholesky(chol));
    }

    match policy {
        SingularPolicy::Strict => {
            Err(Error::SingularCovariance { timestep, matrix: matrix.to_string() })
        }
        SingularPolicy::PseudoInverse => {
            let at = timestep.map(|t| format!(" at timestep {t}")).unwrap_or_default();
            if a.iter().any(|v| !v.is_finite()) {
                return Err(Error::Computation(format!("{matrix}{at} has non-finite entries")));
            }
            log::warn!("{matrix} not SPD{at}; using pseudo-inverse");

            let svd = a.clone().svd(true, true);
            let eps = svd_cutoff(&svd.singular_values, a.nrows());
            let log_pdet: f64 = svd.singular_values.iter().filter(|&&s| s > eps).map(|s| s.ln()).sum();
            let inv = svd.pseudo_inverse(eps).map_err(|e| {
                Error::Computation(format!("pseudo-inverse of {matrix} failed{at}: {e}"))
            })?;
            Ok(CovFactor::Pseudo { inv, log_pdet })
        }
    }
}
