//! Simulation utilities for linear-Gaussian state space models.
//!
//! Generates a latent trajectory and corresponding observations:
//! - x_0 ~ N(m0, P0)
//! - x_t = A_{t-1} x_{t-1} + b_{t-1} + w_t, w_t ~ N(0, Q_{t-1})
//! - y_t = C_t x_t + d_t + v_t,             v_t ~ N(0, R_t)

use lgss_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use super::params::LinearGaussianParams;

/// Simulation output.
#[derive(Debug, Clone)]
pub struct KalmanSimResult {
    /// Latent states (length T, each is n_state).
    pub xs: Vec<DVector<f64>>,
    /// Observations (length T, each is n_obs).
    pub ys: Vec<DVector<f64>>,
}

/// Lower-triangular-ish square root `L` with `L L^T = cov`.
///
/// Falls back to an eigen square root (negative eigenvalues clipped) when the
/// covariance is only positive semi-definite, e.g. a zero noise block.
fn cov_sqrt(cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let n = cov.nrows();
    if cov.ncols() != n || n == 0 {
        return Err(Error::Validation("cov must be square and non-empty".to_string()));
    }
    if cov.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation("cov must be finite".to_string()));
    }

    if let Some(chol) = cov.clone().cholesky() {
        return Ok(chol.l());
    }

    let eig = cov.clone().symmetric_eigen();
    let scale = eig.eigenvalues.iter().cloned().fold(0.0f64, |a, l| a.max(l.abs()));
    if eig.eigenvalues.iter().any(|&l| l < -1e-8 * scale.max(1.0)) {
        return Err(Error::Computation(
            "covariance is not positive semi-definite".to_string(),
        ));
    }
    let sqrt_vals = DMatrix::from_diagonal(&eig.eigenvalues.map(|l| l.max(0.0).sqrt()));
    Ok(&eig.eigenvectors * sqrt_vals)
}

fn sample_mvn_zero<R: Rng + ?Sized>(rng: &mut R, sqrt_cov: &DMatrix<f64>) -> DVector<f64> {
    let z = DVector::<f64>::from_fn(sqrt_cov.ncols(), |_, _| StandardNormal.sample(&mut *rng));
    sqrt_cov * z
}

/// Draw `n_timesteps` states and observations using the caller's random generator.
///
/// When `initial_state` is `None`, `x_0` is drawn from the initial state distribution.
pub fn kalman_sample<R: Rng + ?Sized>(
    params: &LinearGaussianParams,
    n_timesteps: usize,
    initial_state: Option<&DVector<f64>>,
    rng: &mut R,
) -> Result<KalmanSimResult> {
    if n_timesteps == 0 {
        return Err(Error::Validation("n_timesteps must be > 0".to_string()));
    }
    params.validate()?;
    params.check_horizon(n_timesteps)?;
    let n = params.n_dim_state();

    let mut xs: Vec<DVector<f64>> = Vec::with_capacity(n_timesteps);
    let mut ys = Vec::with_capacity(n_timesteps);

    for t in 0..n_timesteps {
        let step = params.step_model(t)?;

        let x = if t == 0 {
            match initial_state {
                Some(x0) if x0.len() != n => {
                    return Err(Error::DimensionMismatch {
                        field: "initial_state".to_string(),
                        expected: n,
                        found: x0.len(),
                    });
                }
                Some(x0) => x0.clone(),
                None => {
                    let l = cov_sqrt(&params.initial_state_covariance)?;
                    &params.initial_state_mean + sample_mvn_zero(rng, &l)
                }
            }
        } else {
            // State evolution
            let l = cov_sqrt(step.transition_covariance)?;
            let w = sample_mvn_zero(rng, &l);
            step.transition_matrix * &xs[t - 1] + step.transition_offset + w
        };

        // Observation
        let l = cov_sqrt(step.observation_covariance)?;
        let v = sample_mvn_zero(rng, &l);
        let y = step.observation_matrix * &x + step.observation_offset + v;

        xs.push(x);
        ys.push(y);
    }

    Ok(KalmanSimResult { xs, ys })
}

/// Simulate `t_max` steps with a `StdRng` seeded from `seed`.
pub fn kalman_simulate(
    params: &LinearGaussianParams,
    t_max: usize,
    seed: u64,
) -> Result<KalmanSimResult> {
    let mut rng = StdRng::seed_from_u64(seed);
    kalman_sample(params, t_max, None, &mut rng)
}
