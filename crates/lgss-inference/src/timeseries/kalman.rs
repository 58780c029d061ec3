//! Linear-Gaussian Kalman filter and RTS smoother.
//!
//! Supports per-timestep transition/observation parameters, offsets and missing
//! observations (an observation containing NaN is missing as a whole).

use lgss_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::internal::{LN_2PI, factorize, symmetrize};
use super::params::LinearGaussianParams;

/// What to do when a covariance that must be inverted is not positive definite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SingularPolicy {
    /// Fail with [`Error::SingularCovariance`].
    Strict,
    /// Substitute the Moore-Penrose pseudo-inverse and continue.
    #[default]
    PseudoInverse,
}

/// Filter/smoother configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Handling of singular innovation / predicted covariances.
    pub singular_policy: SingularPolicy,
}

impl FilterConfig {
    /// Configuration that fails on singular covariances.
    pub fn strict() -> Self {
        Self { singular_policy: SingularPolicy::Strict }
    }
}

/// Parameters of a single predict + update step.
#[derive(Debug, Clone, Copy)]
pub struct StepModel<'a> {
    /// Transition matrix `A` for the predict half.
    pub transition_matrix: &'a DMatrix<f64>,
    /// Transition offset `b`.
    pub transition_offset: &'a DVector<f64>,
    /// Transition covariance `Q`.
    pub transition_covariance: &'a DMatrix<f64>,
    /// Observation matrix `C` for the update half.
    pub observation_matrix: &'a DMatrix<f64>,
    /// Observation offset `d`.
    pub observation_offset: &'a DVector<f64>,
    /// Observation covariance `R`.
    pub observation_covariance: &'a DMatrix<f64>,
}

/// Innovation produced by an update against a present observation.
#[derive(Debug, Clone)]
pub struct Innovation {
    /// `y - (C m_pred + d)`.
    pub residual: DVector<f64>,
    /// `S = C P_pred C^T + R`.
    pub covariance: DMatrix<f64>,
    /// Gaussian log-density of `residual` under `covariance`.
    pub log_density: f64,
}

/// Output of one measurement update.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Posterior mean.
    pub mean: DVector<f64>,
    /// Posterior covariance.
    pub cov: DMatrix<f64>,
    /// `None` when the observation was missing.
    pub innovation: Option<Innovation>,
}

/// Kalman filter output (per-time-step predicted and filtered states).
#[derive(Debug, Clone)]
pub struct KalmanFilterResult {
    /// Total log-likelihood `log p(y_0..y_{T-1})`.
    pub log_likelihood: f64,
    /// Prior means `m_{t|t-1}` for each observation time.
    pub predicted_means: Vec<DVector<f64>>,
    /// Prior covariances `P_{t|t-1}` for each observation time.
    pub predicted_covs: Vec<DMatrix<f64>>,
    /// Posterior means `m_{t|t}` for each observation time.
    pub filtered_means: Vec<DVector<f64>>,
    /// Posterior covariances `P_{t|t}` for each observation time.
    pub filtered_covs: Vec<DMatrix<f64>>,
}

/// RTS smoother output (smoothed states).
#[derive(Debug, Clone)]
pub struct KalmanSmootherResult {
    /// Smoothed means `m_{t|T}`.
    pub smoothed_means: Vec<DVector<f64>>,
    /// Smoothed covariances `P_{t|T}`.
    pub smoothed_covs: Vec<DMatrix<f64>>,
    /// Smoother gains `J_t = P_{t|t} A_t^T P_{t+1|t}^{-1}`, t = 0..T-2.
    pub smoother_gains: Vec<DMatrix<f64>>,
    /// Pairwise cross-covariances `Cov(x_t, x_{t+1} | Y) = J_t P_{t+1|T}`, t = 0..T-2.
    pub pairwise_covs: Vec<DMatrix<f64>>,
}

/// Whether an observation is the missing marker (any NaN component).
pub fn is_missing(y: &DVector<f64>) -> bool {
    y.iter().any(|v| v.is_nan())
}

fn expect_dim(field: &str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(Error::DimensionMismatch { field: field.to_string(), expected, found });
    }
    Ok(())
}

fn expect_square(field: &str, n: usize, m: &DMatrix<f64>) -> Result<()> {
    expect_dim(&format!("{field} rows"), n, m.nrows())?;
    expect_dim(&format!("{field} columns"), n, m.ncols())
}

impl StepModel<'_> {
    /// Check every field against state dimension `n` and the observation dimension
    /// implied by `observation_matrix`.
    pub fn check_dims(&self, n: usize) -> Result<()> {
        expect_square("transition_matrix", n, self.transition_matrix)?;
        expect_dim("transition_offset", n, self.transition_offset.len())?;
        expect_square("transition_covariance", n, self.transition_covariance)?;
        expect_dim("observation_matrix columns", n, self.observation_matrix.ncols())?;
        let m = self.observation_matrix.nrows();
        expect_dim("observation_offset", m, self.observation_offset.len())?;
        expect_square("observation_covariance", m, self.observation_covariance)
    }
}

/// Time update: `(A m + b, A P A^T + Q)`.
pub fn predict(
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
    transition_matrix: &DMatrix<f64>,
    transition_offset: &DVector<f64>,
    transition_covariance: &DMatrix<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let n = mean.len();
    expect_square("state covariance", n, cov)?;
    expect_square("transition_matrix", n, transition_matrix)?;
    expect_dim("transition_offset", n, transition_offset.len())?;
    expect_square("transition_covariance", n, transition_covariance)?;

    let m_pred = transition_matrix * mean + transition_offset;
    let p_pred = transition_matrix * cov * transition_matrix.transpose() + transition_covariance;
    Ok((m_pred, symmetrize(&p_pred)))
}

/// Measurement update against `observation` (missing when `None` or NaN).
///
/// `timestep` is only used to give errors context.
#[allow(clippy::too_many_arguments)]
pub fn update(
    predicted_mean: &DVector<f64>,
    predicted_cov: &DMatrix<f64>,
    observation: Option<&DVector<f64>>,
    observation_matrix: &DMatrix<f64>,
    observation_offset: &DVector<f64>,
    observation_covariance: &DMatrix<f64>,
    policy: SingularPolicy,
    timestep: Option<usize>,
) -> Result<UpdateResult> {
    let n = predicted_mean.len();
    let m = observation_matrix.nrows();
    expect_square("predicted state covariance", n, predicted_cov)?;
    expect_dim("observation_matrix columns", n, observation_matrix.ncols())?;
    expect_dim("observation_offset", m, observation_offset.len())?;
    expect_square("observation_covariance", m, observation_covariance)?;

    let Some(y) = observation.filter(|y| !is_missing(y)) else {
        return Ok(UpdateResult {
            mean: predicted_mean.clone(),
            cov: predicted_cov.clone(),
            innovation: None,
        });
    };
    expect_dim("observation", m, y.len())?;
    let c = observation_matrix;

    // Innovation: v = y - (C m_pred + d)
    let v = y - (c * predicted_mean + observation_offset);

    // Innovation covariance: S = C P_pred C^T + R
    let s = symmetrize(&(c * predicted_cov * c.transpose() + observation_covariance));
    let factor = factorize(&s, policy, timestep, "innovation covariance")?;

    // quad = v^T S^{-1} v
    let quad = v.dot(&factor.solve_vec(&v));
    let log_density = -0.5 * ((m as f64) * LN_2PI + factor.log_det() + quad);

    // Kalman gain: K = P_pred C^T S^{-1}
    let pc_t = predicted_cov * c.transpose(); // n x m
    let k = factor.solve_mat(&pc_t.transpose()).transpose(); // n x m

    let mean = predicted_mean + &k * &v;
    let i_minus_kc = DMatrix::<f64>::identity(n, n) - &k * c;
    let cov = symmetrize(&(i_minus_kc * predicted_cov));

    if !log_density.is_finite() {
        let at = timestep.map(|t| format!(" at timestep {t}")).unwrap_or_default();
        return Err(Error::Computation(format!("non-finite innovation log-density{at}")));
    }

    Ok(UpdateResult {
        mean,
        cov,
        innovation: Some(Innovation { residual: v, covariance: s, log_density }),
    })
}

/// One online filter step: predict from the prior with `step`'s transition, then update
/// against `observation` with `step`'s observation parameters.
///
/// Stateless; chaining the outputs reproduces [`kalman_filter`] for t >= 1. Errors
/// carry no timestep since the step is not tied to a sequence.
pub fn filter_update(
    prior_mean: &DVector<f64>,
    prior_cov: &DMatrix<f64>,
    observation: Option<&DVector<f64>>,
    step: &StepModel<'_>,
    cfg: FilterConfig,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    expect_square("prior_covariance", prior_mean.len(), prior_cov)?;
    step.check_dims(prior_mean.len())?;

    let (m_pred, p_pred) = predict(
        prior_mean,
        prior_cov,
        step.transition_matrix,
        step.transition_offset,
        step.transition_covariance,
    )?;
    let upd = update(
        &m_pred,
        &p_pred,
        observation,
        step.observation_matrix,
        step.observation_offset,
        step.observation_covariance,
        cfg.singular_policy,
        None,
    )?;
    Ok((upd.mean, upd.cov))
}

fn validate_observations(ys: &[DVector<f64>], m: usize) -> Result<()> {
    if ys.is_empty() {
        return Err(Error::Validation("ys must be non-empty".to_string()));
    }
    for (t, y) in ys.iter().enumerate() {
        if y.len() != m {
            return Err(Error::Validation(format!(
                "y[{}] has wrong length: expected {}, got {}",
                t,
                m,
                y.len()
            )));
        }
        // Missing observations are represented as NaN. Reject infinities.
        if y.iter().any(|v| v.is_infinite()) {
            return Err(Error::Validation(format!(
                "y[{}] must be finite or NaN (NaN means missing)",
                t
            )));
        }
    }
    Ok(())
}

/// Run Kalman filtering on a full observation sequence.
///
/// t = 0 updates the initial prior directly; each later step predicts with the
/// transition parameters at `t - 1` and updates with the observation parameters at
/// `t`. Returns per-step predicted and filtered state distributions, plus the total
/// log-likelihood.
pub fn kalman_filter(
    params: &LinearGaussianParams,
    ys: &[DVector<f64>],
    cfg: FilterConfig,
) -> Result<KalmanFilterResult> {
    params.validate()?;
    validate_observations(ys, params.n_dim_obs())?;
    params.check_horizon(ys.len())?;

    let mut predicted_means = Vec::with_capacity(ys.len());
    let mut predicted_covs = Vec::with_capacity(ys.len());
    let mut filtered_means: Vec<DVector<f64>> = Vec::with_capacity(ys.len());
    let mut filtered_covs: Vec<DMatrix<f64>> = Vec::with_capacity(ys.len());
    let mut loglik = 0.0f64;

    for (t, y) in ys.iter().enumerate() {
        let step = params.step_model(t)?;

        let (m_pred, p_pred) = if t == 0 {
            (params.initial_state_mean.clone(), params.initial_state_covariance.clone())
        } else {
            predict(
                &filtered_means[t - 1],
                &filtered_covs[t - 1],
                step.transition_matrix,
                step.transition_offset,
                step.transition_covariance,
            )?
        };

        let upd = update(
            &m_pred,
            &p_pred,
            Some(y),
            step.observation_matrix,
            step.observation_offset,
            step.observation_covariance,
            cfg.singular_policy,
            Some(t),
        )?;
        if let Some(inn) = &upd.innovation {
            loglik += inn.log_density;
        }

        predicted_means.push(m_pred);
        predicted_covs.push(p_pred);
        filtered_means.push(upd.mean);
        filtered_covs.push(upd.cov);
    }

    Ok(KalmanFilterResult {
        log_likelihood: loglik,
        predicted_means,
        predicted_covs,
        filtered_means,
        filtered_covs,
    })
}

/// Run RTS smoothing given a completed Kalman filter result.
pub fn rts_smoother(
    params: &LinearGaussianParams,
    fr: &KalmanFilterResult,
    cfg: FilterConfig,
) -> Result<KalmanSmootherResult> {
    let t_max = fr.filtered_means.len();
    if t_max == 0 {
        return Err(Error::Validation("filter result must be non-empty".to_string()));
    }
    if fr.predicted_means.len() != t_max
        || fr.predicted_covs.len() != t_max
        || fr.filtered_covs.len() != t_max
    {
        return Err(Error::Validation("filter result has inconsistent lengths".to_string()));
    }
    params.validate()?;
    params.check_horizon(t_max)?;

    let n = params.n_dim_state();
    for t in 0..t_max {
        expect_dim("filtered mean", n, fr.filtered_means[t].len())?;
        expect_dim("predicted mean", n, fr.predicted_means[t].len())?;
        expect_square("filtered covariance", n, &fr.filtered_covs[t])?;
        expect_square("predicted covariance", n, &fr.predicted_covs[t])?;
    }

    let mut m_smooth = fr.filtered_means.clone();
    let mut p_smooth = fr.filtered_covs.clone();
    let mut gains = vec![DMatrix::<f64>::zeros(n, n); t_max - 1];
    let mut pairwise = vec![DMatrix::<f64>::zeros(n, n); t_max - 1];

    for t in (0..t_max - 1).rev() {
        // J_t = P_{t|t} A_t^T (P_{t+1|t})^{-1}
        let a = params.step_model(t + 1)?.transition_matrix;
        let p_filt = &fr.filtered_covs[t];
        let p_pred_next = &fr.predicted_covs[t + 1];

        let factor = factorize(
            p_pred_next,
            cfg.singular_policy,
            Some(t + 1),
            "predicted state covariance",
        )?;
        let j = factor.solve_mat(&(a * p_filt)).transpose(); // n x n

        // m_{t|T} = m_{t|t} + J (m_{t+1|T} - m_{t+1|t})
        let dm = &m_smooth[t + 1] - &fr.predicted_means[t + 1];
        m_smooth[t] = &fr.filtered_means[t] + &j * dm;

        // P_{t|T} = P_{t|t} + J (P_{t+1|T} - P_{t+1|t}) J^T
        let dp = &p_smooth[t + 1] - p_pred_next;
        let p = p_filt + &j * dp * j.transpose();
        p_smooth[t] = symmetrize(&p);

        pairwise[t] = &j * &p_smooth[t + 1];
        gains[t] = j;
    }

    Ok(KalmanSmootherResult {
        smoothed_means: m_smooth,
        smoothed_covs: p_smooth,
        smoother_gains: gains,
        pairwise_covs: pairwise,
    })
}

/// Log-likelihood of `ys` under `params` (one forward pass).
pub fn loglikelihood(
    params: &LinearGaussianParams,
    ys: &[DVector<f64>],
    cfg: FilterConfig,
) -> Result<f64> {
    Ok(kalman_filter(params, ys, cfg)?.log_likelihood)
}
