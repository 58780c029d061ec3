//! EM parameter estimation for linear-Gaussian state space models.
//!
//! Each iteration runs the filter and RTS smoother against the current parameters and
//! then applies closed-form updates to the selected parameters, one block at a time:
//! observation matrix, observation offset, observation covariance, transition matrix,
//! transition offset, transition covariance, initial mean and initial covariance.
//! Every block update maximizes the expected complete-data log-likelihood given the
//! blocks already updated, so the log-likelihood is non-decreasing.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use lgss_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::internal::{pinv, symmetrize};
use super::kalman::{
    FilterConfig, KalmanSmootherResult, is_missing, kalman_filter, rts_smoother,
};
use super::params::{LinearGaussianParams, TimeVarying};

/// A parameter that EM can re-estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmVar {
    /// Transition matrix `A`.
    TransitionMatrices,
    /// Observation matrix `C`.
    ObservationMatrices,
    /// Transition offset `b`.
    TransitionOffsets,
    /// Observation offset `d`.
    ObservationOffsets,
    /// Transition covariance `Q`.
    TransitionCovariance,
    /// Observation covariance `R`.
    ObservationCovariance,
    /// Initial state mean `m0`.
    InitialStateMean,
    /// Initial state covariance `P0`.
    InitialStateCovariance,
}

impl EmVar {
    /// Every selectable parameter.
    pub const ALL: [EmVar; 8] = [
        EmVar::TransitionMatrices,
        EmVar::ObservationMatrices,
        EmVar::TransitionOffsets,
        EmVar::ObservationOffsets,
        EmVar::TransitionCovariance,
        EmVar::ObservationCovariance,
        EmVar::InitialStateMean,
        EmVar::InitialStateCovariance,
    ];

    /// Canonical parameter name.
    pub fn name(self) -> &'static str {
        match self {
            EmVar::TransitionMatrices => "transition_matrices",
            EmVar::ObservationMatrices => "observation_matrices",
            EmVar::TransitionOffsets => "transition_offsets",
            EmVar::ObservationOffsets => "observation_offsets",
            EmVar::TransitionCovariance => "transition_covariance",
            EmVar::ObservationCovariance => "observation_covariance",
            EmVar::InitialStateMean => "initial_state_mean",
            EmVar::InitialStateCovariance => "initial_state_covariance",
        }
    }
}

impl fmt::Display for EmVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EmVar {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        let var = match name {
            "transition_covariances" => EmVar::TransitionCovariance,
            "observation_covariances" => EmVar::ObservationCovariance,
            _ => *EmVar::ALL
                .iter()
                .find(|v| v.name() == name)
                .ok_or_else(|| Error::InvalidEmSelector(format!("unknown parameter '{name}'")))?,
        };
        Ok(var)
    }
}

/// Which parameters EM re-estimates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmVars {
    /// Every parameter.
    All,
    /// Only the listed parameters; the rest are held fixed.
    Only(BTreeSet<EmVar>),
}

impl EmVars {
    /// Parse a list of parameter names. `"all"` selects everything; every other name
    /// must still be valid.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        let mut all = false;
        for name in names {
            let name = name.as_ref();
            if name.trim() == "all" {
                all = true;
            } else {
                set.insert(name.parse::<EmVar>()?);
            }
        }
        Ok(if all { EmVars::All } else { EmVars::Only(set) })
    }

    /// Whether `var` is re-estimated.
    pub fn contains(&self, var: EmVar) -> bool {
        match self {
            EmVars::All => true,
            EmVars::Only(set) => set.contains(&var),
        }
    }

    /// Selected parameters in canonical order.
    pub fn selected(&self) -> Vec<EmVar> {
        EmVar::ALL.iter().copied().filter(|&v| self.contains(v)).collect()
    }
}

impl Default for EmVars {
    /// Noise covariances and the initial state distribution.
    fn default() -> Self {
        EmVars::Only(BTreeSet::from([
            EmVar::TransitionCovariance,
            EmVar::ObservationCovariance,
            EmVar::InitialStateMean,
            EmVar::InitialStateCovariance,
        ]))
    }
}

impl FromStr for EmVars {
    type Err = Error;

    /// `"all"` or a comma-separated list of parameter names.
    fn from_str(s: &str) -> Result<Self> {
        EmVars::from_names(s.split(',').filter(|p| !p.trim().is_empty()))
    }
}

/// EM configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanEmConfig {
    /// Number of EM iterations.
    pub n_iter: usize,
    /// Parameters to re-estimate.
    pub em_vars: EmVars,
    /// Stop early once the relative log-likelihood change falls below this value.
    pub tol: Option<f64>,
    /// Minimum diagonal value applied to re-estimated covariances to avoid degeneracy.
    pub min_diag: f64,
    /// Filter/smoother settings used in the E-step.
    pub filter: FilterConfig,
}

impl Default for KalmanEmConfig {
    fn default() -> Self {
        Self {
            n_iter: 10,
            em_vars: EmVars::default(),
            tol: None,
            min_diag: 1e-12,
            filter: FilterConfig::default(),
        }
    }
}

/// EM result.
#[derive(Debug, Clone)]
pub struct KalmanEmResult {
    /// Fitted parameters.
    pub params: LinearGaussianParams,
    /// Log-likelihood at the initial parameters and after every completed iteration.
    pub loglik_trace: Vec<f64>,
    /// Whether the `tol` stopping criterion was met.
    pub converged: bool,
    /// Number of completed EM iterations.
    pub n_iter: usize,
}

fn ensure_spd(mut a: DMatrix<f64>, min_diag: f64) -> Result<DMatrix<f64>> {
    a = symmetrize(&a);

    // Floor the diagonal to keep things numerically sane.
    let n = a.nrows().min(a.ncols());
    for i in 0..n {
        if !a[(i, i)].is_finite() {
            return Err(Error::Computation("covariance has non-finite diagonal".to_string()));
        }
        if a[(i, i)] < min_diag {
            a[(i, i)] = min_diag;
        }
    }

    // If still not SPD, add increasing jitter until Cholesky succeeds.
    if a.clone().cholesky().is_some() {
        return Ok(a);
    }

    let mut jitter = min_diag.max(1e-12);
    for _ in 0..20 {
        let j = DMatrix::<f64>::identity(a.nrows(), a.ncols()) * jitter;
        let candidate = symmetrize(&(a.clone() + j));
        if candidate.clone().cholesky().is_some() {
            return Ok(candidate);
        }
        jitter *= 10.0;
    }

    Err(Error::Computation(
        "failed to make covariance SPD (Cholesky never succeeded)".to_string(),
    ))
}

fn e_xx(m: &DVector<f64>, p: &DMatrix<f64>) -> DMatrix<f64> {
    p + m * m.transpose()
}

fn validate_selection(
    params: &LinearGaussianParams,
    ys: &[DVector<f64>],
    cfg: &KalmanEmConfig,
) -> Result<()> {
    if cfg.n_iter == 0 {
        return Err(Error::Validation("n_iter must be > 0".to_string()));
    }
    if cfg.tol.is_some_and(|tol| !tol.is_finite() || tol <= 0.0) {
        return Err(Error::Validation("tol must be finite and > 0".to_string()));
    }
    if !cfg.min_diag.is_finite() || cfg.min_diag < 0.0 {
        return Err(Error::Validation("min_diag must be finite and >= 0".to_string()));
    }

    let vars = &cfg.em_vars;
    let time_varying = [
        (EmVar::TransitionMatrices, params.transition_matrices.is_time_varying()),
        (EmVar::TransitionOffsets, params.transition_offsets.is_time_varying()),
        (EmVar::TransitionCovariance, params.transition_covariance.is_time_varying()),
        (EmVar::ObservationMatrices, params.observation_matrices.is_time_varying()),
        (EmVar::ObservationOffsets, params.observation_offsets.is_time_varying()),
        (EmVar::ObservationCovariance, params.observation_covariance.is_time_varying()),
    ];
    for (var, tv) in time_varying {
        if tv && vars.contains(var) {
            return Err(Error::Validation(format!(
                "{var} is time-varying and cannot be re-estimated by EM"
            )));
        }
    }

    let transition_selected = [
        EmVar::TransitionMatrices,
        EmVar::TransitionOffsets,
        EmVar::TransitionCovariance,
    ]
    .into_iter()
    .any(|v| vars.contains(v));
    if transition_selected && ys.len() < 2 {
        return Err(Error::Validation(
            "need at least 2 observations to estimate transition parameters".to_string(),
        ));
    }

    let observation_selected = [
        EmVar::ObservationMatrices,
        EmVar::ObservationOffsets,
        EmVar::ObservationCovariance,
    ]
    .into_iter()
    .any(|v| vars.contains(v));
    if observation_selected && ys.iter().all(is_missing) {
        return Err(Error::Validation(
            "cannot estimate observation parameters: all observations are missing".to_string(),
        ));
    }
    Ok(())
}

/// Closed-form M-step on the selected parameters of `cur`.
fn m_step(
    cur: &mut LinearGaussianParams,
    ys: &[DVector<f64>],
    sr: &KalmanSmootherResult,
    vars: &EmVars,
    min_diag: f64,
) -> Result<()> {
    let t_max = ys.len();
    let n = cur.n_dim_state();
    let m_obs = cur.n_dim_obs();
    let ms = &sr.smoothed_means;
    let ps = &sr.smoothed_covs;

    // Cov(x_{t+1}, x_t | Y) for t = 0..T-2.
    let pair_next: Vec<DMatrix<f64>> = sr.pairwise_covs.iter().map(|p| p.transpose()).collect();
    let observed: Vec<usize> = (0..t_max).filter(|&t| !is_missing(&ys[t])).collect();
    let n_observed = observed.len() as f64;

    if vars.contains(EmVar::ObservationMatrices) {
        // C = [sum (y_t - d_t) E[x_t]^T] [sum E[x_t x_t^T]]^+
        let mut res1 = DMatrix::<f64>::zeros(m_obs, n);
        let mut res2 = DMatrix::<f64>::zeros(n, n);
        for &t in &observed {
            let centered = &ys[t] - cur.step_model(t)?.observation_offset;
            res1 += &centered * ms[t].transpose();
            res2 += e_xx(&ms[t], &ps[t]);
        }
        cur.observation_matrices = TimeVarying::Static(res1 * pinv(&res2)?);
    }

    if vars.contains(EmVar::ObservationOffsets) {
        let mut acc = DVector::<f64>::zeros(m_obs);
        for &t in &observed {
            acc += &ys[t] - cur.step_model(t)?.observation_matrix * &ms[t];
        }
        cur.observation_offsets = TimeVarying::Static(acc / n_observed);
    }

    if vars.contains(EmVar::ObservationCovariance) {
        let mut acc = DMatrix::<f64>::zeros(m_obs, m_obs);
        for &t in &observed {
            let step = cur.step_model(t)?;
            let c = step.observation_matrix;
            let err = &ys[t] - c * &ms[t] - step.observation_offset;
            acc += &err * err.transpose() + c * &ps[t] * c.transpose();
        }
        cur.observation_covariance = TimeVarying::Static(ensure_spd(acc / n_observed, min_diag)?);
    }

    let n_trans = t_max.saturating_sub(1) as f64;

    if vars.contains(EmVar::TransitionMatrices) {
        // A = [sum E[x_t x_{t-1}^T] - b_{t-1} E[x_{t-1}]^T] [sum E[x_{t-1} x_{t-1}^T]]^+
        let mut res1 = DMatrix::<f64>::zeros(n, n);
        let mut res2 = DMatrix::<f64>::zeros(n, n);
        for t in 1..t_max {
            let b = cur.step_model(t)?.transition_offset;
            res1 += &pair_next[t - 1] + &ms[t] * ms[t - 1].transpose()
                - b * ms[t - 1].transpose();
            res2 += e_xx(&ms[t - 1], &ps[t - 1]);
        }
        cur.transition_matrices = TimeVarying::Static(res1 * pinv(&res2)?);
    }

    if vars.contains(EmVar::TransitionOffsets) {
        let mut acc = DVector::<f64>::zeros(n);
        for t in 1..t_max {
            acc += &ms[t] - cur.step_model(t)?.transition_matrix * &ms[t - 1];
        }
        cur.transition_offsets = TimeVarying::Static(acc / n_trans);
    }

    if vars.contains(EmVar::TransitionCovariance) {
        let mut acc = DMatrix::<f64>::zeros(n, n);
        for t in 0..t_max - 1 {
            let step = cur.step_model(t + 1)?;
            let a = step.transition_matrix;
            let err = &ms[t + 1] - a * &ms[t] - step.transition_offset;
            let pair_a = &pair_next[t] * a.transpose();
            acc += &err * err.transpose() + a * &ps[t] * a.transpose() + &ps[t + 1]
                - &pair_a
                - pair_a.transpose();
        }
        cur.transition_covariance = TimeVarying::Static(ensure_spd(acc / n_trans, min_diag)?);
    }

    if vars.contains(EmVar::InitialStateMean) {
        cur.initial_state_mean = ms[0].clone();
    }

    if vars.contains(EmVar::InitialStateCovariance) {
        let dm = &ms[0] - &cur.initial_state_mean;
        cur.initial_state_covariance = ensure_spd(&ps[0] + &dm * dm.transpose(), min_diag)?;
    }

    Ok(())
}

/// Fit the selected parameters with EM, holding the others fixed.
pub fn kalman_em(
    params: &LinearGaussianParams,
    ys: &[DVector<f64>],
    cfg: &KalmanEmConfig,
) -> Result<KalmanEmResult> {
    validate_selection(params, ys, cfg)?;

    let mut cur = params.clone();
    let mut trace = Vec::with_capacity(cfg.n_iter + 1);
    let mut converged = false;
    let mut n_iter = 0usize;

    let mut fr = kalman_filter(&cur, ys, cfg.filter)?;
    let mut prev_ll = fr.log_likelihood;
    trace.push(prev_ll);

    for iter in 0..cfg.n_iter {
        let sr = rts_smoother(&cur, &fr, cfg.filter)?;
        m_step(&mut cur, ys, &sr, &cfg.em_vars, cfg.min_diag)?;

        fr = kalman_filter(&cur, ys, cfg.filter)?;
        let ll = fr.log_likelihood;
        trace.push(ll);
        n_iter = iter + 1;

        log::debug!("EM iteration {}: loglik = {:.6} (delta {:.3e})", n_iter, ll, ll - prev_ll);
        if ll < prev_ll - 1e-8 * (1.0 + prev_ll.abs()) {
            log::warn!(
                "EM log-likelihood decreased at iteration {}: {} -> {}",
                n_iter,
                prev_ll,
                ll
            );
        }

        if let Some(tol) = cfg.tol {
            let rel = (ll - prev_ll).abs() / (1.0 + prev_ll.abs());
            if rel <= tol {
                converged = true;
                break;
            }
        }
        prev_ll = ll;
    }

    Ok(KalmanEmResult { params: cur, loglik_trace: trace, converged, n_iter })
}
