//! `KalmanFilter`: resolved parameters plus default settings behind named operations.

use lgss_core::Result;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::em::{EmVars, KalmanEmConfig, KalmanEmResult, kalman_em};
use super::kalman::{FilterConfig, filter_update, kalman_filter, loglikelihood, rts_smoother};
use super::params::{LinearGaussianParams, StateSpaceParams, resolve};
use super::simulate::{KalmanSimResult, kalman_sample};

/// Linear-Gaussian state space model with filter/smoother/EM operations.
///
/// ```
/// use lgss_inference::timeseries::{KalmanFilter, StateSpaceParams};
/// use nalgebra::DVector;
///
/// let kf = KalmanFilter::new(&StateSpaceParams::new().with_n_dim_state(2)).unwrap();
/// let ys: Vec<DVector<f64>> = (0..10).map(|t| DVector::from_element(1, t as f64)).collect();
/// let (means, covs) = kf.filter(&ys).unwrap();
/// assert_eq!(means.len(), 10);
/// assert_eq!(covs[0].nrows(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanFilter {
    params: LinearGaussianParams,
    em_vars: EmVars,
    config: FilterConfig,
}

impl KalmanFilter {
    /// Resolve `spec` and build a filter with default EM selection and configuration.
    pub fn new(spec: &StateSpaceParams) -> Result<Self> {
        Ok(Self::from_params(resolve(spec)?))
    }

    /// Wrap already-resolved parameters.
    pub fn from_params(params: LinearGaussianParams) -> Self {
        Self { params, em_vars: EmVars::default(), config: FilterConfig::default() }
    }

    /// Set the parameters EM re-estimates by default.
    pub fn with_em_vars(mut self, em_vars: EmVars) -> Self {
        self.em_vars = em_vars;
        self
    }

    /// Set the filter configuration.
    pub fn with_config(mut self, config: FilterConfig) -> Self {
        self.config = config;
        self
    }

    /// Current (fully resolved) parameters.
    pub fn resolved_parameters(&self) -> &LinearGaussianParams {
        &self.params
    }

    /// Default EM selection.
    pub fn em_vars(&self) -> &EmVars {
        &self.em_vars
    }

    /// Filtered means and covariances for every timestep.
    pub fn filter(&self, ys: &[DVector<f64>]) -> Result<(Vec<DVector<f64>>, Vec<DMatrix<f64>>)> {
        let fr = kalman_filter(&self.params, ys, self.config)?;
        Ok((fr.filtered_means, fr.filtered_covs))
    }

    /// One online step from `(mean, cov)` using the model's last-timestep parameters.
    pub fn filter_update(
        &self,
        mean: &DVector<f64>,
        cov: &DMatrix<f64>,
        observation: Option<&DVector<f64>>,
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        filter_update(mean, cov, observation, &self.params.last_step_model()?, self.config)
    }

    /// Smoothed means and covariances for every timestep.
    pub fn smooth(&self, ys: &[DVector<f64>]) -> Result<(Vec<DVector<f64>>, Vec<DMatrix<f64>>)> {
        let fr = kalman_filter(&self.params, ys, self.config)?;
        let sr = rts_smoother(&self.params, &fr, self.config)?;
        Ok((sr.smoothed_means, sr.smoothed_covs))
    }

    /// Draw a state/observation trajectory.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n_timesteps: usize,
        initial_state: Option<&DVector<f64>>,
        rng: &mut R,
    ) -> Result<KalmanSimResult> {
        kalman_sample(&self.params, n_timesteps, initial_state, rng)
    }

    /// Log-likelihood of `ys`.
    pub fn loglikelihood(&self, ys: &[DVector<f64>]) -> Result<f64> {
        loglikelihood(&self.params, ys, self.config)
    }

    /// Run `n_iter` EM iterations and replace the parameters with the fitted ones.
    ///
    /// `em_vars` overrides the default selection for this call.
    pub fn em(
        &mut self,
        ys: &[DVector<f64>],
        n_iter: usize,
        em_vars: Option<&EmVars>,
    ) -> Result<&mut Self> {
        self.em_with_trace(ys, n_iter, em_vars)?;
        Ok(self)
    }

    /// Like [`KalmanFilter::em`], returning the full EM result.
    pub fn em_with_trace(
        &mut self,
        ys: &[DVector<f64>],
        n_iter: usize,
        em_vars: Option<&EmVars>,
    ) -> Result<KalmanEmResult> {
        let cfg = KalmanEmConfig {
            n_iter,
            em_vars: em_vars.unwrap_or(&self.em_vars).clone(),
            filter: self.config,
            ..KalmanEmConfig::default()
        };
        let res = kalman_em(&self.params, ys, &cfg)?;
        self.params = res.params.clone();
        Ok(res)
    }
}
