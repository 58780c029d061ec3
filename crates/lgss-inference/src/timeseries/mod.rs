//! Linear-Gaussian state space models.

mod internal;

/// Parameter specification, time-varying accessors and shape resolution.
pub mod params;

/// Linear-Gaussian Kalman filter / smoother.
pub mod kalman;

/// EM parameter estimation for linear-Gaussian state space models.
pub mod em;

/// Simulation from the generative model.
pub mod simulate;

/// Model facade bundling parameters and default settings.
pub mod model;

pub use em::{EmVar, EmVars, KalmanEmConfig, KalmanEmResult, kalman_em};
pub use kalman::{
    FilterConfig, KalmanFilterResult, KalmanSmootherResult, SingularPolicy, StepModel,
    filter_update, kalman_filter, loglikelihood, rts_smoother,
};
pub use model::KalmanFilter;
pub use params::{LinearGaussianParams, StateSpaceParams, TimeVarying, resolve};
pub use simulate::{KalmanSimResult, kalman_sample, kalman_simulate};
