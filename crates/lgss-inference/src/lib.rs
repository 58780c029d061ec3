//! # lgss-inference
//!
//! Estimation for linear-Gaussian state space models.
//!
//! This crate provides:
//! - Parameter resolution (partial and time-varying specifications)
//! - Kalman filtering and single-step online updates
//! - RTS smoothing with pairwise cross-covariances
//! - Log-likelihood evaluation
//! - EM parameter estimation
//! - Simulation from the generative model
//!
//! Everything is single-threaded and synchronous; results are freshly allocated
//! per call, so independent sequences can be processed in parallel by the caller.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Linear-Gaussian state space models.
pub mod timeseries;

pub use timeseries::{
    EmVar, EmVars, FilterConfig, KalmanEmConfig, KalmanFilter, LinearGaussianParams,
    SingularPolicy, StateSpaceParams, TimeVarying,
};
