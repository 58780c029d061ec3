//! Parameter specification and shape resolution for linear-Gaussian state space models.
//!
//! Callers may supply any subset of the model parameters, each either fixed for all
//! timesteps or given per timestep. [`resolve`] infers the state/observation dimensions
//! from whatever was supplied, validates every field against them and fills the rest
//! with defaults:
//! - transition matrix: identity
//! - observation matrix: rectangular identity `I(n_obs, n_state)`
//! - offsets: zero
//! - covariances (including the initial state covariance): identity
//! - initial state mean: zero

use lgss_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::kalman::StepModel;

/// A parameter that is either shared by all timesteps or given per timestep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeVarying<T> {
    /// One value reused at every timestep.
    Static(T),
    /// One value per timestep (or per transition for transition parameters).
    PerStep(Vec<T>),
}

impl<T> TimeVarying<T> {
    /// Value valid at timestep `t`, or `None` for an empty per-step sequence.
    ///
    /// Per-step sequences shorter than `t + 1` yield their last element; the filter
    /// checks the horizon with [`TimeVarying::covers`] before indexing.
    pub fn at(&self, t: usize) -> Option<&T> {
        match self {
            TimeVarying::Static(v) => Some(v),
            TimeVarying::PerStep(vs) => vs.get(t).or_else(|| vs.last()),
        }
    }

    /// First value (the only one for static parameters).
    pub fn first(&self) -> Option<&T> {
        self.at(0)
    }

    /// Last value (the only one for static parameters).
    pub fn last(&self) -> Option<&T> {
        match self {
            TimeVarying::Static(v) => Some(v),
            TimeVarying::PerStep(vs) => vs.last(),
        }
    }

    /// Whether this is a per-step sequence with no entries.
    pub fn is_empty(&self) -> bool {
        matches!(self, TimeVarying::PerStep(vs) if vs.is_empty())
    }

    /// Whether the parameter changes with the timestep.
    pub fn is_time_varying(&self) -> bool {
        matches!(self, TimeVarying::PerStep(_))
    }

    /// Whether values exist for timesteps `0..n`.
    pub fn covers(&self, n: usize) -> bool {
        match self {
            TimeVarying::Static(_) => true,
            TimeVarying::PerStep(vs) => vs.len() >= n,
        }
    }

    /// Iterate over all stored values.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            TimeVarying::Static(v) => std::slice::from_ref(v).iter(),
            TimeVarying::PerStep(vs) => vs.iter(),
        }
    }
}

impl From<DMatrix<f64>> for TimeVarying<DMatrix<f64>> {
    fn from(m: DMatrix<f64>) -> Self {
        TimeVarying::Static(m)
    }
}

impl From<Vec<DMatrix<f64>>> for TimeVarying<DMatrix<f64>> {
    fn from(ms: Vec<DMatrix<f64>>) -> Self {
        TimeVarying::PerStep(ms)
    }
}

impl From<DVector<f64>> for TimeVarying<DVector<f64>> {
    fn from(v: DVector<f64>) -> Self {
        TimeVarying::Static(v)
    }
}

impl From<Vec<DVector<f64>>> for TimeVarying<DVector<f64>> {
    fn from(vs: Vec<DVector<f64>>) -> Self {
        TimeVarying::PerStep(vs)
    }
}

/// User-supplied, possibly partial model specification.
///
/// State:
/// `x_{t+1} = A_t x_t + b_t + w_t`,  `w_t ~ N(0, Q_t)`
///
/// Observation:
/// `y_t = C_t x_t + d_t + v_t`,      `v_t ~ N(0, R_t)`
///
/// Initial prior:
/// `x_0 ~ N(m0, P0)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSpaceParams {
    /// Transition matrices `A` (n_state x n_state).
    pub transition_matrices: Option<TimeVarying<DMatrix<f64>>>,
    /// Transition offsets `b` (n_state).
    pub transition_offsets: Option<TimeVarying<DVector<f64>>>,
    /// Transition covariance `Q` (n_state x n_state).
    pub transition_covariance: Option<TimeVarying<DMatrix<f64>>>,
    /// Observation matrices `C` (n_obs x n_state).
    pub observation_matrices: Option<TimeVarying<DMatrix<f64>>>,
    /// Observation offsets `d` (n_obs).
    pub observation_offsets: Option<TimeVarying<DVector<f64>>>,
    /// Observation covariance `R` (n_obs x n_obs).
    pub observation_covariance: Option<TimeVarying<DMatrix<f64>>>,
    /// Initial state mean `m0` (n_state).
    pub initial_state_mean: Option<DVector<f64>>,
    /// Initial state covariance `P0` (n_state x n_state).
    pub initial_state_covariance: Option<DMatrix<f64>>,
    /// Explicit state dimension.
    pub n_dim_state: Option<usize>,
    /// Explicit observation dimension.
    pub n_dim_obs: Option<usize>,
}

impl StateSpaceParams {
    /// Empty specification (everything defaulted, dimensions 1).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transition matrices.
    pub fn with_transition_matrices(mut self, a: impl Into<TimeVarying<DMatrix<f64>>>) -> Self {
        self.transition_matrices = Some(a.into());
        self
    }

    /// Set the transition offsets.
    pub fn with_transition_offsets(mut self, b: impl Into<TimeVarying<DVector<f64>>>) -> Self {
        self.transition_offsets = Some(b.into());
        self
    }

    /// Set the transition covariance.
    pub fn with_transition_covariance(mut self, q: impl Into<TimeVarying<DMatrix<f64>>>) -> Self {
        self.transition_covariance = Some(q.into());
        self
    }

    /// Set the observation matrices.
    pub fn with_observation_matrices(mut self, c: impl Into<TimeVarying<DMatrix<f64>>>) -> Self {
        self.observation_matrices = Some(c.into());
        self
    }

    /// Set the observation offsets.
    pub fn with_observation_offsets(mut self, d: impl Into<TimeVarying<DVector<f64>>>) -> Self {
        self.observation_offsets = Some(d.into());
        self
    }

    /// Set the observation covariance.
    pub fn with_observation_covariance(mut self, r: impl Into<TimeVarying<DMatrix<f64>>>) -> Self {
        self.observation_covariance = Some(r.into());
        self
    }

    /// Set the initial state mean.
    pub fn with_initial_state_mean(mut self, m0: DVector<f64>) -> Self {
        self.initial_state_mean = Some(m0);
        self
    }

    /// Set the initial state covariance.
    pub fn with_initial_state_covariance(mut self, p0: DMatrix<f64>) -> Self {
        self.initial_state_covariance = Some(p0);
        self
    }

    /// Fix the state dimension explicitly.
    pub fn with_n_dim_state(mut self, n: usize) -> Self {
        self.n_dim_state = Some(n);
        self
    }

    /// Fix the observation dimension explicitly.
    pub fn with_n_dim_obs(mut self, m: usize) -> Self {
        self.n_dim_obs = Some(m);
        self
    }
}

/// Fully resolved, dimensionally consistent model parameters.
///
/// Deserialization runs [`LinearGaussianParams::validate`], so a restored model has
/// the same guarantees as one built by [`resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParams")]
pub struct LinearGaussianParams {
    /// Transition matrices `A` (n_state x n_state).
    pub transition_matrices: TimeVarying<DMatrix<f64>>,
    /// Transition offsets `b` (n_state).
    pub transition_offsets: TimeVarying<DVector<f64>>,
    /// Transition covariance `Q` (n_state x n_state).
    pub transition_covariance: TimeVarying<DMatrix<f64>>,
    /// Observation matrices `C` (n_obs x n_state).
    pub observation_matrices: TimeVarying<DMatrix<f64>>,
    /// Observation offsets `d` (n_obs).
    pub observation_offsets: TimeVarying<DVector<f64>>,
    /// Observation covariance `R` (n_obs x n_obs).
    pub observation_covariance: TimeVarying<DMatrix<f64>>,
    /// Initial state mean `m0` (n_state).
    pub initial_state_mean: DVector<f64>,
    /// Initial state covariance `P0` (n_state x n_state).
    pub initial_state_covariance: DMatrix<f64>,
}

impl LinearGaussianParams {
    /// Time-invariant model with zero offsets; dimensions are validated.
    pub fn new(
        transition_matrix: DMatrix<f64>,
        transition_covariance: DMatrix<f64>,
        observation_matrix: DMatrix<f64>,
        observation_covariance: DMatrix<f64>,
        initial_state_mean: DVector<f64>,
        initial_state_covariance: DMatrix<f64>,
    ) -> Result<Self> {
        resolve(
            &StateSpaceParams::new()
                .with_transition_matrices(transition_matrix)
                .with_transition_covariance(transition_covariance)
                .with_observation_matrices(observation_matrix)
                .with_observation_covariance(observation_covariance)
                .with_initial_state_mean(initial_state_mean)
                .with_initial_state_covariance(initial_state_covariance),
        )
    }

    /// Local level model (random walk) with 1D state and 1D observations.
    ///
    /// State:
    /// `x_t = x_{t-1} + w_t`, `w_t ~ N(0, q)`
    ///
    /// Observation:
    /// `y_t = x_t + v_t`, `v_t ~ N(0, r)`
    pub fn local_level(q: f64, r: f64, m0: f64, p0: f64) -> Result<Self> {
        check_positive("q", q)?;
        check_positive("r", r)?;
        check_finite("m0", m0)?;
        check_positive("p0", p0)?;

        Self::new(
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::from_row_slice(1, 1, &[q]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::from_row_slice(1, 1, &[r]),
            DVector::from_row_slice(&[m0]),
            DMatrix::from_row_slice(1, 1, &[p0]),
        )
    }

    /// Local linear trend model (level + slope) with 2D state and 1D observations.
    ///
    /// `level_t = level_{t-1} + slope_{t-1} + w_level`, `slope_t = slope_{t-1} + w_slope`,
    /// `y_t = level_t + v_t`.
    pub fn local_linear_trend(
        q_level: f64,
        q_slope: f64,
        r: f64,
        level0: f64,
        slope0: f64,
        p0: f64,
    ) -> Result<Self> {
        check_positive("q_level", q_level)?;
        check_positive("q_slope", q_slope)?;
        check_positive("r", r)?;
        check_finite("level0", level0)?;
        check_finite("slope0", slope0)?;
        check_positive("p0", p0)?;

        Self::new(
            DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            DMatrix::from_row_slice(2, 2, &[q_level, 0.0, 0.0, q_slope]),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::from_row_slice(1, 1, &[r]),
            DVector::from_row_slice(&[level0, slope0]),
            DMatrix::identity(2, 2) * p0,
        )
    }

    /// AR(1) state with 1D observations.
    ///
    /// `x_t = phi * x_{t-1} + w_t`, `y_t = x_t + v_t`.
    pub fn ar1(phi: f64, q: f64, r: f64, m0: f64, p0: f64) -> Result<Self> {
        check_finite("phi", phi)?;
        check_positive("q", q)?;
        check_positive("r", r)?;
        check_finite("m0", m0)?;
        check_positive("p0", p0)?;

        Self::new(
            DMatrix::from_row_slice(1, 1, &[phi]),
            DMatrix::from_row_slice(1, 1, &[q]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::from_row_slice(1, 1, &[r]),
            DVector::from_row_slice(&[m0]),
            DMatrix::from_row_slice(1, 1, &[p0]),
        )
    }

    /// Number of latent state dimensions.
    pub fn n_dim_state(&self) -> usize {
        self.initial_state_mean.len()
    }

    /// Number of observation dimensions (0 if the observation offsets are empty).
    pub fn n_dim_obs(&self) -> usize {
        self.observation_offsets.first().map_or(0, |d| d.len())
    }

    /// Re-check every field: non-empty per-step sequences, consistent shapes and
    /// finite values.
    ///
    /// The fields are public, so callers that edit them can re-establish the
    /// invariants [`resolve`] gives.
    pub fn validate(&self) -> Result<()> {
        for (field, empty) in [
            ("transition_matrices", self.transition_matrices.is_empty()),
            ("transition_offsets", self.transition_offsets.is_empty()),
            ("transition_covariance", self.transition_covariance.is_empty()),
            ("observation_matrices", self.observation_matrices.is_empty()),
            ("observation_offsets", self.observation_offsets.is_empty()),
            ("observation_covariance", self.observation_covariance.is_empty()),
        ] {
            if empty {
                return Err(Error::Validation(format!("{field} has no timesteps")));
            }
        }

        let n = self.n_dim_state();
        let m = self.n_dim_obs();
        if n == 0 {
            return Err(Error::Validation("n_dim_state must be > 0".to_string()));
        }
        if m == 0 {
            return Err(Error::Validation("n_dim_obs must be > 0".to_string()));
        }

        check_matrices("transition_matrices", &self.transition_matrices, n, n)?;
        check_vectors("transition_offsets", &self.transition_offsets, n)?;
        check_matrices("transition_covariance", &self.transition_covariance, n, n)?;
        check_matrices("observation_matrices", &self.observation_matrices, m, n)?;
        check_vectors("observation_offsets", &self.observation_offsets, m)?;
        check_matrices("observation_covariance", &self.observation_covariance, m, m)?;
        if self.initial_state_mean.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("initial_state_mean must be finite".to_string()));
        }
        check_matrices(
            "initial_state_covariance",
            &TimeVarying::Static(self.initial_state_covariance.clone()),
            n,
            n,
        )
    }

    /// Parameters of the step that ends at timestep `t`.
    ///
    /// Transition parameters are taken at `t - 1` (the `t-1 -> t` transition) and
    /// observation parameters at `t`. For `t = 0` the transition slot holds the
    /// first transition, which the filter never applies.
    pub fn step_model(&self, t: usize) -> Result<StepModel<'_>> {
        let tt = t.saturating_sub(1);
        Ok(StepModel {
            transition_matrix: present("transition_matrices", self.transition_matrices.at(tt))?,
            transition_offset: present("transition_offsets", self.transition_offsets.at(tt))?,
            transition_covariance: present(
                "transition_covariance",
                self.transition_covariance.at(tt),
            )?,
            observation_matrix: present("observation_matrices", self.observation_matrices.at(t))?,
            observation_offset: present("observation_offsets", self.observation_offsets.at(t))?,
            observation_covariance: present(
                "observation_covariance",
                self.observation_covariance.at(t),
            )?,
        })
    }

    /// Step parameters built from the last value of every time-varying parameter.
    pub fn last_step_model(&self) -> Result<StepModel<'_>> {
        Ok(StepModel {
            transition_matrix: present("transition_matrices", self.transition_matrices.last())?,
            transition_offset: present("transition_offsets", self.transition_offsets.last())?,
            transition_covariance: present(
                "transition_covariance",
                self.transition_covariance.last(),
            )?,
            observation_matrix: present(
                "observation_matrices",
                self.observation_matrices.last(),
            )?,
            observation_offset: present("observation_offsets", self.observation_offsets.last())?,
            observation_covariance: present(
                "observation_covariance",
                self.observation_covariance.last(),
            )?,
        })
    }

    /// Check that per-step parameters cover a sequence of `n_timesteps`.
    ///
    /// Transition parameters need `n_timesteps - 1` entries, observation parameters
    /// `n_timesteps`.
    pub fn check_horizon(&self, n_timesteps: usize) -> Result<()> {
        let n_trans = n_timesteps.saturating_sub(1);
        let checks = [
            ("transition_matrices", self.transition_matrices.covers(n_trans), n_trans),
            ("transition_offsets", self.transition_offsets.covers(n_trans), n_trans),
            ("transition_covariance", self.transition_covariance.covers(n_trans), n_trans),
            ("observation_matrices", self.observation_matrices.covers(n_timesteps), n_timesteps),
            ("observation_offsets", self.observation_offsets.covers(n_timesteps), n_timesteps),
            (
                "observation_covariance",
                self.observation_covariance.covers(n_timesteps),
                n_timesteps,
            ),
        ];
        for (field, ok, needed) in checks {
            if !ok {
                return Err(Error::Validation(format!(
                    "{field} is time-varying but has fewer than {needed} entries"
                )));
            }
        }
        Ok(())
    }
}

/// Serialized form of [`LinearGaussianParams`], validated on the way in.
#[derive(Deserialize)]
struct RawParams {
    transition_matrices: TimeVarying<DMatrix<f64>>,
    transition_offsets: TimeVarying<DVector<f64>>,
    transition_covariance: TimeVarying<DMatrix<f64>>,
    observation_matrices: TimeVarying<DMatrix<f64>>,
    observation_offsets: TimeVarying<DVector<f64>>,
    observation_covariance: TimeVarying<DMatrix<f64>>,
    initial_state_mean: DVector<f64>,
    initial_state_covariance: DMatrix<f64>,
}

impl TryFrom<RawParams> for LinearGaussianParams {
    type Error = Error;

    fn try_from(raw: RawParams) -> Result<Self> {
        let params = LinearGaussianParams {
            transition_matrices: raw.transition_matrices,
            transition_offsets: raw.transition_offsets,
            transition_covariance: raw.transition_covariance,
            observation_matrices: raw.observation_matrices,
            observation_offsets: raw.observation_offsets,
            observation_covariance: raw.observation_covariance,
            initial_state_mean: raw.initial_state_mean,
            initial_state_covariance: raw.initial_state_covariance,
        };
        params.validate()?;
        Ok(params)
    }
}

fn present<'a, T>(field: &str, value: Option<&'a T>) -> Result<&'a T> {
    value.ok_or_else(|| Error::Validation(format!("{field} has no timesteps")))
}

fn check_positive(name: &str, v: f64) -> Result<()> {
    if !v.is_finite() || v <= 0.0 {
        return Err(Error::Validation(format!("{name} must be finite and > 0")));
    }
    Ok(())
}

fn check_finite(name: &str, v: f64) -> Result<()> {
    if !v.is_finite() {
        return Err(Error::Validation(format!("{name} must be finite")));
    }
    Ok(())
}

/// Running inference of one dimension: the first candidate wins, later ones must agree.
struct DimInference {
    value: Option<usize>,
}

impl DimInference {
    fn new() -> Self {
        Self { value: None }
    }

    fn observe(&mut self, field: &str, found: Option<usize>) -> Result<()> {
        let Some(found) = found else {
            return Ok(());
        };
        match self.value {
            None => self.value = Some(found),
            Some(expected) if expected != found => {
                return Err(Error::DimensionMismatch { field: field.to_string(), expected, found });
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn resolve(self, name: &str) -> Result<usize> {
        let n = self.value.unwrap_or(1);
        if n == 0 {
            return Err(Error::Validation(format!("{name} must be > 0")));
        }
        Ok(n)
    }
}

fn check_matrices(
    field: &str,
    tv: &TimeVarying<DMatrix<f64>>,
    rows: usize,
    cols: usize,
) -> Result<()> {
    for (t, m) in tv.iter().enumerate() {
        if m.nrows() != rows {
            return Err(Error::DimensionMismatch {
                field: format!("{field}[{t}] rows"),
                expected: rows,
                found: m.nrows(),
            });
        }
        if m.ncols() != cols {
            return Err(Error::DimensionMismatch {
                field: format!("{field}[{t}] columns"),
                expected: cols,
                found: m.ncols(),
            });
        }
        if m.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("{field}[{t}] must be finite")));
        }
    }
    Ok(())
}

fn check_vectors(field: &str, tv: &TimeVarying<DVector<f64>>, len: usize) -> Result<()> {
    for (t, v) in tv.iter().enumerate() {
        if v.len() != len {
            return Err(Error::DimensionMismatch {
                field: format!("{field}[{t}]"),
                expected: len,
                found: v.len(),
            });
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::Validation(format!("{field}[{t}] must be finite")));
        }
    }
    Ok(())
}

/// Resolve a partial specification into complete, validated parameters.
pub fn resolve(spec: &StateSpaceParams) -> Result<LinearGaussianParams> {
    let rows = |tv: &Option<TimeVarying<DMatrix<f64>>>| {
        tv.as_ref().and_then(|m| m.first()).map(|m| m.nrows())
    };
    let cols = |tv: &Option<TimeVarying<DMatrix<f64>>>| {
        tv.as_ref().and_then(|m| m.first()).map(|m| m.ncols())
    };
    let len = |tv: &Option<TimeVarying<DVector<f64>>>| {
        tv.as_ref().and_then(|v| v.first()).map(|v| v.len())
    };

    for (field, empty) in [
        ("transition_matrices", is_empty_seq(&spec.transition_matrices)),
        ("transition_offsets", is_empty_seq(&spec.transition_offsets)),
        ("transition_covariance", is_empty_seq(&spec.transition_covariance)),
        ("observation_matrices", is_empty_seq(&spec.observation_matrices)),
        ("observation_offsets", is_empty_seq(&spec.observation_offsets)),
        ("observation_covariance", is_empty_seq(&spec.observation_covariance)),
    ] {
        if empty {
            return Err(Error::Validation(format!("{field} has no timesteps")));
        }
    }

    let mut n_state = DimInference::new();
    n_state.observe("transition_matrices", rows(&spec.transition_matrices))?;
    n_state.observe("transition_offsets", len(&spec.transition_offsets))?;
    n_state.observe("transition_covariance", rows(&spec.transition_covariance))?;
    n_state.observe("initial_state_mean", spec.initial_state_mean.as_ref().map(|m| m.len()))?;
    n_state.observe(
        "initial_state_covariance",
        spec.initial_state_covariance.as_ref().map(|p| p.nrows()),
    )?;
    n_state.observe("observation_matrices", cols(&spec.observation_matrices))?;
    n_state.observe("n_dim_state", spec.n_dim_state)?;
    let n = n_state.resolve("n_dim_state")?;

    let mut n_obs = DimInference::new();
    n_obs.observe("observation_matrices", rows(&spec.observation_matrices))?;
    n_obs.observe("observation_offsets", len(&spec.observation_offsets))?;
    n_obs.observe("observation_covariance", rows(&spec.observation_covariance))?;
    n_obs.observe("n_dim_obs", spec.n_dim_obs)?;
    let m = n_obs.resolve("n_dim_obs")?;

    let transition_matrices = spec
        .transition_matrices
        .clone()
        .unwrap_or_else(|| TimeVarying::Static(DMatrix::identity(n, n)));
    let transition_offsets = spec
        .transition_offsets
        .clone()
        .unwrap_or_else(|| TimeVarying::Static(DVector::zeros(n)));
    let transition_covariance = spec
        .transition_covariance
        .clone()
        .unwrap_or_else(|| TimeVarying::Static(DMatrix::identity(n, n)));
    let observation_matrices = spec
        .observation_matrices
        .clone()
        .unwrap_or_else(|| TimeVarying::Static(DMatrix::identity(m, n)));
    let observation_offsets = spec
        .observation_offsets
        .clone()
        .unwrap_or_else(|| TimeVarying::Static(DVector::zeros(m)));
    let observation_covariance = spec
        .observation_covariance
        .clone()
        .unwrap_or_else(|| TimeVarying::Static(DMatrix::identity(m, m)));
    let initial_state_mean = spec.initial_state_mean.clone().unwrap_or_else(|| DVector::zeros(n));
    let initial_state_covariance =
        spec.initial_state_covariance.clone().unwrap_or_else(|| DMatrix::identity(n, n));

    // Per-step elements, column counts and finiteness.
    let params = LinearGaussianParams {
        transition_matrices,
        transition_offsets,
        transition_covariance,
        observation_matrices,
        observation_offsets,
        observation_covariance,
        initial_state_mean,
        initial_state_covariance,
    };
    params.validate()?;
    Ok(params)
}

fn is_empty_seq<T>(tv: &Option<TimeVarying<T>>) -> bool {
    tv.as_ref().is_some_and(TimeVarying::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_dims(n_state: usize, n_obs: usize, spec: StateSpaceParams) {
        let p = resolve(&spec).unwrap();
        assert_eq!(p.n_dim_state(), n_state);
        assert_eq!(p.n_dim_obs(), n_obs);

        let a = p.transition_matrices.first().unwrap();
        assert_eq!((a.nrows(), a.ncols()), (n_state, n_state));
        assert_eq!(p.transition_offsets.first().unwrap().len(), n_state);
        let q = p.transition_covariance.first().unwrap();
        assert_eq!((q.nrows(), q.ncols()), (n_state, n_state));
        let c = p.observation_matrices.first().unwrap();
        assert_eq!((c.nrows(), c.ncols()), (n_obs, n_state));
        assert_eq!(p.observation_offsets.first().unwrap().len(), n_obs);
        let r = p.observation_covariance.first().unwrap();
        assert_eq!((r.nrows(), r.ncols()), (n_obs, n_obs));
        assert_eq!(p.initial_state_mean.len(), n_state);
        assert_eq!(
            (p.initial_state_covariance.nrows(), p.initial_state_covariance.ncols()),
            (n_state, n_state)
        );
    }

    #[test]
    fn test_resolve_infers_dimensions_from_any_field() {
        check_dims(5, 1, StateSpaceParams::new().with_transition_matrices(DMatrix::<f64>::identity(5, 5)));
        check_dims(1, 3, StateSpaceParams::new().with_observation_offsets(DVector::<f64>::zeros(3)));
        check_dims(
            2,
            3,
            StateSpaceParams::new()
                .with_transition_covariance(DMatrix::<f64>::identity(2, 2))
                .with_observation_offsets(DVector::<f64>::zeros(3)),
        );
        check_dims(3, 2, StateSpaceParams::new().with_n_dim_state(3).with_n_dim_obs(2));
        check_dims(4, 1, StateSpaceParams::new().with_initial_state_mean(DVector::<f64>::zeros(4)));
        check_dims(1, 1, StateSpaceParams::new());
    }

    #[test]
    fn test_resolve_defaults() {
        let p = resolve(&StateSpaceParams::new().with_n_dim_state(2).with_n_dim_obs(3)).unwrap();
        assert_eq!(p.transition_matrices, TimeVarying::Static(DMatrix::<f64>::identity(2, 2)));
        assert_eq!(p.observation_matrices, TimeVarying::Static(DMatrix::<f64>::identity(3, 2)));
        assert_eq!(p.observation_offsets, TimeVarying::Static(DVector::<f64>::zeros(3)));
        assert_eq!(p.initial_state_covariance, DMatrix::identity(2, 2));
    }

    #[test]
    fn test_resolve_observation_matrix_fixes_state_dim() {
        let spec = StateSpaceParams::new().with_observation_matrices(DMatrix::<f64>::zeros(2, 4));
        let p = resolve(&spec).unwrap();
        assert_eq!(p.n_dim_state(), 4);
        assert_eq!(p.n_dim_obs(), 2);
    }

    #[test]
    fn test_resolve_time_varying_uses_element_shape() {
        let a: Vec<DMatrix<f64>> = (0..4).map(|_| DMatrix::identity(3, 3)).collect();
        let p = resolve(&StateSpaceParams::new().with_transition_matrices(a)).unwrap();
        assert_eq!(p.n_dim_state(), 3);
        assert!(p.transition_matrices.is_time_varying());
        assert!(p.transition_matrices.covers(4));
        assert!(!p.transition_matrices.covers(5));
        assert!(p.check_horizon(5).is_ok());
        assert!(p.check_horizon(6).is_err());
    }

    #[test]
    fn test_resolve_conflicting_dims_fail() {
        let spec = StateSpaceParams::new()
            .with_transition_matrices(DMatrix::<f64>::identity(2, 2))
            .with_initial_state_mean(DVector::<f64>::zeros(3));
        let err = resolve(&spec).unwrap_err();
        assert_eq!(
            err,
            Error::DimensionMismatch { field: "initial_state_mean".into(), expected: 2, found: 3 }
        );

        let spec = StateSpaceParams::new()
            .with_observation_offsets(DVector::<f64>::zeros(2))
            .with_n_dim_obs(3);
        assert!(matches!(resolve(&spec), Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_resolve_rejects_bad_shapes() {
        // Non-square transition matrix.
        let spec = StateSpaceParams::new().with_transition_matrices(DMatrix::<f64>::zeros(2, 3));
        assert!(matches!(resolve(&spec), Err(Error::DimensionMismatch { .. })));

        // Per-step sequence with inconsistent element shapes.
        let spec = StateSpaceParams::new()
            .with_transition_offsets(vec![DVector::<f64>::zeros(2), DVector::<f64>::zeros(3)]);
        assert!(matches!(resolve(&spec), Err(Error::DimensionMismatch { .. })));

        let spec = StateSpaceParams::new().with_transition_offsets(Vec::<DVector<f64>>::new());
        assert!(matches!(resolve(&spec), Err(Error::Validation(_))));

        let spec = StateSpaceParams::new().with_n_dim_state(0);
        assert!(matches!(resolve(&spec), Err(Error::Validation(_))));

        let spec = StateSpaceParams::new()
            .with_observation_covariance(DMatrix::from_row_slice(1, 1, &[f64::NAN]));
        assert!(matches!(resolve(&spec), Err(Error::Validation(_))));
    }

    #[test]
    fn test_step_model_indexes_transition_at_previous_step() {
        let a: Vec<DMatrix<f64>> =
            (0..3).map(|i| DMatrix::from_row_slice(1, 1, &[i as f64])).collect();
        let c: Vec<DMatrix<f64>> =
            (0..4).map(|i| DMatrix::from_row_slice(1, 1, &[10.0 + i as f64])).collect();
        let p = resolve(
            &StateSpaceParams::new().with_transition_matrices(a).with_observation_matrices(c),
        )
        .unwrap();

        let s = p.step_model(2).unwrap();
        assert_eq!(s.transition_matrix[(0, 0)], 1.0);
        assert_eq!(s.observation_matrix[(0, 0)], 12.0);

        let s = p.last_step_model().unwrap();
        assert_eq!(s.transition_matrix[(0, 0)], 2.0);
        assert_eq!(s.observation_matrix[(0, 0)], 13.0);
    }

    #[test]
    fn test_empty_sequences_and_edited_fields() {
        let tv: TimeVarying<DVector<f64>> = TimeVarying::PerStep(Vec::new());
        assert!(tv.is_empty());
        assert!(tv.at(3).is_none());
        assert!(tv.last().is_none());

        let mut p = LinearGaussianParams::local_level(0.1, 0.2, 0.0, 1.0).unwrap();
        assert!(p.validate().is_ok());

        p.transition_offsets = TimeVarying::PerStep(Vec::new());
        assert!(matches!(p.validate(), Err(Error::Validation(_))));
        assert!(matches!(p.step_model(1), Err(Error::Validation(_))));
        assert!(matches!(p.last_step_model(), Err(Error::Validation(_))));

        p.transition_offsets = TimeVarying::PerStep(vec![DVector::<f64>::zeros(2)]);
        assert!(matches!(p.validate(), Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_builders_validate_inputs() {
        assert_eq!(LinearGaussianParams::local_level(0.1, 0.2, 0.0, 1.0).unwrap().n_dim_state(), 1);
        assert_eq!(
            LinearGaussianParams::local_linear_trend(0.1, 0.01, 0.2, 0.0, 0.0, 1.0)
                .unwrap()
                .n_dim_state(),
            2
        );
        assert!(LinearGaussianParams::ar1(0.9, -1.0, 0.2, 0.0, 1.0).is_err());
        assert!(LinearGaussianParams::local_level(0.1, 0.2, f64::NAN, 1.0).is_err());
    }
}
