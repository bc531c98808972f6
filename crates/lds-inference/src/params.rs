//! Model parameters for time-invariant linear-Gaussian state-space models.
//!
//! Two representations exist:
//! - [`ParameterSet`]: a partial, unvalidated collection of parameter
//!   blocks. This is what subspace identification returns, what the
//!   persistence layer loads, and what parameter updates are expressed in.
//!   Any block may be absent.
//! - [`KalmanParams`]: a complete, validated model. Constructing one
//!   performs all shape and finiteness checks exactly once; every
//!   `KalmanParams` in existence has passed validation.
//!
//! Offsets are a tagged variant rather than a pair of nullable vectors, so
//! the filter/EM formulas select their offset-aware forms by matching on
//! [`Offsets`] instead of repeating runtime null tests.

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

/// Optional state/observation offsets `(b, d)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Offsets {
    /// No offsets modeled; both offset terms are identically zero.
    None,
    /// Offsets modeled.
    Provided {
        /// State offset `b` (length `n_state`).
        state: DVector<f64>,
        /// Observation offset `d` (length `n_obs`).
        observation: DVector<f64>,
    },
}

impl Offsets {
    /// Whether offsets are modeled.
    pub fn provided(&self) -> bool {
        matches!(self, Offsets::Provided { .. })
    }
}

/// Validated parameters of a linear-Gaussian state-space model.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanParams {
    /// State transition matrix `A` (`n_state x n_state`).
    pub transition: DMatrix<f64>,
    /// Measurement function `C` (`n_obs x n_state`).
    pub measurement: DMatrix<f64>,
    /// Process noise covariance `Q` (`n_state x n_state`).
    pub process_noise: DMatrix<f64>,
    /// Measurement noise covariance `R` (`n_obs x n_obs`).
    pub measurement_noise: DMatrix<f64>,
    /// Initial state mean `mu0` (`n_state`).
    pub initial_mean: DVector<f64>,
    /// Initial state covariance `Sigma0` (`n_state x n_state`).
    pub initial_covariance: DMatrix<f64>,
    /// Optional offsets `(b, d)`.
    pub offsets: Offsets,
}

impl KalmanParams {
    /// Create a new model and validate all shapes and entries.
    pub fn new(
        transition: DMatrix<f64>,
        measurement: DMatrix<f64>,
        process_noise: DMatrix<f64>,
        measurement_noise: DMatrix<f64>,
        initial_mean: DVector<f64>,
        initial_covariance: DMatrix<f64>,
        offsets: Offsets,
    ) -> Result<Self> {
        let n = transition.nrows();
        if n == 0 || transition.ncols() != n {
            return Err(Error::Validation(
                "transition matrix must be square with n_state > 0".to_string(),
            ));
        }
        let m = measurement.nrows();
        if m == 0 || measurement.ncols() != n {
            return Err(Error::Validation(
                "measurement function must be n_obs x n_state with n_obs > 0".to_string(),
            ));
        }
        if process_noise.nrows() != n || process_noise.ncols() != n {
            return Err(Error::Validation(
                "process noise covariance must be n_state x n_state".to_string(),
            ));
        }
        if measurement_noise.nrows() != m || measurement_noise.ncols() != m {
            return Err(Error::Validation(
                "measurement noise covariance must be n_obs x n_obs".to_string(),
            ));
        }
        if initial_mean.len() != n {
            return Err(Error::Validation(
                "initial mean must have length n_state".to_string(),
            ));
        }
        if initial_covariance.nrows() != n || initial_covariance.ncols() != n {
            return Err(Error::Validation(
                "initial covariance must be n_state x n_state".to_string(),
            ));
        }
        if let Offsets::Provided { state, observation } = &offsets {
            if state.len() != n {
                return Err(Error::Validation(
                    "state offset must have length n_state".to_string(),
                ));
            }
            if observation.len() != m {
                return Err(Error::Validation(
                    "observation offset must have length n_obs".to_string(),
                ));
            }
        }

        let offsets_finite = match &offsets {
            Offsets::None => true,
            Offsets::Provided { state, observation } => {
                state.iter().all(|v| v.is_finite()) && observation.iter().all(|v| v.is_finite())
            }
        };
        if transition.iter().any(|v| !v.is_finite())
            || measurement.iter().any(|v| !v.is_finite())
            || process_noise.iter().any(|v| !v.is_finite())
            || measurement_noise.iter().any(|v| !v.is_finite())
            || initial_mean.iter().any(|v| !v.is_finite())
            || initial_covariance.iter().any(|v| !v.is_finite())
            || !offsets_finite
        {
            return Err(Error::Validation(
                "model matrices/vectors must be finite".to_string(),
            ));
        }

        Ok(Self {
            transition,
            measurement,
            process_noise,
            measurement_noise,
            initial_mean,
            initial_covariance,
            offsets,
        })
    }

    /// Fully-defaulted model: `A = I`, `C = eye(n_obs, n_state)`,
    /// `Q = q * I`, `R = r * I`, `mu0 = 0`, `Sigma0 = I`, no offsets.
    pub fn isotropic(
        num_states: usize,
        num_observations: usize,
        process_noise_variance: f64,
        measurement_noise_variance: f64,
    ) -> Result<Self> {
        if num_states == 0 {
            return Err(Error::Validation(
                "number of states must be greater than zero".to_string(),
            ));
        }
        if num_observations == 0 {
            return Err(Error::Validation(
                "number of observations must be greater than zero".to_string(),
            ));
        }
        if !process_noise_variance.is_finite() || process_noise_variance <= 0.0 {
            return Err(Error::Validation(
                "process noise variance must be finite and > 0".to_string(),
            ));
        }
        if !measurement_noise_variance.is_finite() || measurement_noise_variance <= 0.0 {
            return Err(Error::Validation(
                "measurement noise variance must be finite and > 0".to_string(),
            ));
        }

        KalmanParams::new(
            DMatrix::identity(num_states, num_states),
            DMatrix::identity(num_observations, num_states),
            DMatrix::identity(num_states, num_states) * process_noise_variance,
            DMatrix::identity(num_observations, num_observations) * measurement_noise_variance,
            DVector::zeros(num_states),
            DMatrix::identity(num_states, num_states),
            Offsets::None,
        )
    }

    /// Number of latent state dimensions.
    pub fn num_states(&self) -> usize {
        self.transition.nrows()
    }

    /// Number of observation dimensions.
    pub fn num_observations(&self) -> usize {
        self.measurement.nrows()
    }

    /// The state offset `b`, when offsets are modeled.
    pub fn state_offset(&self) -> Option<&DVector<f64>> {
        match &self.offsets {
            Offsets::None => None,
            Offsets::Provided { state, .. } => Some(state),
        }
    }

    /// The observation offset `d`, when offsets are modeled.
    pub fn observation_offset(&self) -> Option<&DVector<f64>> {
        match &self.offsets {
            Offsets::None => None,
            Offsets::Provided { observation, .. } => Some(observation),
        }
    }

    /// Build a new model with the provided blocks replacing the current
    /// ones; absent blocks keep their current values. Re-validates.
    pub fn with_updates(&self, set: &ParameterSet) -> Result<KalmanParams> {
        let mut merged = ParameterSet::from(self);
        merged.overlay(set);
        merged.build()
    }
}

/// Which parameter blocks an estimator is allowed to overwrite.
///
/// All flags default to `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParametersToEstimate {
    /// The state transition matrix.
    pub transition: bool,
    /// The measurement function.
    pub measurement: bool,
    /// The process noise covariance.
    pub process_noise: bool,
    /// The measurement noise covariance.
    pub measurement_noise: bool,
    /// The initial mean.
    pub initial_mean: bool,
    /// The initial covariance.
    pub initial_covariance: bool,
    /// The state offset (only meaningful when offsets are modeled).
    pub state_offset: bool,
    /// The observation offset (only meaningful when offsets are modeled).
    pub observation_offset: bool,
}

impl Default for ParametersToEstimate {
    fn default() -> Self {
        Self {
            transition: true,
            measurement: true,
            process_noise: true,
            measurement_noise: true,
            initial_mean: true,
            initial_covariance: true,
            state_offset: true,
            observation_offset: true,
        }
    }
}

impl ParametersToEstimate {
    /// A mask with every flag cleared; nothing gets overwritten.
    pub fn none() -> Self {
        Self {
            transition: false,
            measurement: false,
            process_noise: false,
            measurement_noise: false,
            initial_mean: false,
            initial_covariance: false,
            state_offset: false,
            observation_offset: false,
        }
    }
}

/// A partial, unvalidated set of parameter blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    /// State transition matrix `A`.
    pub transition: Option<DMatrix<f64>>,
    /// Measurement function `C`.
    pub measurement: Option<DMatrix<f64>>,
    /// Process noise covariance `Q`.
    pub process_noise: Option<DMatrix<f64>>,
    /// Measurement noise covariance `R`.
    pub measurement_noise: Option<DMatrix<f64>>,
    /// Initial state mean `mu0`.
    pub initial_mean: Option<DVector<f64>>,
    /// Initial state covariance `Sigma0`.
    pub initial_covariance: Option<DMatrix<f64>>,
    /// State offset `b`.
    pub state_offset: Option<DVector<f64>>,
    /// Observation offset `d`.
    pub observation_offset: Option<DVector<f64>>,
}

impl ParameterSet {
    /// Infer the state dimension from whichever state-sized block is present.
    ///
    /// Tries `A`, `C`, `mu0`, `Sigma0`, `Q`, `b`, in that order.
    pub fn infer_num_states(&self) -> Option<usize> {
        if let Some(a) = &self.transition {
            return Some(a.nrows());
        }
        if let Some(c) = &self.measurement {
            return Some(c.ncols());
        }
        if let Some(m0) = &self.initial_mean {
            return Some(m0.len());
        }
        if let Some(p0) = &self.initial_covariance {
            return Some(p0.nrows());
        }
        if let Some(q) = &self.process_noise {
            return Some(q.nrows());
        }
        if let Some(b) = &self.state_offset {
            return Some(b.len());
        }
        None
    }

    /// Infer the observation dimension from whichever observation-sized
    /// block is present. Tries `C`, `R`, `d`, in that order.
    pub fn infer_num_observations(&self) -> Option<usize> {
        if let Some(c) = &self.measurement {
            return Some(c.nrows());
        }
        if let Some(r) = &self.measurement_noise {
            return Some(r.nrows());
        }
        if let Some(d) = &self.observation_offset {
            return Some(d.len());
        }
        None
    }

    /// Replace this set's blocks with `other`'s wherever `other` has one.
    pub fn overlay(&mut self, other: &ParameterSet) {
        if let Some(v) = &other.transition {
            self.transition = Some(v.clone());
        }
        if let Some(v) = &other.measurement {
            self.measurement = Some(v.clone());
        }
        if let Some(v) = &other.process_noise {
            self.process_noise = Some(v.clone());
        }
        if let Some(v) = &other.measurement_noise {
            self.measurement_noise = Some(v.clone());
        }
        if let Some(v) = &other.initial_mean {
            self.initial_mean = Some(v.clone());
        }
        if let Some(v) = &other.initial_covariance {
            self.initial_covariance = Some(v.clone());
        }
        if let Some(v) = &other.state_offset {
            self.state_offset = Some(v.clone());
        }
        if let Some(v) = &other.observation_offset {
            self.observation_offset = Some(v.clone());
        }
    }

    /// Build a validated model, inferring both dimensions from the
    /// populated blocks.
    pub fn build(self) -> Result<KalmanParams> {
        let num_states = self.infer_num_states().ok_or_else(|| {
            Error::Validation(
                "cannot infer the number of states: no state-sized block provided".to_string(),
            )
        })?;
        let num_observations = self.infer_num_observations().ok_or_else(|| {
            Error::Validation(
                "cannot infer the number of observations: no observation-sized block provided"
                    .to_string(),
            )
        })?;
        self.build_with_dims(num_states, num_observations)
    }

    /// Build a validated model with explicit dimensions, defaulting any
    /// absent block (`A = I`, `C = eye`, `Q = I`, `R = I`, `mu0 = 0`,
    /// `Sigma0 = I`). If exactly one offset vector is present, the other
    /// defaults to zeros and offsets count as modeled.
    pub fn build_with_dims(self, num_states: usize, num_observations: usize) -> Result<KalmanParams> {
        if num_states == 0 {
            return Err(Error::Validation(
                "number of states must be greater than zero".to_string(),
            ));
        }
        if num_observations == 0 {
            return Err(Error::Validation(
                "number of observations must be greater than zero".to_string(),
            ));
        }

        let offsets = match (self.state_offset, self.observation_offset) {
            (None, None) => Offsets::None,
            (state, observation) => Offsets::Provided {
                state: state.unwrap_or_else(|| DVector::zeros(num_states)),
                observation: observation.unwrap_or_else(|| DVector::zeros(num_observations)),
            },
        };

        let params = KalmanParams::new(
            self.transition
                .unwrap_or_else(|| DMatrix::identity(num_states, num_states)),
            self.measurement
                .unwrap_or_else(|| DMatrix::identity(num_observations, num_states)),
            self.process_noise
                .unwrap_or_else(|| DMatrix::identity(num_states, num_states)),
            self.measurement_noise
                .unwrap_or_else(|| DMatrix::identity(num_observations, num_observations)),
            self.initial_mean
                .unwrap_or_else(|| DVector::zeros(num_states)),
            self.initial_covariance
                .unwrap_or_else(|| DMatrix::identity(num_states, num_states)),
            offsets,
        )?;

        if params.num_states() != num_states {
            return Err(Error::Validation(format!(
                "parameter blocks imply {} states, expected {}",
                params.num_states(),
                num_states
            )));
        }
        if params.num_observations() != num_observations {
            return Err(Error::Validation(format!(
                "parameter blocks imply {} observations, expected {}",
                params.num_observations(),
                num_observations
            )));
        }
        Ok(params)
    }
}

impl From<&KalmanParams> for ParameterSet {
    fn from(params: &KalmanParams) -> Self {
        ParameterSet {
            transition: Some(params.transition.clone()),
            measurement: Some(params.measurement.clone()),
            process_noise: Some(params.process_noise.clone()),
            measurement_noise: Some(params.measurement_noise.clone()),
            initial_mean: Some(params.initial_mean.clone()),
            initial_covariance: Some(params.initial_covariance.clone()),
            state_offset: params.state_offset().cloned(),
            observation_offset: params.observation_offset().cloned(),
        }
    }
}
