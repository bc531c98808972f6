//! Stochastic subspace identification.
//!
//! A non-iterative estimator: project the "future" block-Hankel matrix of
//! the centered observations onto the "past" one, extract the dominant
//! subspace by SVD, and recover `(A, C, Q, R, mu0, Sigma0)` from the
//! implied state sequence by least squares. Typically used to initialize
//! a model that EM then refines.

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

use crate::internal::{solve_spd, symmetrize};
use crate::params::{ParameterSet, ParametersToEstimate};

/// Subspace identification configuration.
#[derive(Debug, Clone)]
pub struct SsiOptions {
    /// Number of block rows (lags) in the Hankel matrices. Must be >= 1.
    pub max_lag: usize,
    /// Relative singular-value threshold for the effective model order,
    /// in `[0, 1)`.
    pub threshold: f64,
    /// Cap on the selected state dimension; `None` lets the threshold
    /// decide alone.
    pub target_states: Option<usize>,
    /// Which parameter blocks to populate in the result.
    pub estimate: ParametersToEstimate,
}

impl Default for SsiOptions {
    fn default() -> Self {
        Self {
            max_lag: 20,
            threshold: 0.01,
            target_states: None,
            estimate: ParametersToEstimate::default(),
        }
    }
}

/// Subspace identification output.
#[derive(Debug, Clone)]
pub struct SsiResult {
    /// Estimated parameters; only mask-enabled blocks are populated.
    pub parameters: ParameterSet,
    /// Selected state dimension.
    pub effective_states: usize,
    /// Full singular-value spectrum of the projection, descending.
    pub singular_values: DVector<f64>,
}

/// Identify a state-space model from a `[T, n_obs]` observation batch.
///
/// Fails with a validation error before any matrix work when
/// `T <= 2 * max_lag`.
pub fn subspace_identify(observations: &DMatrix<f64>, options: &SsiOptions) -> Result<SsiResult> {
    if options.max_lag == 0 {
        return Err(Error::Validation(
            "max_lag must be greater than zero".to_string(),
        ));
    }
    if !options.threshold.is_finite() || options.threshold < 0.0 || options.threshold >= 1.0 {
        return Err(Error::Validation(
            "threshold must be in [0, 1)".to_string(),
        ));
    }
    if options.target_states == Some(0) {
        return Err(Error::Validation(
            "target_states must be greater than zero".to_string(),
        ));
    }

    let t_max = observations.nrows();
    let m = observations.ncols();
    if m == 0 {
        return Err(Error::Validation(
            "observations must have at least one column".to_string(),
        ));
    }
    if observations.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation(
            "observations must be finite".to_string(),
        ));
    }

    let lag = options.max_lag;
    if t_max <= 2 * lag {
        return Err(Error::Validation(format!(
            "number of time steps ({t_max}) must exceed 2 * max_lag ({})",
            2 * lag
        )));
    }
    let num_cols = t_max - 2 * lag + 1;

    // Center observations by their time means.
    let time_means = observations.row_mean();
    let mut centered = observations.clone();
    for j in 0..m {
        for t in 0..t_max {
            centered[(t, j)] -= time_means[j];
        }
    }

    // Block-Hankel past/future matrices, (lag * n_obs) x num_cols.
    let block_rows = lag * m;
    let mut past = DMatrix::<f64>::zeros(block_rows, num_cols);
    let mut future = DMatrix::<f64>::zeros(block_rows, num_cols);
    for i in 0..lag {
        for k in 0..m {
            let row = i * m + k;
            for j in 0..num_cols {
                past[(row, j)] = centered[(i + j, k)];
                future[(row, j)] = centered[(lag + i + j, k)];
            }
        }
    }

    // Oblique projection of the future onto the past:
    // proj = (future past^T)(past past^T)^{-1} past
    let pp = &past * past.transpose();
    let fp = &future * past.transpose();
    let projection = solve_spd(&pp, &fp.transpose())?.transpose() * &past;

    let svd = projection.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| Error::Computation("SVD of the projection failed".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::Computation("SVD of the projection failed".to_string()))?;
    let singular_values = svd.singular_values;

    // Effective model order from the relative singular-value spectrum.
    let leading = singular_values[0];
    let rank = singular_values
        .iter()
        .filter(|&&s| s > options.threshold * leading)
        .count();
    let effective_states = options.target_states.unwrap_or(rank).min(rank).max(1);

    let u_r = u.columns(0, effective_states).into_owned();
    let s_sqrt = DMatrix::from_diagonal(
        &singular_values
            .rows(0, effective_states)
            .map(|s| s.sqrt()),
    );
    let v_rt = v_t.rows(0, effective_states).into_owned();

    // Observability matrix; its first block row is the measurement function.
    let observability = &u_r * &s_sqrt;
    let measurement = observability.rows(0, m).into_owned();

    // Implied state sequence, n_eff x num_cols.
    let states = &s_sqrt * &v_rt;

    // Transition by least squares of the shifted states.
    let states_shifted = states.columns(0, num_cols - 1).into_owned();
    let states_next = states.columns(1, num_cols - 1).into_owned();
    let ss = &states_shifted * states_shifted.transpose();
    let ns = &states_next * states_shifted.transpose();
    let transition = solve_spd(&ss, &ns.transpose())?.transpose();

    // Noise covariances from the regression residuals.
    let state_residuals = &states_next - &transition * &states_shifted;
    let process_noise = symmetrize(
        &(&state_residuals * state_residuals.transpose() / (num_cols as f64 - 1.0)),
    );

    let observation_window = centered.rows(lag, num_cols).transpose();
    let observation_residuals = observation_window - &measurement * &states;
    let measurement_noise = symmetrize(
        &(&observation_residuals * observation_residuals.transpose() / num_cols as f64),
    );

    let initial_mean = states.column(0).into_owned();
    let initial_covariance = symmetrize(&(&states * states.transpose() / num_cols as f64));

    let mask = &options.estimate;
    let parameters = ParameterSet {
        transition: mask.transition.then_some(transition),
        measurement: mask.measurement.then_some(measurement),
        process_noise: mask.process_noise.then_some(process_noise),
        measurement_noise: mask.measurement_noise.then_some(measurement_noise),
        initial_mean: mask.initial_mean.then_some(initial_mean),
        initial_covariance: mask.initial_covariance.then_some(initial_covariance),
        state_offset: None,
        observation_offset: None,
    };

    Ok(SsiResult {
        parameters,
        effective_states,
        singular_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{KalmanParams, Offsets};
    use crate::simulate::simulate;

    #[test]
    fn test_rejects_insufficient_data() {
        let observations = DMatrix::<f64>::zeros(40, 1);
        let options = SsiOptions {
            max_lag: 20,
            ..Default::default()
        };
        // T == 2 * max_lag is still insufficient.
        assert!(subspace_identify(&observations, &options).is_err());
    }

    #[test]
    fn test_rejects_bad_config() {
        let observations = DMatrix::<f64>::zeros(100, 1);
        assert!(subspace_identify(
            &observations,
            &SsiOptions {
                max_lag: 0,
                ..Default::default()
            }
        )
        .is_err());
        assert!(subspace_identify(
            &observations,
            &SsiOptions {
                threshold: 1.0,
                ..Default::default()
            }
        )
        .is_err());
        assert!(subspace_identify(
            &observations,
            &SsiOptions {
                target_states: Some(0),
                ..Default::default()
            }
        )
        .is_err());
    }

    #[test]
    fn test_singular_values_are_descending() {
        let truth = KalmanParams::new(
            DMatrix::from_row_slice(1, 1, &[0.9]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::from_row_slice(1, 1, &[0.05]),
            DMatrix::from_row_slice(1, 1, &[0.1]),
            DVector::from_row_slice(&[0.0]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            Offsets::None,
        )
        .unwrap();
        let sim = simulate(&truth, 300, 7).unwrap();
        let result = subspace_identify(
            &sim.observation_matrix(),
            &SsiOptions {
                max_lag: 6,
                ..Default::default()
            },
        )
        .unwrap();

        for i in 1..result.singular_values.len() {
            assert!(result.singular_values[i] <= result.singular_values[i - 1]);
        }
    }

    #[test]
    fn test_recovers_scalar_ar1_transition() {
        let a_true = 0.9;
        let truth = KalmanParams::new(
            DMatrix::from_row_slice(1, 1, &[a_true]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::from_row_slice(1, 1, &[0.05]),
            DMatrix::from_row_slice(1, 1, &[0.05]),
            DVector::from_row_slice(&[0.0]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            Offsets::None,
        )
        .unwrap();
        let sim = simulate(&truth, 1000, 42).unwrap();

        let result = subspace_identify(
            &sim.observation_matrix(),
            &SsiOptions {
                max_lag: 8,
                threshold: 1e-8,
                target_states: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(result.effective_states, 1);
        let a_hat = result.parameters.transition.as_ref().unwrap()[(0, 0)];
        assert!(
            (a_hat - a_true).abs() <= 0.1,
            "a_hat={a_hat} a_true={a_true}"
        );
        // A scalar AR(1) driven by nontrivial noise is fully excited, so
        // every estimated variance must be positive.
        assert!(result.parameters.process_noise.as_ref().unwrap()[(0, 0)] > 0.0);
        assert!(result.parameters.measurement_noise.as_ref().unwrap()[(0, 0)] > 0.0);
    }

    #[test]
    fn test_mask_limits_populated_blocks() {
        let truth = KalmanParams::isotropic(1, 1, 0.1, 0.1).unwrap();
        let sim = simulate(&truth, 200, 3).unwrap();

        let mut estimate = ParametersToEstimate::none();
        estimate.transition = true;
        let result = subspace_identify(
            &sim.observation_matrix(),
            &SsiOptions {
                max_lag: 5,
                estimate,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(result.parameters.transition.is_some());
        assert!(result.parameters.measurement.is_none());
        assert!(result.parameters.process_noise.is_none());
        assert!(result.parameters.initial_mean.is_none());
    }
}
