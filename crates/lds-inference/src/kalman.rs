//! Linear-Gaussian Kalman filtering.
//!
//! One-step [`predict`]/[`update`] contracts, a streaming [`KalmanFilter`]
//! that carries its belief across calls, and the batch [`filter_batch`]
//! used by EM and subspace identification.
//!
//! Observation batches are `[T, n_obs]` matrices, one row per time step. A
//! row whose entries are all NaN marks a missing observation: the update
//! is skipped and the predicted belief is passed through unchanged, which
//! also serves as a forecasting step.

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

use crate::forecast::{forecast_from_belief, ForecastResult};
use crate::internal::{log_det_cholesky, symmetrize};
use crate::params::{KalmanParams, Offsets, ParameterSet};
use crate::smoother::{rts_smooth, SmoothedTrajectory};

/// Gaussian state estimate at one time index.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianBelief {
    /// State mean (`n_state`).
    pub mean: DVector<f64>,
    /// State covariance (`n_state x n_state`).
    pub covariance: DMatrix<f64>,
}

impl GaussianBelief {
    /// The model's initial prior `(mu0, Sigma0)`.
    pub fn initial(params: &KalmanParams) -> Self {
        Self {
            mean: params.initial_mean.clone(),
            covariance: params.initial_covariance.clone(),
        }
    }
}

/// One filtered time step.
///
/// The diagnostic fields are `None` on missing-observation steps.
#[derive(Debug, Clone)]
pub struct FilteredStep {
    /// Predicted (prior) belief for this step.
    pub predicted: GaussianBelief,
    /// Updated (posterior) belief for this step.
    pub updated: GaussianBelief,
    /// Innovation `y - (C mean' + d)`.
    pub innovation: Option<DVector<f64>>,
    /// Innovation covariance `S = C P' C^T + R`, symmetrized.
    pub innovation_covariance: Option<DMatrix<f64>>,
    /// Kalman gain `K = P' C^T S^{-1}`.
    pub gain: Option<DMatrix<f64>>,
    /// Per-step log-likelihood term `-(log|S| + v^T S^{-1} v)`.
    pub loglik_term: Option<f64>,
}

/// One-step prediction: `mean' = A mean + b`, `P' = A P A^T + Q`.
pub fn predict(belief: &GaussianBelief, params: &KalmanParams) -> GaussianBelief {
    let a = &params.transition;
    let mut mean = a * &belief.mean;
    if let Offsets::Provided { state, .. } = &params.offsets {
        mean += state;
    }
    let covariance = a * &belief.covariance * a.transpose() + &params.process_noise;
    GaussianBelief { mean, covariance }
}

/// One-step measurement update.
///
/// With no observation the predicted belief passes through unchanged and
/// every diagnostic field is `None`. Fails with a computation error when
/// the innovation covariance is not positive-definite (degenerate model).
pub fn update(
    observation: Option<&DVector<f64>>,
    predicted: &GaussianBelief,
    params: &KalmanParams,
) -> Result<FilteredStep> {
    let Some(observation) = observation else {
        return Ok(FilteredStep {
            predicted: predicted.clone(),
            updated: predicted.clone(),
            innovation: None,
            innovation_covariance: None,
            gain: None,
            loglik_term: None,
        });
    };

    let c = &params.measurement;
    if observation.len() != params.num_observations() {
        return Err(Error::Validation(format!(
            "observation has length {}, model expects {}",
            observation.len(),
            params.num_observations()
        )));
    }

    // Innovation: v = y - (C mean' + d)
    let mut predicted_observation = c * &predicted.mean;
    if let Offsets::Provided { observation: d, .. } = &params.offsets {
        predicted_observation += d;
    }
    let innovation = observation - predicted_observation;

    // Innovation covariance: S = C P' C^T + R
    let innovation_covariance =
        symmetrize(&(c * &predicted.covariance * c.transpose() + &params.measurement_noise));

    let chol = innovation_covariance.clone().cholesky().ok_or_else(|| {
        Error::Computation("Kalman update failed: innovation covariance not SPD".to_string())
    })?;

    // Kalman gain: K = P' C^T S^{-1}
    let pc_t = &predicted.covariance * c.transpose();
    let gain = chol.solve(&pc_t.transpose()).transpose();

    // Log-likelihood term: -(log|S| + v^T S^{-1} v)
    let s_inv_v = chol.solve(&innovation);
    let loglik_term = -(log_det_cholesky(&chol)? + innovation.dot(&s_inv_v));

    let updated_mean = &predicted.mean + &gain * &innovation;
    // Standard-form covariance update; not re-symmetrized.
    let updated_covariance = &predicted.covariance - &gain * c * &predicted.covariance;

    Ok(FilteredStep {
        predicted: predicted.clone(),
        updated: GaussianBelief {
            mean: updated_mean,
            covariance: updated_covariance,
        },
        innovation: Some(innovation),
        innovation_covariance: Some(innovation_covariance),
        gain: Some(gain),
        loglik_term: Some(loglik_term),
    })
}

/// Batch filter output: per-step predicted/updated beliefs plus the
/// diagnostics consumed by the smoother and EM.
#[derive(Debug, Clone)]
pub struct FilteredTrajectory {
    /// Prior means `m_{t|t-1}`.
    pub predicted_means: Vec<DVector<f64>>,
    /// Prior covariances `P_{t|t-1}`.
    pub predicted_covs: Vec<DMatrix<f64>>,
    /// Posterior means `m_{t|t}`.
    pub updated_means: Vec<DVector<f64>>,
    /// Posterior covariances `P_{t|t}`.
    pub updated_covs: Vec<DMatrix<f64>>,
    /// Innovations (`None` on missing steps).
    pub innovations: Vec<Option<DVector<f64>>>,
    /// Innovation covariances (`None` on missing steps).
    pub innovation_covs: Vec<Option<DMatrix<f64>>>,
    /// Kalman gains (`None` on missing steps).
    pub gains: Vec<Option<DMatrix<f64>>>,
    /// Per-step log-likelihood terms (0.0 on missing steps).
    pub loglik_terms: Vec<f64>,
}

impl FilteredTrajectory {
    fn with_capacity(t_max: usize) -> Self {
        Self {
            predicted_means: Vec::with_capacity(t_max),
            predicted_covs: Vec::with_capacity(t_max),
            updated_means: Vec::with_capacity(t_max),
            updated_covs: Vec::with_capacity(t_max),
            innovations: Vec::with_capacity(t_max),
            innovation_covs: Vec::with_capacity(t_max),
            gains: Vec::with_capacity(t_max),
            loglik_terms: Vec::with_capacity(t_max),
        }
    }

    fn push(&mut self, step: FilteredStep) {
        self.predicted_means.push(step.predicted.mean);
        self.predicted_covs.push(step.predicted.covariance);
        self.updated_means.push(step.updated.mean);
        self.updated_covs.push(step.updated.covariance);
        self.loglik_terms.push(step.loglik_term.unwrap_or(0.0));
        self.innovations.push(step.innovation);
        self.innovation_covs.push(step.innovation_covariance);
        self.gains.push(step.gain);
    }

    /// Number of time steps.
    pub fn len(&self) -> usize {
        self.updated_means.len()
    }

    /// Whether the trajectory is empty.
    pub fn is_empty(&self) -> bool {
        self.updated_means.is_empty()
    }
}

/// Extract row `t` of an observation batch.
///
/// Returns `None` for an all-NaN row (missing step); rejects rows mixing
/// NaN with finite entries.
fn observation_row(observations: &DMatrix<f64>, t: usize) -> Result<Option<DVector<f64>>> {
    let row = observations.row(t);
    if row.iter().all(|v| v.is_nan()) {
        return Ok(None);
    }
    if row.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation(format!(
            "observation row {t} must be fully observed (finite) or fully missing (all NaN)"
        )));
    }
    Ok(Some(row.transpose()))
}

fn validate_observation_width(observations: &DMatrix<f64>, params: &KalmanParams) -> Result<()> {
    if observations.nrows() == 0 {
        return Err(Error::Validation("observations must be non-empty".to_string()));
    }
    if observations.ncols() != params.num_observations() {
        return Err(Error::Validation(format!(
            "observations have {} columns, model expects {}",
            observations.ncols(),
            params.num_observations()
        )));
    }
    Ok(())
}

/// Streaming Kalman filter.
///
/// Holds one running belief, initialized to `(mu0, Sigma0)`. Each call to
/// [`KalmanFilter::filter`] advances the belief over the batch; state
/// persists across calls until [`KalmanFilter::reset`]. One instance
/// models exactly one running estimation process.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    params: KalmanParams,
    belief: GaussianBelief,
}

impl KalmanFilter {
    /// Create a filter with its belief at the initial prior.
    pub fn new(params: KalmanParams) -> Self {
        let belief = GaussianBelief::initial(&params);
        Self { params, belief }
    }

    /// The model parameters.
    pub fn params(&self) -> &KalmanParams {
        &self.params
    }

    /// The current running belief.
    pub fn belief(&self) -> &GaussianBelief {
        &self.belief
    }

    /// Reset the running belief to the initial prior `(mu0, Sigma0)`.
    pub fn reset(&mut self) {
        self.belief = GaussianBelief::initial(&self.params);
    }

    /// Replace the provided parameter blocks, keeping the running belief.
    ///
    /// The update must preserve the model dimensions.
    pub fn update_parameters(&mut self, set: &ParameterSet) -> Result<()> {
        let updated = self.params.with_updates(set)?;
        if updated.num_states() != self.params.num_states()
            || updated.num_observations() != self.params.num_observations()
        {
            return Err(Error::Validation(
                "parameter update must preserve model dimensions".to_string(),
            ));
        }
        self.params = updated;
        Ok(())
    }

    /// Run predict/update over the batch's time axis, mutating the running
    /// belief, and return the full trajectory for this batch.
    pub fn filter(&mut self, observations: &DMatrix<f64>) -> Result<FilteredTrajectory> {
        validate_observation_width(observations, &self.params)?;

        let t_max = observations.nrows();
        let mut out = FilteredTrajectory::with_capacity(t_max);
        for t in 0..t_max {
            let observation = observation_row(observations, t)?;
            let predicted = predict(&self.belief, &self.params);
            let step = update(observation.as_ref(), &predicted, &self.params)?;
            self.belief = step.updated.clone();
            out.push(step);
        }
        Ok(out)
    }

    /// RTS-smooth a trajectory produced by this filter's model.
    pub fn smooth(&self, trajectory: &FilteredTrajectory) -> Result<SmoothedTrajectory> {
        rts_smooth(&self.params, trajectory)
    }

    /// Forecast `steps` ahead from the current running belief.
    pub fn forecast(&self, steps: usize) -> Result<ForecastResult> {
        forecast_from_belief(&self.params, &self.belief, steps)
    }
}

/// Batch filter used by EM and subspace identification.
///
/// Always starts from the initial prior `(mu0, Sigma0)` and requires a
/// fully observed, finite batch.
pub fn filter_batch(
    params: &KalmanParams,
    observations: &DMatrix<f64>,
) -> Result<FilteredTrajectory> {
    validate_observation_width(observations, params)?;
    if observations.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation(
            "batch observations must be finite".to_string(),
        ));
    }

    let t_max = observations.nrows();
    let mut belief = GaussianBelief::initial(params);
    let mut out = FilteredTrajectory::with_capacity(t_max);
    for t in 0..t_max {
        let observation = observations.row(t).transpose();
        let predicted = predict(&belief, params);
        let step = update(Some(&observation), &predicted, params)?;
        belief = step.updated.clone();
        out.push(step);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scalar predict-first Kalman recursion used as a hand-computed
    /// reference: the prior `(m0, p0)` is the belief at time -1.
    fn scalar_filter(
        y: &[f64],
        a: f64,
        c: f64,
        q: f64,
        r: f64,
        m0: f64,
        p0: f64,
    ) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut mean = m0;
        let mut var = p0;

        let mut m_filt = Vec::with_capacity(y.len());
        let mut p_filt = Vec::with_capacity(y.len());
        let mut ll_terms = Vec::with_capacity(y.len());

        for &yt in y {
            let m_pred = a * mean;
            let p_pred = a * a * var + q;

            if yt.is_nan() {
                m_filt.push(m_pred);
                p_filt.push(p_pred);
                ll_terms.push(0.0);
                mean = m_pred;
                var = p_pred;
                continue;
            }

            let v = yt - c * m_pred;
            let s = c * c * p_pred + r;
            let k = p_pred * c / s;
            mean = m_pred + k * v;
            var = p_pred - k * c * p_pred;

            ll_terms.push(-(s.ln() + v * v / s));
            m_filt.push(mean);
            p_filt.push(var);
        }
        (m_filt, p_filt, ll_terms)
    }

    fn assert_close(a: f64, b: f64, tol: f64) {
        let d = (a - b).abs();
        assert!(d <= tol, "a={} b={} |diff|={}", a, b, d);
    }

    fn scalar_params(a: f64, c: f64, q: f64, r: f64, m0: f64, p0: f64) -> KalmanParams {
        KalmanParams::new(
            DMatrix::from_row_slice(1, 1, &[a]),
            DMatrix::from_row_slice(1, 1, &[c]),
            DMatrix::from_row_slice(1, 1, &[q]),
            DMatrix::from_row_slice(1, 1, &[r]),
            DVector::from_row_slice(&[m0]),
            DMatrix::from_row_slice(1, 1, &[p0]),
            Offsets::None,
        )
        .unwrap()
    }

    #[test]
    fn test_filter_matches_scalar_reference() {
        // Random-walk state observed directly; the canonical scalar check.
        let params = scalar_params(1.0, 1.0, 0.01, 0.1, 0.0, 1.0);
        let y = [1.0, 1.1, 0.9];
        let (m_ref, p_ref, ll_ref) = scalar_filter(&y, 1.0, 1.0, 0.01, 0.1, 0.0, 1.0);

        let observations = DMatrix::from_column_slice(3, 1, &y);
        let traj = filter_batch(&params, &observations).unwrap();

        assert_eq!(traj.len(), y.len());
        for t in 0..y.len() {
            assert_close(traj.updated_means[t][0], m_ref[t], 1e-6);
            assert_close(traj.updated_covs[t][(0, 0)], p_ref[t], 1e-6);
            assert_close(traj.loglik_terms[t], ll_ref[t], 1e-9);
        }

        // Filtered variance strictly decreases over this window.
        for t in 1..y.len() {
            assert!(
                traj.updated_covs[t][(0, 0)] < traj.updated_covs[t - 1][(0, 0)],
                "variance did not decrease at t={t}"
            );
        }
    }

    #[test]
    fn test_update_without_observation_passes_belief_through() {
        let params = scalar_params(1.0, 1.0, 0.01, 0.1, 0.0, 1.0);
        let belief = GaussianBelief {
            mean: DVector::from_row_slice(&[0.3]),
            covariance: DMatrix::from_row_slice(1, 1, &[0.7]),
        };
        let step = update(None, &belief, &params).unwrap();
        assert_eq!(step.predicted, belief);
        assert_eq!(step.updated, belief);
        assert!(step.innovation.is_none());
        assert!(step.innovation_covariance.is_none());
        assert!(step.gain.is_none());
        assert!(step.loglik_term.is_none());
    }

    #[test]
    fn test_predict_covariance_is_symmetric_and_choleskyable() {
        let params = KalmanParams::new(
            DMatrix::from_row_slice(2, 2, &[0.9, 0.2, -0.3, 0.8]),
            DMatrix::identity(1, 2),
            DMatrix::from_row_slice(2, 2, &[0.3, 0.1, 0.1, 0.4]),
            DMatrix::from_row_slice(1, 1, &[0.2]),
            DVector::from_row_slice(&[0.5, -0.5]),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.2, 2.0]),
            Offsets::None,
        )
        .unwrap();

        let mut belief = GaussianBelief::initial(&params);
        for _ in 0..20 {
            belief = predict(&belief, &params);
            let p = &belief.covariance;
            for i in 0..2 {
                for j in 0..2 {
                    assert_close(p[(i, j)], p[(j, i)], 1e-12);
                }
            }
            assert!(p.clone().cholesky().is_some(), "predicted covariance not PSD");
        }
    }

    #[test]
    fn test_streaming_filter_persists_belief_across_calls() {
        let params = scalar_params(1.0, 1.0, 0.01, 0.1, 0.0, 1.0);
        let y = [1.0, 1.1, 0.9, 1.05];
        let (m_ref, _, _) = scalar_filter(&y, 1.0, 1.0, 0.01, 0.1, 0.0, 1.0);

        let mut filter = KalmanFilter::new(params);
        let first = filter
            .filter(&DMatrix::from_column_slice(2, 1, &y[..2]))
            .unwrap();
        let second = filter
            .filter(&DMatrix::from_column_slice(2, 1, &y[2..]))
            .unwrap();

        assert_close(first.updated_means[1][0], m_ref[1], 1e-12);
        assert_close(second.updated_means[0][0], m_ref[2], 1e-12);
        assert_close(second.updated_means[1][0], m_ref[3], 1e-12);

        // Reset rewinds to the initial prior.
        filter.reset();
        let replay = filter
            .filter(&DMatrix::from_column_slice(4, 1, &y))
            .unwrap();
        for t in 0..y.len() {
            assert_close(replay.updated_means[t][0], m_ref[t], 1e-12);
        }
    }

    #[test]
    fn test_missing_rows_skip_update() {
        let params = scalar_params(1.0, 1.0, 0.01, 0.1, 0.0, 1.0);
        let y = [1.0, f64::NAN, 0.9];
        let (m_ref, p_ref, _) = scalar_filter(&y, 1.0, 1.0, 0.01, 0.1, 0.0, 1.0);

        let mut filter = KalmanFilter::new(params);
        let traj = filter
            .filter(&DMatrix::from_column_slice(3, 1, &y))
            .unwrap();

        for t in 0..y.len() {
            assert_close(traj.updated_means[t][0], m_ref[t], 1e-12);
            assert_close(traj.updated_covs[t][(0, 0)], p_ref[t], 1e-12);
        }
        assert!(traj.innovations[1].is_none());
        assert!(traj.gains[1].is_none());
        assert_eq!(traj.loglik_terms[1], 0.0);
        // Missing step passes the prediction through unchanged.
        assert_eq!(traj.updated_means[1], traj.predicted_means[1]);
        assert_eq!(traj.updated_covs[1], traj.predicted_covs[1]);
    }

    #[test]
    fn test_offsets_enter_predict_and_update() {
        let b = 0.5;
        let d = -1.0;
        let params = KalmanParams::new(
            DMatrix::from_row_slice(1, 1, &[0.8]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::from_row_slice(1, 1, &[0.01]),
            DMatrix::from_row_slice(1, 1, &[0.1]),
            DVector::from_row_slice(&[0.0]),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            Offsets::Provided {
                state: DVector::from_row_slice(&[b]),
                observation: DVector::from_row_slice(&[d]),
            },
        )
        .unwrap();

        let belief = GaussianBelief {
            mean: DVector::from_row_slice(&[1.0]),
            covariance: DMatrix::from_row_slice(1, 1, &[0.5]),
        };
        let predicted = predict(&belief, &params);
        assert_close(predicted.mean[0], 0.8 * 1.0 + b, 1e-12);

        let y = DVector::from_row_slice(&[0.7]);
        let step = update(Some(&y), &predicted, &params).unwrap();
        let expected_innovation = 0.7 - (predicted.mean[0] + d);
        assert_close(step.innovation.unwrap()[0], expected_innovation, 1e-12);
    }

    #[test]
    fn test_filter_batch_rejects_nan_and_bad_width() {
        let params = scalar_params(1.0, 1.0, 0.01, 0.1, 0.0, 1.0);
        let with_nan = DMatrix::from_column_slice(2, 1, &[1.0, f64::NAN]);
        assert!(filter_batch(&params, &with_nan).is_err());

        let wide = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        assert!(filter_batch(&params, &wide).is_err());
    }

    #[test]
    fn test_partially_missing_row_is_rejected() {
        let params = KalmanParams::isotropic(2, 2, 0.1, 0.1).unwrap();
        let mut observations = DMatrix::zeros(2, 2);
        observations[(1, 0)] = f64::NAN;
        let mut filter = KalmanFilter::new(params);
        assert!(filter.filter(&observations).is_err());
    }

    #[test]
    fn test_update_parameters_overlays_blocks() {
        let params = scalar_params(1.0, 1.0, 0.01, 0.1, 0.0, 1.0);
        let mut filter = KalmanFilter::new(params);
        filter
            .update_parameters(&ParameterSet {
                measurement_noise: Some(DMatrix::from_row_slice(1, 1, &[0.5])),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filter.params().measurement_noise[(0, 0)], 0.5);
        assert_eq!(filter.params().transition[(0, 0)], 1.0);
    }
}
