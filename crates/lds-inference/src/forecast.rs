//! Forecasting for linear-Gaussian state-space models.
//!
//! Given a model and a belief at time T-1, roll the dynamics forward:
//! - latent state distribution `x_{T+k}`
//! - observation distribution `y_{T+k}`

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::internal::symmetrize;
use crate::kalman::GaussianBelief;
use crate::params::{KalmanParams, Offsets};

/// Forecast output.
#[derive(Debug, Clone)]
pub struct ForecastResult {
    /// Predicted state means for steps 1..=K (each is `n_state`).
    pub state_means: Vec<DVector<f64>>,
    /// Predicted state covariances for steps 1..=K.
    pub state_covs: Vec<DMatrix<f64>>,
    /// Predicted observation means for steps 1..=K (each is `n_obs`).
    pub obs_means: Vec<DVector<f64>>,
    /// Predicted observation covariances for steps 1..=K.
    pub obs_covs: Vec<DMatrix<f64>>,
}

/// Observation prediction intervals (marginal, per observed dimension).
#[derive(Debug, Clone)]
pub struct ForecastIntervals {
    /// Alpha for the two-sided interval (e.g. 0.05 means 95% interval).
    pub alpha: f64,
    /// Standard normal z-value for `1 - alpha/2`.
    pub z: f64,
    /// Lower bounds for steps 1..=K (each is `n_obs`).
    pub obs_lower: Vec<DVector<f64>>,
    /// Upper bounds for steps 1..=K (each is `n_obs`).
    pub obs_upper: Vec<DVector<f64>>,
}

/// Forecast K steps ahead starting from `belief` at time T-1.
pub fn forecast_from_belief(
    params: &KalmanParams,
    belief: &GaussianBelief,
    steps: usize,
) -> Result<ForecastResult> {
    if steps == 0 {
        return Err(Error::Validation("steps must be > 0".to_string()));
    }
    let n = params.num_states();
    if belief.mean.len() != n {
        return Err(Error::Validation(
            "belief mean has wrong length".to_string(),
        ));
    }
    if belief.covariance.nrows() != n || belief.covariance.ncols() != n {
        return Err(Error::Validation(
            "belief covariance has wrong shape".to_string(),
        ));
    }

    let a = &params.transition;
    let c = &params.measurement;

    let mut mean = belief.mean.clone();
    let mut cov = belief.covariance.clone();

    let mut state_means = Vec::with_capacity(steps);
    let mut state_covs = Vec::with_capacity(steps);
    let mut obs_means = Vec::with_capacity(steps);
    let mut obs_covs = Vec::with_capacity(steps);

    for _k in 0..steps {
        mean = a * &mean;
        cov = a * &cov * a.transpose() + &params.process_noise;
        cov = symmetrize(&cov);
        if let Offsets::Provided { state, .. } = &params.offsets {
            mean += state;
        }

        let mut obs_mean = c * &mean;
        if let Offsets::Provided { observation, .. } = &params.offsets {
            obs_mean += observation;
        }
        let obs_cov = c * &cov * c.transpose() + &params.measurement_noise;

        state_means.push(mean.clone());
        state_covs.push(cov.clone());
        obs_means.push(obs_mean);
        obs_covs.push(symmetrize(&obs_cov));
    }

    Ok(ForecastResult {
        state_means,
        state_covs,
        obs_means,
        obs_covs,
    })
}

/// Compute marginal normal prediction intervals for the observation
/// forecasts in `fc`.
pub fn forecast_intervals(fc: &ForecastResult, alpha: f64) -> Result<ForecastIntervals> {
    if !(alpha.is_finite() && alpha > 0.0 && alpha < 1.0) {
        return Err(Error::Validation("alpha must be in (0, 1)".to_string()));
    }
    if fc.obs_means.len() != fc.obs_covs.len() {
        return Err(Error::Validation(
            "forecast result has inconsistent lengths".to_string(),
        ));
    }
    if fc.obs_means.is_empty() {
        return Err(Error::Validation(
            "forecast result must be non-empty".to_string(),
        ));
    }

    let n_obs = fc.obs_means[0].len();
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| Error::Validation(format!("failed to construct normal distribution: {e}")))?;
    let z = normal.inverse_cdf(1.0 - 0.5 * alpha);
    if !z.is_finite() || z <= 0.0 {
        return Err(Error::Computation("invalid z for alpha".to_string()));
    }

    let mut obs_lower = Vec::with_capacity(fc.obs_means.len());
    let mut obs_upper = Vec::with_capacity(fc.obs_means.len());

    for (mean, cov) in fc.obs_means.iter().zip(fc.obs_covs.iter()) {
        if mean.len() != n_obs || cov.nrows() != n_obs || cov.ncols() != n_obs {
            return Err(Error::Validation(
                "forecast result has inconsistent shapes".to_string(),
            ));
        }
        let mut lo = DVector::<f64>::zeros(n_obs);
        let mut hi = DVector::<f64>::zeros(n_obs);
        for i in 0..n_obs {
            let mu = mean[i];
            let var = cov[(i, i)];
            if !mu.is_finite() || !var.is_finite() || var < 0.0 {
                return Err(Error::Computation(
                    "forecast intervals failed: invalid marginal mean/variance".to_string(),
                ));
            }
            let sd = var.sqrt();
            lo[i] = mu - z * sd;
            hi[i] = mu + z * sd;
        }
        obs_lower.push(lo);
        obs_upper.push(hi);
    }

    Ok(ForecastIntervals {
        alpha,
        z,
        obs_lower,
        obs_upper,
    })
}
