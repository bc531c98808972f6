//! Fixed-interval RTS smoothing.
//!
//! [`rts_smooth`] is the plain backward pass. The crate-internal
//! [`smooth_with_stats`] runs the same recursion while accumulating the
//! moment sums and lag-one covariances EM's M-step consumes, including the
//! smoothed estimate at the virtual time -1 (relative to the initial
//! prior), which drives the `mu0`/`Sigma0` updates.

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

use crate::internal::solve_spd;
use crate::kalman::{FilteredTrajectory, GaussianBelief};
use crate::params::KalmanParams;

/// Smoothed state trajectory.
#[derive(Debug, Clone)]
pub struct SmoothedTrajectory {
    /// Smoothed means `m_{t|T}`.
    pub means: Vec<DVector<f64>>,
    /// Smoothed covariances `P_{t|T}`.
    pub covs: Vec<DMatrix<f64>>,
}

/// Moment sums accumulated by the extended smoother for one EM iteration.
///
/// Index convention: `1` covers times `0..T`, `0` covers the lagged times
/// `-1..T-1` (the virtual time -1 is the initial prior).
#[derive(Debug, Clone)]
pub(crate) struct SufficientStatistics {
    /// `sum_t E[x_t x_t^T]` over times `0..T`.
    pub sxx11: DMatrix<f64>,
    /// `sum_t E[x_t x_{t-1}^T]` over times `0..T`.
    pub sxx10: DMatrix<f64>,
    /// `sum_t E[x_t x_t^T]` over times `-1..T-1`.
    pub sxx00: DMatrix<f64>,
    /// `sum_t E[x_t]` over times `0..T`.
    pub tx1: DVector<f64>,
    /// `sum_t E[x_t]` over times `-1..T-1`.
    pub tx0: DVector<f64>,
    /// `sum_t y_t`.
    pub ty1: DVector<f64>,
    /// `sum_t y_t E[x_t]^T`.
    pub tyx11: DMatrix<f64>,
    /// `sum_t y_t y_t^T`.
    pub tyy11: DMatrix<f64>,
}

/// Extended smoother output.
#[derive(Debug, Clone)]
pub(crate) struct ExtendedSmooth {
    /// Smoothed trajectory over times `0..T`.
    pub smoothed: SmoothedTrajectory,
    /// Smoothed belief at the virtual time -1.
    pub initial: GaussianBelief,
    /// Accumulated moment sums.
    pub stats: SufficientStatistics,
}

/// Smoothing gain `G = P A^T (P_pred_next)^{-1}` via the SPD solve.
fn smoothing_gain(
    params: &KalmanParams,
    cov: &DMatrix<f64>,
    predicted_cov_next: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    let ca_t = cov * params.transition.transpose();
    Ok(solve_spd(predicted_cov_next, &ca_t.transpose())?.transpose())
}

fn validate_trajectory(fr: &FilteredTrajectory) -> Result<usize> {
    let t_max = fr.len();
    if t_max < 2 {
        return Err(Error::Validation(
            "smoothing requires at least two time steps".to_string(),
        ));
    }
    if fr.predicted_means.len() != t_max
        || fr.predicted_covs.len() != t_max
        || fr.updated_covs.len() != t_max
    {
        return Err(Error::Validation(
            "filtered trajectory has inconsistent lengths".to_string(),
        ));
    }
    Ok(t_max)
}

/// Run RTS smoothing over a filtered trajectory.
///
/// The boundary is fixed at `smoothed[T-1] = updated[T-1]`; the backward
/// recursion solves each predicted covariance via Cholesky. Requires at
/// least two time steps.
pub fn rts_smooth(params: &KalmanParams, fr: &FilteredTrajectory) -> Result<SmoothedTrajectory> {
    let t_max = validate_trajectory(fr)?;

    let mut means = fr.updated_means.clone();
    let mut covs = fr.updated_covs.clone();

    for t in (0..t_max - 1).rev() {
        let gain = smoothing_gain(params, &fr.updated_covs[t], &fr.predicted_covs[t + 1])?;

        let dm = &means[t + 1] - &fr.predicted_means[t + 1];
        means[t] = &fr.updated_means[t] + &gain * dm;

        let dp = &covs[t + 1] - &fr.predicted_covs[t + 1];
        covs[t] = &fr.updated_covs[t] + &gain * dp * gain.transpose();
    }

    Ok(SmoothedTrajectory { means, covs })
}

fn e_xx(mean: &DVector<f64>, cov: &DMatrix<f64>) -> DMatrix<f64> {
    cov + mean * mean.transpose()
}

/// RTS smoothing plus EM sufficient statistics.
///
/// Accumulates the second-moment sums, first-moment sums, observation
/// moments, and the lag-one covariance chain, and produces the smoothed
/// belief at the virtual time -1 relative to `(mu0, Sigma0)`.
pub(crate) fn smooth_with_stats(
    params: &KalmanParams,
    fr: &FilteredTrajectory,
    observations: &DMatrix<f64>,
) -> Result<ExtendedSmooth> {
    let t_max = validate_trajectory(fr)?;
    if observations.nrows() != t_max {
        return Err(Error::Validation(
            "observations and filtered trajectory must have the same length".to_string(),
        ));
    }

    let n = params.num_states();
    let m = params.num_observations();
    let a = &params.transition;
    let c = &params.measurement;

    let mut means = fr.updated_means.clone();
    let mut covs = fr.updated_covs.clone();

    let mut sxx11 = DMatrix::<f64>::zeros(n, n);
    let mut sxx10 = DMatrix::<f64>::zeros(n, n);
    let mut sxx00 = DMatrix::<f64>::zeros(n, n);
    let mut tx1 = DVector::<f64>::zeros(n);
    let mut tx0 = DVector::<f64>::zeros(n);

    // Lag-one seed: Cov(x_{T-1}, x_{T-2} | Y) = (I - K_{T-1} C) A P_{T-2|T-2}.
    // A missing last step has no gain, so K enters as zero there.
    let identity = DMatrix::<f64>::identity(n, n);
    let i_minus_kc = match &fr.gains[t_max - 1] {
        Some(k) => &identity - k * c,
        None => identity.clone(),
    };
    let mut lag_one = &i_minus_kc * a * &fr.updated_covs[t_max - 2];

    sxx11 += e_xx(&means[t_max - 1], &covs[t_max - 1]);
    tx1 += &means[t_max - 1];

    // Backward pass; the gain computed for the lag-one chain at step t is
    // reused as the smoothing gain at step t-1.
    let mut carried_gain: Option<DMatrix<f64>> = None;
    let mut gain_at_zero = DMatrix::<f64>::zeros(n, n);

    for t in (0..t_max - 1).rev() {
        let gain = match carried_gain.take() {
            Some(g) => g,
            None => smoothing_gain(params, &fr.updated_covs[t], &fr.predicted_covs[t + 1])?,
        };

        let dm = &means[t + 1] - &fr.predicted_means[t + 1];
        means[t] = &fr.updated_means[t] + &gain * dm;

        let dp = &covs[t + 1] - &fr.predicted_covs[t + 1];
        covs[t] = &fr.updated_covs[t] + &gain * dp * gain.transpose();

        let e_t = e_xx(&means[t], &covs[t]);
        sxx11 += &e_t;
        sxx00 += &e_t;
        sxx10 += &means[t + 1] * means[t].transpose() + &lag_one;
        tx1 += &means[t];
        tx0 += &means[t];

        if t > 0 {
            let gain_prev = smoothing_gain(params, &fr.updated_covs[t - 1], &fr.predicted_covs[t])?;
            lag_one = &fr.updated_covs[t] * gain_prev.transpose()
                + &gain * (&lag_one - a * &fr.updated_covs[t]) * gain_prev.transpose();
            carried_gain = Some(gain_prev);
        } else {
            gain_at_zero = gain;
        }
    }

    // Virtual time -1: smooth the initial prior itself.
    let gain_init = smoothing_gain(params, &params.initial_covariance, &fr.predicted_covs[0])?;
    let initial_mean = &params.initial_mean + &gain_init * (&means[0] - &fr.predicted_means[0]);
    let initial_covariance = &params.initial_covariance
        + &gain_init * (&covs[0] - &fr.predicted_covs[0]) * gain_init.transpose();

    lag_one = &fr.updated_covs[0] * gain_init.transpose()
        + &gain_at_zero * (&lag_one - a * &fr.updated_covs[0]) * gain_init.transpose();

    sxx10 += &means[0] * initial_mean.transpose() + &lag_one;
    sxx00 += &initial_mean * initial_mean.transpose() + &initial_covariance;
    tx0 += &initial_mean;

    // Observation moments against the final smoothed means.
    let mut ty1 = DVector::<f64>::zeros(m);
    let mut tyx11 = DMatrix::<f64>::zeros(m, n);
    let mut tyy11 = DMatrix::<f64>::zeros(m, m);
    for t in 0..t_max {
        let y = observations.row(t).transpose();
        tyx11 += &y * means[t].transpose();
        tyy11 += &y * y.transpose();
        ty1 += y;
    }

    Ok(ExtendedSmooth {
        smoothed: SmoothedTrajectory { means, covs },
        initial: GaussianBelief {
            mean: initial_mean,
            covariance: initial_covariance,
        },
        stats: SufficientStatistics {
            sxx11,
            sxx10,
            sxx00,
            tx1,
            tx0,
            ty1,
            tyx11,
            tyy11,
        },
    })
}

/// Trajectory projected through the measurement function's SVD.
#[derive(Debug, Clone)]
pub struct OrthogonalizedTrajectory {
    /// Projected means.
    pub means: Vec<DVector<f64>>,
    /// Projected covariances.
    pub covs: Vec<DMatrix<f64>>,
}

/// Project state estimates through `W = diag(S) V^T` where `C = U S V^T`.
///
/// Rotates and scales the latent coordinates into the ordering the
/// measurement function actually reads them in, which makes trajectories
/// from similarity-equivalent models comparable.
pub fn orthogonalize_trajectory(
    params: &KalmanParams,
    trajectory: &SmoothedTrajectory,
) -> Result<OrthogonalizedTrajectory> {
    if trajectory.means.len() != trajectory.covs.len() {
        return Err(Error::Validation(
            "trajectory has inconsistent lengths".to_string(),
        ));
    }

    let svd = params.measurement.clone().svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| {
        Error::Computation("SVD of the measurement function failed".to_string())
    })?;
    let w = DMatrix::from_diagonal(&svd.singular_values) * v_t;

    let means = trajectory.means.iter().map(|mean| &w * mean).collect();
    let covs = trajectory
        .covs
        .iter()
        .map(|cov| &w * cov * w.transpose())
        .collect();

    Ok(OrthogonalizedTrajectory { means, covs })
}
