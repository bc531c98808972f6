//! Batch EM parameter learning for linear-Gaussian state-space models.
//!
//! Each iteration filters the full batch, scores the total log-likelihood,
//! checks the stop conditions, then runs the extended smoother and the
//! closed-form M-step on the mask-enabled parameter blocks. Intermediate
//! results are emitted after every completed M-step except the final pass;
//! one final result (`finished = true`) is emitted after the loop ends,
//! unless the run was cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lds_core::{Error, Result};
use nalgebra::DMatrix;

use crate::internal::{solve_spd, symmetrize, LN_2PI};
use crate::kalman::filter_batch;
use crate::params::{KalmanParams, Offsets, ParametersToEstimate};
use crate::smoother::{smooth_with_stats, ExtendedSmooth};

/// Cooperative cancellation flag, polled once per EM iteration boundary.
///
/// In-flight linear algebra within one iteration is not interruptible.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a fresh, non-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// EM configuration.
#[derive(Debug, Clone)]
pub struct EmOptions {
    /// Maximum number of EM iterations. Must be at least 1.
    pub max_iterations: usize,
    /// Absolute tolerance on log-likelihood improvement.
    pub tolerance: f64,
    /// Which parameter blocks the M-step may overwrite.
    pub estimate: ParametersToEstimate,
}

impl Default for EmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-4,
            estimate: ParametersToEstimate::default(),
        }
    }
}

/// How an EM run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmStatus {
    /// Log-likelihood improvement fell below the tolerance.
    Converged,
    /// The iteration budget was exhausted.
    MaxIterationsReached,
    /// Log-likelihood decreased; parameters were rolled back one iteration.
    Diverged,
    /// Cancellation was requested; no final result was emitted.
    Cancelled,
}

/// One emitted EM result.
#[derive(Debug, Clone)]
pub struct EmResult {
    /// Log-likelihood trace up to and including the latest iteration.
    pub log_likelihood: Vec<f64>,
    /// Parameters as of the latest completed M-step.
    pub parameters: KalmanParams,
    /// Whether this is the final emission of the run.
    pub finished: bool,
}

/// Run batch EM, emitting intermediate and final results through `emit`.
///
/// `emit` receives an [`EmResult`] with `finished = false` after every
/// completed non-final iteration, and exactly one `finished = true` result
/// after the loop stops — unless cancellation was requested, in which case
/// nothing further is emitted and [`EmStatus::Cancelled`] is returned.
pub fn expectation_maximization<F>(
    params: &KalmanParams,
    observations: &DMatrix<f64>,
    options: &EmOptions,
    cancel: Option<&CancellationToken>,
    mut emit: F,
) -> Result<EmStatus>
where
    F: FnMut(EmResult),
{
    if options.max_iterations == 0 {
        return Err(Error::Validation(
            "max_iterations must be greater than zero".to_string(),
        ));
    }
    if !options.tolerance.is_finite() || options.tolerance < 0.0 {
        return Err(Error::Validation(
            "tolerance must be finite and >= 0".to_string(),
        ));
    }

    let t_max = observations.nrows();
    let m = params.num_observations();
    if observations.ncols() != m {
        return Err(Error::Validation(format!(
            "observations have {} columns, model expects {}",
            observations.ncols(),
            m
        )));
    }
    if t_max < 2 {
        return Err(Error::Validation(
            "EM requires at least two time steps".to_string(),
        ));
    }
    if observations.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation(
            "EM observations must be finite".to_string(),
        ));
    }

    let loglik_const = -0.5 * (t_max as f64) * (m as f64) * LN_2PI;

    let mut current = params.clone();
    let mut previous = params.clone();
    let mut trace: Vec<f64> = Vec::with_capacity(options.max_iterations);
    let mut previous_ll = f64::NEG_INFINITY;
    let mut status = EmStatus::MaxIterationsReached;

    for iteration in 0..options.max_iterations {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Ok(EmStatus::Cancelled);
        }

        let filtered = filter_batch(&current, observations)?;
        let total = loglik_const + 0.5 * filtered.loglik_terms.iter().sum::<f64>();
        trace.push(total);
        tracing::debug!(iteration, log_likelihood = total, "EM iteration");

        if total <= previous_ll {
            tracing::warn!(
                log_likelihood = total,
                previous = previous_ll,
                "log-likelihood decreased; stopping EM"
            );
            current = previous;
            status = EmStatus::Diverged;
            break;
        }
        if total - previous_ll < options.tolerance {
            status = EmStatus::Converged;
            break;
        }
        previous_ll = total;

        let extended = smooth_with_stats(&current, &filtered, observations)?;
        previous = current.clone();
        current = m_step(&current, &extended, t_max, &options.estimate)?;

        if iteration + 1 < options.max_iterations {
            emit(EmResult {
                log_likelihood: trace.clone(),
                parameters: current.clone(),
                finished: false,
            });
        }
    }

    emit(EmResult {
        log_likelihood: trace,
        parameters: current,
        finished: true,
    });
    Ok(status)
}

/// Run batch EM and return only the final result.
pub fn kalman_em(
    params: &KalmanParams,
    observations: &DMatrix<f64>,
    options: &EmOptions,
) -> Result<EmResult> {
    let mut last: Option<EmResult> = None;
    expectation_maximization(params, observations, options, None, |result| {
        if result.finished {
            last = Some(result);
        }
    })?;
    last.ok_or_else(|| Error::Computation("EM finished without a final result".to_string()))
}

/// Closed-form M-step on the mask-enabled blocks.
///
/// All solves go through the Cholesky primitive. Update order: `A`, `b`,
/// `C`, `d`, `Q` (uses the current `A`/`b`), `R` (uses the current
/// `C`/`d`), `mu0`, `Sigma0`. A masked-off block keeps its previous value
/// and downstream formulas use that previous value.
fn m_step(
    current: &KalmanParams,
    extended: &ExtendedSmooth,
    t_max: usize,
    estimate: &ParametersToEstimate,
) -> Result<KalmanParams> {
    let stats = &extended.stats;
    let t = t_max as f64;
    let mut next = current.clone();

    match &current.offsets {
        Offsets::None => {
            if estimate.transition {
                // A = Sxx10 Sxx00^{-1}
                next.transition = solve_spd(&stats.sxx00, &stats.sxx10.transpose())?.transpose();
            }
            if estimate.measurement {
                // C = Tyx11 Sxx11^{-1}
                next.measurement = solve_spd(&stats.sxx11, &stats.tyx11.transpose())?.transpose();
            }
            if estimate.process_noise {
                let a = &next.transition;
                let residual = &stats.sxx11 - a * stats.sxx10.transpose()
                    - &stats.sxx10 * a.transpose()
                    + a * &stats.sxx00 * a.transpose();
                next.process_noise = symmetrize(&(residual / t));
            }
            if estimate.measurement_noise {
                let c = &next.measurement;
                let residual = &stats.tyy11 - c * stats.tyx11.transpose()
                    - &stats.tyx11 * c.transpose()
                    + c * &stats.sxx11 * c.transpose();
                next.measurement_noise = symmetrize(&(residual / t));
            }
        }
        Offsets::Provided { state, observation } => {
            // Intercept-adjusted moments.
            let sxx00_adj = &stats.sxx00 - (&stats.tx0 * stats.tx0.transpose()) / t;
            let sxx10_adj = &stats.sxx10 - (&stats.tx1 * stats.tx0.transpose()) / t;
            let sxx11_adj = &stats.sxx11 - (&stats.tx1 * stats.tx1.transpose()) / t;
            let tyx11_adj = &stats.tyx11 - (&stats.ty1 * stats.tx1.transpose()) / t;

            let mut b = state.clone();
            let mut d = observation.clone();

            if estimate.transition {
                next.transition = solve_spd(&sxx00_adj, &sxx10_adj.transpose())?.transpose();
            }
            if estimate.state_offset {
                b = (&stats.tx1 - &next.transition * &stats.tx0) / t;
            }
            if estimate.measurement {
                next.measurement = solve_spd(&sxx11_adj, &tyx11_adj.transpose())?.transpose();
            }
            if estimate.observation_offset {
                d = (&stats.ty1 - &next.measurement * &stats.tx1) / t;
            }
            if estimate.process_noise {
                let a = &next.transition;
                let residual = &stats.sxx11 - a * stats.sxx10.transpose()
                    - &stats.sxx10 * a.transpose()
                    + a * &stats.sxx00 * a.transpose()
                    - &b * stats.tx1.transpose()
                    - &stats.tx1 * b.transpose()
                    + a * &stats.tx0 * b.transpose()
                    + &b * stats.tx0.transpose() * a.transpose()
                    + (&b * b.transpose()) * t;
                next.process_noise = symmetrize(&(residual / t));
            }
            if estimate.measurement_noise {
                let c = &next.measurement;
                let residual = &stats.tyy11 - c * stats.tyx11.transpose()
                    - &stats.tyx11 * c.transpose()
                    + c * &stats.sxx11 * c.transpose()
                    - &d * stats.ty1.transpose()
                    - &stats.ty1 * d.transpose()
                    + c * &stats.tx1 * d.transpose()
                    + &d * stats.tx1.transpose() * c.transpose()
                    + (&d * d.transpose()) * t;
                next.measurement_noise = symmetrize(&(residual / t));
            }
            next.offsets = Offsets::Provided {
                state: b,
                observation: d,
            };
        }
    }

    if estimate.initial_mean {
        next.initial_mean = extended.initial.mean.clone();
    }
    if estimate.initial_covariance {
        next.initial_covariance = extended.initial.covariance.clone();
    }

    Ok(next)
}
