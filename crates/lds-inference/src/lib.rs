//! # lds-inference
//!
//! Estimation engine for time-invariant linear-Gaussian state-space models:
//!
//! State:       `x_t = A x_{t-1} + b + w_t`,  `w_t ~ N(0, Q)`
//!
//! Observation: `y_t = C x_t + d + v_t`,      `v_t ~ N(0, R)`
//!
//! Initial prior: `x_{-1} ~ N(mu0, Sigma0)`
//!
//! This crate provides:
//! - recursive Kalman filtering (streaming and batch forms)
//! - fixed-interval RTS smoothing
//! - batch EM parameter learning with per-block estimation masks
//! - stochastic subspace identification (SSI) for model initialization
//! - per-block binary parameter persistence
//!
//! All dense numerics go through `nalgebra`; symmetric positive-definite
//! systems are solved via Cholesky factorization, never by explicit
//! inversion. Batch operations are synchronous and single-threaded; EM
//! supports cooperative cancellation at iteration boundaries.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Batch EM parameter learning.
pub mod em;
/// k-step-ahead state and observation forecasts.
pub mod forecast;
mod internal;
/// Kalman predict/update steps and the streaming/batch filters.
pub mod kalman;
/// Model parameters, offsets, and estimation masks.
pub mod params;
/// Per-block binary parameter persistence.
pub mod persistence;
/// Caller-owned registry of named filter instances.
pub mod registry;
/// Trajectory and observation simulation.
pub mod simulate;
/// RTS smoothing, EM sufficient statistics, and orthogonalization.
pub mod smoother;
/// Stochastic subspace identification.
pub mod ssi;

pub use em::{
    expectation_maximization, kalman_em, CancellationToken, EmOptions, EmResult, EmStatus,
};
pub use forecast::{forecast_from_belief, forecast_intervals, ForecastIntervals, ForecastResult};
pub use kalman::{
    filter_batch, predict, update, FilteredStep, FilteredTrajectory, GaussianBelief, KalmanFilter,
};
pub use params::{KalmanParams, Offsets, ParameterSet, ParametersToEstimate};
pub use persistence::{load_parameters, save_parameters};
pub use registry::FilterRegistry;
pub use simulate::{simulate, SimulationResult};
pub use smoother::{
    orthogonalize_trajectory, rts_smooth, OrthogonalizedTrajectory, SmoothedTrajectory,
};
pub use ssi::{subspace_identify, SsiOptions, SsiResult};
