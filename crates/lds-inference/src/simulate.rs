//! Simulation for linear-Gaussian state-space models.
//!
//! Generates a latent trajectory and corresponding observations:
//! - `x_t = A x_{t-1} + b + w_t`, `w_t ~ N(0, Q)`
//! - `y_t = C x_t     + d + v_t`, `v_t ~ N(0, R)`

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::params::{KalmanParams, Offsets};

/// Simulation output.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Latent states (length T, each is `n_state`).
    pub states: Vec<DVector<f64>>,
    /// Observations (length T, each is `n_obs`).
    pub observations: Vec<DVector<f64>>,
}

impl SimulationResult {
    /// The observations as a `[T, n_obs]` batch matrix.
    pub fn observation_matrix(&self) -> DMatrix<f64> {
        let t_max = self.observations.len();
        let m = if t_max == 0 {
            0
        } else {
            self.observations[0].len()
        };
        let mut out = DMatrix::<f64>::zeros(t_max, m);
        for (t, y) in self.observations.iter().enumerate() {
            for j in 0..m {
                out[(t, j)] = y[j];
            }
        }
        out
    }
}

fn sample_mvn_zero(rng: &mut StdRng, cov: &DMatrix<f64>) -> Result<DVector<f64>> {
    let n = cov.nrows();
    if cov.ncols() != n || n == 0 {
        return Err(Error::Validation(
            "cov must be square and non-empty".to_string(),
        ));
    }

    let chol = cov
        .clone()
        .cholesky()
        .ok_or_else(|| Error::Computation("covariance not SPD (Cholesky failed)".to_string()))?;
    let l = chol.l();

    let mut z = DVector::<f64>::zeros(n);
    for i in 0..n {
        z[i] = StandardNormal.sample(rng);
    }
    Ok(l * z)
}

/// Simulate T steps from the model starting at the initial prior mean.
pub fn simulate(params: &KalmanParams, t_max: usize, seed: u64) -> Result<SimulationResult> {
    if t_max == 0 {
        return Err(Error::Validation("t_max must be > 0".to_string()));
    }

    let mut rng = StdRng::seed_from_u64(seed);

    let mut states = Vec::with_capacity(t_max);
    let mut observations = Vec::with_capacity(t_max);

    let mut x = params.initial_mean.clone();
    for _t in 0..t_max {
        // State evolution
        let w = sample_mvn_zero(&mut rng, &params.process_noise)?;
        x = &params.transition * x + w;
        if let Offsets::Provided { state, .. } = &params.offsets {
            x += state;
        }

        // Observation
        let v = sample_mvn_zero(&mut rng, &params.measurement_noise)?;
        let mut y = &params.measurement * &x + v;
        if let Offsets::Provided { observation, .. } = &params.offsets {
            y += observation;
        }

        states.push(x.clone());
        observations.push(y);
    }

    Ok(SimulationResult {
        states,
        observations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_shapes_smoke() {
        let params = KalmanParams::isotropic(2, 1, 0.1, 0.2).unwrap();
        let sim = simulate(&params, 5, 123).unwrap();
        assert_eq!(sim.states.len(), 5);
        assert_eq!(sim.observations.len(), 5);
        assert_eq!(sim.states[0].len(), 2);
        assert_eq!(sim.observations[0].len(), 1);

        let batch = sim.observation_matrix();
        assert_eq!(batch.nrows(), 5);
        assert_eq!(batch.ncols(), 1);
        assert_eq!(batch[(3, 0)], sim.observations[3][0]);
    }

    #[test]
    fn test_simulate_is_reproducible_per_seed() {
        let params = KalmanParams::isotropic(1, 1, 0.1, 0.2).unwrap();
        let a = simulate(&params, 20, 9).unwrap();
        let b = simulate(&params, 20, 9).unwrap();
        let c = simulate(&params, 20, 10).unwrap();

        assert_eq!(a.observation_matrix(), b.observation_matrix());
        assert_ne!(a.observation_matrix(), c.observation_matrix());
    }

    #[test]
    fn test_simulate_rejects_degenerate_noise() {
        // A zero process-noise covariance is not positive-definite.
        let params = KalmanParams::new(
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1),
            DMatrix::zeros(1, 1),
            DMatrix::identity(1, 1),
            DVector::zeros(1),
            DMatrix::identity(1, 1),
            Offsets::None,
        )
        .unwrap();
        assert!(simulate(&params, 3, 0).is_err());
    }
}
