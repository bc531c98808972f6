//! Per-block binary persistence of model parameters.
//!
//! Each parameter block is serialized to its own file in a caller-chosen
//! directory, named by role. Encoding per file: `u64` LE row count,
//! `u64` LE column count, then row-major `f64` LE data. Vectors are
//! stored as `n x 1`.
//!
//! Loading reads whichever files exist; a missing file leaves that block
//! unset so downstream validation can apply defaults.

use std::path::Path;

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

use crate::params::ParameterSet;

/// File name for the transition matrix block.
pub const TRANSITION_MATRIX_FILE: &str = "TransitionMatrix.bin";
/// File name for the measurement function block.
pub const MEASUREMENT_FUNCTION_FILE: &str = "MeasurementFunction.bin";
/// File name for the process noise covariance block.
pub const PROCESS_NOISE_COVARIANCE_FILE: &str = "ProcessNoiseCovariance.bin";
/// File name for the measurement noise covariance block.
pub const MEASUREMENT_NOISE_COVARIANCE_FILE: &str = "MeasurementNoiseCovariance.bin";
/// File name for the initial mean block.
pub const INITIAL_MEAN_FILE: &str = "InitialMean.bin";
/// File name for the initial covariance block.
pub const INITIAL_COVARIANCE_FILE: &str = "InitialCovariance.bin";
/// File name for the state offset block.
pub const STATE_OFFSET_FILE: &str = "StateOffset.bin";
/// File name for the observation offset block.
pub const OBSERVATION_OFFSET_FILE: &str = "ObservationOffset.bin";

fn matrix_to_bytes(matrix: &DMatrix<f64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 8 * matrix.len());
    buf.extend_from_slice(&(matrix.nrows() as u64).to_le_bytes());
    buf.extend_from_slice(&(matrix.ncols() as u64).to_le_bytes());
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            buf.extend_from_slice(&matrix[(i, j)].to_le_bytes());
        }
    }
    buf
}

fn vector_to_bytes(vector: &DVector<f64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 8 * vector.len());
    buf.extend_from_slice(&(vector.len() as u64).to_le_bytes());
    buf.extend_from_slice(&1u64.to_le_bytes());
    for i in 0..vector.len() {
        buf.extend_from_slice(&vector[i].to_le_bytes());
    }
    buf
}

fn matrix_from_bytes(data: &[u8], name: &str) -> Result<DMatrix<f64>> {
    if data.len() < 16 {
        return Err(Error::Validation(format!(
            "{name}: file too short for a dimension header"
        )));
    }
    let nrows = u64::from_le_bytes(data[0..8].try_into().unwrap()) as usize;
    let ncols = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;
    let expected = nrows
        .checked_mul(ncols)
        .and_then(|c| c.checked_mul(8))
        .and_then(|c| c.checked_add(16))
        .ok_or_else(|| Error::Validation(format!("{name}: invalid dimensions")))?;
    if data.len() != expected {
        return Err(Error::Validation(format!(
            "{name}: expected {expected} bytes for a {nrows}x{ncols} block, got {}",
            data.len()
        )));
    }

    let mut out = DMatrix::<f64>::zeros(nrows, ncols);
    let mut pos = 16;
    for i in 0..nrows {
        for j in 0..ncols {
            out[(i, j)] = f64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
    }
    Ok(out)
}

fn vector_from_bytes(data: &[u8], name: &str) -> Result<DVector<f64>> {
    let matrix = matrix_from_bytes(data, name)?;
    if matrix.ncols() != 1 {
        return Err(Error::Validation(format!(
            "{name}: expected a column vector, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    Ok(matrix.column(0).into_owned())
}

fn load_matrix(dir: &Path, name: &str) -> Result<Option<DMatrix<f64>>> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(&path)?;
    Ok(Some(matrix_from_bytes(&data, name)?))
}

fn load_vector(dir: &Path, name: &str) -> Result<Option<DVector<f64>>> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(&path)?;
    Ok(Some(vector_from_bytes(&data, name)?))
}

/// Save the populated blocks of `parameters` into `dir`, one file per
/// block. Absent blocks produce no file. Creates `dir` if needed.
pub fn save_parameters(dir: &Path, parameters: &ParameterSet) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    if let Some(block) = &parameters.transition {
        std::fs::write(dir.join(TRANSITION_MATRIX_FILE), matrix_to_bytes(block))?;
    }
    if let Some(block) = &parameters.measurement {
        std::fs::write(dir.join(MEASUREMENT_FUNCTION_FILE), matrix_to_bytes(block))?;
    }
    if let Some(block) = &parameters.process_noise {
        std::fs::write(
            dir.join(PROCESS_NOISE_COVARIANCE_FILE),
            matrix_to_bytes(block),
        )?;
    }
    if let Some(block) = &parameters.measurement_noise {
        std::fs::write(
            dir.join(MEASUREMENT_NOISE_COVARIANCE_FILE),
            matrix_to_bytes(block),
        )?;
    }
    if let Some(block) = &parameters.initial_mean {
        std::fs::write(dir.join(INITIAL_MEAN_FILE), vector_to_bytes(block))?;
    }
    if let Some(block) = &parameters.initial_covariance {
        std::fs::write(dir.join(INITIAL_COVARIANCE_FILE), matrix_to_bytes(block))?;
    }
    if let Some(block) = &parameters.state_offset {
        std::fs::write(dir.join(STATE_OFFSET_FILE), vector_to_bytes(block))?;
    }
    if let Some(block) = &parameters.observation_offset {
        std::fs::write(dir.join(OBSERVATION_OFFSET_FILE), vector_to_bytes(block))?;
    }
    Ok(())
}

/// Load whichever parameter files exist in `dir`.
///
/// A missing file leaves the corresponding block unset.
pub fn load_parameters(dir: &Path) -> Result<ParameterSet> {
    Ok(ParameterSet {
        transition: load_matrix(dir, TRANSITION_MATRIX_FILE)?,
        measurement: load_matrix(dir, MEASUREMENT_FUNCTION_FILE)?,
        process_noise: load_matrix(dir, PROCESS_NOISE_COVARIANCE_FILE)?,
        measurement_noise: load_matrix(dir, MEASUREMENT_NOISE_COVARIANCE_FILE)?,
        initial_mean: load_vector(dir, INITIAL_MEAN_FILE)?,
        initial_covariance: load_matrix(dir, INITIAL_COVARIANCE_FILE)?,
        state_offset: load_vector(dir, STATE_OFFSET_FILE)?,
        observation_offset: load_vector(dir, OBSERVATION_OFFSET_FILE)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::KalmanParams;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("lds_persistence_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_roundtrip_full_parameter_set() {
        let dir = temp_dir("full");
        let params = KalmanParams::new(
            DMatrix::from_row_slice(2, 2, &[0.9, 0.1, -0.2, 0.8]),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.5]),
            DMatrix::from_row_slice(2, 2, &[0.05, 0.01, 0.01, 0.05]),
            DMatrix::from_row_slice(1, 1, &[0.2]),
            DVector::from_row_slice(&[0.3, -0.4]),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.5]),
            crate::params::Offsets::Provided {
                state: DVector::from_row_slice(&[0.1, 0.2]),
                observation: DVector::from_row_slice(&[-0.5]),
            },
        )
        .unwrap();
        let set = ParameterSet::from(&params);

        save_parameters(&dir, &set).unwrap();
        let loaded = load_parameters(&dir).unwrap();

        // f64 -> LE bytes -> f64 is lossless, so blocks roundtrip exactly.
        assert_eq!(loaded, set);

        let rebuilt = loaded.build().unwrap();
        assert_eq!(rebuilt, params);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_set_leaves_missing_blocks_unset() {
        let dir = temp_dir("partial");
        let set = ParameterSet {
            transition: Some(DMatrix::from_row_slice(1, 1, &[0.7])),
            initial_mean: Some(DVector::from_row_slice(&[0.25])),
            ..Default::default()
        };

        save_parameters(&dir, &set).unwrap();
        let loaded = load_parameters(&dir).unwrap();

        assert_eq!(loaded.transition, set.transition);
        assert_eq!(loaded.initial_mean, set.initial_mean);
        assert!(loaded.measurement.is_none());
        assert!(loaded.process_noise.is_none());
        assert!(loaded.measurement_noise.is_none());
        assert!(loaded.initial_covariance.is_none());
        assert!(loaded.state_offset.is_none());
        assert!(loaded.observation_offset.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_from_empty_directory_is_all_unset() {
        let dir = temp_dir("empty");
        std::fs::create_dir_all(&dir).unwrap();
        let loaded = load_parameters(&dir).unwrap();
        assert_eq!(loaded, ParameterSet::default());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = temp_dir("truncated");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(TRANSITION_MATRIX_FILE), [0u8; 10]).unwrap();
        assert!(load_parameters(&dir).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
