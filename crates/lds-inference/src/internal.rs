use lds_core::{Error, Result};
use nalgebra::{Cholesky, DMatrix, Dyn};

/// Natural log of `2*pi` as an f64 constant.
///
/// We keep this as a literal because `ln()` is not a `const fn` on stable Rust.
pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

#[inline]
pub(crate) fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (p + p.transpose())
}

/// Solve `a * x = b` for symmetric positive-definite `a` via Cholesky
/// factorization and two triangular solves.
pub(crate) fn solve_spd(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let chol = a.clone().cholesky().ok_or_else(|| {
        Error::Computation("SPD solve failed: matrix not positive-definite".to_string())
    })?;
    Ok(chol.solve(b))
}

/// `log|det(a)|` from an existing Cholesky factor of `a`.
pub(crate) fn log_det_cholesky(chol: &Cholesky<f64, Dyn>) -> Result<f64> {
    let l = chol.l();
    let mut logdet = 0.0;
    for i in 0..l.nrows() {
        let d = l[(i, i)];
        if d <= 0.0 || !d.is_finite() {
            return Err(Error::Computation(
                "invalid Cholesky diagonal".to_string(),
            ));
        }
        logdet += 2.0 * d.ln();
    }
    Ok(logdet)
}
