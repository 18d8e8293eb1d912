//! Dense covariance routines shared by the filter
//!
//! Small set of helpers on top of nalgebra: symmetrization, diagonal floor,
//! congruence scaling of selected variances and a robust SPD inverse for the
//! innovation covariance.

use nalgebra::DMatrix;

use crate::error::{FusionError, FusionResult};
use crate::types::{StateMat13, STATE_DIM_13};

/// Smallest variance any state slot may carry
pub const VARIANCE_FLOOR: f64 = 1e-8;

/// Regularization added to a non-SPD innovation covariance before retrying
const REGULARIZATION: f64 = 1e-6;

/// `P ← ½(P + Pᵀ)`
pub fn symmetrize(p: &mut StateMat13) {
    *p = (*p + p.transpose()) * 0.5;
}

/// Raise every diagonal entry to at least `floor`.
pub fn floor_diagonal(p: &mut StateMat13, floor: f64) {
    for i in 0..STATE_DIM_13 {
        if !(p[(i, i)] >= floor) {
            p[(i, i)] = floor;
        }
    }
}

/// Symmetrize and floor; run after every mutation of P.
pub fn condition(p: &mut StateMat13) {
    symmetrize(p);
    floor_diagonal(p, VARIANCE_FLOOR);
}

/// Scale `P[i,i]` by `factor` for each `(i, factor)` via `P ← D P D` with
/// `D = diag(√factor)`. Cross terms follow so P stays PSD.
pub fn scale_variances(p: &mut StateMat13, scales: &[(usize, f64)]) {
    for &(idx, factor) in scales {
        if idx >= STATE_DIM_13 || !factor.is_finite() || factor < 0.0 {
            continue;
        }
        let d = factor.sqrt();
        for j in 0..STATE_DIM_13 {
            p[(idx, j)] *= d;
        }
        for i in 0..STATE_DIM_13 {
            p[(i, idx)] *= d;
        }
    }
}

/// Cap `P[idx,idx]` at `max` (congruence scaling, no-op below the cap).
pub fn cap_variance(p: &mut StateMat13, idx: usize, max: f64) {
    let current = p[(idx, idx)];
    if current > max && max > 0.0 {
        scale_variances(p, &[(idx, max / current)]);
    }
}

pub fn is_finite(p: &StateMat13) -> bool {
    p.iter().all(|v| v.is_finite())
}

/// Inverse of a symmetric innovation covariance.
///
/// Cholesky first; on failure retry with `S + 1e-6·I`; then fall back to an
/// eigendecomposition with eigenvalues floored relative to the largest one.
pub fn robust_inverse(s: &DMatrix<f64>) -> FusionResult<DMatrix<f64>> {
    let (rows, cols) = s.shape();
    if rows != cols || rows == 0 {
        return Err(FusionError::InvalidDimension(format!(
            "innovation covariance must be square and non-empty, got {rows}x{cols}"
        )));
    }
    if s.iter().any(|v| !v.is_finite()) {
        return Err(FusionError::SingularInnovation);
    }

    let sym = (s + s.transpose()) * 0.5;
    if let Some(chol) = sym.clone().cholesky() {
        return Ok(chol.inverse());
    }

    let regularized = &sym + DMatrix::identity(rows, rows) * REGULARIZATION;
    if let Some(chol) = regularized.clone().cholesky() {
        log::debug!("Innovation covariance regularized before inversion");
        return Ok(chol.inverse());
    }

    let eigen = regularized.symmetric_eigen();
    let max_eig = eigen.eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max_eig.is_finite() || max_eig <= 1e-12 {
        return Err(FusionError::SingularInnovation);
    }
    let floor = max_eig * 1e-9;
    let inv_diag = eigen.eigenvalues.map(|l| 1.0 / l.max(floor));
    let v = &eigen.eigenvectors;
    log::warn!("Innovation covariance inverted through eigenvalue floor");
    Ok(v * DMatrix::from_diagonal(&inv_diag) * v.transpose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_cov() -> StateMat13 {
        let mut p = StateMat13::identity() * 0.1;
        p[(0, 3)] = 0.02;
        p[(3, 0)] = 0.02;
        p[(1, 6)] = -0.01;
        p[(6, 1)] = -0.01;
        p
    }

    #[test]
    fn test_symmetrize() {
        let mut p = sample_cov();
        p[(2, 5)] = 0.04;
        symmetrize(&mut p);
        assert_abs_diff_eq!(p[(2, 5)], 0.02, epsilon = 1e-15);
        assert_abs_diff_eq!(p[(5, 2)], 0.02, epsilon = 1e-15);
    }

    #[test]
    fn test_floor_catches_nan_and_negative() {
        let mut p = sample_cov();
        p[(4, 4)] = -1.0;
        p[(7, 7)] = f64::NAN;
        condition(&mut p);
        assert_eq!(p[(4, 4)], VARIANCE_FLOOR);
        assert_eq!(p[(7, 7)], VARIANCE_FLOOR);
    }

    #[test]
    fn test_scale_variances_keeps_psd() {
        let mut p = sample_cov();
        scale_variances(&mut p, &[(0, 0.5), (1, 0.5)]);
        assert_abs_diff_eq!(p[(0, 0)], 0.05, epsilon = 1e-15);
        assert_abs_diff_eq!(p[(0, 3)], 0.02 * 0.5f64.sqrt(), epsilon = 1e-15);
        assert_abs_diff_eq!(p[(3, 0)], p[(0, 3)], epsilon = 1e-15);
        assert!(p.symmetric_eigenvalues().iter().all(|&l| l >= 0.0));
    }

    #[test]
    fn test_cap_variance() {
        let mut p = sample_cov();
        p[(0, 0)] = 8.0;
        cap_variance(&mut p, 0, 2.0);
        assert_abs_diff_eq!(p[(0, 0)], 2.0, epsilon = 1e-12);
        cap_variance(&mut p, 1, 2.0);
        assert_abs_diff_eq!(p[(1, 1)], 0.1, epsilon = 1e-15);
    }

    #[test]
    fn test_inverse_spd() {
        let s = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let inv = robust_inverse(&s).unwrap();
        let id = &s * &inv;
        assert_abs_diff_eq!(id[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(id[(0, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_semidefinite_regularized() {
        let s = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let inv = robust_inverse(&s).unwrap();
        assert!(inv.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_inverse_rejects_negative_and_bad_shape() {
        let negative = DMatrix::<f64>::identity(2, 2) * -1.0;
        assert_eq!(robust_inverse(&negative).unwrap_err(), FusionError::SingularInnovation);
        let nan = DMatrix::from_element(2, 2, f64::NAN);
        assert_eq!(robust_inverse(&nan).unwrap_err(), FusionError::SingularInnovation);
        assert!(matches!(
            robust_inverse(&DMatrix::<f64>::zeros(2, 3)),
            Err(FusionError::InvalidDimension(_))
        ));
    }
}
