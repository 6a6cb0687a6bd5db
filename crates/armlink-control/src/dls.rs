//! Damped least-squares pseudo-inverse.
//!
//! Away from singularities the result is the Moore–Penrose pseudo-inverse.
//! When the smallest singular value drops below `threshold` a Levenberg
//! damping term is blended in,
//!
//! ```text
//! λ² = (1 − (σ_min / threshold)²) · λ_max²
//! J⁺ = V · diag(σᵢ / (σᵢ² + λ²)) · Uᵀ
//! ```
//!
//! so the inverse grows smoothly toward a bounded value instead of blowing up
//! as `σ_min → 0`.

use nalgebra::DMatrix;

/// Result of [`damped_pseudo_inverse`].
#[derive(Debug, Clone)]
pub struct DampedInverse {
    /// n×m damped pseudo-inverse of the m×n input.
    pub matrix: DMatrix<f64>,
    /// Smallest singular value of the input.
    pub min_singular_value: f64,
    /// Damping λ² that was applied; zero away from singularities.
    pub damping: f64,
}

impl DampedInverse {
    /// `true` when the damping floor was engaged.
    pub fn is_damped(&self) -> bool {
        self.damping > 0.0
    }
}

/// Compute the damped pseudo-inverse of `j`.
///
/// Always returns a finite matrix for finite input, including zero and
/// rank-deficient matrices.
pub fn damped_pseudo_inverse(j: &DMatrix<f64>, threshold: f64, max_damping: f64) -> DampedInverse {
    let (rows, cols) = j.shape();
    let svd = j.clone().svd(true, true);

    let min_singular_value = if svd.singular_values.is_empty() {
        0.0
    } else {
        svd.singular_values.min()
    };
    // Rank-deficient wide matrices hide the missing singular values; count
    // them as zero.
    let min_singular_value = if svd.singular_values.len() < rows.min(cols) {
        0.0
    } else {
        min_singular_value
    };

    let damping = if threshold > 0.0 && min_singular_value < threshold {
        let ratio = min_singular_value / threshold;
        (1.0 - ratio * ratio) * max_damping * max_damping
    } else {
        0.0
    };

    let matrix = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let k = svd.singular_values.len();
            let mut sigma_inv = DMatrix::zeros(k, k);
            for (i, &s) in svd.singular_values.iter().enumerate() {
                let denom = s * s + damping;
                if denom > f64::MIN_POSITIVE && s > 0.0 {
                    sigma_inv[(i, i)] = s / denom;
                }
            }
            v_t.transpose() * sigma_inv * u.transpose()
        }
        _ => DMatrix::zeros(cols, rows),
    };

    DampedInverse {
        matrix,
        min_singular_value,
        damping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_conditioned() -> DMatrix<f64> {
        DMatrix::from_fn(6, 7, |i, j| {
            ((i * 7 + j) as f64 * 0.37).sin() * 0.3 + if i == j { 1.0 } else { 0.0 }
        })
    }

    #[test]
    fn undamped_for_well_conditioned_matrix() {
        let j = well_conditioned();
        let inv = damped_pseudo_inverse(&j, 1e-3, 0.05);
        assert!(!inv.is_damped());
        let identity = &j * &inv.matrix;
        assert!((identity - DMatrix::<f64>::identity(6, 6)).norm() < 1e-9);
    }

    #[test]
    fn zero_matrix_yields_finite_zero_inverse() {
        let j = DMatrix::<f64>::zeros(6, 7);
        let inv = damped_pseudo_inverse(&j, 1e-3, 0.05);
        assert!(inv.is_damped());
        assert_eq!(inv.matrix.shape(), (7, 6));
        assert!(inv.matrix.iter().all(|v| v.is_finite()));
        assert_eq!(inv.matrix.norm(), 0.0);
    }

    #[test]
    fn rank_deficient_matrix_stays_bounded() {
        let mut j = well_conditioned();
        // Make two rows identical: rank 5.
        let row = j.row(0).into_owned();
        j.set_row(1, &row);
        let inv = damped_pseudo_inverse(&j, 1e-3, 0.05);
        assert!(inv.is_damped());
        assert!(inv.min_singular_value < 1e-9);
        assert!(inv.matrix.iter().all(|v| v.is_finite()));
        // Bounded by 1 / (2 λ) for the damped directions.
        assert!(inv.matrix.norm() < 1e3);
    }

    #[test]
    fn near_singular_matrix_is_smoothly_damped() {
        let mut j = well_conditioned();
        let row = j.row(0).into_owned() * (1.0 + 1e-7);
        j.set_row(1, &row);
        let inv = damped_pseudo_inverse(&j, 1e-2, 0.05);
        assert!(inv.is_damped());
        assert!(inv.damping <= 0.05 * 0.05);
        assert!(inv.matrix.iter().all(|v| v.is_finite()));
    }
}
