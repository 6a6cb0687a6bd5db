//! Rotation helpers.
//!
//! The orientation error is the rotation vector (axis × angle) of
//! `R_d · R_cᵀ`, i.e. the world-frame rotation that carries the current
//! orientation onto the desired one.  It is computed through a unit
//! quaternion, which stays well defined at a half turn where the
//! antisymmetric part of the error matrix vanishes.

use armlink_types::orthonormalize;
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Rotation of `angle` radians about the world x axis.
pub fn rotation_x(angle: f64) -> Matrix3<f64> {
    Rotation3::from_axis_angle(&Vector3::x_axis(), angle).into_inner()
}

/// Rotation of `angle` radians about the world y axis.
pub fn rotation_y(angle: f64) -> Matrix3<f64> {
    Rotation3::from_axis_angle(&Vector3::y_axis(), angle).into_inner()
}

/// Rotation of `angle` radians about the world z axis.
pub fn rotation_z(angle: f64) -> Matrix3<f64> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), angle).into_inner()
}

/// Rotation vector mapping `current` onto `desired`, expressed in the world
/// frame.  Its norm is the angle (in `[0, π]`).
pub fn orientation_error(desired: &Matrix3<f64>, current: &Matrix3<f64>) -> Vector3<f64> {
    let error = orthonormalize(&(desired * current.transpose()));
    let rotation = Rotation3::from_matrix_unchecked(error);
    UnitQuaternion::from_rotation_matrix(&rotation).scaled_axis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn identical_orientations_have_zero_error() {
        let r = rotation_x(PI) * rotation_z(0.4);
        assert!(orientation_error(&r, &r).norm() < 1e-12);
    }

    #[test]
    fn error_about_single_axis() {
        let current = rotation_x(PI);
        let desired = rotation_z(0.3) * current;
        let e = orientation_error(&desired, &current);
        assert!((e - Vector3::new(0.0, 0.0, 0.3)).norm() < 1e-9);
    }

    #[test]
    fn error_is_antisymmetric() {
        let a = rotation_y(0.2) * rotation_x(-0.7);
        let b = rotation_z(FRAC_PI_2);
        let ab = orientation_error(&a, &b);
        let ba = orientation_error(&b, &a);
        // e(b→a) is the inverse rotation of e(a→b), expressed in the world frame.
        assert!((ab + ba).norm() < 1e-9);
    }

    #[test]
    fn half_turn_error_has_full_magnitude() {
        let current = Matrix3::identity();
        let desired = rotation_y(PI);
        let e = orientation_error(&desired, &current);
        assert!((e.norm() - PI).abs() < 1e-9);
        assert!(e.x.abs() < 1e-9 && e.z.abs() < 1e-9);
    }
}
