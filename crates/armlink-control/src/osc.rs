//! Operational-space controller.
//!
//! Converts a desired end-effector pose into joint torques:
//!
//! ```text
//! e      = [p_d − p ; log(R_d · Rᵀ)]
//! F      = Kp ∘ e − Kd ∘ (J · q̇)
//! τ      = Jᵀ F + (I − J⁺ J)ᵀ (k_n (q₀ − q) − d_n q̇) + bias
//! ```
//!
//! `J⁺` is the damped least-squares inverse from [`crate::dls`].  The
//! controller holds nothing but its gains and limits, so the same inputs
//! always produce the same command.

use armlink_types::{ArmError, ControlTarget, KinematicState, TorqueCommand};
use nalgebra::{DMatrix, DVector, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dls::damped_pseudo_inverse;
use crate::rotation::orientation_error;

/// Gripper actuator command for a fully closed grasp.
pub const GRIPPER_FULL_SCALE: f64 = 255.0;

const DEFAULT_SINGULAR_THRESHOLD: f64 = 1e-2;
const DEFAULT_MAX_DAMPING: f64 = 0.05;
const DEFAULT_TORQUE_LIMIT: f64 = 80.0;

// ────────────────────────────────────────────────────────────────────────────
// Gains
// ────────────────────────────────────────────────────────────────────────────

/// Per-axis task-space gains plus the nullspace posture gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscGains {
    pub kp_position: Vector3<f64>,
    pub kp_rotation: Vector3<f64>,
    pub kd_position: Vector3<f64>,
    pub kd_rotation: Vector3<f64>,
    pub kp_nullspace: f64,
    pub kd_nullspace: f64,
}

impl OscGains {
    /// Identical stiffness `kp` and damping `kd` on all six task axes.
    pub fn diagonal(kp: f64, kd: f64) -> Self {
        Self {
            kp_position: Vector3::repeat(kp),
            kp_rotation: Vector3::repeat(kp),
            kd_position: Vector3::repeat(kd),
            kd_rotation: Vector3::repeat(kd),
            ..Self::default()
        }
    }

    /// Separate translational and rotational stiffness with `kd = 2·√kp`.
    pub fn critically_damped(kp_position: f64, kp_rotation: f64) -> Self {
        Self {
            kp_position: Vector3::repeat(kp_position),
            kp_rotation: Vector3::repeat(kp_rotation),
            kd_position: Vector3::repeat(2.0 * kp_position.max(0.0).sqrt()),
            kd_rotation: Vector3::repeat(2.0 * kp_rotation.max(0.0).sqrt()),
            ..Self::default()
        }
    }

    /// Stack translational then rotational stiffness.
    pub fn kp(&self) -> Vector6<f64> {
        stack(&self.kp_position, &self.kp_rotation)
    }

    /// Stack translational then rotational damping.
    pub fn kd(&self) -> Vector6<f64> {
        stack(&self.kd_position, &self.kd_rotation)
    }
}

impl Default for OscGains {
    fn default() -> Self {
        Self {
            kp_position: Vector3::repeat(200.0),
            kp_rotation: Vector3::repeat(100.0),
            kd_position: Vector3::repeat(2.0 * 200.0_f64.sqrt()),
            kd_rotation: Vector3::repeat(2.0 * 100.0_f64.sqrt()),
            kp_nullspace: 10.0,
            kd_nullspace: 2.0 * 10.0_f64.sqrt(),
        }
    }
}

fn stack(linear: &Vector3<f64>, angular: &Vector3<f64>) -> Vector6<f64> {
    Vector6::new(linear.x, linear.y, linear.z, angular.x, angular.y, angular.z)
}

// ────────────────────────────────────────────────────────────────────────────
// Controller
// ────────────────────────────────────────────────────────────────────────────

/// One controller evaluation.
#[derive(Debug, Clone)]
pub struct ControlOutput {
    pub command: TorqueCommand,
    /// Position error followed by the orientation error (rotation vector).
    pub task_error: Vector6<f64>,
    /// Task-space wrench `F` before mapping through `Jᵀ`.
    pub task_force: Vector6<f64>,
    /// Smallest singular value of the Jacobian this cycle.
    pub min_singular_value: f64,
    /// Recoverable condition raised during this evaluation.
    pub warning: Option<ArmError>,
}

/// Task-space PD controller with nullspace posture control and gravity
/// compensation.
#[derive(Debug, Clone)]
pub struct OperationalSpaceController {
    gains: OscGains,
    posture: DVector<f64>,
    singular_threshold: f64,
    max_damping: f64,
    torque_limit: f64,
}

impl OperationalSpaceController {
    /// Create a controller pulling the redundant joints toward `posture`.
    pub fn new(gains: OscGains, posture: DVector<f64>) -> Self {
        Self {
            gains,
            posture,
            singular_threshold: DEFAULT_SINGULAR_THRESHOLD,
            max_damping: DEFAULT_MAX_DAMPING,
            torque_limit: DEFAULT_TORQUE_LIMIT,
        }
    }

    /// Engage Levenberg damping below `threshold`, up to `max_damping`.
    pub fn with_damping(mut self, threshold: f64, max_damping: f64) -> Self {
        self.singular_threshold = threshold;
        self.max_damping = max_damping;
        self
    }

    /// Largest per-joint control torque allowed while damping is engaged.
    pub fn with_torque_limit(mut self, limit: f64) -> Self {
        self.torque_limit = limit;
        self
    }

    pub fn gains(&self) -> &OscGains {
        &self.gains
    }

    pub fn set_gains(&mut self, gains: OscGains) {
        self.gains = gains;
    }

    pub fn posture(&self) -> &DVector<f64> {
        &self.posture
    }

    /// Compute the torque command driving the end-effector toward
    /// `target.pose`.
    ///
    /// Non-finite inputs produce a zero joint torque with an
    /// [`ArmError::NonFinite`] warning.  Near singularities the task and
    /// nullspace torque is clamped to the torque limit and an
    /// [`ArmError::SingularConfiguration`] warning is attached.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Engine`] when the state's dimensions disagree with
    /// each other or with the reference posture.
    pub fn compute_torque(
        &self,
        state: &KinematicState,
        target: &ControlTarget,
    ) -> Result<ControlOutput, ArmError> {
        let n = state.joints.len();
        self.check_shapes(state)?;
        let gripper = target.grasp_value() * GRIPPER_FULL_SCALE;

        if let Some(what) = first_non_finite(state, target) {
            return Ok(ControlOutput {
                command: TorqueCommand::zeros(n, gripper),
                task_error: Vector6::zeros(),
                task_force: Vector6::zeros(),
                min_singular_value: 0.0,
                warning: Some(ArmError::NonFinite(what.to_string())),
            });
        }

        let q = &state.joints.positions;
        let qd = &state.joints.velocities;
        let jac = &state.jacobian;

        let position_error = target.pose.position - state.eef_pose.position;
        let rotation_error = orientation_error(&target.pose.rotation, &state.eef_pose.rotation);
        let task_error = stack(&position_error, &rotation_error);

        let twist = jac * qd;
        let twist = Vector6::from_iterator(twist.iter().copied());
        let task_force = self.gains.kp().component_mul(&task_error)
            - self.gains.kd().component_mul(&twist);

        let task_force_dyn = DVector::from_column_slice(task_force.as_slice());
        let tau_task = jac.transpose() * task_force_dyn;

        let inverse = damped_pseudo_inverse(jac, self.singular_threshold, self.max_damping);
        let projector = DMatrix::<f64>::identity(n, n) - &inverse.matrix * jac;
        let posture_torque =
            (&self.posture - q) * self.gains.kp_nullspace - qd * self.gains.kd_nullspace;
        let tau_null = projector.transpose() * posture_torque;

        let mut tau = tau_task + tau_null;
        let mut warning = None;
        if inverse.is_damped() {
            clamp_magnitude(&mut tau, self.torque_limit);
            warning = Some(ArmError::SingularConfiguration {
                min_singular_value: inverse.min_singular_value,
            });
        }
        tau += &state.bias;

        trace!(
            position_error = position_error.norm(),
            rotation_error = rotation_error.norm(),
            min_singular_value = inverse.min_singular_value,
            "osc evaluated"
        );

        Ok(ControlOutput {
            command: TorqueCommand {
                joints: tau,
                gripper,
            },
            task_error,
            task_force,
            min_singular_value: inverse.min_singular_value,
            warning,
        })
    }

    fn check_shapes(&self, state: &KinematicState) -> Result<(), ArmError> {
        let n = state.joints.len();
        let shapes_agree = state.joints.velocities.len() == n
            && state.jacobian.shape() == (6, n)
            && state.bias.len() == n
            && self.posture.len() == n;
        if shapes_agree {
            Ok(())
        } else {
            Err(ArmError::Engine(format!(
                "kinematic state shape mismatch: {} joints, {} velocities, {}x{} jacobian, {} bias, {} posture",
                n,
                state.joints.velocities.len(),
                state.jacobian.nrows(),
                state.jacobian.ncols(),
                state.bias.len(),
                self.posture.len()
            )))
        }
    }
}

/// Scale `tau` so its largest entry does not exceed `limit` in magnitude.
fn clamp_magnitude(tau: &mut DVector<f64>, limit: f64) {
    let peak = tau.amax();
    if limit > 0.0 && peak > limit {
        *tau *= limit / peak;
    }
}

fn first_non_finite(state: &KinematicState, target: &ControlTarget) -> Option<&'static str> {
    if !state.joints.is_finite() {
        Some("joint state")
    } else if !state.eef_pose.is_finite() {
        Some("end-effector pose")
    } else if !state.jacobian.iter().all(|v| v.is_finite()) {
        Some("jacobian")
    } else if !state.bias.iter().all(|v| v.is_finite()) {
        Some("bias forces")
    } else if !target.pose.is_finite() {
        Some("target pose")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::{rotation_x, rotation_z};
    use armlink_types::{JointState, Pose};
    use std::f64::consts::PI;

    const N: usize = 7;

    fn jacobian() -> DMatrix<f64> {
        DMatrix::from_fn(6, N, |i, j| {
            ((i * N + j) as f64 * 0.37).sin() * 0.3 + if i == j { 1.0 } else { 0.0 }
        })
    }

    fn q0() -> DVector<f64> {
        DVector::from_vec(vec![0.0, 0.2686, 0.0, -1.5423, 0.0, 1.3307, 0.0])
    }

    fn eef() -> Pose {
        Pose::new(Vector3::new(0.5, 0.0, 0.4), rotation_x(PI))
    }

    fn state_at(q: DVector<f64>, qd: DVector<f64>) -> KinematicState {
        KinematicState {
            joints: JointState::new(q, qd),
            eef_pose: eef(),
            jacobian: jacobian(),
            bias: DVector::from_fn(N, |i, _| 0.5 * i as f64 - 1.0),
        }
    }

    fn resting_state() -> KinematicState {
        state_at(q0(), DVector::zeros(N))
    }

    #[test]
    fn zero_error_at_reference_posture_yields_gravity_compensation() {
        let controller = OperationalSpaceController::new(OscGains::default(), q0());
        let state = resting_state();
        let out = controller
            .compute_torque(&state, &ControlTarget::at(eef()))
            .unwrap();

        assert!(out.task_error.norm() < 1e-12);
        assert!(out.warning.is_none());
        assert!((&out.command.joints - &state.bias).norm() < 1e-9);
    }

    #[test]
    fn matching_pose_with_zero_velocity_gives_zero_wrench() {
        let controller = OperationalSpaceController::new(OscGains::diagonal(100.0, 10.0), q0());
        let state = resting_state();
        let out = controller
            .compute_torque(&state, &ControlTarget::at(eef()))
            .unwrap();
        assert!(out.task_force.norm() < 1e-12);
    }

    #[test]
    fn position_offset_produces_proportional_force() {
        let controller = OperationalSpaceController::new(OscGains::diagonal(100.0, 10.0), q0());
        let mut desired = eef();
        desired.position.x += 0.1;
        let out = controller
            .compute_torque(&resting_state(), &ControlTarget::at(desired))
            .unwrap();

        assert!((out.task_force[0] - 10.0).abs() < 1e-9);
        assert!(out.task_force.rows(1, 5).norm() < 1e-9);
    }

    #[test]
    fn orientation_offset_drives_rotational_rows() {
        let controller = OperationalSpaceController::new(OscGains::diagonal(100.0, 10.0), q0());
        let current = eef();
        let desired = Pose::new(current.position, rotation_z(0.2) * current.rotation);
        let out = controller
            .compute_torque(&resting_state(), &ControlTarget::at(desired))
            .unwrap();

        assert!(out.task_force.rows(0, 5).norm() < 1e-9);
        assert!((out.task_force[5] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn joint_velocity_is_damped_in_task_space() {
        let controller = OperationalSpaceController::new(OscGains::diagonal(100.0, 10.0), q0());
        let qd = DVector::from_element(N, 0.1);
        let state = state_at(q0(), qd.clone());
        let out = controller
            .compute_torque(&state, &ControlTarget::at(eef()))
            .unwrap();

        let twist = jacobian() * qd;
        for i in 0..6 {
            assert!((out.task_force[i] + 10.0 * twist[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn nullspace_torque_produces_no_task_force() {
        let gains = OscGains {
            kp_nullspace: 25.0,
            ..OscGains::diagonal(100.0, 10.0)
        };
        let controller = OperationalSpaceController::new(gains, q0());
        let mut q = q0();
        q[0] += 0.3;
        q[4] -= 0.2;
        let state = state_at(q, DVector::zeros(N));
        let out = controller
            .compute_torque(&state, &ControlTarget::at(eef()))
            .unwrap();

        let nullspace = &out.command.joints - &state.bias;
        assert!(nullspace.norm() > 1e-3);
        let inverse = damped_pseudo_inverse(&jacobian(), 1e-2, 0.05);
        let leaked = inverse.matrix.transpose() * nullspace;
        assert!(leaked.norm() < 1e-9);
    }

    #[test]
    fn singular_jacobian_stays_finite_and_clamped() {
        let controller = OperationalSpaceController::new(OscGains::default(), q0())
            .with_torque_limit(20.0);
        let mut state = resting_state();
        state.jacobian = DMatrix::zeros(6, N);
        let mut desired = eef();
        desired.position.z += 0.3;

        let out = controller
            .compute_torque(&state, &ControlTarget::at(desired))
            .unwrap();

        assert!(out.command.is_finite());
        assert!(matches!(
            out.warning,
            Some(ArmError::SingularConfiguration { .. })
        ));
        let control = &out.command.joints - &state.bias;
        assert!(control.amax() <= 20.0 + 1e-9);
    }

    #[test]
    fn rank_deficient_jacobian_never_yields_non_finite_torque() {
        let controller = OperationalSpaceController::new(OscGains::default(), q0());
        let mut state = resting_state();
        let row = state.jacobian.row(2).into_owned();
        state.jacobian.set_row(3, &row);
        state.jacobian.set_row(4, &row);
        let mut desired = eef();
        desired.position.y -= 0.2;

        let out = controller
            .compute_torque(&state, &ControlTarget::at(desired))
            .unwrap();
        assert!(out.command.is_finite());
    }

    #[test]
    fn non_finite_input_yields_zero_torque_and_warning() {
        let controller = OperationalSpaceController::new(OscGains::default(), q0());
        let mut q = q0();
        q[2] = f64::NAN;
        let state = state_at(q, DVector::zeros(N));
        let out = controller
            .compute_torque(&state, &ControlTarget::at(eef()))
            .unwrap();

        assert_eq!(out.command.joints, DVector::zeros(N));
        assert!(matches!(out.warning, Some(ArmError::NonFinite(_))));
    }

    #[test]
    fn grasp_closes_gripper_at_full_scale() {
        let controller = OperationalSpaceController::new(OscGains::default(), q0());
        let mut target = ControlTarget::at(eef());
        target.grasp = true;
        let out = controller.compute_torque(&resting_state(), &target).unwrap();
        assert_eq!(out.command.gripper, 255.0);
    }

    #[test]
    fn mismatched_posture_is_rejected() {
        let controller = OperationalSpaceController::new(OscGains::default(), DVector::zeros(3));
        let result = controller.compute_torque(&resting_state(), &ControlTarget::at(eef()));
        assert!(matches!(result, Err(ArmError::Engine(_))));
    }

    #[test]
    fn critically_damped_gains() {
        let gains = OscGains::critically_damped(400.0, 100.0);
        assert_eq!(gains.kd_position, Vector3::repeat(40.0));
        assert_eq!(gains.kd_rotation, Vector3::repeat(20.0));
    }
}
