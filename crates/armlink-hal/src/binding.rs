//! [`ArmBinding`] – name resolution and per-cycle engine access.
//!
//! The binding resolves every configured joint, actuator and site name to
//! the engine's integer ids exactly once, at startup.  A name the engine
//! does not know is a [`ArmError::FatalConfiguration`]: the loop must never
//! start with a partial binding.  After resolution the index mapping never
//! changes.
//!
//! # Actuator mapping
//!
//! Each controlled joint is driven by an actuator with the same name as the
//! joint.  The gripper is a separate actuator addressed by its own name.

use armlink_types::{ArmError, JointState, KinematicState, Pose, TorqueCommand};
use nalgebra::DVector;

use crate::engine::PhysicsEngine;

/// Names of everything the control loop touches in the scene.
#[derive(Debug, Clone)]
pub struct ArmLayout {
    pub joint_names: Vec<String>,
    pub eef_site: String,
    pub target_site: String,
    pub gripper_actuator: String,
}

/// Resolved engine ids for an [`ArmLayout`].
#[derive(Debug, Clone)]
pub struct ArmBinding {
    joint_names: Vec<String>,
    dof_ids: Vec<usize>,
    actuator_ids: Vec<usize>,
    gripper_id: usize,
    eef_site: usize,
    target_site: usize,
}

impl ArmBinding {
    /// Resolve `layout` against `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::FatalConfiguration`] listing every name the engine
    /// does not know.
    pub fn resolve<E: PhysicsEngine + ?Sized>(
        engine: &E,
        layout: &ArmLayout,
    ) -> Result<Self, ArmError> {
        if layout.joint_names.is_empty() {
            return Err(ArmError::FatalConfiguration(
                "no joints configured".to_string(),
            ));
        }

        let mut missing = Vec::new();
        let mut dof_ids = Vec::with_capacity(layout.joint_names.len());
        let mut actuator_ids = Vec::with_capacity(layout.joint_names.len());

        for name in &layout.joint_names {
            match engine.joint_id(name) {
                Some(id) => dof_ids.push(id),
                None => missing.push(format!("joint '{name}'")),
            }
            match engine.actuator_id(name) {
                Some(id) => actuator_ids.push(id),
                None => missing.push(format!("actuator '{name}'")),
            }
        }
        let gripper_id = engine.actuator_id(&layout.gripper_actuator);
        if gripper_id.is_none() {
            missing.push(format!("actuator '{}'", layout.gripper_actuator));
        }
        let eef_site = engine.site_id(&layout.eef_site);
        if eef_site.is_none() {
            missing.push(format!("site '{}'", layout.eef_site));
        }
        let target_site = engine.site_id(&layout.target_site);
        if target_site.is_none() {
            missing.push(format!("site '{}'", layout.target_site));
        }

        match (gripper_id, eef_site, target_site) {
            (Some(gripper_id), Some(eef_site), Some(target_site)) if missing.is_empty() => {
                Ok(Self {
                    joint_names: layout.joint_names.clone(),
                    dof_ids,
                    actuator_ids,
                    gripper_id,
                    eef_site,
                    target_site,
                })
            }
            _ => Err(ArmError::FatalConfiguration(format!(
                "unknown names in scene: {}",
                missing.join(", ")
            ))),
        }
    }

    /// Number of controlled joints.
    pub fn joint_count(&self) -> usize {
        self.dof_ids.len()
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    /// Index of `name` within [`JointState`] vectors.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.joint_names.iter().position(|n| n == name)
    }

    pub fn target_site(&self) -> usize {
        self.target_site
    }

    /// Snapshot the controlled joints.
    pub fn read_joints<E: PhysicsEngine + ?Sized>(&self, engine: &E) -> JointState {
        let q = DVector::from_iterator(
            self.dof_ids.len(),
            self.dof_ids.iter().map(|&id| engine.joint_position(id)),
        );
        let qd = DVector::from_iterator(
            self.dof_ids.len(),
            self.dof_ids.iter().map(|&id| engine.joint_velocity(id)),
        );
        JointState::new(q, qd)
    }

    /// Snapshot everything the controller needs for this instant.
    pub fn kinematics<E: PhysicsEngine + ?Sized>(&self, engine: &E) -> KinematicState {
        KinematicState {
            joints: self.read_joints(engine),
            eef_pose: engine.site_pose(self.eef_site),
            jacobian: engine.site_jacobian(self.eef_site, &self.dof_ids),
            bias: engine.bias_forces(&self.dof_ids),
        }
    }

    /// Write a torque command into the joint and gripper actuators.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Engine`] when the command has the wrong length.
    pub fn apply<E: PhysicsEngine + ?Sized>(
        &self,
        engine: &mut E,
        command: &TorqueCommand,
    ) -> Result<(), ArmError> {
        if command.joints.len() != self.actuator_ids.len() {
            return Err(ArmError::Engine(format!(
                "torque command has {} entries, expected {}",
                command.joints.len(),
                self.actuator_ids.len()
            )));
        }
        for (&id, &tau) in self.actuator_ids.iter().zip(command.joints.iter()) {
            engine.set_control(id, tau);
        }
        engine.set_control(self.gripper_id, command.gripper);
        Ok(())
    }

    /// Teleport the controlled joints to `posture`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::FatalConfiguration`] when `posture` does not have
    /// one entry per joint.
    pub fn seed_posture<E: PhysicsEngine + ?Sized>(
        &self,
        engine: &mut E,
        posture: &DVector<f64>,
    ) -> Result<(), ArmError> {
        if posture.len() != self.dof_ids.len() {
            return Err(ArmError::FatalConfiguration(format!(
                "reference posture has {} entries, expected {}",
                posture.len(),
                self.dof_ids.len()
            )));
        }
        for (&id, &q) in self.dof_ids.iter().zip(posture.iter()) {
            engine.set_joint_position(id, q);
        }
        Ok(())
    }

    /// Current pose of the target site as integrated by the scene.
    pub fn target_pose<E: PhysicsEngine + ?Sized>(&self, engine: &E) -> Pose {
        let raw = engine.site_pose(self.target_site);
        Pose::new(raw.position, raw.rotation)
    }

    /// Move the target site.
    pub fn write_target<E: PhysicsEngine + ?Sized>(
        &self,
        engine: &mut E,
        pose: &Pose,
    ) -> Result<(), ArmError> {
        engine.set_site_pose(self.target_site, pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimArm;
    use nalgebra::Vector3;

    fn layout() -> ArmLayout {
        ArmLayout {
            joint_names: (1..=7).map(|i| format!("joint{i}")).collect(),
            eef_site: "eef".to_string(),
            target_site: "eef_target".to_string(),
            gripper_actuator: "fingers_actuator".to_string(),
        }
    }

    #[test]
    fn resolve_maps_every_name() {
        let arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        assert_eq!(binding.joint_count(), 7);
        assert_eq!(binding.index_of("joint3"), Some(2));
        assert_eq!(binding.index_of("joint99"), None);
    }

    #[test]
    fn resolve_reports_all_missing_names_as_fatal() {
        let arm = SimArm::seven_dof();
        let mut bad = layout();
        bad.joint_names.push("joint8".to_string());
        bad.eef_site = "tool_tip".to_string();

        let err = ArmBinding::resolve(&arm, &bad).unwrap_err();
        assert!(err.is_fatal());
        let msg = err.to_string();
        assert!(msg.contains("joint 'joint8'"));
        assert!(msg.contains("site 'tool_tip'"));
    }

    #[test]
    fn resolve_rejects_empty_joint_list() {
        let arm = SimArm::seven_dof();
        let mut bad = layout();
        bad.joint_names.clear();
        assert!(ArmBinding::resolve(&arm, &bad).unwrap_err().is_fatal());
    }

    #[test]
    fn seed_posture_sets_joint_positions() {
        let mut arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        let q0 = DVector::from_vec(vec![0.0, 0.2686, 0.0, -1.5423, 0.0, 1.3307, 0.0]);
        binding.seed_posture(&mut arm, &q0).unwrap();
        assert_eq!(binding.read_joints(&arm).positions, q0);
    }

    #[test]
    fn seed_posture_rejects_wrong_length() {
        let mut arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        let err = binding
            .seed_posture(&mut arm, &DVector::zeros(3))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn apply_rejects_wrong_length() {
        let mut arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        let result = binding.apply(&mut arm, &TorqueCommand::zeros(6, 0.0));
        assert!(matches!(result, Err(ArmError::Engine(_))));
    }

    #[test]
    fn target_site_roundtrip() {
        let mut arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        let pose = Pose::from_position(Vector3::new(0.5, 0.0, 0.4));
        binding.write_target(&mut arm, &pose).unwrap();
        assert_eq!(binding.target_pose(&arm).position, pose.position);
    }

    #[test]
    fn kinematics_shapes_match_joint_count() {
        let arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        let state = binding.kinematics(&arm);
        assert_eq!(state.jacobian.nrows(), 6);
        assert_eq!(state.jacobian.ncols(), 7);
        assert_eq!(state.bias.len(), 7);
        assert_eq!(state.joints.len(), 7);
    }
}
