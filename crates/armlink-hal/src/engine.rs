//! Generic `PhysicsEngine` trait for the simulated scene the arm lives in.
//!
//! Engine bindings implement this trait.  Names are resolved to integer ids
//! once (see [`ArmBinding`][crate::binding::ArmBinding]); every per-cycle
//! call after that is id-based.

use armlink_types::{ArmError, Pose};
use nalgebra::{DMatrix, DVector};

/// A steppable rigid-body simulation.
pub trait PhysicsEngine: Send {
    /// Resolve a joint name to its id.
    fn joint_id(&self, name: &str) -> Option<usize>;

    /// Resolve an actuator name to its id.
    fn actuator_id(&self, name: &str) -> Option<usize>;

    /// Resolve a site name to its id.
    fn site_id(&self, name: &str) -> Option<usize>;

    /// Integration timestep in seconds.
    fn timestep(&self) -> f64;

    /// Override the integration timestep.
    fn set_timestep(&mut self, dt: f64);

    /// Simulated time in seconds since the scene was created.
    fn time(&self) -> f64;

    fn joint_position(&self, joint: usize) -> f64;

    fn joint_velocity(&self, joint: usize) -> f64;

    /// Teleport a joint to `value` (used to seed the startup posture).
    fn set_joint_position(&mut self, joint: usize, value: f64);

    /// Write the command for one actuator.  Takes effect on the next
    /// [`step`][Self::step].
    fn set_control(&mut self, actuator: usize, value: f64);

    /// World pose of a site.
    fn site_pose(&self, site: usize) -> Pose;

    /// Move a site that is not attached to the kinematic chain.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Engine`] when the site is driven by the chain and
    /// cannot be written.
    fn set_site_pose(&mut self, site: usize, pose: &Pose) -> Result<(), ArmError>;

    /// 6×n Jacobian of a site with respect to the given joints, linear rows
    /// first.
    fn site_jacobian(&self, site: usize, joints: &[usize]) -> DMatrix<f64>;

    /// Gravity plus Coriolis generalized forces for the given joints.
    fn bias_forces(&self, joints: &[usize]) -> DVector<f64>;

    /// Advance the simulation by exactly one timestep.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Engine`] when the integration fails; the engine
    /// must leave its state usable for the next call.
    fn step(&mut self) -> Result<(), ArmError>;
}
