//! In-process simulated arm and camera rig for headless runs and CI.
//!
//! [`SimArm`] is a serial chain of revolute joints with a diagonal, constant
//! joint-space inertia, viscous joint friction and point link masses under
//! gravity.  It is deliberately simple (no contacts, no Coriolis coupling)
//! but exposes exactly the surface the control loop needs: joint state,
//! actuator commands, site poses, a geometric Jacobian and gravity bias
//! forces consistent with its own dynamics.
//!
//! [`SimCameraRig`] returns synthetic color and linear-depth frames and can
//! be told to fail on specific cameras.
//!
//! # Example
//!
//! ```rust
//! use armlink_hal::engine::PhysicsEngine;
//! use armlink_hal::sim::SimArm;
//!
//! let mut arm = SimArm::seven_dof();
//! let eef = arm.site_id("eef").unwrap();
//! let before = arm.site_pose(eef);
//! arm.step().expect("sim step must succeed");
//! assert!(arm.time() > 0.0);
//! # let _ = before;
//! ```

use std::collections::HashSet;
use std::f64::consts::PI;

use armlink_types::{ArmError, ColorImage, DepthImage, Pose};
use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Unit, Vector3};

use crate::camera::RenderSurface;
use crate::engine::PhysicsEngine;

const DEFAULT_TIMESTEP: f64 = 0.002;
/// Finger travel from fully open to fully closed, in metres.
const GRIPPER_TRAVEL: f64 = 0.04;
/// First-order rate at which the fingers track their command, in 1/s.
const GRIPPER_RATE: f64 = 25.0;
/// Actuator command that closes the gripper completely.
const GRIPPER_FULL_SCALE: f64 = 255.0;

// ────────────────────────────────────────────────────────────────────────────
// Joint description
// ────────────────────────────────────────────────────────────────────────────

/// Description of one revolute joint of a [`SimArm`].
#[derive(Debug, Clone)]
pub struct SimJointSpec {
    name: String,
    /// Translation from the previous joint frame to this joint, expressed in
    /// the previous frame.
    offset: Vector3<f64>,
    /// Rotation axis in the local frame.
    axis: Unit<Vector3<f64>>,
    inertia: f64,
    damping: f64,
    /// Point mass carried at the far end of the link this joint drives.
    link_mass: f64,
}

impl SimJointSpec {
    /// A revolute joint with unit inertia, light friction and a 1 kg link.
    pub fn revolute(name: impl Into<String>, offset: [f64; 3], axis: [f64; 3]) -> Self {
        Self {
            name: name.into(),
            offset: Vector3::from(offset),
            axis: Unit::new_normalize(Vector3::from(axis)),
            inertia: 1.0,
            damping: 0.5,
            link_mass: 1.0,
        }
    }

    pub fn with_inertia(mut self, inertia: f64) -> Self {
        self.inertia = inertia;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_link_mass(mut self, mass: f64) -> Self {
        self.link_mass = mass;
        self
    }
}

#[derive(Debug, Clone)]
struct SimJoint {
    spec: SimJointSpec,
    q: f64,
    qd: f64,
    ctrl: f64,
}

#[derive(Debug, Clone)]
enum SiteKind {
    /// Rigidly attached to the last link through the tool transform.
    EndEffector,
    /// Free-floating, moved only by writes.
    Free(Pose),
}

#[derive(Debug, Clone)]
struct SimSite {
    name: String,
    kind: SiteKind,
}

/// World-frame quantities of the chain for the current joint positions.
struct ChainFrames {
    origins: Vec<Vector3<f64>>,
    axes: Vec<Vector3<f64>>,
    mass_points: Vec<Vector3<f64>>,
    eef: Pose,
}

// ────────────────────────────────────────────────────────────────────────────
// SimArm
// ────────────────────────────────────────────────────────────────────────────

/// A simulated serial arm with a gripper and named sites.
///
/// Joint actuators are torque motors named after their joints; the gripper
/// actuator takes a `0..=255` closing command.
#[derive(Debug, Clone)]
pub struct SimArm {
    joints: Vec<SimJoint>,
    tool: Pose,
    sites: Vec<SimSite>,
    gripper_name: String,
    gripper_ctrl: f64,
    gripper_closure: f64,
    gravity: Vector3<f64>,
    dt: f64,
    time: f64,
}

impl SimArm {
    /// Start describing a custom arm.
    pub fn builder() -> SimArmBuilder {
        SimArmBuilder::default()
    }

    /// A redundant 7-DOF arm with joints `joint1`..`joint7`, an `eef` site,
    /// a free `eef_target` site and a `fingers_actuator` gripper.
    ///
    /// At the posture `[0, 0.2686, 0, -1.5423, 0, 1.3307, 0]` the `eef` site
    /// sits near `(0.47, 0, 0.40)` with its z axis pointing straight down.
    pub fn seven_dof() -> Self {
        Self::builder()
            .with_joint(
                SimJointSpec::revolute("joint1", [0.0, 0.0, 0.333], [0.0, 0.0, 1.0])
                    .with_inertia(0.5)
                    .with_link_mass(4.0),
            )
            .with_joint(
                SimJointSpec::revolute("joint2", [0.0, 0.0, 0.0], [0.0, 1.0, 0.0])
                    .with_inertia(0.5)
                    .with_link_mass(4.0),
            )
            .with_joint(
                SimJointSpec::revolute("joint3", [0.0, 0.0, 0.316], [0.0, 0.0, 1.0])
                    .with_inertia(0.4)
                    .with_link_mass(3.0),
            )
            .with_joint(
                SimJointSpec::revolute("joint4", [0.0825, 0.0, 0.0], [0.0, -1.0, 0.0])
                    .with_inertia(0.4)
                    .with_link_mass(3.0),
            )
            .with_joint(
                SimJointSpec::revolute("joint5", [-0.0825, 0.0, 0.384], [0.0, 0.0, 1.0])
                    .with_inertia(0.2)
                    .with_link_mass(2.0),
            )
            .with_joint(
                SimJointSpec::revolute("joint6", [0.0, 0.0, 0.0], [0.0, 1.0, 0.0])
                    .with_inertia(0.2)
                    .with_link_mass(1.5),
            )
            .with_joint(
                SimJointSpec::revolute("joint7", [0.088, 0.0, 0.0], [0.0, 0.0, 1.0])
                    .with_inertia(0.1)
                    .with_link_mass(0.5),
            )
            .with_tool(Pose::new(
                Vector3::new(0.0, 0.0, 0.2),
                Rotation3::from_axis_angle(&Vector3::z_axis(), PI).into_inner(),
            ))
            .with_site("eef_target", Pose::identity())
            .build()
    }

    /// Closing fraction of the gripper, `0.0` open to `1.0` closed.
    pub fn gripper_closure(&self) -> f64 {
        self.gripper_closure / GRIPPER_TRAVEL
    }

    fn gripper_actuator_id(&self) -> usize {
        self.joints.len()
    }

    fn frames(&self) -> ChainFrames {
        let n = self.joints.len();
        let mut origins = Vec::with_capacity(n);
        let mut axes = Vec::with_capacity(n);
        let mut p = Vector3::zeros();
        let mut r = Matrix3::identity();

        for joint in &self.joints {
            p += r * joint.spec.offset;
            origins.push(p);
            axes.push(r * joint.spec.axis.into_inner());
            r *= Rotation3::from_axis_angle(&joint.spec.axis, joint.q).into_inner();
        }

        let eef_position = p + r * self.tool.position;
        let eef_rotation = r * self.tool.rotation;

        // Link i's mass sits at the next joint origin; the last link's at the
        // end-effector.
        let mut mass_points: Vec<Vector3<f64>> = origins.iter().skip(1).copied().collect();
        mass_points.push(eef_position);

        ChainFrames {
            origins,
            axes,
            mass_points,
            eef: Pose {
                position: eef_position,
                rotation: eef_rotation,
            },
        }
    }

    /// Generalized gravity force acting on every joint.
    fn gravity_forces(&self, frames: &ChainFrames) -> DVector<f64> {
        let n = self.joints.len();
        DVector::from_fn(n, |i, _| {
            let (o, a) = (frames.origins[i], frames.axes[i]);
            (i..n)
                .map(|k| {
                    let force = self.joints[k].spec.link_mass * self.gravity;
                    a.dot(&(frames.mass_points[k] - o).cross(&force))
                })
                .sum()
        })
    }
}

impl PhysicsEngine for SimArm {
    fn joint_id(&self, name: &str) -> Option<usize> {
        self.joints.iter().position(|j| j.spec.name == name)
    }

    fn actuator_id(&self, name: &str) -> Option<usize> {
        if name == self.gripper_name {
            return Some(self.gripper_actuator_id());
        }
        self.joint_id(name)
    }

    fn site_id(&self, name: &str) -> Option<usize> {
        self.sites.iter().position(|s| s.name == name)
    }

    fn timestep(&self) -> f64 {
        self.dt
    }

    fn set_timestep(&mut self, dt: f64) {
        self.dt = dt;
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn joint_position(&self, joint: usize) -> f64 {
        self.joints.get(joint).map_or(0.0, |j| j.q)
    }

    fn joint_velocity(&self, joint: usize) -> f64 {
        self.joints.get(joint).map_or(0.0, |j| j.qd)
    }

    fn set_joint_position(&mut self, joint: usize, value: f64) {
        if let Some(j) = self.joints.get_mut(joint) {
            j.q = value;
            j.qd = 0.0;
        }
    }

    fn set_control(&mut self, actuator: usize, value: f64) {
        if actuator == self.gripper_actuator_id() {
            self.gripper_ctrl = value;
        } else if let Some(j) = self.joints.get_mut(actuator) {
            j.ctrl = value;
        }
    }

    fn site_pose(&self, site: usize) -> Pose {
        match self.sites.get(site).map(|s| &s.kind) {
            Some(SiteKind::EndEffector) => self.frames().eef,
            Some(SiteKind::Free(pose)) => *pose,
            None => Pose::identity(),
        }
    }

    fn set_site_pose(&mut self, site: usize, pose: &Pose) -> Result<(), ArmError> {
        match self.sites.get_mut(site) {
            Some(SimSite {
                kind: SiteKind::Free(current),
                ..
            }) => {
                *current = *pose;
                Ok(())
            }
            Some(SimSite { name, .. }) => Err(ArmError::Engine(format!(
                "site '{name}' is attached to the chain and cannot be written"
            ))),
            None => Err(ArmError::Engine(format!("site id {site} does not exist"))),
        }
    }

    fn site_jacobian(&self, site: usize, joints: &[usize]) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(6, joints.len());
        if !matches!(self.sites.get(site).map(|s| &s.kind), Some(SiteKind::EndEffector)) {
            return jac;
        }
        let frames = self.frames();
        for (col, &id) in joints.iter().enumerate() {
            let (Some(o), Some(a)) = (frames.origins.get(id), frames.axes.get(id)) else {
                continue;
            };
            let linear = a.cross(&(frames.eef.position - o));
            jac.fixed_view_mut::<3, 1>(0, col).copy_from(&linear);
            jac.fixed_view_mut::<3, 1>(3, col).copy_from(a);
        }
        jac
    }

    fn bias_forces(&self, joints: &[usize]) -> DVector<f64> {
        let gravity = self.gravity_forces(&self.frames());
        // Holding torque is the negated gravity force; there is no Coriolis
        // term with a constant diagonal inertia.
        DVector::from_iterator(
            joints.len(),
            joints.iter().map(|&id| gravity.get(id).map_or(0.0, |g| -g)),
        )
    }

    fn step(&mut self) -> Result<(), ArmError> {
        let saved: Vec<(f64, f64)> = self.joints.iter().map(|j| (j.q, j.qd)).collect();
        let gravity = self.gravity_forces(&self.frames());
        let dt = self.dt;

        for (joint, g) in self.joints.iter_mut().zip(gravity.iter()) {
            let spec = &joint.spec;
            let qdd = (joint.ctrl + g - spec.damping * joint.qd) / spec.inertia;
            // Semi-implicit Euler.
            joint.qd += dt * qdd;
            joint.q += dt * joint.qd;
        }

        if self
            .joints
            .iter()
            .any(|j| !j.q.is_finite() || !j.qd.is_finite())
        {
            for (joint, (q, qd)) in self.joints.iter_mut().zip(saved) {
                joint.q = q;
                joint.qd = qd;
            }
            return Err(ArmError::Engine(format!(
                "integration diverged at t={:.4}s; step discarded",
                self.time
            )));
        }

        let command = if self.gripper_ctrl.is_finite() {
            (self.gripper_ctrl / GRIPPER_FULL_SCALE).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let goal = command * GRIPPER_TRAVEL;
        self.gripper_closure += (goal - self.gripper_closure) * (GRIPPER_RATE * dt).min(1.0);

        self.time += dt;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimArm builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for custom [`SimArm`] chains.
///
/// The end-effector site is always registered first (as `"eef"` unless
/// renamed) and the gripper actuator defaults to `"fingers_actuator"`.
pub struct SimArmBuilder {
    joints: Vec<SimJointSpec>,
    tool: Pose,
    eef_site: String,
    sites: Vec<(String, Pose)>,
    gripper_name: String,
    gravity: Vector3<f64>,
    dt: f64,
}

impl Default for SimArmBuilder {
    fn default() -> Self {
        Self {
            joints: Vec::new(),
            tool: Pose::identity(),
            eef_site: "eef".to_string(),
            sites: Vec::new(),
            gripper_name: "fingers_actuator".to_string(),
            gravity: Vector3::new(0.0, 0.0, -9.81),
            dt: DEFAULT_TIMESTEP,
        }
    }
}

impl SimArmBuilder {
    /// Append a joint to the end of the chain.
    pub fn with_joint(mut self, joint: SimJointSpec) -> Self {
        self.joints.push(joint);
        self
    }

    /// Transform from the last joint frame to the end-effector site.
    pub fn with_tool(mut self, tool: Pose) -> Self {
        self.tool = tool;
        self
    }

    pub fn with_eef_site(mut self, name: impl Into<String>) -> Self {
        self.eef_site = name.into();
        self
    }

    /// Register a free-floating site at `pose`.
    pub fn with_site(mut self, name: impl Into<String>, pose: Pose) -> Self {
        self.sites.push((name.into(), pose));
        self
    }

    pub fn with_gripper(mut self, name: impl Into<String>) -> Self {
        self.gripper_name = name.into();
        self
    }

    pub fn with_gravity(mut self, gravity: [f64; 3]) -> Self {
        self.gravity = Vector3::from(gravity);
        self
    }

    pub fn with_timestep(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn build(self) -> SimArm {
        let mut sites = vec![SimSite {
            name: self.eef_site,
            kind: SiteKind::EndEffector,
        }];
        sites.extend(self.sites.into_iter().map(|(name, pose)| SimSite {
            name,
            kind: SiteKind::Free(pose),
        }));

        SimArm {
            joints: self
                .joints
                .into_iter()
                .map(|spec| SimJoint {
                    spec,
                    q: 0.0,
                    qd: 0.0,
                    ctrl: 0.0,
                })
                .collect(),
            tool: self.tool,
            sites,
            gripper_name: self.gripper_name,
            gripper_ctrl: 0.0,
            gripper_closure: 0.0,
            gravity: self.gravity,
            dt: self.dt,
            time: 0.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera rig
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimCamera {
    name: String,
    /// Distance of the synthetic depth plane, in metres.
    depth_m: f32,
}

/// A simulated multi-camera rig producing synthetic frames.
///
/// Color frames are a gradient whose blue channel advances with every
/// render; depth frames are a flat plane at the camera's configured
/// distance.
#[derive(Debug, Clone)]
pub struct SimCameraRig {
    width: u32,
    height: u32,
    cameras: Vec<SimCamera>,
    failing: HashSet<String>,
    renders: u64,
}

impl SimCameraRig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cameras: Vec::new(),
            failing: HashSet::new(),
            renders: 0,
        }
    }

    /// Register a camera whose depth plane sits `depth_m` metres away.
    pub fn with_camera(mut self, name: impl Into<String>, depth_m: f32) -> Self {
        self.cameras.push(SimCamera {
            name: name.into(),
            depth_m,
        });
        self
    }

    /// Make every render from `name` fail.
    pub fn with_failing_camera(mut self, name: impl Into<String>) -> Self {
        self.failing.insert(name.into());
        self
    }

    pub fn camera_names(&self) -> Vec<String> {
        self.cameras.iter().map(|c| c.name.clone()).collect()
    }

    fn lookup(&self, name: &str) -> Result<&SimCamera, ArmError> {
        if self.failing.contains(name) {
            return Err(ArmError::CaptureFailure {
                camera: name.to_string(),
                details: "simulated render fault".to_string(),
            });
        }
        self.cameras
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ArmError::CaptureFailure {
                camera: name.to_string(),
                details: "camera is not part of the rig".to_string(),
            })
    }
}

impl RenderSurface for SimCameraRig {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn render_color(&mut self, camera: &str) -> Result<ColorImage, ArmError> {
        self.lookup(camera)?;
        let shade = (self.renders % 256) as u8;
        self.renders += 1;

        let (w, h) = (self.width.max(1), self.height.max(1));
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x * 255 / w) as u8);
                data.push((y * 255 / h) as u8);
                data.push(shade);
            }
        }
        Ok(ColorImage {
            width: self.width,
            height: self.height,
            data,
        })
    }

    fn render_depth(&mut self, camera: &str) -> Result<DepthImage, ArmError> {
        let depth_m = self.lookup(camera)?.depth_m;
        Ok(DepthImage {
            width: self.width,
            height: self.height,
            data: vec![depth_m; self.width as usize * self.height as usize],
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
