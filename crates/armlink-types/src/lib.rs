//! `armlink-types` – shared data model for the armlink control stack.
//!
//! Every crate in the workspace speaks in terms of these types: poses and
//! joint snapshots flow from the physics engine into the controller, the
//! [`ControlTarget`] flows from the teleoperation listener into the control
//! loop, and finished [`CaptureFrame`]s flow out to the dataset sink.

use std::collections::BTreeMap;
use std::time::Duration;

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body pose: position in metres plus a rotation matrix.
///
/// The rotation is re-orthonormalized by [`Pose::new`], so any pose built
/// from externally written data is a proper rotation again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub rotation: Matrix3<f64>,
}

impl Pose {
    /// Build a pose, projecting `rotation` back onto SO(3).
    pub fn new(position: Vector3<f64>, rotation: Matrix3<f64>) -> Self {
        Self {
            position,
            rotation: orthonormalize(&rotation),
        }
    }

    /// A pose at `position` with the identity orientation.
    pub fn from_position(position: Vector3<f64>) -> Self {
        Self {
            position,
            rotation: Matrix3::identity(),
        }
    }

    /// The identity pose at the origin.
    pub fn identity() -> Self {
        Self::from_position(Vector3::zeros())
    }

    /// `true` when every component of the pose is finite.
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite()) && self.rotation.iter().all(|v| v.is_finite())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Project a 3×3 matrix onto the closest rotation matrix (polar
/// decomposition through the SVD).
///
/// Non-finite input is returned unchanged so the caller can detect it.
pub fn orthonormalize(m: &Matrix3<f64>) -> Matrix3<f64> {
    if !m.iter().all(|v| v.is_finite()) {
        return *m;
    }
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(mut u), Some(v_t)) => {
            let r = u * v_t;
            if r.determinant() >= 0.0 {
                return r;
            }
            // Reflection: flip the axis of the smallest singular value.
            let flipped = -u.column(2);
            u.set_column(2, &flipped);
            u * v_t
        }
        _ => Matrix3::identity(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Joint and kinematic state
// ────────────────────────────────────────────────────────────────────────────

/// Positions and velocities of the controlled joints, ordered by the joint
/// index mapping fixed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    pub positions: DVector<f64>,
    pub velocities: DVector<f64>,
}

impl JointState {
    pub fn new(positions: DVector<f64>, velocities: DVector<f64>) -> Self {
        Self {
            positions,
            velocities,
        }
    }

    /// A resting state with every joint at zero.
    pub fn zeros(n: usize) -> Self {
        Self::new(DVector::zeros(n), DVector::zeros(n))
    }

    /// Number of joints.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.positions.iter().chain(self.velocities.iter()).all(|v| v.is_finite())
    }
}

/// Everything the controller needs to know about the arm at one simulation
/// instant.
#[derive(Debug, Clone)]
pub struct KinematicState {
    pub joints: JointState,
    /// Pose of the end-effector site.
    pub eef_pose: Pose,
    /// 6×n site Jacobian, linear rows first, then angular rows.
    pub jacobian: DMatrix<f64>,
    /// Gravity plus Coriolis generalized forces, one entry per joint.
    pub bias: DVector<f64>,
}

// ────────────────────────────────────────────────────────────────────────────
// Control target and command
// ────────────────────────────────────────────────────────────────────────────

/// The desired end-effector pose together with the discrete grasp flag and
/// the raw analog button value.
///
/// Always read and written as one tuple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlTarget {
    pub pose: Pose,
    pub grasp: bool,
    pub button: f64,
}

impl ControlTarget {
    /// A target resting at `origin` with the gripper open.
    pub fn at(origin: Pose) -> Self {
        Self {
            pose: origin,
            grasp: false,
            button: 0.0,
        }
    }

    /// Grasp flag as the 0/1 scalar the gripper actuator expects.
    pub fn grasp_value(&self) -> f64 {
        if self.grasp { 1.0 } else { 0.0 }
    }
}

/// Joint torques aligned with [`JointState`] indices plus the gripper
/// actuator command.
#[derive(Debug, Clone, PartialEq)]
pub struct TorqueCommand {
    pub joints: DVector<f64>,
    pub gripper: f64,
}

impl TorqueCommand {
    /// An all-zero command for `n` joints with the given gripper command.
    pub fn zeros(n: usize, gripper: f64) -> Self {
        Self {
            joints: DVector::zeros(n),
            gripper,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.gripper.is_finite() && self.joints.iter().all(|v| v.is_finite())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Teleoperation input
// ────────────────────────────────────────────────────────────────────────────

/// One reading from the teleoperation device, expressed relative to the
/// device's own origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSample {
    /// Position offset from the device origin.
    pub position: Vector3<f64>,
    /// Rotation offset from the device origin.
    pub rotation: Matrix3<f64>,
    /// Continuous button / analog trigger value.
    pub button: f64,
    /// Toggle trigger level; a rising edge flips the grasp flag.
    pub toggle: bool,
}

impl DeviceSample {
    /// A sample at the device origin with nothing pressed.
    pub fn at_origin() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: Matrix3::identity(),
            button: 0.0,
            toggle: false,
        }
    }
}

impl Default for DeviceSample {
    fn default() -> Self {
        Self::at_origin()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera capture
// ────────────────────────────────────────────────────────────────────────────

/// An RGB24 color image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB24 pixels.
    pub data: Vec<u8>,
}

impl ColorImage {
    /// An all-black image.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 3],
        }
    }
}

/// A depth image holding linear distances in metres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    /// Row-major linear depth in metres.
    pub data: Vec<f32>,
}

impl DepthImage {
    /// A depth image with every pixel at zero distance.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize],
        }
    }
}

/// Color and depth output of one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCapture {
    pub color: ColorImage,
    pub depth: DepthImage,
    /// `true` when the render failed and blank images were substituted.
    pub placeholder: bool,
}

/// One synchronized demonstration sample.
///
/// Immutable once built; ownership moves to the dataset sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureFrame {
    episode: Uuid,
    index: u64,
    sim_time: f64,
    timestamp: Duration,
    cameras: BTreeMap<String, CameraCapture>,
    target: ControlTarget,
    joints: JointState,
}

impl CaptureFrame {
    pub fn new(
        episode: Uuid,
        index: u64,
        sim_time: f64,
        timestamp: Duration,
        cameras: BTreeMap<String, CameraCapture>,
        target: ControlTarget,
        joints: JointState,
    ) -> Self {
        Self {
            episode,
            index,
            sim_time,
            timestamp,
            cameras,
            target,
            joints,
        }
    }

    /// Recording episode this frame belongs to.
    pub fn episode(&self) -> Uuid {
        self.episode
    }

    /// Sequence number within the episode, starting at 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Simulated time at capture, in seconds.
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    /// Monotonic wall-clock offset from the start of the episode.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn cameras(&self) -> &BTreeMap<String, CameraCapture> {
        &self.cameras
    }

    pub fn camera(&self, name: &str) -> Option<&CameraCapture> {
        self.cameras.get(name)
    }

    pub fn target(&self) -> &ControlTarget {
        &self.target
    }

    pub fn joints(&self) -> &JointState {
        &self.joints
    }

    /// Names of cameras whose images are placeholders.
    pub fn failed_cameras(&self) -> Vec<&str> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.placeholder)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Flattened image keys in dataset order: `<camera>_rgb`, `<camera>_depth`.
    pub fn image_keys(&self) -> Vec<String> {
        self.cameras
            .keys()
            .flat_map(|name| [format!("{name}_rgb"), format!("{name}_depth")])
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
///
/// Only [`ArmError::FatalConfiguration`] stops the process; every other
/// variant is logged and the control loop carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArmError {
    #[error("singular configuration: damping engaged (min singular value {min_singular_value:.3e})")]
    SingularConfiguration { min_singular_value: f64 },

    #[error("deadline miss on cycle {cycle}: overran by {overrun:?}")]
    DeadlineMiss { cycle: u64, overrun: Duration },

    #[error("capture failed on camera {camera}: {details}")]
    CaptureFailure { camera: String, details: String },

    #[error("teleoperation stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("non-finite value in {0}")]
    NonFinite(String),

    #[error("physics engine fault: {0}")]
    Engine(String),

    #[error("teleoperation transport error: {0}")]
    Transport(String),

    #[error("dataset sink error: {0}")]
    Sink(String),
}

impl ArmError {
    /// `true` for errors that must abort before (or instead of) running the
    /// control loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArmError::FatalConfiguration(_))
    }
}
