//! Session configuration file – reads `armlink.toml`.

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use armlink_control::OscGains;
use armlink_hal::ArmLayout;
use armlink_runtime::{CameraFailurePolicy, SessionConfig};
use armlink_types::{ArmError, Pose};
use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file when no argument is given.
pub const CONFIG_ENV: &str = "ARMLINK_CONFIG";

/// Settings for one `armlink` run, stored in `armlink.toml`.
///
/// Every field is optional in the file; missing fields take the defaults of
/// the reference scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Physics timestep in seconds.
    #[serde(default = "default_dt")]
    pub dt: f64,

    /// Controller evaluation rate in Hz.
    #[serde(default = "default_control_frequency")]
    pub control_frequency: f64,

    /// Capture rate in Hz of simulated time.
    #[serde(default = "default_recording_frequency")]
    pub recording_frequency: f64,

    #[serde(default = "default_joint_names")]
    pub joint_names: Vec<String>,

    #[serde(default = "default_eef_site")]
    pub eef_site: String,

    #[serde(default = "default_target_site")]
    pub target_site: String,

    #[serde(default = "default_gripper_actuator")]
    pub gripper_actuator: String,

    /// Nullspace reference posture, one entry per joint.
    #[serde(default = "default_posture")]
    pub posture: Vec<f64>,

    #[serde(default = "default_origin_position")]
    pub origin_position: [f64; 3],

    /// Teleoperation origin orientation as roll, pitch, yaw in radians.
    #[serde(default = "default_origin_rpy")]
    pub origin_rpy: [f64; 3],

    /// Device-to-world translation scale.
    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub disable_rotation: bool,

    /// WebSocket port the device streams to.
    #[serde(default = "default_teleop_port")]
    pub teleop_port: u16,

    #[serde(default = "default_record")]
    pub record: bool,

    /// Disable the teleoperation listener.
    #[serde(default)]
    pub run_policy: bool,

    #[serde(default = "default_cameras")]
    pub cameras: Vec<String>,

    #[serde(default = "default_camera_width")]
    pub camera_width: u32,

    #[serde(default = "default_camera_height")]
    pub camera_height: u32,

    #[serde(default)]
    pub camera_failure: CameraFailurePolicy,

    /// Controller gains, the `[gains]` table.
    #[serde(default)]
    pub gains: OscGains,
}

fn default_dt() -> f64 {
    0.002
}
fn default_control_frequency() -> f64 {
    1000.0
}
fn default_recording_frequency() -> f64 {
    10.0
}
fn default_joint_names() -> Vec<String> {
    (1..=7).map(|i| format!("joint{i}")).collect()
}
fn default_eef_site() -> String {
    "eef".to_string()
}
fn default_target_site() -> String {
    "eef_target".to_string()
}
fn default_gripper_actuator() -> String {
    "fingers_actuator".to_string()
}
fn default_posture() -> Vec<f64> {
    vec![0.0, 0.2686, 0.0, -1.5423, 0.0, 1.3307, 0.0]
}
fn default_origin_position() -> [f64; 3] {
    [0.5, 0.0, 0.4]
}
fn default_origin_rpy() -> [f64; 3] {
    [PI, 0.0, 0.0]
}
fn default_scale() -> f64 {
    3.0
}
fn default_teleop_port() -> u16 {
    8888
}
fn default_record() -> bool {
    true
}
fn default_cameras() -> Vec<String> {
    ["front_camera", "side_camera", "top_camera"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_camera_width() -> u32 {
    640
}
fn default_camera_height() -> u32 {
    480
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dt: default_dt(),
            control_frequency: default_control_frequency(),
            recording_frequency: default_recording_frequency(),
            joint_names: default_joint_names(),
            eef_site: default_eef_site(),
            target_site: default_target_site(),
            gripper_actuator: default_gripper_actuator(),
            gains: OscGains::default(),
            posture: default_posture(),
            origin_position: default_origin_position(),
            origin_rpy: default_origin_rpy(),
            scale: default_scale(),
            disable_rotation: false,
            teleop_port: default_teleop_port(),
            record: default_record(),
            run_policy: false,
            cameras: default_cameras(),
            camera_width: default_camera_width(),
            camera_height: default_camera_height(),
            camera_failure: CameraFailurePolicy::default(),
        }
    }
}

impl Config {
    /// Teleoperation origin as a pose.
    pub fn origin(&self) -> Pose {
        let [roll, pitch, yaw] = self.origin_rpy;
        Pose::new(
            Vector3::from(self.origin_position),
            Rotation3::from_euler_angles(roll, pitch, yaw).into_inner(),
        )
    }

    /// Session settings for a wall-clock paced run.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            dt: self.dt,
            control_frequency: self.control_frequency,
            recording_frequency: self.recording_frequency,
            layout: ArmLayout {
                joint_names: self.joint_names.clone(),
                eef_site: self.eef_site.clone(),
                target_site: self.target_site.clone(),
                gripper_actuator: self.gripper_actuator.clone(),
            },
            gains: self.gains,
            posture: self.posture.clone(),
            origin: self.origin(),
            scale: self.scale,
            disable_rotation: self.disable_rotation,
            record: self.record,
            run_policy: self.run_policy,
            cameras: self.cameras.clone(),
            camera_failure: self.camera_failure,
            real_time: true,
        }
    }

    /// Reject settings the loop cannot start with.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::FatalConfiguration`] naming the offending field.
    pub fn validate(&self) -> Result<(), ArmError> {
        if self.record && (self.camera_width == 0 || self.camera_height == 0) {
            return Err(ArmError::FatalConfiguration(format!(
                "camera resolution {}x{} is empty",
                self.camera_width, self.camera_height
            )));
        }
        self.session_config().validate()
    }
}

/// Resolve the config path: the first argument, then [`CONFIG_ENV`], then
/// `./armlink.toml`.
pub fn config_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("armlink.toml"))
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ARMLINK_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMLINK_DT` | `dt` |
/// | `ARMLINK_RECORD` | `record` (`true`/`false`/`1`/`0`) |
/// | `ARMLINK_TELEOP_PORT` | `teleop_port` |
/// | `ARMLINK_SCALE` | `scale` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ARMLINK_DT")
        && let Ok(dt) = v.parse::<f64>()
    {
        cfg.dt = dt;
    }
    if let Ok(v) = std::env::var("ARMLINK_RECORD")
        && let Some(record) = parse_flag(&v)
    {
        cfg.record = record;
    }
    if let Ok(v) = std::env::var("ARMLINK_TELEOP_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.teleop_port = port;
    }
    if let Ok(v) = std::env::var("ARMLINK_SCALE")
        && let Ok(scale) = v.parse::<f64>()
    {
        cfg.scale = scale;
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
