//! [`Session`] – startup wiring for one teleoperation / recording run.
//!
//! [`Session::build`] performs every fallible startup step before the first
//! control cycle, so a misconfigured scene never reaches the loop:
//!
//! 1. validate the [`SessionConfig`],
//! 2. resolve joint, site and actuator names against the engine,
//! 3. set the physics timestep and seed the reference posture,
//! 4. place the target site at the teleoperation origin,
//! 5. link the target to the device stream and start the listener, unless
//!    the session runs in policy mode,
//! 6. attach the recorder when recording is enabled.

use armlink_control::{OperationalSpaceController, OscGains};
use armlink_hal::{ArmBinding, ArmLayout, DatasetSink, PhysicsEngine, RenderSurface};
use armlink_teleop::{LinkOptions, TeleopLinker, TeleopTransport};
use armlink_types::{ArmError, Pose};
use nalgebra::{DVector, Vector3};
use tracing::{info, warn};

use crate::realtime_loop::{LoopStats, RealTimeLoop, StopHandle};
use crate::recorder::{CameraFailurePolicy, DataRecorder};

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Physics timestep and pacing period, in seconds.
    pub dt: f64,
    /// Controller evaluation rate in Hz.
    pub control_frequency: f64,
    /// Capture rate in Hz of simulated time.
    pub recording_frequency: f64,
    pub layout: ArmLayout,
    pub gains: OscGains,
    /// Nullspace reference posture, also the startup posture.
    pub posture: Vec<f64>,
    /// Pose the target rests at until the device moves it.
    pub origin: Pose,
    pub scale: f64,
    pub disable_rotation: bool,
    pub record: bool,
    /// Run without the teleoperation listener.
    pub run_policy: bool,
    pub cameras: Vec<String>,
    pub camera_failure: CameraFailurePolicy,
    /// `false` steps as fast as possible instead of in wall-clock time.
    pub real_time: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let flip_x = nalgebra::Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI);
        Self {
            dt: 0.002,
            control_frequency: 1000.0,
            recording_frequency: 10.0,
            layout: ArmLayout {
                joint_names: (1..=7).map(|i| format!("joint{i}")).collect(),
                eef_site: "eef".to_string(),
                target_site: "eef_target".to_string(),
                gripper_actuator: "fingers_actuator".to_string(),
            },
            gains: OscGains::default(),
            posture: vec![0.0, 0.2686, 0.0, -1.5423, 0.0, 1.3307, 0.0],
            origin: Pose::new(Vector3::new(0.5, 0.0, 0.4), flip_x.into_inner()),
            scale: 3.0,
            disable_rotation: false,
            record: true,
            run_policy: false,
            cameras: vec![
                "front_camera".to_string(),
                "side_camera".to_string(),
                "top_camera".to_string(),
            ],
            camera_failure: CameraFailurePolicy::default(),
            real_time: true,
        }
    }
}

impl SessionConfig {
    /// Reject values the loop cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::FatalConfiguration`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ArmError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ArmError::FatalConfiguration(format!(
                    "{name} must be positive, got {v}"
                )))
            }
        };
        positive("dt", self.dt)?;
        positive("control_frequency", self.control_frequency)?;
        positive("recording_frequency", self.recording_frequency)?;
        positive("scale", self.scale)?;
        if self.posture.len() != self.layout.joint_names.len() {
            return Err(ArmError::FatalConfiguration(format!(
                "posture has {} entries for {} joints",
                self.posture.len(),
                self.layout.joint_names.len()
            )));
        }
        if !self.origin.is_finite() {
            return Err(ArmError::FatalConfiguration(
                "teleop origin is not finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// A ready-to-run control loop plus the teleoperation listener feeding it.
///
/// Dropping the session stops the listener thread.
pub struct Session<E: PhysicsEngine> {
    rt: RealTimeLoop<E>,
    linker: TeleopLinker,
}

impl<E: PhysicsEngine> Session<E> {
    /// Wire up a session on `engine`.
    ///
    /// `transport` is started only when teleoperation is active; in policy
    /// mode it is dropped unused.  `surface` is only rendered from when
    /// recording is enabled.
    ///
    /// # Errors
    ///
    /// [`ArmError::FatalConfiguration`] for invalid configuration or names
    /// the scene does not know, [`ArmError::Transport`] when the
    /// teleoperation transport fails to start.
    pub fn build<T: TeleopTransport>(
        mut engine: E,
        config: &SessionConfig,
        transport: T,
        surface: Box<dyn RenderSurface>,
        sink: Box<dyn DatasetSink>,
    ) -> Result<Self, ArmError> {
        config.validate()?;

        let binding = ArmBinding::resolve(&engine, &config.layout)?;
        engine.set_timestep(config.dt);
        let posture = DVector::from_vec(config.posture.clone());
        binding.seed_posture(&mut engine, &posture)?;
        binding
            .write_target(&mut engine, &config.origin)
            .map_err(|e| {
                ArmError::FatalConfiguration(format!(
                    "target site '{}' cannot be placed: {e}",
                    config.layout.target_site
                ))
            })?;
        info!(
            joints = binding.joint_count(),
            dt = config.dt,
            "arm bound and seeded at reference posture"
        );

        let controller = OperationalSpaceController::new(config.gains, posture);
        let mut rt = RealTimeLoop::new(engine, binding, controller)
            .with_real_time(config.real_time)
            .with_control_frequency(config.control_frequency)
            .with_sink(sink);

        let mut linker = TeleopLinker::new();
        if config.run_policy {
            info!("policy mode: teleoperation listener disabled");
        } else {
            let link = linker.link(
                config.layout.target_site.clone(),
                config.origin,
                config.scale,
                Some(Box::new(|grasp: bool| info!(grasp, "grasp toggled"))),
                LinkOptions {
                    disable_rotation: config.disable_rotation,
                },
            )?;
            linker.start(transport)?;
            rt = rt.with_teleop(link);
        }

        if config.record {
            let recorder = DataRecorder::new(
                config.recording_frequency,
                config.cameras.clone(),
                config.camera_failure,
            )?;
            if surface.resolution() == (0, 0) {
                warn!("render surface reports a zero resolution");
            }
            rt = rt.with_recorder(recorder, surface);
        }

        Ok(Self { rt, linker })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.rt.stop_handle()
    }

    /// Run until stopped, then shut the listener down.
    pub fn run(&mut self) -> LoopStats {
        let stats = self.rt.run();
        self.linker.stop();
        if self.linker.disconnect_count() > 0 {
            info!(disconnects = self.linker.disconnect_count(), "teleop device disconnects");
        }
        stats
    }

    /// Run at most `cycles` cycles without shutting anything down.
    pub fn run_for(&mut self, cycles: u64) -> LoopStats {
        self.rt.run_for(cycles)
    }

    /// Finish the loop and stop the listener.
    pub fn finish(&mut self) -> LoopStats {
        let stats = self.rt.finish();
        self.linker.stop();
        stats
    }

    pub fn control_loop(&self) -> &RealTimeLoop<E> {
        &self.rt
    }

    pub fn control_loop_mut(&mut self) -> &mut RealTimeLoop<E> {
        &mut self.rt
    }

    pub fn linker(&self) -> &TeleopLinker {
        &self.linker
    }
}
