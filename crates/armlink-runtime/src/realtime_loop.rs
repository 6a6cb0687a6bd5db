//! [`RealTimeLoop`] – the fixed-period control-and-teleoperation loop.
//!
//! Each iteration:
//!
//! 1. marks the wall-clock start of the cycle,
//! 2. copies the latest teleoperation target into the scene's target site,
//! 3. evaluates the [`OperationalSpaceController`] against the current
//!    target,
//! 4. writes the torque and gripper commands,
//! 5. advances the physics engine by one timestep,
//! 6. re-reads the target site pose, which is authoritative for the next
//!    cycle,
//! 7. offers the new state to the [`DataRecorder`],
//! 8. sleeps out the rest of the period.
//!
//! No error escapes a cycle.  Controller, engine, capture and sink errors
//! are logged, counted in [`LoopStats`] and the loop carries on with a zero
//! torque for the failed cycle.
//!
//! The loop moves `Idle -> Stepping -> Stopped` and stops when its
//! [`StopHandle`] fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use armlink_control::OperationalSpaceController;
use armlink_hal::{ArmBinding, DatasetSink, LoggingSink, PhysicsEngine, RenderSurface};
use armlink_teleop::LinkHandle;
use armlink_types::{ArmError, ControlTarget, TorqueCommand};
use tracing::{debug, info, info_span, warn};

use crate::pacer::{FixedRatePacer, PaceOutcome};
use crate::recorder::DataRecorder;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a [`RealTimeLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Stepping,
    Stopped,
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub deadline_misses: u64,
    /// Cycles in which the damped inverse was engaged.
    pub singular_cycles: u64,
    /// Cycles that fell back to a zero torque or lost a physics step.
    pub failed_cycles: u64,
    pub frames_captured: u64,
    pub sink_errors: u64,
}

/// Cloneable stop signal for a running loop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop after the current cycle.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct Capture {
    recorder: DataRecorder,
    surface: Box<dyn RenderSurface>,
}

// ────────────────────────────────────────────────────────────────────────────
// RealTimeLoop
// ────────────────────────────────────────────────────────────────────────────

/// Owns the engine for the duration of the run and drives it at a fixed
/// period.
pub struct RealTimeLoop<E: PhysicsEngine> {
    engine: E,
    binding: ArmBinding,
    controller: OperationalSpaceController,
    teleop: Option<LinkHandle>,
    capture: Option<Capture>,
    sink: Box<dyn DatasetSink>,
    pacer: FixedRatePacer,
    real_time: bool,
    control_decimation: u64,
    target: ControlTarget,
    last_command: TorqueCommand,
    singular: bool,
    state: LoopState,
    stop: StopHandle,
    stats: LoopStats,
}

impl<E: PhysicsEngine> RealTimeLoop<E> {
    /// Create an idle loop paced at the engine's timestep.
    ///
    /// The initial target is whatever the scene's target site holds.
    pub fn new(engine: E, binding: ArmBinding, controller: OperationalSpaceController) -> Self {
        let target = ControlTarget::at(binding.target_pose(&engine));
        let pacer = FixedRatePacer::from_secs_f64(engine.timestep());
        let last_command = TorqueCommand::zeros(binding.joint_count(), 0.0);
        Self {
            engine,
            binding,
            controller,
            teleop: None,
            capture: None,
            sink: Box::new(LoggingSink::default()),
            pacer,
            real_time: true,
            control_decimation: 1,
            target,
            last_command,
            singular: false,
            state: LoopState::Idle,
            stop: StopHandle::new(),
            stats: LoopStats::default(),
        }
    }

    /// Follow a teleoperation link.
    pub fn with_teleop(mut self, link: LinkHandle) -> Self {
        self.teleop = Some(link);
        self
    }

    /// Record frames from `surface` on the recorder's schedule.
    pub fn with_recorder(mut self, recorder: DataRecorder, surface: Box<dyn RenderSurface>) -> Self {
        self.capture = Some(Capture { recorder, surface });
        self
    }

    /// Destination of captured frames.
    pub fn with_sink(mut self, sink: Box<dyn DatasetSink>) -> Self {
        self.sink = sink;
        self
    }

    /// `false` runs cycles back to back without sleeping.
    pub fn with_real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }

    /// Evaluate the controller at `frequency` Hz, holding the last torque on
    /// the physics steps in between.  Frequencies at or above the physics
    /// rate evaluate it every step.
    pub fn with_control_frequency(mut self, frequency: f64) -> Self {
        let dt = self.engine.timestep();
        self.control_decimation = if frequency > 0.0 && dt > 0.0 {
            ((1.0 / (frequency * dt)).round() as u64).max(1)
        } else {
            1
        };
        self
    }

    /// Use an externally created stop signal.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// The target the controller tracked on the last cycle.
    pub fn target(&self) -> &ControlTarget {
        &self.target
    }

    pub fn binding(&self) -> &ArmBinding {
        &self.binding
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn recorder(&self) -> Option<&DataRecorder> {
        self.capture.as_ref().map(|c| &c.recorder)
    }

    /// Step until the stop handle fires.
    pub fn run(&mut self) -> LoopStats {
        self.run_cycles(None)
    }

    /// Step at most `cycles` times, or until the stop handle fires.
    pub fn run_for(&mut self, cycles: u64) -> LoopStats {
        self.run_cycles(Some(cycles))
    }

    fn run_cycles(&mut self, limit: Option<u64>) -> LoopStats {
        if self.state == LoopState::Stopped {
            return self.stats;
        }
        let span = info_span!("rt_loop", dt = self.engine.timestep());
        let _enter = span.enter();

        self.state = LoopState::Stepping;
        info!(
            joints = self.binding.joint_count(),
            teleop = self.teleop.is_some(),
            recording = self.capture.is_some(),
            real_time = self.real_time,
            "control loop stepping"
        );

        let mut done = 0;
        while !self.stop.is_stopped() && limit.is_none_or(|n| done < n) {
            self.cycle();
            done += 1;
        }

        if self.stop.is_stopped() || limit.is_none() {
            self.shutdown();
        }
        self.stats
    }

    fn shutdown(&mut self) {
        self.state = LoopState::Stopped;
        if let Err(e) = self.sink.finish() {
            self.stats.sink_errors += 1;
            warn!(error = %e, "dataset sink failed to finish");
        }
        let s = self.stats;
        info!(
            cycles = s.cycles,
            deadline_misses = s.deadline_misses,
            singular_cycles = s.singular_cycles,
            failed_cycles = s.failed_cycles,
            frames_captured = s.frames_captured,
            sink_errors = s.sink_errors,
            "control loop stopped"
        );
    }

    /// Stop a loop that was driven with [`run_for`][Self::run_for].
    pub fn finish(&mut self) -> LoopStats {
        if self.state != LoopState::Stopped {
            self.shutdown();
        }
        self.stats
    }

    fn cycle(&mut self) {
        let cycle = self.stats.cycles;
        self.pacer.begin_cycle();

        if let Some(link) = &self.teleop {
            let latest = link.snapshot();
            if let Err(e) = self.binding.write_target(&mut self.engine, &latest.pose) {
                warn!(cycle, error = %e, "could not move target site");
            }
            self.target.pose = latest.pose;
            self.target.grasp = latest.grasp;
            self.target.button = latest.button;
        }

        let mut failed = false;
        if cycle % self.control_decimation == 0 {
            self.last_command = self.compute(cycle, &mut failed);
        }

        if let Err(e) = self.binding.apply(&mut self.engine, &self.last_command) {
            warn!(cycle, error = %e, "could not write actuator commands");
            failed = true;
        }
        if let Err(e) = self.engine.step() {
            warn!(cycle, error = %e, "physics step failed");
            failed = true;
        }

        self.target.pose = self.binding.target_pose(&self.engine);

        if let Some(capture) = self.capture.as_mut() {
            let joints = self.binding.read_joints(&self.engine);
            if let Some(frame) = capture.recorder.maybe_capture(
                self.engine.time(),
                &joints,
                &self.target,
                capture.surface.as_mut(),
            ) {
                self.stats.frames_captured += 1;
                if let Err(e) = self.sink.write(frame) {
                    self.stats.sink_errors += 1;
                    warn!(cycle, error = %e, "dataset sink rejected frame");
                }
            }
        }

        if failed {
            self.stats.failed_cycles += 1;
        }
        self.stats.cycles += 1;

        if self.real_time {
            if let PaceOutcome::Overrun { overrun } = self.pacer.finish_cycle() {
                self.stats.deadline_misses += 1;
                let err = ArmError::DeadlineMiss { cycle, overrun };
                warn!(cycle, overrun_us = overrun.as_micros() as u64, "{err}");
            }
        }
    }

    fn compute(&mut self, cycle: u64, failed: &mut bool) -> TorqueCommand {
        let state = self.binding.kinematics(&self.engine);
        let gripper_only = |target: &ControlTarget| {
            TorqueCommand::zeros(
                state.joints.len(),
                target.grasp_value() * armlink_control::osc::GRIPPER_FULL_SCALE,
            )
        };

        match self.controller.compute_torque(&state, &self.target) {
            Ok(output) => {
                let singular = matches!(
                    output.warning,
                    Some(ArmError::SingularConfiguration { .. })
                );
                if singular {
                    self.stats.singular_cycles += 1;
                }
                if singular != self.singular {
                    if singular {
                        warn!(
                            cycle,
                            min_singular_value = output.min_singular_value,
                            "entering singular configuration; torque clamped"
                        );
                    } else {
                        info!(cycle, "left singular configuration");
                    }
                    self.singular = singular;
                }
                if let Some(err @ ArmError::NonFinite(_)) = &output.warning {
                    warn!(cycle, error = %err, "controller fell back to zero torque");
                    *failed = true;
                }
                debug!(cycle, error = output.task_error.norm(), "control evaluated");
                output.command
            }
            Err(e) => {
                warn!(cycle, error = %e, "controller failed; applying zero torque");
                *failed = true;
                gripper_only(&self.target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armlink_control::OscGains;
    use armlink_hal::{ArmLayout, MemorySink};
    use armlink_hal::sim::{SimArm, SimCameraRig};
    use armlink_types::{DeviceSample, Pose};
    use nalgebra::{DVector, Vector3};
    use std::time::{Duration, Instant};

    use crate::recorder::CameraFailurePolicy;

    fn layout() -> ArmLayout {
        ArmLayout {
            joint_names: (1..=7).map(|i| format!("joint{i}")).collect(),
            eef_site: "eef".to_string(),
            target_site: "eef_target".to_string(),
            gripper_actuator: "fingers_actuator".to_string(),
        }
    }

    fn q0() -> DVector<f64> {
        DVector::from_vec(vec![0.0, 0.2686, 0.0, -1.5423, 0.0, 1.3307, 0.0])
    }

    /// Arm at q0 with the target site on the end-effector.
    fn seeded_loop() -> RealTimeLoop<SimArm> {
        let mut arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        binding.seed_posture(&mut arm, &q0()).unwrap();
        let eef = arm.site_pose(arm.site_id("eef").unwrap());
        binding.write_target(&mut arm, &eef).unwrap();
        let controller = OperationalSpaceController::new(OscGains::default(), q0());
        RealTimeLoop::new(arm, binding, controller).with_real_time(false)
    }

    fn eef_position(rt: &RealTimeLoop<SimArm>) -> Vector3<f64> {
        let arm = rt.engine();
        arm.site_pose(arm.site_id("eef").unwrap()).position
    }

    #[test]
    fn starts_idle_and_stops_after_run() {
        let mut rt = seeded_loop();
        assert_eq!(rt.state(), LoopState::Idle);
        let stop = rt.stop_handle();
        stop.stop();
        let stats = rt.run();
        assert_eq!(rt.state(), LoopState::Stopped);
        assert_eq!(stats.cycles, 0);
    }

    #[test]
    fn holds_pose_at_rest() {
        let mut rt = seeded_loop();
        let start = eef_position(&rt);
        let stats = rt.run_for(500);
        assert_eq!(stats.cycles, 500);
        assert_eq!(stats.failed_cycles, 0);
        assert!((eef_position(&rt) - start).norm() < 1e-3);
        assert!((rt.engine().time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn tracks_a_moved_target_site() {
        let mut rt = seeded_loop();
        let start = eef_position(&rt);
        let goal = start + Vector3::new(0.05, 0.0, 0.0);

        let target_site = rt.binding().target_site();
        let rotation = rt.target().pose.rotation;
        rt.engine_mut()
            .set_site_pose(target_site, &Pose::new(goal, rotation))
            .unwrap();
        rt.run_for(1500);

        assert!((rt.target().pose.position - goal).norm() < 1e-12);
        assert!((eef_position(&rt) - goal).norm() < 0.02);
    }

    #[test]
    fn teleop_link_drives_the_target_site() {
        let mut linker = armlink_teleop::TeleopLinker::new();
        let rt = seeded_loop();
        let origin = rt.target().pose;
        let link = linker
            .link("eef_target", origin, 1.0, None, Default::default())
            .unwrap();
        let mut rt = rt.with_teleop(link.clone());

        rt.run_for(1);
        assert_eq!(rt.target().pose.position, origin.position);
        let arm = rt.engine();
        let site = arm.site_pose(arm.site_id("eef_target").unwrap());
        assert_eq!(site.position, link.poll().0.position);
    }

    #[test]
    fn records_on_schedule_into_the_sink() {
        let sink = MemorySink::new();
        let rig = SimCameraRig::new(4, 4)
            .with_camera("front_camera", 1.0)
            .with_camera("side_camera", 1.0);
        let recorder = DataRecorder::new(
            10.0,
            rig.camera_names(),
            CameraFailurePolicy::FillPlaceholder,
        )
        .unwrap();
        let mut rt = seeded_loop()
            .with_recorder(recorder, Box::new(rig))
            .with_sink(Box::new(sink.clone()));

        let stats = rt.run_for(500);
        assert!((stats.frames_captured as i64 - 10).abs() <= 1);
        assert_eq!(sink.len() as u64, stats.frames_captured);
        let frames = sink.frames();
        assert_eq!(frames[0].cameras().len(), 2);
        assert_eq!(frames[0].joints().len(), 7);
    }

    #[test]
    fn grasp_drives_gripper_command() {
        let mut linker = armlink_teleop::TeleopLinker::new();
        let rt = seeded_loop();
        let link = linker
            .link("eef_target", rt.target().pose, 1.0, None, Default::default())
            .unwrap();
        let (transport, tx) = armlink_teleop::ChannelTransport::new();
        linker.start(transport).unwrap();
        tx.send(DeviceSample {
            toggle: true,
            ..DeviceSample::at_origin()
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !link.poll().1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(link.poll().1);

        let mut rt = rt.with_teleop(link);
        rt.run_for(400);
        assert!(rt.target().grasp);
        assert!(rt.engine().gripper_closure() > 0.9);
    }

    #[test]
    fn controller_error_degrades_to_zero_torque() {
        let mut arm = SimArm::seven_dof();
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        binding.seed_posture(&mut arm, &q0()).unwrap();
        // Posture of the wrong length makes every evaluation fail.
        let controller = OperationalSpaceController::new(OscGains::default(), DVector::zeros(3));
        let mut rt = RealTimeLoop::new(arm, binding, controller).with_real_time(false);

        let stats = rt.run_for(10);
        assert_eq!(stats.cycles, 10);
        assert_eq!(stats.failed_cycles, 10);
    }

    #[test]
    fn control_decimation_holds_torque_between_evaluations() {
        let mut rt = seeded_loop().with_control_frequency(100.0);
        assert_eq!(rt.control_decimation, 5);
        let stats = rt.run_for(50);
        assert_eq!(stats.failed_cycles, 0);
    }

    #[test]
    fn real_time_cycles_are_paced() {
        let mut rt = seeded_loop().with_real_time(true);
        let start = Instant::now();
        let stats = rt.run_for(50);
        let elapsed = start.elapsed();
        // 50 cycles at 2 ms.
        assert!(elapsed >= Duration::from_millis(100), "took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "took {elapsed:?}");
        assert_eq!(stats.cycles, 50);
    }

    #[test]
    fn overrunning_cycles_are_counted_and_the_loop_keeps_stepping() {
        let mut arm = SimArm::seven_dof();
        // A 1 µs period no controller evaluation can meet.
        arm.set_timestep(1e-6);
        let binding = ArmBinding::resolve(&arm, &layout()).unwrap();
        binding.seed_posture(&mut arm, &q0()).unwrap();
        let controller = OperationalSpaceController::new(OscGains::default(), q0());
        let mut rt = RealTimeLoop::new(arm, binding, controller).with_real_time(true);

        let stats = rt.run_for(20);
        assert_eq!(stats.cycles, 20);
        assert!(stats.deadline_misses > 0);
        assert_eq!(stats.failed_cycles, 0);
        assert_eq!(rt.state(), LoopState::Stepping);
    }

    #[test]
    fn stop_handle_from_another_thread_ends_run() {
        let mut rt = seeded_loop().with_real_time(true);
        let stop = rt.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        let stats = rt.run();
        stopper.join().unwrap();
        assert_eq!(rt.state(), LoopState::Stopped);
        assert!(stats.cycles > 0);
    }
}
