//! [`TeleopLinker`] – maps the device stream onto control targets.
//!
//! Each link binds a named [`SharedTarget`] to an origin pose and a scale
//! factor.  For every device sample the linker computes
//!
//! ```text
//! position = origin.position + scale · delta.position
//! rotation = delta.rotation · origin.rotation
//! ```
//!
//! The rotation is composed, never scaled, and can be frozen at the origin
//! with [`LinkOptions::disable_rotation`].  A rising edge on the device
//! toggle flips the link's grasp flag and invokes its toggle callback.
//!
//! Samples are consumed on a dedicated listener thread started with
//! [`TeleopLinker::start`].  Until then every [`LinkHandle::poll`] returns
//! the origin unmodified.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use armlink_types::{ArmError, ControlTarget, DeviceSample, Pose};
use tracing::{debug, error, info, warn};

use crate::edge::{Edge, EdgeDetector};
use crate::monitor::StreamMonitor;
use crate::target::SharedTarget;
use crate::transport::TeleopTransport;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback invoked with the new grasp state on every toggle.
pub type ToggleFn = Box<dyn FnMut(bool) + Send>;

/// Per-link behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Keep the target orientation at the origin orientation.
    pub disable_rotation: bool,
}

struct LinkState {
    name: String,
    origin: Pose,
    scale: f64,
    options: LinkOptions,
    toggle_fn: Option<ToggleFn>,
    edge: EdgeDetector,
    grasp: bool,
    target: SharedTarget,
}

impl LinkState {
    fn map_pose(&self, sample: &DeviceSample) -> Pose {
        let position = self.origin.position + sample.position * self.scale;
        let rotation = if self.options.disable_rotation {
            self.origin.rotation
        } else {
            sample.rotation * self.origin.rotation
        };
        Pose::new(position, rotation)
    }

    fn apply(&mut self, sample: &DeviceSample) {
        if self.edge.update(sample.toggle) == Some(Edge::Rising) {
            self.grasp = !self.grasp;
            debug!(link = %self.name, grasp = self.grasp, "grasp toggled");
            if let Some(toggle) = self.toggle_fn.as_mut() {
                toggle(self.grasp);
            }
        }
        self.target.store(ControlTarget {
            pose: self.map_pose(sample),
            grasp: self.grasp,
            button: sample.button,
        });
    }
}

type Links = Arc<Mutex<Vec<LinkState>>>;

fn apply_sample(links: &Links, sample: &DeviceSample) {
    let finite = sample.position.iter().all(|v| v.is_finite())
        && sample.rotation.iter().all(|v| v.is_finite())
        && sample.button.is_finite();
    if !finite {
        warn!("dropping device sample with non-finite values");
        return;
    }
    let mut links = links.lock().unwrap_or_else(PoisonError::into_inner);
    for link in links.iter_mut() {
        link.apply(sample);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

/// Read side of one link, held by the control loop.
///
/// The handle only ever copies the target out; writes go through the
/// linker's listener.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    name: String,
    target: SharedTarget,
}

impl LinkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current `(target pose, grasp)` pair.  Never blocks on the listener.
    pub fn poll(&self) -> (Pose, bool) {
        let t = self.target.snapshot();
        (t.pose, t.grasp)
    }

    /// The full target tuple including the analog button value.
    pub fn snapshot(&self) -> ControlTarget {
        self.target.snapshot()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Linker
// ────────────────────────────────────────────────────────────────────────────

/// Owns the links and the listener thread that feeds them.
///
/// Dropping the linker stops and joins the listener.
pub struct TeleopLinker {
    links: Links,
    running: Arc<AtomicBool>,
    disconnects: Arc<AtomicU64>,
    listener: Option<JoinHandle<()>>,
    poll_interval: Duration,
    silence_timeout: Duration,
}

impl Default for TeleopLinker {
    fn default() -> Self {
        Self::new()
    }
}

impl TeleopLinker {
    pub fn new() -> Self {
        Self {
            links: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            disconnects: Arc::new(AtomicU64::new(0)),
            listener: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
        }
    }

    /// How long the listener waits on the transport before re-checking the
    /// stop flag.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Silence after which the stream is reported as disconnected.
    pub fn with_silence_timeout(mut self, timeout: Duration) -> Self {
        self.silence_timeout = timeout;
        self
    }

    /// Bind a new control target named `name` to `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::FatalConfiguration`] if `scale` is not a positive
    /// finite number, the origin is not finite, or `name` is already linked.
    pub fn link(
        &mut self,
        name: impl Into<String>,
        origin: Pose,
        scale: f64,
        toggle_fn: Option<ToggleFn>,
        options: LinkOptions,
    ) -> Result<LinkHandle, ArmError> {
        let name = name.into();
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ArmError::FatalConfiguration(format!(
                "teleop scale for '{name}' must be positive, got {scale}"
            )));
        }
        if !origin.is_finite() {
            return Err(ArmError::FatalConfiguration(format!(
                "teleop origin for '{name}' is not finite"
            )));
        }

        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if links.iter().any(|l| l.name == name) {
            return Err(ArmError::FatalConfiguration(format!(
                "teleop target '{name}' is already linked"
            )));
        }

        let target = SharedTarget::new(ControlTarget::at(origin));
        links.push(LinkState {
            name: name.clone(),
            origin,
            scale,
            options,
            toggle_fn,
            edge: EdgeDetector::new(),
            grasp: false,
            target: target.clone(),
        });
        info!(link = %name, scale, disable_rotation = options.disable_rotation, "teleop target linked");
        Ok(LinkHandle { name, target })
    }

    /// `true` while the listener thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of device disconnects seen since start.
    pub fn disconnect_count(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Open `transport` and start the listener thread.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Transport`] if the linker is already running, the
    /// transport fails to open, or the thread cannot be spawned.
    pub fn start<T: TeleopTransport>(&mut self, mut transport: T) -> Result<(), ArmError> {
        if self.listener.is_some() {
            return Err(ArmError::Transport("teleop listener already started".to_string()));
        }
        transport.start()?;
        self.running.store(true, Ordering::Release);

        let links = Arc::clone(&self.links);
        let running = Arc::clone(&self.running);
        let disconnects = Arc::clone(&self.disconnects);
        let poll_interval = self.poll_interval;
        let silence_timeout = self.silence_timeout;

        let handle = thread::Builder::new()
            .name("teleop-listener".to_string())
            .spawn(move || {
                listen(
                    &mut transport,
                    &links,
                    &running,
                    &disconnects,
                    poll_interval,
                    silence_timeout,
                );
                transport.stop();
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                ArmError::Transport(format!("spawning teleop listener: {e}"))
            })?;

        self.listener = Some(handle);
        info!("teleop listener started");
        Ok(())
    }

    /// Stop the listener and wait for it to release the transport.
    ///
    /// Targets keep their last value.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                error!("teleop listener panicked");
            }
            info!("teleop listener stopped");
        }
    }
}

impl Drop for TeleopLinker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen<T: TeleopTransport>(
    transport: &mut T,
    links: &Links,
    running: &AtomicBool,
    disconnects: &AtomicU64,
    poll_interval: Duration,
    silence_timeout: Duration,
) {
    let mut monitor = StreamMonitor::new(silence_timeout);
    while running.load(Ordering::Acquire) {
        match transport.recv_timeout(poll_interval) {
            Ok(Some(sample)) => {
                monitor.heartbeat();
                apply_sample(links, &sample);
            }
            Ok(None) => {}
            Err(ArmError::StreamDisconnected(reason)) => {
                disconnects.fetch_add(1, Ordering::Relaxed);
                warn!(%reason, "teleop stream disconnected; holding last target");
            }
            Err(e) => {
                error!(error = %e, "teleop transport failed; listener exiting");
                break;
            }
        }
        if let Some(err) = monitor.check() {
            warn!(error = %err, "teleop stream silent; holding last target");
        }
    }
    running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use nalgebra::{Matrix3, Rotation3, Vector3};
    use std::f64::consts::PI;
    use std::time::Instant;

    fn origin() -> Pose {
        Pose::new(
            Vector3::new(0.5, 0.0, 0.4),
            Rotation3::from_axis_angle(&Vector3::x_axis(), PI).into_inner(),
        )
    }

    fn sample(dx: f64, toggle: bool) -> DeviceSample {
        DeviceSample {
            position: Vector3::new(dx, 0.0, 0.0),
            toggle,
            ..DeviceSample::at_origin()
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn poll_before_start_returns_origin() {
        let mut linker = TeleopLinker::new();
        let handle = linker
            .link("eef_target", origin(), 3.0, None, LinkOptions::default())
            .unwrap();
        assert_eq!(handle.poll(), (origin(), false));
        assert!(!linker.is_running());
    }

    #[test]
    fn zero_delta_with_unit_scale_is_the_origin() {
        let mut linker = TeleopLinker::new();
        let handle = linker
            .link("eef_target", origin(), 1.0, None, LinkOptions::default())
            .unwrap();
        apply_sample(&linker.links, &DeviceSample::at_origin());

        let (pose, grasp) = handle.poll();
        assert!((pose.position - origin().position).norm() < 1e-12);
        assert!((pose.rotation - origin().rotation).norm() < 1e-12);
        assert!(!grasp);
    }

    #[test]
    fn position_scales_and_rotation_composes() {
        let mut linker = TeleopLinker::new();
        let start = Pose::from_position(Vector3::new(0.0, 0.0, 0.4));
        let handle = linker
            .link("eef_target", start, 3.0, None, LinkOptions::default())
            .unwrap();

        let spin = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.5).into_inner();
        apply_sample(
            &linker.links,
            &DeviceSample {
                position: Vector3::new(0.1, 0.0, 0.0),
                rotation: spin,
                ..DeviceSample::at_origin()
            },
        );

        let (pose, _) = handle.poll();
        assert!((pose.position - Vector3::new(0.3, 0.0, 0.4)).norm() < 1e-12);
        // Rotation is not scaled: still 0.5 rad, not 1.5.
        assert!((pose.rotation - spin).norm() < 1e-12);
    }

    #[test]
    fn disabled_rotation_keeps_origin_orientation() {
        let mut linker = TeleopLinker::new();
        let handle = linker
            .link(
                "eef_target",
                origin(),
                1.0,
                None,
                LinkOptions {
                    disable_rotation: true,
                },
            )
            .unwrap();
        apply_sample(
            &linker.links,
            &DeviceSample {
                rotation: Rotation3::from_axis_angle(&Vector3::y_axis(), 0.7).into_inner(),
                ..sample(0.05, false)
            },
        );
        let (pose, _) = handle.poll();
        assert!((pose.rotation - origin().rotation).norm() < 1e-12);
        assert!((pose.position.x - 0.55).abs() < 1e-12);
    }

    #[test]
    fn rising_edges_flip_grasp_exactly_once_each() {
        let mut linker = TeleopLinker::new();
        let toggles = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&toggles);
        let handle = linker
            .link(
                "eef_target",
                origin(),
                1.0,
                Some(Box::new(move |grasp: bool| seen.lock().unwrap().push(grasp))),
                LinkOptions::default(),
            )
            .unwrap();

        // Three presses, each held for several samples.
        let levels = [
            false, true, true, true, false, false, true, true, false, true, true, true, true,
        ];
        for level in levels {
            apply_sample(&linker.links, &sample(0.0, level));
        }

        assert_eq!(*toggles.lock().unwrap(), vec![true, false, true]);
        assert!(handle.poll().1);
    }

    #[test]
    fn button_value_travels_with_the_pose() {
        let mut linker = TeleopLinker::new();
        let handle = linker
            .link("eef_target", origin(), 2.0, None, LinkOptions::default())
            .unwrap();
        apply_sample(
            &linker.links,
            &DeviceSample {
                button: 0.8,
                ..sample(0.1, false)
            },
        );
        let t = handle.snapshot();
        assert_eq!(t.button, 0.8);
        assert!((t.pose.position.x - 0.7).abs() < 1e-12);
    }

    #[test]
    fn non_finite_sample_is_dropped() {
        let mut linker = TeleopLinker::new();
        let handle = linker
            .link("eef_target", origin(), 1.0, None, LinkOptions::default())
            .unwrap();
        apply_sample(&linker.links, &sample(f64::NAN, true));
        assert_eq!(handle.poll(), (origin(), false));
    }

    #[test]
    fn link_rejects_bad_scale_and_duplicates() {
        let mut linker = TeleopLinker::new();
        for scale in [0.0, -1.0, f64::NAN] {
            let err = linker
                .link("eef_target", origin(), scale, None, LinkOptions::default())
                .unwrap_err();
            assert!(err.is_fatal());
        }
        linker
            .link("eef_target", origin(), 1.0, None, LinkOptions::default())
            .unwrap();
        assert!(
            linker
                .link("eef_target", origin(), 1.0, None, LinkOptions::default())
                .unwrap_err()
                .is_fatal()
        );
    }

    #[test]
    fn listener_thread_feeds_targets_and_survives_disconnect() {
        let mut linker = TeleopLinker::new().with_poll_interval(Duration::from_millis(5));
        let handle = linker
            .link("eef_target", origin(), 3.0, None, LinkOptions::default())
            .unwrap();
        let (transport, tx) = ChannelTransport::new();
        linker.start(transport).unwrap();
        assert!(linker.is_running());

        tx.send(sample(0.1, true)).unwrap();
        assert!(wait_until(|| handle.poll().1));
        let (pose, _) = handle.poll();
        assert!((pose.position.x - 0.8).abs() < 1e-12);

        drop(tx);
        assert!(wait_until(|| linker.disconnect_count() == 1));
        // Last target is frozen.
        assert!((handle.poll().0.position.x - 0.8).abs() < 1e-12);

        linker.stop();
        assert!(!linker.is_running());
    }

    #[test]
    fn handle_clones_observe_listener_writes() {
        let mut linker = TeleopLinker::new().with_poll_interval(Duration::from_millis(5));
        let handle = linker
            .link("eef_target", origin(), 1.0, None, LinkOptions::default())
            .unwrap();
        let reader = handle.clone();
        let (transport, tx) = ChannelTransport::new();
        linker.start(transport).unwrap();

        tx.send(sample(0.0, true)).unwrap();
        assert!(wait_until(|| reader.poll().1));
        assert_eq!(handle.snapshot(), reader.snapshot());
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut linker = TeleopLinker::new().with_poll_interval(Duration::from_millis(5));
        let (first, _tx1) = ChannelTransport::new();
        let (second, _tx2) = ChannelTransport::new();
        linker.start(first).unwrap();
        assert!(matches!(linker.start(second), Err(ArmError::Transport(_))));
    }

    #[test]
    fn identity_device_rotation_keeps_flipped_origin() {
        let mut linker = TeleopLinker::new();
        let handle = linker
            .link("eef_target", origin(), 1.0, None, LinkOptions::default())
            .unwrap();
        apply_sample(&linker.links, &sample(0.0, false));
        let expected = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0);
        assert!((handle.poll().0.rotation - expected).norm() < 1e-12);
    }
}
