//! [`DataRecorder`] – down-sampled multi-camera demonstration capture.
//!
//! The control loop offers the recorder every cycle; the recorder fires
//! once every `1 / frequency` seconds of *simulated* time.  Due times sit on
//! a fixed grid anchored at the first capture, so steps that do not divide
//! the period never stretch the schedule.  A capture renders color and linear depth from every
//! configured camera and bundles them with the joint state and the control
//! target of the same instant.
//!
//! A camera that fails to render never produces a half-written frame.
//! Depending on [`CameraFailurePolicy`] the frame is either completed with
//! blank placeholder images (flagged on the [`CameraCapture`]) or dropped.

use std::collections::BTreeMap;
use std::time::Instant;

use armlink_hal::RenderSurface;
use armlink_types::{
    ArmError, CameraCapture, CaptureFrame, ColorImage, ControlTarget, DepthImage, JointState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tolerance on the capture period, absorbing floating-point drift in the
/// accumulated simulation time.
const SCHEDULE_EPSILON: f64 = 1e-9;

/// What to do with a frame when one of its cameras fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraFailurePolicy {
    /// Substitute blank images and mark the camera as a placeholder.
    #[default]
    FillPlaceholder,
    /// Drop the whole frame.
    SkipFrame,
}

/// Captures [`CaptureFrame`]s on a simulated-time schedule.
#[derive(Debug)]
pub struct DataRecorder {
    period: f64,
    cameras: Vec<String>,
    policy: CameraFailurePolicy,
    next_due: Option<f64>,
    episode: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    next_index: u64,
    skipped: u64,
}

impl DataRecorder {
    /// Start a new recording episode.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::FatalConfiguration`] if `frequency` is not a
    /// positive finite number.
    pub fn new(
        frequency: f64,
        cameras: Vec<String>,
        policy: CameraFailurePolicy,
    ) -> Result<Self, ArmError> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(ArmError::FatalConfiguration(format!(
                "recording frequency must be positive, got {frequency}"
            )));
        }
        let episode = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%episode, %started_at, frequency, cameras = cameras.len(), "recording episode started");
        Ok(Self {
            period: 1.0 / frequency,
            cameras,
            policy,
            next_due: None,
            episode,
            started_at,
            started: Instant::now(),
            next_index: 0,
            skipped: 0,
        })
    }

    pub fn episode(&self) -> Uuid {
        self.episode
    }

    /// UTC wall-clock time the episode started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Capture period in simulated seconds.
    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn cameras(&self) -> &[String] {
        &self.cameras
    }

    /// Frames handed out so far.
    pub fn frames_captured(&self) -> u64 {
        self.next_index
    }

    /// Frames dropped under [`CameraFailurePolicy::SkipFrame`].
    pub fn frames_skipped(&self) -> u64 {
        self.skipped
    }

    /// `true` when a capture is due at `sim_time`.
    pub fn is_due(&self, sim_time: f64) -> bool {
        match self.next_due {
            None => true,
            Some(due) => sim_time >= due - SCHEDULE_EPSILON,
        }
    }

    /// Move the next due time to the first grid point after `sim_time`.
    fn advance_schedule(&mut self, sim_time: f64) {
        let mut due = self.next_due.unwrap_or(sim_time) + self.period;
        if sim_time >= due - SCHEDULE_EPSILON {
            let missed = ((sim_time - due) / self.period).floor() + 1.0;
            due += missed * self.period;
        }
        self.next_due = Some(due);
    }

    /// Capture a frame if one is due at `sim_time`.
    pub fn maybe_capture(
        &mut self,
        sim_time: f64,
        joints: &JointState,
        target: &ControlTarget,
        surface: &mut dyn RenderSurface,
    ) -> Option<CaptureFrame> {
        if !self.is_due(sim_time) {
            return None;
        }
        self.advance_schedule(sim_time);

        let (width, height) = surface.resolution();
        let mut captures = BTreeMap::new();
        for camera in &self.cameras {
            let rendered = surface
                .render_color(camera)
                .and_then(|color| Ok((color, surface.render_depth(camera)?)));
            let capture = match rendered {
                Ok((color, depth)) => CameraCapture {
                    color,
                    depth,
                    placeholder: false,
                },
                Err(e) => {
                    warn!(camera = %camera, error = %e, sim_time, "camera capture failed");
                    match self.policy {
                        CameraFailurePolicy::FillPlaceholder => CameraCapture {
                            color: ColorImage::blank(width, height),
                            depth: DepthImage::blank(width, height),
                            placeholder: true,
                        },
                        CameraFailurePolicy::SkipFrame => {
                            self.skipped += 1;
                            return None;
                        }
                    }
                }
            };
            captures.insert(camera.clone(), capture);
        }

        let frame = CaptureFrame::new(
            self.episode,
            self.next_index,
            sim_time,
            self.started.elapsed(),
            captures,
            *target,
            joints.clone(),
        );
        debug!(index = self.next_index, sim_time, "frame captured");
        self.next_index += 1;
        Some(frame)
    }
}
