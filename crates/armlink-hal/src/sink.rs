//! Generic `DatasetSink` trait plus two in-process sinks.
//!
//! On-disk dataset formats live outside this workspace; a writer for one
//! implements [`DatasetSink`] and receives ownership of every frame.

use std::sync::{Arc, Mutex, PoisonError};

use armlink_types::{ArmError, CaptureFrame};
use tracing::{debug, info};

/// Destination of finished capture frames.
pub trait DatasetSink: Send {
    /// Persist `frame`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Sink`] when the frame cannot be stored.  The frame
    /// is dropped; the control loop keeps running.
    fn write(&mut self, frame: CaptureFrame) -> Result<(), ArmError>;

    /// Flush anything buffered.  Called once when the loop stops.
    fn finish(&mut self) -> Result<(), ArmError> {
        Ok(())
    }
}

/// Keeps every frame in memory.  Clones share the same buffer, so a test can
/// hand one clone to the loop and inspect the other afterwards.
#[derive(Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<CaptureFrame>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames written so far.
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every frame written so far.
    pub fn frames(&self) -> Vec<CaptureFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DatasetSink for MemorySink {
    fn write(&mut self, frame: CaptureFrame) -> Result<(), ArmError> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }
}

/// Logs a summary of every frame and drops the image data.
#[derive(Debug, Default)]
pub struct LoggingSink {
    written: u64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl DatasetSink for LoggingSink {
    fn write(&mut self, frame: CaptureFrame) -> Result<(), ArmError> {
        self.written += 1;
        debug!(
            episode = %frame.episode(),
            index = frame.index(),
            sim_time = frame.sim_time(),
            grasp = frame.target().grasp,
            images = ?frame.image_keys(),
            failed = ?frame.failed_cameras(),
            "capture frame"
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ArmError> {
        info!(frames = self.written, "dataset sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armlink_types::{ControlTarget, JointState, Pose};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn frame(index: u64) -> CaptureFrame {
        CaptureFrame::new(
            Uuid::nil(),
            index,
            index as f64 * 0.1,
            Duration::from_millis(index * 100),
            BTreeMap::new(),
            ControlTarget::at(Pose::identity()),
            JointState::zeros(7),
        )
    }

    #[test]
    fn memory_sink_clones_share_frames() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write(frame(0)).unwrap();
        writer.write(frame(1)).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.frames()[1].index(), 1);
    }

    #[test]
    fn logging_sink_counts_frames() {
        let mut sink = LoggingSink::new();
        sink.write(frame(0)).unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.written(), 1);
    }
}
