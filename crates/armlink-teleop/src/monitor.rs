//! [`StreamMonitor`] – liveness of the teleoperation stream.
//!
//! The listener calls [`StreamMonitor::heartbeat`] for every device sample
//! and [`StreamMonitor::check`] on every wake-up.  A silence longer than
//! the timeout is reported exactly once; the next heartbeat re-arms it.

use std::time::{Duration, Instant};

use armlink_types::ArmError;

/// Detects a device stream that has gone quiet.
#[derive(Debug, Clone)]
pub struct StreamMonitor {
    timeout: Duration,
    last_heartbeat: Instant,
    reported: bool,
}

impl StreamMonitor {
    /// Start monitoring now with the given silence `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_heartbeat: Instant::now(),
            reported: false,
        }
    }

    /// Record a sample arrival.
    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        self.reported = false;
    }

    /// Time since the last heartbeat.
    pub fn silence(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    /// `true` while the stream is within its deadline.
    pub fn is_alive(&self) -> bool {
        self.silence() <= self.timeout
    }

    /// Returns [`ArmError::StreamDisconnected`] the first time the deadline
    /// is found exceeded in a silence period, `None` otherwise.
    pub fn check(&mut self) -> Option<ArmError> {
        if self.reported || self.is_alive() {
            return None;
        }
        self.reported = true;
        Some(ArmError::StreamDisconnected(format!(
            "no device sample for {} ms",
            self.silence().as_millis()
        )))
    }
}
