//! [`FixedRatePacer`] – fixed-period wall-clock pacing.
//!
//! Every cycle is measured from its own start.  When the work finishes
//! early the pacer sleeps for the remainder of the period; when it overruns
//! the pacer does not sleep at all and reports the overrun so the caller can
//! log and count a deadline miss.  There is no catch-up: a late cycle never
//! shortens the next one.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use armlink_runtime::pacer::{FixedRatePacer, PaceOutcome};
//!
//! let mut pacer = FixedRatePacer::new(Duration::from_millis(2));
//! pacer.begin_cycle();
//! // ... one control step ...
//! assert!(matches!(pacer.finish_cycle(), PaceOutcome::OnTime { .. }));
//! ```

use std::thread;
use std::time::{Duration, Instant};

/// Result of finishing one paced cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceOutcome {
    /// The cycle fit in its period; the pacer slept for `slept`.
    OnTime { slept: Duration },
    /// The cycle took longer than its period by `overrun`.
    Overrun { overrun: Duration },
}

/// Sleeps out the remainder of a fixed period after each cycle.
#[derive(Debug, Clone)]
pub struct FixedRatePacer {
    period: Duration,
    cycle_start: Instant,
    cycles: u64,
    deadline_misses: u64,
}

impl FixedRatePacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            cycle_start: Instant::now(),
            cycles: 0,
            deadline_misses: 0,
        }
    }

    /// Build a pacer from a period in seconds.  Non-positive or non-finite
    /// periods give a zero period: no sleeping and no deadline misses.
    pub fn from_secs_f64(period: f64) -> Self {
        let period = Duration::try_from_secs_f64(period).unwrap_or(Duration::ZERO);
        Self::new(period)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Mark the wall-clock start of a cycle.
    pub fn begin_cycle(&mut self) -> Instant {
        self.cycle_start = Instant::now();
        self.cycle_start
    }

    /// Time spent since [`begin_cycle`][Self::begin_cycle].
    pub fn elapsed(&self) -> Duration {
        self.cycle_start.elapsed()
    }

    /// Close the cycle: sleep out the rest of the period or report the
    /// overrun.
    pub fn finish_cycle(&mut self) -> PaceOutcome {
        self.cycles += 1;
        if self.period.is_zero() {
            return PaceOutcome::OnTime {
                slept: Duration::ZERO,
            };
        }
        let elapsed = self.elapsed();
        match self.period.checked_sub(elapsed) {
            Some(remaining) => {
                if !remaining.is_zero() {
                    thread::sleep(remaining);
                }
                PaceOutcome::OnTime { slept: remaining }
            }
            None => {
                self.deadline_misses += 1;
                PaceOutcome::Overrun {
                    overrun: elapsed - self.period,
                }
            }
        }
    }

    /// Cycles finished so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Cycles that overran their period.
    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses
    }
}
