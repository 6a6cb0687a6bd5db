//! [`EdgeDetector`] – level-to-edge conversion for the toggle trigger.
//!
//! The device reports the trigger as a level that stays `true` for as long
//! as it is held.  Only the transition matters: holding the trigger across
//! many samples must produce exactly one event.

/// A transition of the watched level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Remembers the previous level and reports transitions.
#[derive(Debug, Clone, Default)]
pub struct EdgeDetector {
    previous: bool,
}

impl EdgeDetector {
    /// A detector whose previous level is `false`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A detector starting from `level`.
    pub fn with_level(level: bool) -> Self {
        Self { previous: level }
    }

    /// Feed the current level, returning the transition if there was one.
    pub fn update(&mut self, level: bool) -> Option<Edge> {
        let edge = match (self.previous, level) {
            (false, true) => Some(Edge::Rising),
            (true, false) => Some(Edge::Falling),
            _ => None,
        };
        self.previous = level;
        edge
    }

    /// The last level fed to the detector.
    pub fn level(&self) -> bool {
        self.previous
    }
}
