//! [`SharedTarget`] – the control target shared between the teleoperation
//! listener and the control loop.
//!
//! Pose, grasp flag and button value live behind one mutex and are always
//! read and written as a whole, so the loop can never observe a pose from
//! one device sample combined with the grasp state of another.  Critical
//! sections are a single copy; the loop never waits on listener work.

use std::sync::{Arc, Mutex, PoisonError};

use armlink_types::ControlTarget;

/// Cheaply cloneable handle to one control target.
#[derive(Debug, Clone)]
pub struct SharedTarget {
    inner: Arc<Mutex<ControlTarget>>,
}

impl SharedTarget {
    pub fn new(initial: ControlTarget) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    /// Copy of the whole target tuple.
    pub fn snapshot(&self) -> ControlTarget {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the whole target tuple.
    pub fn store(&self, target: ControlTarget) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = target;
    }

    /// Read-modify-write under a single lock acquisition.
    pub fn update<F: FnOnce(&mut ControlTarget)>(&self, f: F) -> ControlTarget {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armlink_types::Pose;
    use nalgebra::Vector3;
    use std::thread;

    #[test]
    fn snapshot_reflects_last_store() {
        let shared = SharedTarget::new(ControlTarget::at(Pose::identity()));
        let next = ControlTarget {
            pose: Pose::from_position(Vector3::new(0.1, 0.2, 0.3)),
            grasp: true,
            button: 0.4,
        };
        shared.store(next);
        assert_eq!(shared.snapshot(), next);
    }

    #[test]
    fn concurrent_writers_never_tear_the_tuple() {
        let shared = SharedTarget::new(ControlTarget::at(Pose::identity()));
        let writer = {
            let shared = shared.clone();
            thread::spawn(move || {
                for i in 0..2000 {
                    let v = i as f64;
                    shared.store(ControlTarget {
                        pose: Pose::from_position(Vector3::new(v, v, v)),
                        grasp: i % 2 == 1,
                        button: v,
                    });
                }
            })
        };

        for _ in 0..2000 {
            let t = shared.snapshot();
            let v = t.pose.position.x;
            assert_eq!(t.pose.position.y, v);
            assert_eq!(t.button, v);
            if v > 0.0 {
                assert_eq!(t.grasp, (v as u64) % 2 == 1);
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn update_returns_new_value() {
        let shared = SharedTarget::new(ControlTarget::at(Pose::identity()));
        let after = shared.update(|t| t.grasp = !t.grasp);
        assert!(after.grasp);
        assert!(shared.snapshot().grasp);
    }
}
