//! `armlink-control` – task-space control law.
//!
//! Turns a desired end-effector pose into joint torques.  Everything here is
//! a pure function of its inputs; the only state a controller carries is its
//! tuning.
//!
//! # Modules
//!
//! - [`rotation`] – rotation helpers and the orientation error (rotation
//!   vector of `R_d · R_cᵀ`, taken through a unit quaternion).
//! - [`dls`] – damped least-squares pseudo-inverse that stays finite at
//!   Jacobian singularities.
//! - [`osc`] – [`OperationalSpaceController`][osc::OperationalSpaceController]:
//!   task-space PD with nullspace posture control and gravity compensation.

pub mod dls;
pub mod osc;
pub mod rotation;

pub use dls::{damped_pseudo_inverse, DampedInverse};
pub use osc::{ControlOutput, OperationalSpaceController, OscGains};
