//! `armlink-hal` – collaborator seams for the control loop.
//!
//! The control core never talks to a physics engine, a renderer or a dataset
//! writer directly.  It talks to the traits defined here, so an engine
//! binding, a GPU renderer or a file writer can be swapped without touching
//! control or teleoperation logic.
//!
//! # Modules
//!
//! - [`engine`] – [`PhysicsEngine`][engine::PhysicsEngine]: stepping, joint
//!   state, actuator commands, site poses and Jacobians.
//! - [`binding`] – [`ArmBinding`][binding::ArmBinding]: resolves the
//!   configured joint, site and actuator names to stable engine ids once at
//!   startup.
//! - [`camera`] – [`RenderSurface`][camera::RenderSurface]: per-camera color
//!   and linear-depth renders.
//! - [`sink`] – [`DatasetSink`][sink::DatasetSink]: destination of finished
//!   capture frames.
//! - [`sim`] – in-process simulated arm, camera rig and sinks for headless
//!   runs and tests.

pub mod binding;
pub mod camera;
pub mod engine;
pub mod sim;
pub mod sink;

pub use binding::{ArmBinding, ArmLayout};
pub use camera::RenderSurface;
pub use engine::PhysicsEngine;
pub use sink::{DatasetSink, LoggingSink, MemorySink};
