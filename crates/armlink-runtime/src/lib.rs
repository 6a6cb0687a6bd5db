//! `armlink-runtime` – the real-time control loop and everything around it.
//!
//! # Modules
//!
//! - [`realtime_loop`] – [`RealTimeLoop`][realtime_loop::RealTimeLoop]:
//!   steps physics at a fixed period, evaluates the operational-space
//!   controller against the teleoperation target and feeds the recorder.
//!   Errors inside a cycle are logged and counted, never propagated.
//! - [`pacer`] – [`FixedRatePacer`][pacer::FixedRatePacer]: sleeps out the
//!   remainder of each period and reports deadline misses.
//! - [`recorder`] – [`DataRecorder`][recorder::DataRecorder]: down-sampled,
//!   simulated-time capture of multi-camera color and depth frames.
//! - [`session`] – [`Session`][session::Session]: validated startup wiring of
//!   engine, controller, teleoperation and recording.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console or
//!   JSON logging with optional OTLP span export.

pub mod pacer;
pub mod realtime_loop;
pub mod recorder;
pub mod session;
pub mod telemetry;

pub use pacer::{FixedRatePacer, PaceOutcome};
pub use realtime_loop::{LoopState, LoopStats, RealTimeLoop, StopHandle};
pub use recorder::{CameraFailurePolicy, DataRecorder};
pub use session::{Session, SessionConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
