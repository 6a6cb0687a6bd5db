//! `armlink-teleop` – from an external device stream to the control target.
//!
//! A teleoperation device reports poses relative to its own origin plus an
//! analog button and a toggle trigger.  This crate turns that stream into
//! the absolute [`ControlTarget`][armlink_types::ControlTarget] the control
//! loop tracks.
//!
//! # Modules
//!
//! - [`edge`] – [`EdgeDetector`][edge::EdgeDetector]: turns a level-held
//!   trigger into discrete rising/falling edge events.
//! - [`target`] – [`SharedTarget`][target::SharedTarget]: the one
//!   mutex-protected target tuple shared by the listener and the loop.
//! - [`linker`] – [`TeleopLinker`][linker::TeleopLinker]: origin/scale mapping,
//!   grasp toggling and the listener thread lifecycle.
//! - [`transport`] – [`TeleopTransport`][transport::TeleopTransport] trait and
//!   the in-process [`ChannelTransport`][transport::ChannelTransport].
//! - [`ws`] – [`WsTransport`][ws::WsTransport]: JSON device frames over a
//!   WebSocket server.
//! - [`monitor`] – [`StreamMonitor`][monitor::StreamMonitor]: heartbeat-based
//!   detection of a silent device stream.

pub mod edge;
pub mod linker;
pub mod monitor;
pub mod target;
pub mod transport;
pub mod ws;

pub use edge::{Edge, EdgeDetector};
pub use linker::{LinkHandle, LinkOptions, TeleopLinker, ToggleFn};
pub use monitor::StreamMonitor;
pub use target::SharedTarget;
pub use transport::{ChannelTransport, TeleopTransport};
pub use ws::WsTransport;
