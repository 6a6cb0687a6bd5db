//! Generic `RenderSurface` trait for the scene cameras.

use armlink_types::{ArmError, ColorImage, DepthImage};

/// Something that can render the current scene from a named camera.
///
/// Every render has the fixed [`resolution`][Self::resolution] of the
/// surface.  Depth renders hold linear distance in metres, not normalized
/// disparity.
pub trait RenderSurface: Send {
    /// `(width, height)` of every image this surface produces.
    fn resolution(&self) -> (u32, u32);

    /// Render an RGB24 image from `camera`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::CaptureFailure`] if the camera is unknown or the
    /// render fails.
    fn render_color(&mut self, camera: &str) -> Result<ColorImage, ArmError>;

    /// Render a linear depth image from `camera`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::CaptureFailure`] if the camera is unknown or the
    /// render fails.
    fn render_depth(&mut self, camera: &str) -> Result<DepthImage, ArmError>;
}
