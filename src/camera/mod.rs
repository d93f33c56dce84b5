//! Camera models.
//!
//! - [`ProjectiveCamera`] - pose plus output-size-derived unprojection matrices
//! - [`FlyCamera`] - first-person controller driven by movement flags and pointer deltas
//!
//! The renderer only talks to cameras through [`RtCamera`].

mod fly;
mod projective;

pub use fly::{FlyCamera, FlyCameraConfig, MoveIntent};
pub use projective::{ProjectiveCamera, SurfaceOrigin};

use crate::util::{Mat4, Result, UVec2};

/// Camera capability consumed by the frame pipeline.
pub trait RtCamera: Send {
    /// Camera-to-world pose (orthonormal rotation + translation).
    fn camera_to_world(&self) -> Mat4;

    fn set_camera_to_world(&mut self, pose: Mat4);

    /// Maps window pixel coordinates (x, y, depth in [0, 1], 1) to camera space
    /// (homogeneous, divide by w).
    fn viewport_to_camera(&self) -> Mat4;

    /// Recompute every size-dependent matrix for a new output surface size.
    fn set_output_size(&mut self, size: UVec2) -> Result<()>;

    fn output_size(&self) -> UVec2;
}
