//! # vrtracer
//!
//! Interactive real-time ray tracer: fly through a triangle scene rendered by
//! a per-pixel compute kernel over two-level acceleration structures, with up
//! to three frames in flight.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math re-exports, bounding boxes
//! - [`transform`] - Look-at, perspective and affine helpers
//! - [`camera`] - Projective camera and fly-through controller
//! - [`scene`] - Geometry arena, instances, mesh builder
//! - [`accel`] - Primitive and instance BVHs in kernel layout
//! - [`gpu`] - Device seam with software and wgpu backends
//! - [`render`] - Uniform ring, frame semaphore and the renderer loop
//! - [`config`] - Persistent renderer settings
//! - [`logging`] - Tracing subscriber setup
//!
//! ## Example
//!
//! ```ignore
//! use vrtracer::prelude::*;
//!
//! let backend = SoftwareBackend::headless();
//! let mut renderer = Renderer::new(backend, Scene::cube_scene()?, RendererConfig::default())?;
//! renderer.render_frame(&FrameInput::default())?;
//! let image = renderer.read_output()?;
//! image.save("cube.png".as_ref())?;
//! ```

pub mod accel;
pub mod camera;
pub mod config;
pub mod gpu;
pub mod logging;
pub mod render;
pub mod scene;
pub mod transform;
pub mod util;

// Re-export commonly used types
pub use config::RendererConfig;
pub use render::{FrameInput, FrameOutcome, RenderStats, Renderer};
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accel::{AccelerationStructures, BuildPolicy};
    pub use crate::camera::{FlyCamera, FlyCameraConfig, MoveIntent, ProjectiveCamera, RtCamera, SurfaceOrigin};
    pub use crate::config::RendererConfig;
    pub use crate::gpu::{GpuBackend, OutputImage, SoftwareBackend, SoftwareOptions};
    #[cfg(feature = "gpu")]
    pub use crate::gpu::{WgpuBackend, WgpuOptions};
    pub use crate::render::{FrameInput, FrameOutcome, RenderStats, Renderer};
    pub use crate::scene::{Geometry, GeometryId, GeometryInstance, IntersectionFunction, MeshBuilder, Scene};
    pub use crate::util::{Error, Mat4, Result, UVec2, Vec2, Vec3};
}
