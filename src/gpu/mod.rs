//! Device backends.
//!
//! Everything the renderer needs from a device goes through [`GpuBackend`]:
//! buffer management, the per-pixel ray-tracing dispatch and presentation.
//! Two implementations exist:
//!
//! - [`SoftwareBackend`] - host memory plus a device-timeline thread running a
//!   rayon reference kernel (always available, used by tests and headless runs)
//! - [`WgpuBackend`] - WGSL compute kernel and blit pass (feature `gpu`)
//!
//! ## Frame contract
//!
//! ```text
//!  submit_frame(frame, on_complete)
//!     |
//!     +-- Err(_)  callback dropped, never called
//!     +-- Ok(())  device executes:
//!                   trace  ceil(w/8) x ceil(h/8) groups of 8x8 -> output image
//!                   blit   output image -> display surface
//!                 then calls on_complete exactly once (any thread)
//! ```

mod readback;
pub mod software;
#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use readback::OutputImage;
pub use software::{SoftwareBackend, SoftwareOptions, TimelineStats};

#[cfg(feature = "gpu")]
pub use wgpu_backend::{WgpuBackend, WgpuOptions};

use crate::util::{Result, UVec2};

/// Threads per workgroup along each axis.
pub const WORKGROUP_SIZE: u32 = 8;

/// Opaque buffer id issued by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u32);

impl BufferHandle {
    pub(crate) fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Opaque output image id issued by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(u32);

impl ImageHandle {
    pub(crate) fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Read-only storage for the kernel, also a copy source/destination.
    Storage,
    /// Uniform data bound with a dynamic offset.
    Uniform,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    /// Size in bytes (multiple of 4).
    pub size: u64,
    pub usage: BufferUsage,
}

impl<'a> BufferDesc<'a> {
    pub fn storage(label: &'a str, size: u64) -> Self {
        Self { label, size, usage: BufferUsage::Storage }
    }

    pub fn uniform(label: &'a str, size: u64) -> Self {
        Self { label, size, usage: BufferUsage::Uniform }
    }
}

/// A buffer plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer: BufferHandle,
    pub offset: u64,
}

/// Scene resources bound to the ray-tracing kernel.
///
/// `vertices`, `colors` and `primitive_pool` are only reached through the
/// instance structure; they must also appear in [`FrameSubmission::resident`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneBindings {
    pub vertices: BufferHandle,
    pub colors: BufferHandle,
    pub instances: BufferHandle,
    pub instance_structure: BufferHandle,
    pub primitive_pool: BufferHandle,
    pub geometry_records: BufferHandle,
    pub intersection_table: Option<BufferHandle>,
}

impl SceneBindings {
    /// Buffers the kernel reaches indirectly through the instance structure.
    pub fn indirect(&self) -> [BufferHandle; 3] {
        [self.vertices, self.colors, self.primitive_pool]
    }
}

/// 2-D dispatch of `groups` workgroups of `group_size` threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGrid {
    pub groups: UVec2,
    pub group_size: UVec2,
}

impl DispatchGrid {
    /// Grid with one thread per pixel, rounded up to whole workgroups.
    pub fn for_size(size: UVec2) -> Self {
        Self {
            groups: UVec2::new(
                size.x.div_ceil(WORKGROUP_SIZE),
                size.y.div_ceil(WORKGROUP_SIZE),
            ),
            group_size: UVec2::splat(WORKGROUP_SIZE),
        }
    }

    /// Thread extent covered by the grid (>= the image size).
    pub fn threads(&self) -> UVec2 {
        self.groups * self.group_size
    }
}

/// Everything a device needs to run and present one frame.
#[derive(Debug, Clone)]
pub struct FrameSubmission {
    pub frame_index: u64,
    /// Uniform slot for this frame (bound with a dynamic offset).
    pub uniforms: BufferSlice,
    pub scene: SceneBindings,
    /// Resources used indirectly by the dispatch.
    pub resident: Vec<BufferHandle>,
    pub output: ImageHandle,
    pub size: UVec2,
    pub grid: DispatchGrid,
}

/// Completion callback; runs once when the device finished a frame.
pub type CompletionFn = Box<dyn FnOnce() + Send + 'static>;

/// Device abstraction used by the scene, acceleration and frame modules.
///
/// Writes are visible to every frame submitted afterwards. Callers must not
/// write or copy into a region that an in-flight frame reads.
pub trait GpuBackend: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle>;

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Device-side copy of `size` bytes.
    fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;

    /// Blocking readback of a buffer range.
    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Release a buffer. In-flight frames keep their references alive.
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64>;

    /// Create an rgba32float output image the kernel writes into.
    fn create_output_image(&mut self, size: UVec2) -> Result<ImageHandle>;

    fn destroy_image(&mut self, image: ImageHandle);

    /// Current display surface size in pixels (may be zero while minimized).
    fn surface_size(&self) -> UVec2;

    /// Compile the ray-tracing and blit pipelines.
    fn prepare_pipelines(&mut self) -> Result<()>;

    /// Encode and submit one frame. `on_complete` runs exactly once iff this returns `Ok`.
    fn submit_frame(&mut self, frame: FrameSubmission, on_complete: CompletionFn) -> Result<()>;

    /// Non-blocking progress of device work and completion callbacks.
    fn poll(&mut self);

    /// Block until all submitted work has completed.
    fn wait_idle(&mut self) -> Result<()>;

    /// Blocking readback of an output image.
    fn read_output(&mut self, image: ImageHandle) -> Result<OutputImage>;
}
