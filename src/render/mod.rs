//! Frame pipeline.
//!
//! ## Per-frame state machine
//! ```text
//!  acquire permit ──> update (resize, camera, uniform slot) ──> dispatch ──> present
//!        ^                                                                      |
//!        └──────────── completion: release slot, signal semaphore <─────────────┘
//! ```
//!
//! Up to `max_frames_in_flight` frames are queued on the device at once. Each
//! frame owns one slot of the [`UniformRing`]; the slot and the permit are
//! returned together when the frame completes, or immediately if it is
//! never submitted.

mod semaphore;
mod uniforms;

pub use semaphore::{FramePermit, FrameSemaphore};
pub use uniforms::{slot_stride, FrameUniforms, SlotRelease, UniformRing, UNIFORM_SLOT_ALIGN};

use std::sync::Arc;
use std::time::Duration;

use crate::accel::AccelerationStructures;
use crate::camera::{FlyCamera, MoveIntent, ProjectiveCamera, RtCamera};
use crate::config::RendererConfig;
use crate::gpu::{DispatchGrid, FrameSubmission, GpuBackend, ImageHandle, OutputImage};
use crate::scene::{Scene, SceneBuffers, SceneRevision};
use crate::util::{Error, Result, UVec2, Vec2};

/// Backend poll interval while waiting for a free frame slot.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Input sampled once per frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameInput {
    /// Seconds since the previous frame.
    pub dt: f32,
    pub pointer_delta: Vec2,
    pub moves: MoveIntent,
    /// Return the fly camera to its home pose before applying this input.
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Submitted { frame_index: u64 },
    /// Nothing was presented (surface unavailable or zero-sized).
    Skipped { frame_index: u64 },
}

impl FrameOutcome {
    pub fn frame_index(&self) -> u64 {
        match *self {
            Self::Submitted { frame_index } | Self::Skipped { frame_index } => frame_index,
        }
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_submitted: u64,
    pub frames_skipped: u64,
    pub full_builds: u64,
    pub instance_builds: u64,
    /// High-water mark of frames in flight.
    pub max_in_flight: usize,
}

/// Released when a frame completes or is dropped unsubmitted.
struct FrameCompletion {
    slot: SlotRelease,
    _permit: FramePermit,
}

impl Drop for FrameCompletion {
    fn drop(&mut self) {
        // The slot is freed before the permit returns.
        self.slot.release();
    }
}

/// Device resources owned by the renderer.
struct FrameResources {
    buffers: SceneBuffers,
    accel: AccelerationStructures,
    ring: UniformRing,
    output: Option<ImageHandle>,
}

/// Interactive ray-tracing renderer over a [`GpuBackend`].
pub struct Renderer<B: GpuBackend> {
    backend: B,
    scene: Scene,
    config: RendererConfig,
    resources: Option<FrameResources>,
    built: SceneRevision,
    semaphore: Arc<FrameSemaphore>,
    camera: Box<dyn RtCamera>,
    fly: FlyCamera,
    output_size: UVec2,
    frame_index: u64,
    stats: RenderStats,
}

impl<B: GpuBackend> Renderer<B> {
    /// Prepare pipelines, upload the scene and build its acceleration structures.
    ///
    /// Every failure here is a configuration error.
    #[tracing::instrument(skip_all, fields(backend = backend.name()))]
    pub fn new(mut backend: B, mut scene: Scene, mut config: RendererConfig) -> Result<Self> {
        for note in config.validate() {
            tracing::warn!("config: {note}");
        }
        backend
            .prepare_pipelines()
            .map_err(|e| Error::config(format!("pipeline setup failed: {e}")))?;

        let placement = scene.camera;
        let fly = FlyCamera::from_placement(placement.position, placement.target, placement.up, config.fly)?;
        let surface = backend.surface_size();
        let initial = if surface.x == 0 || surface.y == 0 {
            config.output_size()
        } else {
            surface
        };
        let camera = ProjectiveCamera::new(
            fly.camera_to_world(),
            initial,
            config.fov_y_degrees,
            config.z_near,
            config.z_far,
            config.surface_origin,
        )?;

        let resources = Self::create_resources(&mut backend, &mut scene, &config)
            .map_err(|e| match e {
                Error::Configuration(_) => e,
                other => Error::config(format!("scene setup failed: {other}")),
            })?;

        tracing::info!(
            backend = backend.name(),
            triangles = scene.triangle_count(),
            instances = resources.accel.instance_count(),
            frames_in_flight = config.max_frames_in_flight,
            "renderer ready"
        );

        Ok(Self {
            built: scene.revision(),
            semaphore: Arc::new(FrameSemaphore::new(config.max_frames_in_flight)),
            camera: Box::new(camera),
            fly,
            output_size: UVec2::ZERO,
            frame_index: 0,
            stats: RenderStats {
                full_builds: 1,
                ..Default::default()
            },
            resources: Some(resources),
            backend,
            scene,
            config,
        })
    }

    fn create_resources(backend: &mut B, scene: &mut Scene, config: &RendererConfig) -> Result<FrameResources> {
        let buffers = scene.upload(backend)?;
        let accel = match AccelerationStructures::build(backend, scene, config.build_policy()) {
            Ok(a) => a,
            Err(e) => {
                scene.release(backend, buffers);
                return Err(e);
            }
        };
        let ring = match UniformRing::new(backend, config.max_frames_in_flight) {
            Ok(r) => r,
            Err(e) => {
                accel.release(backend);
                scene.release(backend, buffers);
                return Err(e);
            }
        };
        Ok(FrameResources {
            buffers,
            accel,
            ring,
            output: None,
        })
    }

    /// Run one tick of the frame state machine.
    pub fn render_frame(&mut self, input: &FrameInput) -> Result<FrameOutcome> {
        if self.resources.is_none() {
            return Err(Error::config("renderer has been shut down"));
        }
        self.sync_scene()?;

        let permit = self.acquire();
        let in_flight = self.semaphore.capacity() - self.semaphore.available();
        self.stats.max_in_flight = self.stats.max_in_flight.max(in_flight);

        let frame_index = self.frame_index;
        let _span = tracing::debug_span!("frame", index = frame_index).entered();

        let size = self.backend.surface_size();
        if size.x == 0 || size.y == 0 {
            self.frame_index += 1;
            self.stats.frames_skipped += 1;
            tracing::trace!("zero-sized surface, frame skipped");
            return Ok(FrameOutcome::Skipped { frame_index });
        }
        if size != self.output_size {
            self.resize(size)?;
        }

        // Camera
        if input.reset {
            self.fly.reset();
        }
        self.fly.update(input.dt, input.pointer_delta, input.moves);
        self.camera.set_camera_to_world(self.fly.camera_to_world());

        let Some(res) = self.resources.as_mut() else {
            return Err(Error::config("renderer has been shut down"));
        };
        let Some(output) = res.output else {
            return Err(Error::config("output image missing"));
        };

        let uniforms = FrameUniforms::new(
            size,
            frame_index,
            res.accel.instance_count(),
            self.camera.camera_to_world(),
            self.camera.viewport_to_camera(),
            self.config.background(),
            res.accel.uses_intersection_functions(),
        );
        let (slot_slice, slot) = res.ring.write(&mut self.backend, frame_index, uniforms)?;
        self.frame_index += 1;

        let scene = res.accel.bindings(&res.buffers);
        let mut resident = scene.indirect().to_vec();
        resident.extend(res.accel.primitives().iter().map(|p| p.buffer));
        let submission = FrameSubmission {
            frame_index,
            uniforms: slot_slice,
            scene,
            resident,
            output,
            size,
            grid: DispatchGrid::for_size(size),
        };

        let completion = FrameCompletion { slot, _permit: permit };
        match self
            .backend
            .submit_frame(submission, Box::new(move || drop(completion)))
        {
            Ok(()) => {
                self.stats.frames_submitted += 1;
                Ok(FrameOutcome::Submitted { frame_index })
            }
            Err(e) if e.is_transient() => {
                self.stats.frames_skipped += 1;
                tracing::debug!("frame skipped: {e}");
                Ok(FrameOutcome::Skipped { frame_index })
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for a permit, polling the device so completions can arrive.
    fn acquire(&mut self) -> FramePermit {
        loop {
            if let Some(permit) = self.semaphore.permit_for(POLL_INTERVAL) {
                return permit;
            }
            self.backend.poll();
        }
    }

    /// Block until no frame is in flight.
    fn drain(&mut self) {
        while !self.semaphore.wait_all_for(POLL_INTERVAL) {
            self.backend.poll();
        }
    }

    fn resize(&mut self, size: UVec2) -> Result<()> {
        let Some(res) = self.resources.as_mut() else {
            return Ok(());
        };
        let image = self.backend.create_output_image(size)?;
        if let Some(old) = res.output.replace(image) {
            self.backend.destroy_image(old);
        }
        self.camera.set_output_size(size)?;
        self.output_size = size;
        tracing::debug!(width = size.x, height = size.y, "output resized");
        Ok(())
    }

    /// Rebuild whatever the scene edits since the last build invalidated.
    fn sync_scene(&mut self) -> Result<()> {
        let current = self.scene.revision();
        if current == self.built {
            return Ok(());
        }
        self.drain();

        if current.geometry != self.built.geometry {
            let _span = tracing::info_span!("full_rebuild").entered();
            let Some(FrameResources { buffers, accel, ring, output }) = self.resources.take() else {
                return Ok(());
            };
            accel.release(&mut self.backend);
            self.scene.release(&mut self.backend, buffers);

            let rebuilt = self.scene.upload(&mut self.backend).and_then(|buffers| {
                match AccelerationStructures::build(&mut self.backend, &self.scene, self.config.build_policy()) {
                    Ok(accel) => Ok((buffers, accel)),
                    Err(e) => {
                        self.scene.release(&mut self.backend, buffers);
                        Err(e)
                    }
                }
            });
            match rebuilt {
                Ok((buffers, accel)) => {
                    self.resources = Some(FrameResources { buffers, accel, ring, output });
                    self.stats.full_builds += 1;
                }
                Err(e) => {
                    // Without a scene the renderer cannot continue.
                    ring.release_buffer(&mut self.backend);
                    if let Some(image) = output {
                        self.backend.destroy_image(image);
                    }
                    return Err(e);
                }
            }
        } else if let Some(res) = self.resources.as_mut() {
            res.accel.rebuild_instances(&mut self.backend, &self.scene)?;
            self.stats.instance_builds += 1;
        }
        self.built = current;
        Ok(())
    }

    /// Stop issuing frames, wait for in-flight ones and release device resources.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(res) = self.resources.take() else {
            return Ok(());
        };
        self.drain();
        self.backend.wait_idle()?;
        if let Some(image) = res.output {
            self.backend.destroy_image(image);
        }
        res.ring.release_buffer(&mut self.backend);
        res.accel.release(&mut self.backend);
        self.scene.release(&mut self.backend, res.buffers);
        tracing::info!(
            submitted = self.stats.frames_submitted,
            skipped = self.stats.frames_skipped,
            "renderer shut down"
        );
        Ok(())
    }

    /// Read back the most recent output image (waits for the device).
    pub fn read_output(&mut self) -> Result<OutputImage> {
        let image = self
            .resources
            .as_ref()
            .and_then(|r| r.output)
            .ok_or(Error::NotUploaded)?;
        self.backend.read_output(image)
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Mutable scene; edits are picked up at the start of the next frame.
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn camera(&self) -> &dyn RtCamera {
        self.camera.as_ref()
    }

    pub fn fly_camera(&self) -> &FlyCamera {
        &self.fly
    }

    pub fn fly_camera_mut(&mut self) -> &mut FlyCamera {
        &mut self.fly
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn acceleration_structures(&self) -> Option<&AccelerationStructures> {
        self.resources.as_ref().map(|r| &r.accel)
    }

    pub fn uniform_ring(&self) -> Option<&UniformRing> {
        self.resources.as_ref().map(|r| &r.ring)
    }

    /// Index the next frame will get.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn frames_in_flight(&self) -> usize {
        self.semaphore.capacity() - self.semaphore.available()
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }
}

impl<B: GpuBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("renderer shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{SoftwareBackend, SoftwareOptions};
    use crate::scene::GeometryInstance;
    use crate::util::{Mat4, Vec3};

    fn renderer(latency_ms: u64, frames_in_flight: usize) -> Renderer<SoftwareBackend> {
        let backend = SoftwareBackend::new(SoftwareOptions {
            surface_size: UVec2::new(32, 32),
            latency: Duration::from_millis(latency_ms),
        });
        let config = RendererConfig {
            max_frames_in_flight: frames_in_flight,
            ..Default::default()
        };
        Renderer::new(backend, Scene::cube_scene().unwrap(), config).unwrap()
    }

    #[test]
    fn test_frames_are_numbered_in_order() {
        let mut r = renderer(0, 3);
        for expected in 0..5 {
            let outcome = r.render_frame(&FrameInput::default()).unwrap();
            assert_eq!(outcome, FrameOutcome::Submitted { frame_index: expected });
        }
        r.shutdown().unwrap();
        assert_eq!(r.stats().frames_submitted, 5);
        assert_eq!(r.frames_in_flight(), 0);
        assert_eq!(r.backend().timeline_stats().completed, 5);
    }

    #[test]
    fn test_in_flight_is_bounded() {
        let mut r = renderer(15, 2);
        for _ in 0..6 {
            r.render_frame(&FrameInput::default()).unwrap();
            assert!(r.frames_in_flight() <= 2);
        }
        r.shutdown().unwrap();
        let timeline = r.backend().timeline_stats();
        assert!(timeline.max_in_flight <= 2);
        assert_eq!(timeline.stale_uniform_reads, 0);
        assert!(r.stats().max_in_flight <= 2);
    }

    #[test]
    fn test_zero_surface_skips() {
        let mut r = renderer(0, 3);
        r.backend_mut().set_surface_size(UVec2::ZERO);
        let outcome = r.render_frame(&FrameInput::default()).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped { frame_index: 0 });

        r.backend_mut().set_surface_size(UVec2::new(16, 8));
        let outcome = r.render_frame(&FrameInput::default()).unwrap();
        assert_eq!(outcome, FrameOutcome::Submitted { frame_index: 1 });
        assert_eq!(r.camera().output_size(), UVec2::new(16, 8));
        assert_eq!(r.read_output().unwrap().size, UVec2::new(16, 8));
    }

    #[test]
    fn test_camera_motion_does_not_rebuild() {
        let mut r = renderer(0, 3);
        let input = FrameInput {
            dt: 0.1,
            pointer_delta: Vec2::new(3.0, 1.0),
            moves: MoveIntent { forward: true, ..Default::default() },
            reset: false,
        };
        for _ in 0..3 {
            r.render_frame(&input).unwrap();
        }
        assert_eq!(r.stats().full_builds, 1);
        assert_eq!(r.stats().instance_builds, 0);
    }

    #[test]
    fn test_instance_edit_rebuilds_instances_only() {
        let mut r = renderer(0, 3);
        r.render_frame(&FrameInput::default()).unwrap();
        assert!(r.scene_mut().set_instance_transform(0, Mat4::from_translation(Vec3::X)));
        r.render_frame(&FrameInput::default()).unwrap();
        assert_eq!(r.stats().instance_builds, 1);
        assert_eq!(r.stats().full_builds, 1);

        let geometry = r.scene().instances()[0].geometry;
        r.scene_mut().add_instance(GeometryInstance::new(geometry, Mat4::from_translation(-Vec3::X)));
        r.render_frame(&FrameInput::default()).unwrap();
        assert_eq!(r.acceleration_structures().unwrap().instance_count(), 2);
    }

    #[test]
    fn test_render_after_shutdown_fails() {
        let mut r = renderer(0, 1);
        r.shutdown().unwrap();
        assert!(r.render_frame(&FrameInput::default()).is_err());
        assert_eq!(r.backend().live_buffer_count(), 0);
    }
}
