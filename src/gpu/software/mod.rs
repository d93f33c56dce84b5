//! Host-memory device.
//!
//! Buffers live in shared host memory, so writes and copies are visible
//! immediately. Frames run in submission order on a device-timeline thread
//! that traces with the rayon kernel in [`kernel`], "blits" the result to a
//! display image and then fires the completion callback. An optional
//! per-frame latency keeps several frames in flight for pipelining tests.

mod kernel;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{
    BufferDesc, BufferHandle, CompletionFn, FrameSubmission, GpuBackend, ImageHandle, OutputImage,
};
use crate::render::FrameUniforms;
use crate::util::{Error, Result, UVec2};

pub use kernel::RAY_MASK;

type Words = Arc<RwLock<Vec<u32>>>;
type Image = Arc<Mutex<OutputImage>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftwareOptions {
    /// Initial display surface size.
    pub surface_size: UVec2,
    /// Simulated device time per frame.
    pub latency: Duration,
}

impl Default for SoftwareOptions {
    fn default() -> Self {
        Self {
            surface_size: UVec2::new(800, 600),
            latency: Duration::ZERO,
        }
    }
}

/// Counters kept by the device timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineStats {
    pub submitted: u64,
    pub completed: u64,
    /// Highest number of frames queued or executing at once.
    pub max_in_flight: usize,
    /// Frames whose uniform slot had been overwritten before they ran.
    pub stale_uniform_reads: u64,
}

#[derive(Default)]
struct Shared {
    in_flight: AtomicUsize,
    stats: Mutex<TimelineStats>,
    display: Mutex<Option<OutputImage>>,
}

/// Resources captured at submission; keeps them alive until the frame ran.
struct FrameJob {
    frame_index: u64,
    uniforms: Words,
    uniform_offset: usize,
    vertices: Words,
    colors: Words,
    instances: Words,
    structure: Words,
    pool: Words,
    records: Words,
    table: Option<Words>,
    output: Image,
    size: UVec2,
    latency: Duration,
    on_complete: CompletionFn,
}

enum DeviceCommand {
    Frame(Box<FrameJob>),
    /// Signalled once every earlier command has finished.
    Fence(Sender<()>),
    Stop,
}

/// Handle to the device-timeline thread.
struct DeviceTimeline {
    tx: Sender<DeviceCommand>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceTimeline {
    fn spawn(shared: Arc<Shared>) -> Self {
        let (tx, rx) = channel::<DeviceCommand>();
        let handle = thread::spawn(move || timeline_loop(rx, shared));
        Self {
            tx,
            handle: Some(handle),
        }
    }

    fn send(&self, cmd: DeviceCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| Error::backend("device timeline stopped"))
    }

    fn stop(&mut self) {
        let _ = self.tx.send(DeviceCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceTimeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timeline_loop(rx: Receiver<DeviceCommand>, shared: Arc<Shared>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DeviceCommand::Frame(job) => execute_frame(*job, &shared),
            DeviceCommand::Fence(done) => {
                let _ = done.send(());
            }
            DeviceCommand::Stop => break,
        }
    }
}

fn execute_frame(job: FrameJob, shared: &Shared) {
    let _span = tracing::trace_span!("device_frame", frame = job.frame_index).entered();
    if !job.latency.is_zero() {
        thread::sleep(job.latency);
    }

    let uniforms = {
        let words = job.uniforms.read();
        let bytes = bytemuck::cast_slice::<u32, u8>(&words);
        let end = job.uniform_offset + std::mem::size_of::<FrameUniforms>();
        bytes
            .get(job.uniform_offset..end)
            .map(bytemuck::pod_read_unaligned::<FrameUniforms>)
    };

    if let Some(uniforms) = uniforms {
        if uniforms.frame_index != job.frame_index as u32 {
            tracing::warn!(
                frame = job.frame_index,
                found = uniforms.frame_index,
                "uniform slot overwritten before use"
            );
            shared.stats.lock().stale_uniform_reads += 1;
        }

        let vertices = job.vertices.read();
        let colors = job.colors.read();
        let instances = job.instances.read();
        let structure = job.structure.read();
        let pool = job.pool.read();
        let records = job.records.read();
        let table = job.table.as_ref().map(|t| t.read());
        let view = kernel::SceneView {
            vertices: kernel::view(&vertices),
            colors: kernel::view(&colors),
            instances: kernel::view(&instances),
            structure: &structure,
            pool: &pool,
            records: kernel::view(&records),
            table: table.as_deref().map(|t| kernel::view(t)),
        };
        let pixels = kernel::trace_image(&uniforms, &view, job.size);

        let mut output = job.output.lock();
        output.pixels = pixels;
        *shared.display.lock() = Some(output.clone());
    } else {
        tracing::error!(frame = job.frame_index, "uniform slot out of range, frame dropped");
    }

    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    shared.stats.lock().completed += 1;
    (job.on_complete)();
}

/// CPU implementation of [`GpuBackend`].
pub struct SoftwareBackend {
    options: SoftwareOptions,
    surface_size: UVec2,
    surface_available: bool,
    pipelines_ready: bool,
    buffers: HashMap<u32, Words>,
    images: HashMap<u32, Image>,
    next_id: u32,
    shared: Arc<Shared>,
    timeline: DeviceTimeline,
}

impl SoftwareBackend {
    pub fn new(options: SoftwareOptions) -> Self {
        let shared = Arc::new(Shared::default());
        Self {
            options,
            surface_size: options.surface_size,
            surface_available: true,
            pipelines_ready: false,
            buffers: HashMap::new(),
            images: HashMap::new(),
            next_id: 1,
            timeline: DeviceTimeline::spawn(Arc::clone(&shared)),
            shared,
        }
    }

    /// 512x512 surface, no simulated latency.
    pub fn headless() -> Self {
        Self::new(SoftwareOptions {
            surface_size: UVec2::new(512, 512),
            latency: Duration::ZERO,
        })
    }

    pub fn options(&self) -> &SoftwareOptions {
        &self.options
    }

    /// Simulate a window resize (zero while minimized).
    pub fn set_surface_size(&mut self, size: UVec2) {
        self.surface_size = size;
    }

    /// While unavailable, frame submission fails with [`Error::SurfaceUnavailable`].
    pub fn set_surface_available(&mut self, available: bool) {
        self.surface_available = available;
    }

    /// Last image blitted to the display.
    pub fn presented(&self) -> Option<OutputImage> {
        self.shared.display.lock().clone()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn timeline_stats(&self) -> TimelineStats {
        *self.shared.stats.lock()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn words(&self, buffer: BufferHandle) -> Result<&Words> {
        self.buffers
            .get(&buffer.raw())
            .ok_or_else(|| Error::backend(format!("unknown buffer {}", buffer.raw())))
    }

    fn image(&self, image: ImageHandle) -> Result<&Image> {
        self.images
            .get(&image.raw())
            .ok_or_else(|| Error::backend(format!("unknown image {}", image.raw())))
    }

    fn check_range(buffer: BufferHandle, words: &[u32], offset: u64, size: u64) -> Result<()> {
        if offset % 4 != 0 || size % 4 != 0 {
            return Err(Error::backend(format!(
                "unaligned access to buffer {} (offset {offset}, size {size})",
                buffer.raw()
            )));
        }
        let len = words.len() as u64 * 4;
        if offset.checked_add(size).is_none_or(|end| end > len) {
            return Err(Error::backend(format!(
                "access past the end of buffer {} ({offset}+{size} > {len})",
                buffer.raw()
            )));
        }
        Ok(())
    }

    fn job(&self, frame: &FrameSubmission, on_complete: CompletionFn) -> Result<FrameJob> {
        let scene = &frame.scene;
        for handle in scene.indirect() {
            if !frame.resident.contains(&handle) {
                return Err(Error::NotResident(format!("buffer {}", handle.raw())));
            }
        }
        let output = Arc::clone(self.image(frame.output)?);
        let image_size = output.lock().size;
        if image_size != frame.size {
            return Err(Error::config(format!(
                "frame size {} does not match output image {}",
                frame.size, image_size
            )));
        }

        let uniforms = Arc::clone(self.words(frame.uniforms.buffer)?);
        Self::check_range(
            frame.uniforms.buffer,
            &uniforms.read(),
            frame.uniforms.offset,
            std::mem::size_of::<FrameUniforms>() as u64,
        )?;

        Ok(FrameJob {
            frame_index: frame.frame_index,
            uniforms,
            uniform_offset: frame.uniforms.offset as usize,
            vertices: Arc::clone(self.words(scene.vertices)?),
            colors: Arc::clone(self.words(scene.colors)?),
            instances: Arc::clone(self.words(scene.instances)?),
            structure: Arc::clone(self.words(scene.instance_structure)?),
            pool: Arc::clone(self.words(scene.primitive_pool)?),
            records: Arc::clone(self.words(scene.geometry_records)?),
            table: scene
                .intersection_table
                .map(|t| self.words(t).map(Arc::clone))
                .transpose()?,
            output,
            size: frame.size,
            latency: self.options.latency,
            on_complete,
        })
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new(SoftwareOptions::default())
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        let words = desc.size.div_ceil(4) as usize;
        let id = self.alloc_id();
        self.buffers.insert(id, Arc::new(RwLock::new(vec![0; words])));
        tracing::trace!(label = desc.label, size = desc.size, id, "create buffer");
        Ok(BufferHandle::from_raw(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut words = self.words(buffer)?.write();
        Self::check_range(buffer, &words, offset, data.len() as u64)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let (s, d, n) = ((src_offset / 4) as usize, (dst_offset / 4) as usize, (size / 4) as usize);
        if src == dst {
            let mut words = self.words(src)?.write();
            Self::check_range(src, &words, src_offset, size)?;
            Self::check_range(dst, &words, dst_offset, size)?;
            words.copy_within(s..s + n, d);
            return Ok(());
        }
        let from = self.words(src)?.read();
        let mut to = self.words(dst)?.write();
        Self::check_range(src, &from, src_offset, size)?;
        Self::check_range(dst, &to, dst_offset, size)?;
        to[d..d + n].copy_from_slice(&from[s..s + n]);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let words = self.words(buffer)?.read();
        Self::check_range(buffer, &words, offset, size)?;
        let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
        Ok(bytes[offset as usize..(offset + size) as usize].to_vec())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.raw()).is_none() {
            tracing::warn!(id = buffer.raw(), "destroy of unknown buffer");
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers
            .get(&buffer.raw())
            .map(|w| w.read().len() as u64 * 4)
    }

    fn create_output_image(&mut self, size: UVec2) -> Result<ImageHandle> {
        if size.x == 0 || size.y == 0 {
            return Err(Error::config(format!("output image size {size} is empty")));
        }
        let id = self.alloc_id();
        self.images.insert(id, Arc::new(Mutex::new(OutputImage::new(size))));
        Ok(ImageHandle::from_raw(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.images.remove(&image.raw());
    }

    fn surface_size(&self) -> UVec2 {
        self.surface_size
    }

    fn prepare_pipelines(&mut self) -> Result<()> {
        self.pipelines_ready = true;
        Ok(())
    }

    fn submit_frame(&mut self, frame: FrameSubmission, on_complete: CompletionFn) -> Result<()> {
        if !self.surface_available {
            return Err(Error::SurfaceUnavailable);
        }
        if !self.pipelines_ready {
            return Err(Error::config("pipelines not prepared"));
        }
        let job = self.job(&frame, on_complete)?;

        let in_flight = self.shared.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut stats = self.shared.stats.lock();
            stats.submitted += 1;
            stats.max_in_flight = stats.max_in_flight.max(in_flight);
        }
        if let Err(e) = self.timeline.send(DeviceCommand::Frame(Box::new(job))) {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        tracing::trace!(frame = frame.frame_index, in_flight, "frame submitted");
        Ok(())
    }

    fn poll(&mut self) {
        // Completions fire on the timeline thread.
    }

    fn wait_idle(&mut self) -> Result<()> {
        let (tx, rx) = channel();
        self.timeline.send(DeviceCommand::Fence(tx))?;
        rx.recv()
            .map_err(|_| Error::backend("device timeline stopped"))
    }

    fn read_output(&mut self, image: ImageHandle) -> Result<OutputImage> {
        self.wait_idle()?;
        Ok(self.image(image)?.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{AccelerationStructures, BuildPolicy};
    use crate::gpu::{BufferSlice, DispatchGrid};
    use crate::render::{slot_stride, FrameUniforms};
    use crate::scene::Scene;
    use crate::util::{Mat4, Vec3};

    #[test]
    fn test_buffer_write_read_copy() {
        let mut backend = SoftwareBackend::headless();
        let a = backend.create_buffer(&BufferDesc::storage("a", 16)).unwrap();
        let b = backend.create_buffer(&BufferDesc::storage("b", 16)).unwrap();
        backend.write_buffer(a, 4, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        backend.copy_buffer(a, 4, b, 8, 8).unwrap();
        assert_eq!(
            backend.read_buffer(b, 0, 16).unwrap(),
            vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(backend.buffer_size(a), Some(16));
        assert_eq!(backend.live_buffer_count(), 2);
        backend.destroy_buffer(a);
        assert_eq!(backend.buffer_size(a), None);
        assert!(backend.read_buffer(a, 0, 4).is_err());
    }

    #[test]
    fn test_copy_within_one_buffer() {
        let mut backend = SoftwareBackend::headless();
        let a = backend.create_buffer(&BufferDesc::storage("a", 16)).unwrap();
        backend.write_buffer(a, 0, &[9, 9, 9, 9]).unwrap();
        backend.copy_buffer(a, 0, a, 12, 4).unwrap();
        assert_eq!(&backend.read_buffer(a, 12, 4).unwrap(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_out_of_range_and_unaligned_access() {
        let mut backend = SoftwareBackend::headless();
        let a = backend.create_buffer(&BufferDesc::storage("a", 8)).unwrap();
        assert!(backend.write_buffer(a, 4, &[0; 8]).is_err());
        assert!(backend.write_buffer(a, 2, &[0; 4]).is_err());
        assert!(backend.read_buffer(a, 0, 12).is_err());
        assert!(backend.copy_buffer(a, 0, a, 4, 8).is_err());
    }

    struct Fixture {
        backend: SoftwareBackend,
        frame: FrameSubmission,
    }

    fn fixture(latency: Duration) -> Fixture {
        let mut backend = SoftwareBackend::new(SoftwareOptions {
            surface_size: UVec2::new(16, 16),
            latency,
        });
        let mut scene = Scene::cube_scene().unwrap();
        let buffers = scene.upload(&mut backend).unwrap();
        let accel = AccelerationStructures::build(&mut backend, &scene, BuildPolicy::default()).unwrap();
        let size = UVec2::new(16, 16);
        let uniforms = backend
            .create_buffer(&BufferDesc::uniform("uniforms", slot_stride()))
            .unwrap();
        let u = FrameUniforms::new(size, 0, accel.instance_count(), Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ZERO, false);
        backend.write_buffer(uniforms, 0, bytemuck::bytes_of(&u)).unwrap();
        let output = backend.create_output_image(size).unwrap();
        let scene = accel.bindings(&buffers);
        let frame = FrameSubmission {
            frame_index: 0,
            uniforms: BufferSlice { buffer: uniforms, offset: 0 },
            scene,
            resident: scene.indirect().to_vec(),
            output,
            size,
            grid: DispatchGrid::for_size(size),
        };
        Fixture { backend, frame }
    }

    fn counter() -> (Arc<AtomicUsize>, CompletionFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_submit_requires_pipelines() {
        let Fixture { mut backend, frame } = fixture(Duration::ZERO);
        let (count, done) = counter();
        assert!(matches!(backend.submit_frame(frame, done), Err(Error::Configuration(_))));
        backend.wait_idle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_completion_runs_once() {
        let Fixture { mut backend, frame } = fixture(Duration::ZERO);
        backend.prepare_pipelines().unwrap();
        let (count, done) = counter();
        backend.submit_frame(frame, done).unwrap();
        backend.wait_idle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(backend.presented().is_some());
        let stats = backend.timeline_stats();
        assert_eq!((stats.submitted, stats.completed), (1, 1));
        assert_eq!(stats.stale_uniform_reads, 0);
    }

    #[test]
    fn test_missing_residency_is_rejected() {
        let Fixture { mut backend, mut frame } = fixture(Duration::ZERO);
        backend.prepare_pipelines().unwrap();
        frame.resident.retain(|&b| b != frame.scene.primitive_pool);
        let (count, done) = counter();
        assert!(matches!(backend.submit_frame(frame, done), Err(Error::NotResident(_))));
        backend.wait_idle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unavailable_surface_drops_callback() {
        let Fixture { mut backend, frame } = fixture(Duration::ZERO);
        backend.prepare_pipelines().unwrap();
        backend.set_surface_available(false);
        let (count, done) = counter();
        let err = backend.submit_frame(frame.clone(), done).unwrap_err();
        assert!(err.is_transient());

        backend.set_surface_available(true);
        let (_, done) = counter();
        backend.submit_frame(frame, done).unwrap();
        backend.wait_idle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroy_during_flight_is_safe() {
        let Fixture { mut backend, frame } = fixture(Duration::from_millis(20));
        backend.prepare_pipelines().unwrap();
        let scene = frame.scene;
        let (count, done) = counter();
        backend.submit_frame(frame, done).unwrap();
        backend.destroy_buffer(scene.primitive_pool);
        backend.destroy_buffer(scene.vertices);
        backend.wait_idle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overwritten_uniforms_are_counted() {
        let Fixture { mut backend, frame } = fixture(Duration::from_millis(20));
        backend.prepare_pipelines().unwrap();
        let slot = frame.uniforms;
        let (_, done) = counter();
        backend.submit_frame(frame, done).unwrap();
        let mut u: FrameUniforms = bytemuck::Zeroable::zeroed();
        u.frame_index = 7;
        backend.write_buffer(slot.buffer, slot.offset, bytemuck::bytes_of(&u)).unwrap();
        backend.wait_idle().unwrap();
        assert_eq!(backend.timeline_stats().stale_uniform_reads, 1);
    }
}
