//! Per-frame uniforms and the multi-buffered uniform ring.
//!
//! ```text
//!  uniform buffer:  | slot 0 (256 B) | slot 1 (256 B) | slot 2 (256 B) |
//!  written frames:     1st, 4th ...     2nd, 5th ...     3rd, 6th ...
//! ```
//!
//! Slots are handed out round-robin by a cursor that only moves when a slot
//! is written, so frames skipped before reaching the ring do not shift it.
//! A slot is reused only once the frame that last read it has completed; the
//! ring tracks the owning frame of every slot and never overwrites a pending
//! one. With one semaphore permit per slot, a permit holder always finds a
//! free slot.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::gpu::{BufferDesc, BufferHandle, BufferSlice, GpuBackend};
use crate::util::{align_up, Error, Mat4, Result, UVec2, Vec3};

/// Alignment of each uniform slot (dynamic uniform offset alignment).
pub const UNIFORM_SLOT_ALIGN: u64 = 256;

/// Uniform block read by the kernel (176 bytes, matches the WGSL struct).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub width: u32,
    pub height: u32,
    /// Low 32 bits of the frame index.
    pub frame_index: u32,
    pub instance_count: u32,
    pub camera_to_world: [[f32; 4]; 4],
    pub viewport_to_camera: [[f32; 4]; 4],
    /// rgb = background color, a unused.
    pub background: [f32; 4],
    /// x = intersection functions enabled.
    pub options: [u32; 4],
}

impl FrameUniforms {
    pub const USE_INTERSECTION_FUNCTIONS: usize = 0;

    pub fn new(
        size: UVec2,
        frame_index: u64,
        instance_count: u32,
        camera_to_world: Mat4,
        viewport_to_camera: Mat4,
        background: Vec3,
        use_intersection_functions: bool,
    ) -> Self {
        Self {
            width: size.x,
            height: size.y,
            frame_index: frame_index as u32,
            instance_count,
            camera_to_world: camera_to_world.to_cols_array_2d(),
            viewport_to_camera: viewport_to_camera.to_cols_array_2d(),
            background: background.extend(1.0).to_array(),
            options: [use_intersection_functions as u32, 0, 0, 0],
        }
    }

    pub fn camera_to_world(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.camera_to_world)
    }

    pub fn viewport_to_camera(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.viewport_to_camera)
    }

    pub fn background(&self) -> Vec3 {
        Vec3::new(self.background[0], self.background[1], self.background[2])
    }

    pub fn uses_intersection_functions(&self) -> bool {
        self.options[Self::USE_INTERSECTION_FUNCTIONS] != 0
    }
}

/// Byte stride between uniform slots.
pub const fn slot_stride() -> u64 {
    align_up(std::mem::size_of::<FrameUniforms>() as u64, UNIFORM_SLOT_ALIGN)
}

/// Releases a ring slot when its frame completes. Cloneable so the failure
/// path can release the slot the completion callback would have released.
#[derive(Debug, Clone)]
pub struct SlotRelease {
    pending: Arc<Mutex<Vec<Option<u64>>>>,
    slot: usize,
    frame: u64,
}

impl SlotRelease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Clear the slot if this frame still owns it.
    pub fn release(&self) {
        let mut pending = self.pending.lock();
        if pending[self.slot] == Some(self.frame) {
            pending[self.slot] = None;
        }
    }
}

/// N uniform slots in one device buffer plus their CPU shadows.
pub struct UniformRing {
    buffer: BufferHandle,
    shadow: Box<[FrameUniforms]>,
    pending: Arc<Mutex<Vec<Option<u64>>>>,
    next: usize,
}

impl UniformRing {
    pub fn new(backend: &mut dyn GpuBackend, slot_count: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(Error::config("uniform ring needs at least one slot"));
        }
        let buffer = backend.create_buffer(&BufferDesc::uniform(
            "frame_uniforms",
            slot_stride() * slot_count as u64,
        ))?;
        Ok(Self {
            buffer,
            shadow: vec![FrameUniforms::zeroed(); slot_count].into_boxed_slice(),
            pending: Arc::new(Mutex::new(vec![None; slot_count])),
            next: 0,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.shadow.len()
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Slot the cursor points at (the next write starts its search here).
    pub fn next_slot(&self) -> usize {
        self.next
    }

    /// Number of slots still read by in-flight frames.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().iter().filter(|p| p.is_some()).count()
    }

    /// Last uniforms written to `slot`.
    pub fn shadow(&self, slot: usize) -> &FrameUniforms {
        &self.shadow[slot]
    }

    /// Write `uniforms` into the first free slot at or after the cursor and
    /// mark it pending for `frame`. Fails with `SlotBusy` only when every
    /// slot is still pending.
    pub fn write(
        &mut self,
        backend: &mut dyn GpuBackend,
        frame: u64,
        uniforms: FrameUniforms,
    ) -> Result<(BufferSlice, SlotRelease)> {
        let count = self.shadow.len();
        let slot = {
            let mut pending = self.pending.lock();
            let free = (0..count)
                .map(|i| (self.next + i) % count)
                .find(|&s| pending[s].is_none());
            let Some(slot) = free else {
                let owner = pending[self.next].unwrap_or_default();
                return Err(Error::SlotBusy { slot: self.next, frame: owner });
            };
            pending[slot] = Some(frame);
            slot
        };

        let offset = slot as u64 * slot_stride();
        let release = SlotRelease {
            pending: Arc::clone(&self.pending),
            slot,
            frame,
        };
        if let Err(e) = backend.write_buffer(self.buffer, offset, bytemuck::bytes_of(&uniforms)) {
            release.release();
            return Err(e);
        }
        self.shadow[slot] = uniforms;
        self.next = (slot + 1) % count;
        Ok((
            BufferSlice {
                buffer: self.buffer,
                offset,
            },
            release,
        ))
    }

    pub fn release_buffer(self, backend: &mut dyn GpuBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn uniforms(frame: u64) -> FrameUniforms {
        FrameUniforms::new(UVec2::new(4, 4), frame, 0, Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ZERO, false)
    }

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 176);
        assert_eq!(slot_stride(), 256);
    }

    #[test]
    fn test_slots_rotate_and_align() {
        let mut backend = SoftwareBackend::headless();
        let mut ring = UniformRing::new(&mut backend, 3).unwrap();
        for frame in 0..6u64 {
            let (slice, release) = ring.write(&mut backend, frame, uniforms(frame)).unwrap();
            assert_eq!(release.slot(), (frame % 3) as usize);
            assert_eq!(slice.offset % UNIFORM_SLOT_ALIGN, 0);
            assert_eq!(slice.offset, (frame % 3) * 256);
            release.release();
        }
        assert_eq!(ring.pending_count(), 0);
    }

    #[test]
    fn test_pending_slot_is_not_overwritten() {
        let mut backend = SoftwareBackend::headless();
        let mut ring = UniformRing::new(&mut backend, 2).unwrap();
        let (_, r0) = ring.write(&mut backend, 0, uniforms(0)).unwrap();
        let (_, r1) = ring.write(&mut backend, 1, uniforms(1)).unwrap();
        assert_eq!(ring.pending_count(), 2);

        let err = ring.write(&mut backend, 2, uniforms(2)).unwrap_err();
        assert!(matches!(err, Error::SlotBusy { slot: 0, frame: 0 }));
        assert_eq!(ring.shadow(0).frame_index, 0);

        r0.release();
        let (slice, _) = ring.write(&mut backend, 2, uniforms(2)).unwrap();
        assert_eq!(slice.offset, 0);
        let bytes = backend.read_buffer(ring.buffer(), 0, 176).unwrap();
        let read: FrameUniforms = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(read.frame_index, 2);
        r1.release();
        assert_eq!(ring.pending_count(), 1);
    }

    #[test]
    fn test_skipped_frame_numbers_do_not_pick_slots() {
        let mut backend = SoftwareBackend::headless();
        let mut ring = UniformRing::new(&mut backend, 3).unwrap();
        // Frames 1 and 4 never reached the ring
        let (_, r0) = ring.write(&mut backend, 0, uniforms(0)).unwrap();
        let (_, r2) = ring.write(&mut backend, 2, uniforms(2)).unwrap();
        let (_, r3) = ring.write(&mut backend, 3, uniforms(3)).unwrap();
        assert_eq!((r0.slot(), r2.slot(), r3.slot()), (0, 1, 2));

        // Frame 0 is still pending; frame 2 completed out of order
        r2.release();
        let (slice, r5) = ring.write(&mut backend, 5, uniforms(5)).unwrap();
        assert_eq!(r5.slot(), 1);
        assert_eq!(slice.offset, 256);
        assert_eq!(ring.shadow(0).frame_index, 0);
        assert_eq!(ring.pending_count(), 3);

        let err = ring.write(&mut backend, 6, uniforms(6)).unwrap_err();
        assert!(matches!(err, Error::SlotBusy { .. }));
        r0.release();
        r3.release();
        r5.release();
    }

    #[test]
    fn test_stale_release_is_ignored() {
        let mut backend = SoftwareBackend::headless();
        let mut ring = UniformRing::new(&mut backend, 1).unwrap();
        let (_, r0) = ring.write(&mut backend, 0, uniforms(0)).unwrap();
        r0.release();
        let (_, _r1) = ring.write(&mut backend, 1, uniforms(1)).unwrap();
        // A duplicate release from frame 0 must not free frame 1's slot
        r0.release();
        assert_eq!(ring.pending_count(), 1);
    }

    #[test]
    fn test_uniform_accessors() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let u = FrameUniforms::new(UVec2::new(8, 6), (1u64 << 32) + 5, 2, m, Mat4::IDENTITY, Vec3::X, true);
        assert_eq!(u.frame_index, 5);
        assert_eq!(u.camera_to_world(), m);
        assert_eq!(u.background(), Vec3::X);
        assert!(u.uses_intersection_functions());
        assert!(UniformRing::new(&mut SoftwareBackend::headless(), 0).is_err());
    }
}
