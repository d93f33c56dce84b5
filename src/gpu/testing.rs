//! Fault-injecting backend for error-path tests.

use super::{
    BufferDesc, BufferHandle, CompletionFn, FrameSubmission, GpuBackend, ImageHandle, OutputImage, SoftwareBackend,
};
use crate::util::{Error, Result, UVec2};

/// Wraps a [`SoftwareBackend`]; each budget counts the calls that still
/// succeed before that operation starts failing (`None` = never fails).
pub(crate) struct FailingBackend {
    pub inner: SoftwareBackend,
    pub creates_left: Option<usize>,
    pub writes_left: Option<usize>,
    pub fail_wait: bool,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self {
            inner: SoftwareBackend::headless(),
            creates_left: None,
            writes_left: None,
            fail_wait: false,
        }
    }

    pub fn live_buffer_count(&self) -> usize {
        self.inner.live_buffer_count()
    }
}

fn spend(budget: &mut Option<usize>, what: &str) -> Result<()> {
    match budget {
        Some(0) => Err(Error::backend(format!("injected {what} failure"))),
        Some(n) => {
            *n -= 1;
            Ok(())
        }
        None => Ok(()),
    }
}

impl GpuBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        spend(&mut self.creates_left, "create")?;
        self.inner.create_buffer(desc)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        spend(&mut self.writes_left, "write")?;
        self.inner.write_buffer(buffer, offset, data)
    }

    fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.inner.copy_buffer(src, src_offset, dst, dst_offset, size)
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.inner.read_buffer(buffer, offset, size)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.inner.destroy_buffer(buffer)
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.inner.buffer_size(buffer)
    }

    fn create_output_image(&mut self, size: UVec2) -> Result<ImageHandle> {
        self.inner.create_output_image(size)
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.inner.destroy_image(image)
    }

    fn surface_size(&self) -> UVec2 {
        self.inner.surface_size()
    }

    fn prepare_pipelines(&mut self) -> Result<()> {
        self.inner.prepare_pipelines()
    }

    fn submit_frame(&mut self, frame: FrameSubmission, on_complete: CompletionFn) -> Result<()> {
        self.inner.submit_frame(frame, on_complete)
    }

    fn poll(&mut self) {
        self.inner.poll()
    }

    fn wait_idle(&mut self) -> Result<()> {
        if self.fail_wait {
            return Err(Error::backend("injected wait failure"));
        }
        self.inner.wait_idle()
    }

    fn read_output(&mut self, image: ImageHandle) -> Result<OutputImage> {
        self.inner.read_output(image)
    }
}
