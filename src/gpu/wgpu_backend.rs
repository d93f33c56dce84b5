//! wgpu device: WGSL ray-tracing kernel plus a full-screen blit.
//!
//! ## Frame encoding
//! ```text
//!  compute pass   raytrace.wgsl  uniform slot (dynamic offset) + scene storage -> rgba32float image
//!  render pass    blit.wgsl      image -> display target (clear + full-screen triangle)
//!  submit         queue.on_submitted_work_done(on_complete)
//! ```
//!
//! The display target is either a window surface or an offscreen texture,
//! so headless runs go through the same encoding path.

use std::collections::HashMap;
use std::num::NonZeroU64;

use super::{
    BufferDesc, BufferHandle, BufferUsage, CompletionFn, FrameSubmission, GpuBackend, ImageHandle, OutputImage,
};
use crate::render::{FrameUniforms, UNIFORM_SLOT_ALIGN};
use crate::util::{align_up, Error, Result, UVec2};

const RAYTRACE_WGSL: &str = include_str!("shaders/raytrace.wgsl");
const BLIT_WGSL: &str = include_str!("shaders/blit.wgsl");

/// Bytes per rgba32float texel.
const TEXEL_BYTES: u32 = 16;

const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

#[derive(Debug, Clone, Copy)]
pub struct WgpuOptions {
    /// Display size for offscreen targets; window surfaces start at this size too.
    pub surface_size: UVec2,
    pub power_preference: wgpu::PowerPreference,
}

impl Default for WgpuOptions {
    fn default() -> Self {
        Self {
            surface_size: UVec2::new(512, 512),
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }
}

enum DisplayTarget {
    Offscreen(wgpu::Texture),
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
}

struct Pipelines {
    trace: wgpu::ComputePipeline,
    trace_layout: wgpu::BindGroupLayout,
    blit: wgpu::RenderPipeline,
    blit_layout: wgpu::BindGroupLayout,
    /// Bound in place of a missing intersection table.
    empty_table: wgpu::Buffer,
}

struct OutputTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: UVec2,
}

/// Display texture acquired for one frame.
struct AcquiredTarget {
    view: wgpu::TextureView,
    surface: Option<wgpu::SurfaceTexture>,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    target: DisplayTarget,
    target_format: wgpu::TextureFormat,
    surface_size: UVec2,
    buffers: HashMap<u32, wgpu::Buffer>,
    images: HashMap<u32, OutputTexture>,
    next_id: u32,
    pipelines: Option<Pipelines>,
}

async fn request_device(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'static>>,
    power_preference: wgpu::PowerPreference,
) -> Result<(wgpu::Adapter, wgpu::Device, wgpu::Queue)> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: surface,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| Error::config(format!("no compatible GPU adapter: {e}")))?;

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("vrtracer_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            ..Default::default()
        })
        .await
        .map_err(|e| Error::config(format!("device request failed: {e}")))?;
    Ok((adapter, device, queue))
}

impl WgpuBackend {
    /// Headless backend presenting into an offscreen texture.
    pub fn new(options: WgpuOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let (adapter, device, queue) = pollster::block_on(request_device(&instance, None, options.power_preference))?;
        let target = DisplayTarget::Offscreen(Self::offscreen_target(&device, options.surface_size));
        Ok(Self::assemble(adapter, device, queue, target, OFFSCREEN_FORMAT, options.surface_size))
    }

    /// Backend presenting into a window surface created from `instance`.
    pub fn with_surface(
        instance: &wgpu::Instance,
        surface: wgpu::Surface<'static>,
        options: WgpuOptions,
    ) -> Result<Self> {
        let (adapter, device, queue) =
            pollster::block_on(request_device(instance, Some(&surface), options.power_preference))?;
        let size = options.surface_size.max(UVec2::ONE);
        let mut config = surface
            .get_default_config(&adapter, size.x, size.y)
            .ok_or_else(|| Error::config("surface is not supported by the adapter"))?;
        // The blit writes linear values; prefer an sRGB view.
        let caps = surface.get_capabilities(&adapter);
        if let Some(format) = caps.formats.iter().copied().find(|f| f.is_srgb()) {
            config.format = format;
        }
        surface.configure(&device, &config);
        let format = config.format;
        let target = DisplayTarget::Window { surface, config };
        Ok(Self::assemble(adapter, device, queue, target, format, options.surface_size))
    }

    fn assemble(
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        target: DisplayTarget,
        target_format: wgpu::TextureFormat,
        surface_size: UVec2,
    ) -> Self {
        let adapter_info = adapter.get_info();
        tracing::info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "wgpu device ready");
        Self {
            device,
            queue,
            adapter_info,
            target,
            target_format,
            surface_size,
            buffers: HashMap::new(),
            images: HashMap::new(),
            next_id: 1,
            pipelines: None,
        }
    }

    fn offscreen_target(device: &wgpu::Device, size: UVec2) -> wgpu::Texture {
        let size = size.max(UVec2::ONE);
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some("display_target"),
            size: wgpu::Extent3d { width: size.x, height: size.y, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Track a window resize; zero while minimized.
    pub fn resize_surface(&mut self, size: UVec2) {
        self.surface_size = size;
        if size.x == 0 || size.y == 0 {
            return;
        }
        match &mut self.target {
            DisplayTarget::Offscreen(texture) => *texture = Self::offscreen_target(&self.device, size),
            DisplayTarget::Window { surface, config } => {
                config.width = size.x;
                config.height = size.y;
                surface.configure(&self.device, config);
            }
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&wgpu::Buffer> {
        self.buffers
            .get(&handle.raw())
            .ok_or_else(|| Error::backend(format!("unknown buffer {}", handle.raw())))
    }

    fn check_range(&self, handle: BufferHandle, offset: u64, size: u64) -> Result<&wgpu::Buffer> {
        let buffer = self.buffer(handle)?;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::backend(format!(
                "unaligned access to buffer {} (offset {offset}, size {size})",
                handle.raw()
            )));
        }
        if offset.checked_add(size).is_none_or(|end| end > buffer.size()) {
            return Err(Error::backend(format!(
                "access past the end of buffer {} ({offset}+{size} > {})",
                handle.raw(),
                buffer.size()
            )));
        }
        Ok(buffer)
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| Error::backend(format!("device poll failed: {e}")))
    }

    /// Copy `size` bytes into a mappable buffer and read them back.
    fn read_staged(&self, encode: impl FnOnce(&mut wgpu::CommandEncoder, &wgpu::Buffer), size: u64) -> Result<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encode(&mut encoder, &staging);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.wait()?;
        rx.recv()
            .map_err(|_| Error::backend("readback callback dropped"))?
            .map_err(|e| Error::backend(format!("buffer mapping failed: {e}")))?;
        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn acquire_target(&self) -> Result<AcquiredTarget> {
        match &self.target {
            DisplayTarget::Offscreen(texture) => Ok(AcquiredTarget {
                view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
                surface: None,
            }),
            DisplayTarget::Window { surface, config } => match surface.get_current_texture() {
                Ok(frame) => Ok(AcquiredTarget {
                    view: frame.texture.create_view(&wgpu::TextureViewDescriptor::default()),
                    surface: Some(frame),
                }),
                Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                    surface.configure(&self.device, config);
                    Err(Error::SurfaceUnavailable)
                }
                Err(wgpu::SurfaceError::OutOfMemory) => Err(Error::backend("surface out of memory")),
                Err(e) => {
                    tracing::debug!("surface acquire failed: {e}");
                    Err(Error::SurfaceUnavailable)
                }
            },
        }
    }

    fn create_pipelines(&self) -> Pipelines {
        let device = &self.device;
        let trace_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("raytrace_shader"),
            source: wgpu::ShaderSource::Wgsl(RAYTRACE_WGSL.into()),
        });

        let storage = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let trace_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("raytrace_bgl"),
            entries: &[
                // @binding(0) frame uniforms, one ring slot per frame
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: NonZeroU64::new(std::mem::size_of::<FrameUniforms>() as u64),
                    },
                    count: None,
                },
                // @binding(1..=7) vertices, colors, instances, instance structure,
                // primitive pool, geometry records, intersection table
                storage(1),
                storage(2),
                storage(3),
                storage(4),
                storage(5),
                storage(6),
                storage(7),
                // @binding(8) output image
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba32Float,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });
        let trace_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("raytrace_pl"),
            bind_group_layouts: &[&trace_layout],
            push_constant_ranges: &[],
        });
        let trace = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("raytrace_pipeline"),
            layout: Some(&trace_pipeline_layout),
            module: &trace_shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let blit_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("blit_shader"),
            source: wgpu::ShaderSource::Wgsl(BLIT_WGSL.into()),
        });
        let blit_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit_bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                },
                count: None,
            }],
        });
        let blit_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("blit_pl"),
            bind_group_layouts: &[&blit_layout],
            push_constant_ranges: &[],
        });
        let blit = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("blit_pipeline"),
            layout: Some(&blit_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &blit_shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &blit_shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.target_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let empty_table = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("empty_intersection_table"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        Pipelines {
            trace,
            trace_layout,
            blit,
            blit_layout,
            empty_table,
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        let usage = match desc.usage {
            BufferUsage::Storage => wgpu::BufferUsages::STORAGE,
            BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM,
        } | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: align_up(desc.size.max(4), wgpu::COPY_BUFFER_ALIGNMENT),
            usage,
            mapped_at_creation: false,
        });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle::from_raw(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let target = self.check_range(buffer, offset, data.len() as u64)?;
        self.queue.write_buffer(target, offset, data);
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
        let from = self.check_range(src, src_offset, size)?;
        let to = self.check_range(dst, dst_offset, size)?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("buffer_copy") });
        if src == dst {
            // Overlapping copies within one buffer go through a temporary.
            let temp = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("buffer_copy_temp"),
                size: size.max(4),
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            encoder.copy_buffer_to_buffer(from, src_offset, &temp, 0, size);
            encoder.copy_buffer_to_buffer(&temp, 0, to, dst_offset, size);
        } else {
            encoder.copy_buffer_to_buffer(from, src_offset, to, dst_offset, size);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let source = self.check_range(buffer, offset, size)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        self.read_staged(
            |encoder, staging| encoder.copy_buffer_to_buffer(source, offset, staging, 0, size),
            size,
        )
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        // Dropping keeps the allocation alive until submitted work is done.
        if self.buffers.remove(&buffer.raw()).is_none() {
            tracing::warn!(id = buffer.raw(), "destroy of unknown buffer");
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(&buffer.raw()).map(|b| b.size())
    }

    fn create_output_image(&mut self, size: UVec2) -> Result<ImageHandle> {
        if size.x == 0 || size.y == 0 {
            return Err(Error::config(format!("output image size {size} is empty")));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("traced_output"),
            size: wgpu::Extent3d { width: size.x, height: size.y, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.alloc_id();
        self.images.insert(id, OutputTexture { texture, view, size });
        Ok(ImageHandle::from_raw(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.images.remove(&image.raw());
    }

    fn surface_size(&self) -> UVec2 {
        self.surface_size
    }

    fn prepare_pipelines(&mut self) -> Result<()> {
        if self.pipelines.is_none() {
            self.pipelines = Some(self.create_pipelines());
        }
        Ok(())
    }

    fn submit_frame(&mut self, frame: FrameSubmission, on_complete: CompletionFn) -> Result<()> {
        let Some(pipelines) = self.pipelines.as_ref() else {
            return Err(Error::config("pipelines not prepared"));
        };
        for handle in frame.scene.indirect() {
            if !frame.resident.contains(&handle) {
                return Err(Error::NotResident(format!("buffer {}", handle.raw())));
            }
        }
        if frame.uniforms.offset % UNIFORM_SLOT_ALIGN != 0 {
            return Err(Error::backend(format!("uniform offset {} is not slot aligned", frame.uniforms.offset)));
        }
        let output = self
            .images
            .get(&frame.output.raw())
            .ok_or_else(|| Error::backend(format!("unknown image {}", frame.output.raw())))?;
        if output.size != frame.size {
            return Err(Error::config(format!(
                "frame size {} does not match output image {}",
                frame.size, output.size
            )));
        }

        let scene = &frame.scene;
        let uniforms = self.buffer(frame.uniforms.buffer)?;
        let table = match scene.intersection_table {
            Some(t) => self.buffer(t)?,
            None => &pipelines.empty_table,
        };
        let storage = [
            self.buffer(scene.vertices)?,
            self.buffer(scene.colors)?,
            self.buffer(scene.instances)?,
            self.buffer(scene.instance_structure)?,
            self.buffer(scene.primitive_pool)?,
            self.buffer(scene.geometry_records)?,
            table,
        ];
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: uniforms,
                offset: 0,
                size: NonZeroU64::new(std::mem::size_of::<FrameUniforms>() as u64),
            }),
        }];
        entries.extend(storage.iter().enumerate().map(|(i, b)| wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: b.as_entire_binding(),
        }));
        entries.push(wgpu::BindGroupEntry {
            binding: 8,
            resource: wgpu::BindingResource::TextureView(&output.view),
        });
        let trace_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("raytrace_bg"),
            layout: &pipelines.trace_layout,
            entries: &entries,
        });
        let blit_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit_bg"),
            layout: &pipelines.blit_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&output.view),
            }],
        });

        let target = self.acquire_target()?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("frame") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("raytrace_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipelines.trace);
            pass.set_bind_group(0, &trace_group, &[frame.uniforms.offset as u32]);
            pass.dispatch_workgroups(frame.grid.groups.x, frame.grid.groups.y, 1);
        }
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("blit_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                ..Default::default()
            });
            pass.set_pipeline(&pipelines.blit);
            pass.set_bind_group(0, &blit_group, &[]);
            pass.draw(0..3, 0..1);
        }

        self.queue.submit(Some(encoder.finish()));
        self.queue.on_submitted_work_done(move || on_complete());
        if let Some(surface) = target.surface {
            surface.present();
        }
        tracing::trace!(frame = frame.frame_index, "frame submitted");
        Ok(())
    }

    fn poll(&mut self) {
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            tracing::warn!("device poll failed: {e}");
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.wait()
    }

    fn read_output(&mut self, image: ImageHandle) -> Result<OutputImage> {
        let output = self
            .images
            .get(&image.raw())
            .ok_or_else(|| Error::backend(format!("unknown image {}", image.raw())))?;
        let size = output.size;
        // bytes_per_row must be aligned to 256 (COPY_BYTES_PER_ROW_ALIGNMENT)
        let row_bytes = size.x * TEXEL_BYTES;
        let padded = align_up(row_bytes as u64, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64) as u32;
        let bytes = self.read_staged(
            |encoder, staging| {
                encoder.copy_texture_to_buffer(
                    wgpu::TexelCopyTextureInfo {
                        texture: &output.texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::TexelCopyBufferInfo {
                        buffer: staging,
                        layout: wgpu::TexelCopyBufferLayout {
                            offset: 0,
                            bytes_per_row: Some(padded),
                            rows_per_image: Some(size.y),
                        },
                    },
                    wgpu::Extent3d { width: size.x, height: size.y, depth_or_array_layers: 1 },
                );
            },
            padded as u64 * size.y as u64,
        )?;

        let mut image = OutputImage::new(size);
        for (row, dst) in image.pixels.chunks_mut(size.x as usize).enumerate() {
            let start = row * padded as usize;
            let src = &bytes[start..start + row_bytes as usize];
            for (texel, raw) in dst.iter_mut().zip(src.chunks_exact(TEXEL_BYTES as usize)) {
                *texel = bytemuck::pod_read_unaligned(raw);
            }
        }
        Ok(image)
    }
}
