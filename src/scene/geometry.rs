//! Triangle geometry and its device-resident copy.

use crate::gpu::{BufferDesc, BufferHandle, GpuBackend};
use crate::util::{Aabb, Error, Result, Vec3};

/// Bytes per uploaded vertex (xyz + padding).
pub const VERTEX_STRIDE: u64 = 16;

/// Custom intersection routine run for non-opaque geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntersectionFunction {
    /// Checkerboard cut-out in barycentric space with `frequency` cells per edge.
    Cutout { frequency: f32 },
}

impl IntersectionFunction {
    /// Function id stored in the intersection table (0 means "none").
    pub fn id(&self) -> u32 {
        match self {
            Self::Cutout { .. } => 1,
        }
    }

    pub fn parameter(&self) -> f32 {
        match self {
            Self::Cutout { frequency } => *frequency,
        }
    }

    /// Decode an intersection table entry.
    pub fn from_table(function: u32, parameter: f32) -> Option<Self> {
        match function {
            1 => Some(Self::Cutout { frequency: parameter }),
            _ => None,
        }
    }

    /// Whether a candidate hit at barycentrics `(u, v)` is accepted.
    pub fn accepts(&self, u: f32, v: f32) -> bool {
        match self {
            Self::Cutout { frequency } => {
                let cell = (u * frequency).floor() as i32 + (v * frequency).floor() as i32;
                cell.rem_euclid(2) == 0
            }
        }
    }
}

/// Where an uploaded geometry lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDescriptor {
    pub vertex_buffer: BufferHandle,
    pub color_buffer: BufferHandle,
    /// Byte offset of the first vertex (same in both buffers).
    pub offset: u64,
    /// Bytes between consecutive vertices.
    pub stride: u64,
    pub triangle_count: u32,
}

impl GeometryDescriptor {
    /// Index of the first vertex in the scene vertex buffer.
    pub fn first_vertex(&self) -> u32 {
        (self.offset / self.stride) as u32
    }
}

/// Scene-wide vertex and color buffers that geometries are uploaded into.
#[derive(Debug)]
pub struct SceneBuffers {
    pub vertices: BufferHandle,
    pub colors: BufferHandle,
    capacity: u32,
    cursor: u32,
}

impl SceneBuffers {
    /// Allocate room for `vertex_count` vertices (at least one).
    pub fn allocate(backend: &mut dyn GpuBackend, vertex_count: u32) -> Result<Self> {
        let size = vertex_count.max(1) as u64 * VERTEX_STRIDE;
        let vertices = backend.create_buffer(&BufferDesc::storage("scene_vertices", size))?;
        let colors = backend.create_buffer(&BufferDesc::storage("scene_colors", size))?;
        Ok(Self {
            vertices,
            colors,
            capacity: vertex_count,
            cursor: 0,
        })
    }

    /// Reserve a contiguous vertex range, returning its first index.
    fn reserve(&mut self, count: u32) -> Result<u32> {
        if self.cursor + count > self.capacity {
            return Err(Error::backend(format!(
                "scene buffers full: {} + {} > {} vertices",
                self.cursor, count, self.capacity
            )));
        }
        let first = self.cursor;
        self.cursor += count;
        Ok(first)
    }

    pub fn used_vertices(&self) -> u32 {
        self.cursor
    }

    pub fn release(self, backend: &mut dyn GpuBackend) {
        backend.destroy_buffer(self.vertices);
        backend.destroy_buffer(self.colors);
    }
}

/// Triangle soup with per-vertex colors. Every three vertices form a triangle.
#[derive(Debug, Clone)]
pub struct Geometry {
    label: String,
    vertices: Vec<Vec3>,
    colors: Vec<Vec3>,
    bounds: Aabb,
    intersection: Option<IntersectionFunction>,
    device: Option<GeometryDescriptor>,
}

impl Geometry {
    /// Validate and wrap vertex/color arrays.
    pub fn new(vertices: Vec<Vec3>, colors: Vec<Vec3>) -> Result<Self> {
        if vertices.len() != colors.len() {
            return Err(Error::InvalidGeometry(format!(
                "{} vertices but {} colors",
                vertices.len(),
                colors.len()
            )));
        }
        if vertices.len() % 3 != 0 {
            return Err(Error::InvalidGeometry(format!(
                "vertex count {} is not a multiple of 3",
                vertices.len()
            )));
        }
        if vertices.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidGeometry("non-finite vertex position".into()));
        }
        let mut bounds = Aabb::EMPTY;
        for v in &vertices {
            bounds.grow_point(*v);
        }
        Ok(Self {
            label: String::from("geometry"),
            vertices,
            colors,
            bounds,
            intersection: None,
            device: None,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Attach a custom intersection routine (makes instances non-opaque).
    pub fn with_intersection_function(mut self, function: IntersectionFunction) -> Self {
        self.intersection = Some(function);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        (self.vertices.len() / 3) as u32
    }

    /// Object-space bounds.
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn triangle(&self, index: usize) -> [Vec3; 3] {
        let i = index * 3;
        [self.vertices[i], self.vertices[i + 1], self.vertices[i + 2]]
    }

    /// Per-triangle bounds in object space.
    pub fn triangle_bounds(&self) -> Vec<Aabb> {
        self.vertices
            .chunks_exact(3)
            .map(|tri| {
                let mut b = Aabb::EMPTY;
                tri.iter().for_each(|v| b.grow_point(*v));
                b
            })
            .collect()
    }

    pub fn intersection_function(&self) -> Option<IntersectionFunction> {
        self.intersection
    }

    pub fn is_uploaded(&self) -> bool {
        self.device.is_some()
    }

    /// Copy vertices and colors into `buffers`.
    ///
    /// # Panics
    ///
    /// Panics on empty geometry.
    pub fn upload(&mut self, backend: &mut dyn GpuBackend, buffers: &mut SceneBuffers) -> Result<()> {
        assert!(
            !self.vertices.is_empty(),
            "cannot upload empty geometry '{}'",
            self.label
        );
        let first = buffers.reserve(self.vertex_count())?;
        let offset = first as u64 * VERTEX_STRIDE;

        let positions: Vec<[f32; 4]> = self.vertices.iter().map(|v| v.extend(1.0).to_array()).collect();
        let colors: Vec<[f32; 4]> = self.colors.iter().map(|c| c.extend(1.0).to_array()).collect();
        backend.write_buffer(buffers.vertices, offset, bytemuck::cast_slice(&positions))?;
        backend.write_buffer(buffers.colors, offset, bytemuck::cast_slice(&colors))?;

        self.device = Some(GeometryDescriptor {
            vertex_buffer: buffers.vertices,
            color_buffer: buffers.colors,
            offset,
            stride: VERTEX_STRIDE,
            triangle_count: self.triangle_count(),
        });
        tracing::debug!(label = %self.label, first, triangles = self.triangle_count(), "uploaded geometry");
        Ok(())
    }

    /// Forget the device copy (its buffers were released).
    pub(crate) fn invalidate(&mut self) {
        self.device = None;
    }

    /// Device location of the uploaded data.
    pub fn descriptor(&self) -> Result<GeometryDescriptor> {
        self.device.ok_or(Error::NotUploaded)
    }
}
