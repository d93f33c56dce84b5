//! Scene model: geometry arena, instances and camera placement.
//!
//! Geometries are referenced by [`GeometryId`] (index into the arena, in
//! insertion order). Instances place a geometry in the world with a transform
//! and visibility mask; many instances may share one geometry.

mod geometry;
mod mesh;

pub use geometry::{
    Geometry, GeometryDescriptor, IntersectionFunction, SceneBuffers, VERTEX_STRIDE,
};
pub use mesh::MeshBuilder;

use crate::gpu::GpuBackend;
use crate::util::{Aabb, Mat4, Result, Vec3};

/// Visibility mask given to instances by default.
pub const DEFAULT_INSTANCE_MASK: u32 = 1;

/// Index of a geometry in its scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(usize);

impl GeometryId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// A placement of one geometry in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryInstance {
    pub geometry: GeometryId,
    /// Object-to-world transform.
    pub transform: Mat4,
    pub mask: u32,
}

impl GeometryInstance {
    pub fn new(geometry: GeometryId, transform: Mat4) -> Self {
        Self {
            geometry,
            transform,
            mask: DEFAULT_INSTANCE_MASK,
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }
}

/// Initial camera pose used when a renderer is created for the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPlacement {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
}

impl Default for CameraPlacement {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.5, -2.72),
            target: Vec3::ZERO,
            up: Vec3::Y,
        }
    }
}

/// Revision counters; a change tells the renderer what to rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneRevision {
    pub geometry: u64,
    pub instances: u64,
}

#[derive(Debug, Default)]
pub struct Scene {
    geometries: Vec<Geometry>,
    instances: Vec<GeometryInstance>,
    pub camera: CameraPlacement,
    revision: SceneRevision,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// One unit cube at the origin, seen from the default camera placement.
    pub fn cube_scene() -> Result<Self> {
        let mut scene = Self::new();
        let mut mesh = MeshBuilder::new();
        mesh.add_cube(Vec3::new(0.8, 0.55, 0.35), Mat4::IDENTITY);
        let cube = scene.add_geometry(mesh.build()?.with_label("cube"));
        scene.add_instance(GeometryInstance::new(cube, Mat4::IDENTITY));
        Ok(scene)
    }

    pub fn add_geometry(&mut self, geometry: Geometry) -> GeometryId {
        self.geometries.push(geometry);
        self.revision.geometry += 1;
        GeometryId(self.geometries.len() - 1)
    }

    /// Append an instance. Unknown geometry ids are reported at build time.
    pub fn add_instance(&mut self, instance: GeometryInstance) -> usize {
        self.instances.push(instance);
        self.revision.instances += 1;
        self.instances.len() - 1
    }

    /// Replace an instance transform (instance-level rebuild only).
    pub fn set_instance_transform(&mut self, index: usize, transform: Mat4) -> bool {
        match self.instances.get_mut(index) {
            Some(instance) => {
                instance.transform = transform;
                self.revision.instances += 1;
                true
            }
            None => false,
        }
    }

    pub fn geometries(&self) -> &[Geometry] {
        &self.geometries
    }

    pub fn geometry(&self, id: GeometryId) -> Option<&Geometry> {
        self.geometries.get(id.0)
    }

    pub fn instances(&self) -> &[GeometryInstance] {
        &self.instances
    }

    pub fn revision(&self) -> SceneRevision {
        self.revision
    }

    pub fn triangle_count(&self) -> u64 {
        self.geometries.iter().map(|g| g.triangle_count() as u64).sum()
    }

    /// World bounds of all valid instances.
    pub fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::EMPTY;
        for instance in &self.instances {
            if let Some(g) = self.geometry(instance.geometry) {
                bounds.grow(&g.bounds().transformed(&instance.transform));
            }
        }
        bounds
    }

    /// Whether any geometry declares a custom intersection routine.
    pub fn uses_intersection_functions(&self) -> bool {
        self.geometries.iter().any(|g| g.intersection_function().is_some())
    }

    /// Upload every geometry into freshly allocated scene buffers.
    #[tracing::instrument(skip_all, fields(geometries = self.geometries.len()))]
    pub fn upload(&mut self, backend: &mut dyn GpuBackend) -> Result<SceneBuffers> {
        let total: u32 = self.geometries.iter().map(|g| g.vertex_count()).sum();
        let mut buffers = SceneBuffers::allocate(backend, total)?;
        let uploaded = self
            .geometries
            .iter_mut()
            .try_for_each(|geometry| geometry.upload(backend, &mut buffers));
        if let Err(e) = uploaded {
            // Earlier geometries must not keep descriptors into freed buffers.
            self.release(backend, buffers);
            return Err(e);
        }
        tracing::info!(vertices = total, "scene uploaded");
        Ok(buffers)
    }

    /// Release scene buffers and mark every geometry as not uploaded.
    pub fn release(&mut self, backend: &mut dyn GpuBackend, buffers: SceneBuffers) {
        buffers.release(backend);
        self.geometries.iter_mut().for_each(Geometry::invalidate);
    }
}
