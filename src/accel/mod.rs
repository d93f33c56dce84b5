//! Two-level acceleration structures.
//!
//! ```text
//!  Geometry 0 --build--> PrimitiveStructure 0 --+
//!  Geometry 1 --build--> PrimitiveStructure 1 --+--copy--> primitive pool
//!  ...                                          |
//!  Instances --descriptors--> InstanceStructure (BVH over instance bounds)
//!                             geometry records, intersection table
//! ```
//!
//! Primitive structures follow the size-query -> allocate -> build ->
//! compacted-size -> optional compaction sequence. They are rebuilt only when
//! geometry changes; instance edits rebuild only the instance structure.

mod bvh;
mod layout;

pub use bvh::{build_bvh, Bvh, BvhNode, MAX_LEAF_SIZE};
pub use layout::{compacted_size, AccelSizes, GeometryRecord, InstanceDescriptor, IntersectionEntry};

use crate::gpu::{BufferDesc, BufferHandle, GpuBackend, SceneBindings};
use crate::scene::{Geometry, GeometryId, Scene, SceneBuffers};
use crate::util::{Aabb, Error, Result};

/// Minimum allocation for buffers that may legitimately hold nothing.
const MIN_BUFFER_BYTES: u64 = 16;

/// Build options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildPolicy {
    /// Copy each primitive structure into an exactly sized allocation.
    pub compact: bool,
}

impl Default for BuildPolicy {
    fn default() -> Self {
        Self { compact: true }
    }
}

/// Why an instance was left out of the instance structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownGeometry,
    SingularTransform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedInstance {
    pub index: usize,
    pub geometry: GeometryId,
    pub reason: SkipReason,
}

/// Summary of the last build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub primitive_structures: usize,
    pub instances: usize,
    pub skipped: Vec<SkippedInstance>,
    /// Bytes allocated for primitive structures before compaction.
    pub allocated_bytes: u64,
    /// Bytes held by primitive structures after the build.
    pub resident_bytes: u64,
}

/// Device-resident BVH over one geometry's triangles.
#[derive(Debug)]
pub struct PrimitiveStructure {
    pub buffer: BufferHandle,
    /// Bytes of the current allocation.
    pub size_bytes: u64,
    pub prim_count: u32,
    pub node_count: u32,
    pub bounds: Aabb,
    pub compacted: bool,
}

/// Build one primitive structure.
#[tracing::instrument(skip_all, fields(geometry = geometry.label(), triangles = geometry.triangle_count()))]
pub fn build_primitive_structure(
    backend: &mut dyn GpuBackend,
    geometry: &Geometry,
    policy: BuildPolicy,
) -> Result<PrimitiveStructure> {
    let sizes = AccelSizes::for_primitives(geometry.triangle_count() as usize);
    let buffer = backend.create_buffer(&BufferDesc::storage("primitive_structure", sizes.structure_bytes))?;

    let bvh = build_bvh(&geometry.triangle_bounds());
    let words = bvh.to_words();
    if let Err(e) = backend.write_buffer(buffer, 0, bytemuck::cast_slice(&words)) {
        backend.destroy_buffer(buffer);
        return Err(e);
    }

    let mut structure = PrimitiveStructure {
        buffer,
        size_bytes: sizes.structure_bytes,
        prim_count: sizes.prim_count,
        node_count: bvh.nodes.len() as u32,
        bounds: bvh.root_bounds(),
        compacted: false,
    };

    let compacted = compacted_size(&bvh);
    if policy.compact && compacted < sizes.structure_bytes {
        let copied = compact_into_new_buffer(backend, buffer, compacted);
        // The uncompacted build is released whether or not the copy succeeded.
        backend.destroy_buffer(buffer);
        structure.buffer = copied?;
        structure.size_bytes = compacted;
        structure.compacted = true;
    }

    tracing::debug!(
        nodes = structure.node_count,
        allocated = sizes.structure_bytes,
        resident = structure.size_bytes,
        "primitive structure built"
    );
    Ok(structure)
}

/// Copy the first `size` bytes of `source` into a fresh allocation.
fn compact_into_new_buffer(backend: &mut dyn GpuBackend, source: BufferHandle, size: u64) -> Result<BufferHandle> {
    // The build must have landed before its result can be copied.
    backend.wait_idle()?;
    let target = backend.create_buffer(&BufferDesc::storage("primitive_structure_compacted", size))?;
    if let Err(e) = backend.copy_buffer(source, 0, target, 0, size) {
        backend.destroy_buffer(target);
        return Err(e);
    }
    Ok(target)
}

/// Tracks buffers created during a multi-step build so a failure releases them.
struct Allocations(Vec<BufferHandle>);

impl Allocations {
    fn create(&mut self, backend: &mut dyn GpuBackend, label: &str, size: u64) -> Result<BufferHandle> {
        let handle = backend.create_buffer(&BufferDesc::storage(label, size.max(MIN_BUFFER_BYTES)))?;
        self.0.push(handle);
        Ok(handle)
    }

    fn release(self, backend: &mut dyn GpuBackend) {
        self.0.into_iter().for_each(|b| backend.destroy_buffer(b));
    }
}

/// Instance-level structure plus the packed data it references.
#[derive(Debug)]
pub struct InstanceStructure {
    pub structure: BufferHandle,
    pub instances: BufferHandle,
    pub primitive_pool: BufferHandle,
    pub geometry_records: BufferHandle,
    pub intersection_table: Option<BufferHandle>,
    descriptors: Vec<InstanceDescriptor>,
    records: Vec<GeometryRecord>,
}

impl InstanceStructure {
    fn build(
        backend: &mut dyn GpuBackend,
        scene: &Scene,
        primitives: &[PrimitiveStructure],
        skipped: &mut Vec<SkippedInstance>,
    ) -> Result<Self> {
        let mut allocs = Allocations(Vec::new());
        match Self::build_into(backend, scene, primitives, skipped, &mut allocs) {
            Ok(s) => Ok(s),
            Err(e) => {
                allocs.release(backend);
                Err(e)
            }
        }
    }

    fn build_into(
        backend: &mut dyn GpuBackend,
        scene: &Scene,
        primitives: &[PrimitiveStructure],
        skipped: &mut Vec<SkippedInstance>,
        allocs: &mut Allocations,
    ) -> Result<Self> {
        // Descriptors for every instance with a valid geometry
        let mut descriptors = Vec::with_capacity(scene.instances().len());
        let mut bounds = Vec::with_capacity(scene.instances().len());
        for (index, instance) in scene.instances().iter().enumerate() {
            let id = instance.geometry;
            let Some(geometry) = scene.geometry(id) else {
                tracing::warn!("{}, skipping", Error::UnknownGeometry { instance: index, geometry: id.index() });
                skipped.push(SkippedInstance { index, geometry: id, reason: SkipReason::UnknownGeometry });
                continue;
            };
            if !layout::is_invertible(&instance.transform) {
                tracing::warn!(instance = index, "singular instance transform, skipping");
                skipped.push(SkippedInstance { index, geometry: id, reason: SkipReason::SingularTransform });
                continue;
            }
            let opaque = geometry.intersection_function().is_none();
            descriptors.push(InstanceDescriptor::new(
                id.index() as u32,
                &instance.transform,
                instance.mask,
                0,
                opaque,
            ));
            bounds.push(primitives[id.index()].bounds.transformed(&instance.transform));
        }

        let bvh = build_bvh(&bounds);
        let words = bvh.to_words();
        let structure = allocs.create(backend, "instance_structure", words.len() as u64 * 4)?;
        backend.write_buffer(structure, 0, bytemuck::cast_slice(&words))?;

        let instances = allocs.create(
            backend,
            "instance_descriptors",
            (descriptors.len() * std::mem::size_of::<InstanceDescriptor>()) as u64,
        )?;
        if !descriptors.is_empty() {
            backend.write_buffer(instances, 0, bytemuck::cast_slice(&descriptors))?;
        }

        // Pack primitive structures into one pool
        let pool_bytes: u64 = primitives.iter().map(|p| p.size_bytes).sum();
        let primitive_pool = allocs.create(backend, "primitive_pool", pool_bytes)?;
        let mut records = Vec::with_capacity(primitives.len());
        let mut offset = 0u64;
        for (geometry, prim) in scene.geometries().iter().zip(primitives) {
            backend.copy_buffer(prim.buffer, 0, primitive_pool, offset, prim.size_bytes)?;
            let word = (offset / 4) as u32;
            records.push(GeometryRecord {
                vertex_offset: geometry.descriptor()?.first_vertex(),
                prim_offset: word,
                node_offset: word + prim.prim_count,
                triangle_count: prim.prim_count,
            });
            offset += prim.size_bytes;
        }
        let geometry_records = allocs.create(
            backend,
            "geometry_records",
            (records.len() * std::mem::size_of::<GeometryRecord>()) as u64,
        )?;
        if !records.is_empty() {
            backend.write_buffer(geometry_records, 0, bytemuck::cast_slice(&records))?;
        }

        let intersection_table = if scene.uses_intersection_functions() {
            let entries: Vec<IntersectionEntry> = scene
                .geometries()
                .iter()
                .map(|g| match g.intersection_function() {
                    Some(f) => IntersectionEntry { function: f.id(), parameter: f.parameter(), _pad: [0; 2] },
                    None => IntersectionEntry { function: 0, parameter: 0.0, _pad: [0; 2] },
                })
                .collect();
            let table = allocs.create(
                backend,
                "intersection_table",
                (entries.len() * std::mem::size_of::<IntersectionEntry>()) as u64,
            )?;
            backend.write_buffer(table, 0, bytemuck::cast_slice(&entries))?;
            Some(table)
        } else {
            None
        };

        Ok(Self {
            structure,
            instances,
            primitive_pool,
            geometry_records,
            intersection_table,
            descriptors,
            records,
        })
    }

    fn release(self, backend: &mut dyn GpuBackend) {
        backend.destroy_buffer(self.structure);
        backend.destroy_buffer(self.instances);
        backend.destroy_buffer(self.primitive_pool);
        backend.destroy_buffer(self.geometry_records);
        if let Some(table) = self.intersection_table {
            backend.destroy_buffer(table);
        }
    }
}

/// Every acceleration structure of a scene.
#[derive(Debug)]
pub struct AccelerationStructures {
    primitives: Vec<PrimitiveStructure>,
    instance: InstanceStructure,
    report: BuildReport,
}

impl AccelerationStructures {
    /// Full build. Every geometry must already be uploaded.
    #[tracing::instrument(skip_all, fields(geometries = scene.geometries().len(), instances = scene.instances().len()))]
    pub fn build(backend: &mut dyn GpuBackend, scene: &Scene, policy: BuildPolicy) -> Result<Self> {
        let mut primitives: Vec<PrimitiveStructure> = Vec::with_capacity(scene.geometries().len());
        let mut report = BuildReport::default();

        for geometry in scene.geometries() {
            let built = geometry
                .descriptor()
                .and_then(|_| build_primitive_structure(backend, geometry, policy));
            match built {
                Ok(p) => {
                    report.allocated_bytes += AccelSizes::for_primitives(p.prim_count as usize).structure_bytes;
                    report.resident_bytes += p.size_bytes;
                    primitives.push(p);
                }
                Err(e) => {
                    primitives.into_iter().for_each(|p| backend.destroy_buffer(p.buffer));
                    return Err(e);
                }
            }
        }

        let instance = match InstanceStructure::build(backend, scene, &primitives, &mut report.skipped) {
            Ok(i) => i,
            Err(e) => {
                primitives.into_iter().for_each(|p| backend.destroy_buffer(p.buffer));
                return Err(e);
            }
        };
        report.primitive_structures = primitives.len();
        report.instances = instance.descriptors.len();

        tracing::info!(
            primitive_structures = report.primitive_structures,
            instances = report.instances,
            skipped = report.skipped.len(),
            resident_bytes = report.resident_bytes,
            "acceleration structures built"
        );
        Ok(Self {
            primitives,
            instance,
            report,
        })
    }

    /// Rebuild only the instance structure after instance edits.
    #[tracing::instrument(skip_all, fields(instances = scene.instances().len()))]
    pub fn rebuild_instances(&mut self, backend: &mut dyn GpuBackend, scene: &Scene) -> Result<()> {
        if scene.geometries().len() != self.primitives.len() {
            return Err(Error::config("geometry set changed; a full rebuild is required"));
        }
        let mut skipped = Vec::new();
        let instance = InstanceStructure::build(backend, scene, &self.primitives, &mut skipped)?;
        let old = std::mem::replace(&mut self.instance, instance);
        old.release(backend);
        self.report.instances = self.instance.descriptors.len();
        self.report.skipped = skipped;
        Ok(())
    }

    /// Kernel bindings for these structures and the scene buffers.
    pub fn bindings(&self, buffers: &SceneBuffers) -> SceneBindings {
        SceneBindings {
            vertices: buffers.vertices,
            colors: buffers.colors,
            instances: self.instance.instances,
            instance_structure: self.instance.structure,
            primitive_pool: self.instance.primitive_pool,
            geometry_records: self.instance.geometry_records,
            intersection_table: self.instance.intersection_table,
        }
    }

    pub fn descriptors(&self) -> &[InstanceDescriptor] {
        &self.instance.descriptors
    }

    pub fn records(&self) -> &[GeometryRecord] {
        &self.instance.records
    }

    pub fn primitives(&self) -> &[PrimitiveStructure] {
        &self.primitives
    }

    pub fn instance_count(&self) -> u32 {
        self.instance.descriptors.len() as u32
    }

    pub fn uses_intersection_functions(&self) -> bool {
        self.instance.intersection_table.is_some()
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn release(self, backend: &mut dyn GpuBackend) {
        self.instance.release(backend);
        for p in self.primitives {
            backend.destroy_buffer(p.buffer);
        }
    }
}
