//! Device layouts of acceleration-structure data (shared with the kernels).

use bytemuck::{Pod, Zeroable};

use super::bvh::{Bvh, BvhNode};
use crate::util::{Mat4, Vec4};

/// Buffer sizes needed to build a structure over `prim_count` primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelSizes {
    pub prim_count: u32,
    /// Worst-case node count.
    pub node_capacity: u32,
    /// Bytes to allocate before building.
    pub structure_bytes: u64,
}

impl AccelSizes {
    pub fn for_primitives(prim_count: usize) -> Self {
        let node_capacity = Bvh::max_nodes(prim_count);
        let words = prim_count + node_capacity * BvhNode::WORDS;
        Self {
            prim_count: prim_count as u32,
            node_capacity: node_capacity as u32,
            structure_bytes: words as u64 * 4,
        }
    }
}

/// Size of a built structure once unused node capacity is dropped.
pub fn compacted_size(bvh: &Bvh) -> u64 {
    (bvh.prim_indices.len() + bvh.nodes.len() * BvhNode::WORDS) as u64 * 4
}

/// Per-instance record read by the instance-level traversal (112 bytes).
///
/// Transforms are stored as the first three rows of the 4x4 matrix.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDescriptor {
    pub transform: [[f32; 4]; 3],
    pub inverse_transform: [[f32; 4]; 3],
    /// Index of the primitive structure (= geometry index).
    pub acceleration_structure_index: u32,
    pub mask: u32,
    pub intersection_function_table_offset: u32,
    pub options: u32,
}

impl InstanceDescriptor {
    /// Skip the intersection routine for this instance.
    pub const OPAQUE: u32 = 1;

    pub fn new(accel_index: u32, transform: &Mat4, mask: u32, table_offset: u32, opaque: bool) -> Self {
        Self {
            transform: rows3x4(transform),
            inverse_transform: rows3x4(&transform.inverse()),
            acceleration_structure_index: accel_index,
            mask,
            intersection_function_table_offset: table_offset,
            options: if opaque { Self::OPAQUE } else { 0 },
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.options & Self::OPAQUE != 0
    }

    pub fn object_to_world(&self) -> Mat4 {
        from_rows3x4(&self.transform)
    }

    pub fn world_to_object(&self) -> Mat4 {
        from_rows3x4(&self.inverse_transform)
    }
}

fn rows3x4(m: &Mat4) -> [[f32; 4]; 3] {
    [m.row(0).to_array(), m.row(1).to_array(), m.row(2).to_array()]
}

fn from_rows3x4(rows: &[[f32; 4]; 3]) -> Mat4 {
    Mat4::from_cols(
        Vec4::from_array(rows[0]),
        Vec4::from_array(rows[1]),
        Vec4::from_array(rows[2]),
        Vec4::W,
    )
    .transpose()
}

/// Where one geometry's data sits inside the packed buffers (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GeometryRecord {
    /// First vertex in the scene vertex/color buffers.
    pub vertex_offset: u32,
    /// Word offset of the primitive index list in the primitive pool.
    pub prim_offset: u32,
    /// Word offset of node 0 in the primitive pool.
    pub node_offset: u32,
    pub triangle_count: u32,
}

/// Intersection table entry (16 bytes). `function` 0 means none.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct IntersectionEntry {
    pub function: u32,
    pub parameter: f32,
    pub _pad: [u32; 2],
}

/// Instance transforms must be finite and invertible for ray transformation.
pub(crate) fn is_invertible(m: &Mat4) -> bool {
    m.is_finite() && m.determinant().abs() > 1e-12
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Vec3;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<InstanceDescriptor>(), 112);
        assert_eq!(std::mem::size_of::<GeometryRecord>(), 16);
        assert_eq!(std::mem::size_of::<IntersectionEntry>(), 16);
        assert_eq!(std::mem::size_of::<BvhNode>(), 32);
    }

    #[test]
    fn test_sizes_query() {
        let s = AccelSizes::for_primitives(12);
        assert_eq!(s.node_capacity, 23);
        assert_eq!(s.structure_bytes, (12 + 23 * 8) * 4);
        assert_eq!(AccelSizes::for_primitives(0).node_capacity, 1);
    }

    #[test]
    fn test_descriptor_transform_roundtrip() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)) * Mat4::from_rotation_y(0.4)
            * Mat4::from_scale(Vec3::splat(2.0));
        let d = InstanceDescriptor::new(3, &m, 1, 0, true);
        assert!(d.object_to_world().abs_diff_eq(m, 1e-6));
        assert!((d.world_to_object() * m).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert!(d.is_opaque());
        assert_eq!(d.acceleration_structure_index, 3);
        // Translation lives in the last column of each stored row
        assert_eq!(d.transform[0][3], 1.0);
        assert_eq!(d.transform[2][3], 3.0);
        assert!(is_invertible(&m));
        assert!(!is_invertible(&Mat4::ZERO));
    }
}
