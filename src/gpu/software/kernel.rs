//! CPU reference implementation of the ray-tracing kernel.
//!
//! Mirrors `shaders/raytrace.wgsl`: one ray per pixel through the pixel
//! center, instance-level traversal, per-instance object-space traversal,
//! optional intersection routine, nearest hit wins.

use bytemuck::Pod;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::accel::{BvhNode, GeometryRecord, InstanceDescriptor, IntersectionEntry};
use crate::render::FrameUniforms;
use crate::scene::IntersectionFunction;
use crate::util::{Mat4, UVec2, Vec3, Vec4};

/// Mask every ray is traced with.
pub const RAY_MASK: u32 = 0xFF;

const HIT_EPSILON: f32 = 1e-6;

/// Typed view over the word buffers bound to one dispatch.
pub(crate) struct SceneView<'a> {
    pub vertices: &'a [[f32; 4]],
    pub colors: &'a [[f32; 4]],
    pub instances: &'a [InstanceDescriptor],
    pub structure: &'a [u32],
    pub pool: &'a [u32],
    pub records: &'a [GeometryRecord],
    pub table: Option<&'a [IntersectionEntry]>,
}

/// Reinterpret a word buffer as whole `T` elements, dropping any tail.
pub(crate) fn view<T: Pod>(words: &[u32]) -> &[T] {
    let per = std::mem::size_of::<T>() / 4;
    bytemuck::cast_slice(&words[..words.len() / per * per])
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    t: f32,
    instance: usize,
    prim: u32,
    u: f32,
    v: f32,
}

/// Trace every pixel of a `size` image.
pub(crate) fn trace_image(uniforms: &FrameUniforms, scene: &SceneView<'_>, size: UVec2) -> Vec<[f32; 4]> {
    let mut pixels = vec![[0.0f32; 4]; (size.x * size.y) as usize];
    let c2w = uniforms.camera_to_world();
    let v2c = uniforms.viewport_to_camera();
    pixels
        .par_chunks_mut(size.x as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                *px = trace_pixel(uniforms, &c2w, &v2c, scene, x as u32, y as u32);
            }
        });
    pixels
}

fn unproject(v2c: &Mat4, x: f32, y: f32, depth: f32) -> Vec3 {
    let p = *v2c * Vec4::new(x, y, depth, 1.0);
    p.truncate() / p.w
}

fn trace_pixel(
    uniforms: &FrameUniforms,
    c2w: &Mat4,
    v2c: &Mat4,
    scene: &SceneView<'_>,
    x: u32,
    y: u32,
) -> [f32; 4] {
    let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
    let origin = c2w.transform_point3(unproject(v2c, px, py, 0.0));
    let far = c2w.transform_point3(unproject(v2c, px, py, 1.0));
    let eye = c2w.w_axis.truncate();

    let span = far - origin;
    let t_max = span.length();
    let background = uniforms.background();
    let miss = [background.x, background.y, background.z, -1.0];
    if !(t_max > 0.0) {
        return miss;
    }
    let dir = span / t_max;

    let Some(hit) = closest_hit(uniforms, scene, origin, dir, t_max) else {
        return miss;
    };

    let desc = &scene.instances[hit.instance];
    let record = &scene.records[desc.acceleration_structure_index as usize];
    let base = (record.vertex_offset + hit.prim * 3) as usize;
    let o2w = desc.object_to_world();
    let p: [Vec3; 3] = std::array::from_fn(|k| o2w.transform_point3(Vec4::from_array(scene.vertices[base + k]).truncate()));
    let c: [Vec3; 3] = std::array::from_fn(|k| Vec4::from_array(scene.colors[base + k]).truncate());

    let normal = (p[1] - p[0]).cross(p[2] - p[0]).normalize_or_zero();
    let shade = 0.2 + 0.8 * normal.dot(dir).abs();
    let color = (c[0] * (1.0 - hit.u - hit.v) + c[1] * hit.u + c[2] * hit.v) * shade;
    let distance = (origin + dir * hit.t - eye).length();
    [color.x, color.y, color.z, distance]
}

fn read_node(words: &[u32], base: usize, index: u32) -> Option<BvhNode> {
    let start = base + index as usize * BvhNode::WORDS;
    words
        .get(start..start + BvhNode::WORDS)
        .map(|w| bytemuck::cast_slice::<u32, BvhNode>(w)[0])
}

/// Walk a serialized BVH; `leaf` receives primitive ids and may shrink `t_max`.
fn traverse(
    words: &[u32],
    prim_base: usize,
    node_base: usize,
    origin: Vec3,
    dir: Vec3,
    t_max: &mut f32,
    mut leaf: impl FnMut(u32, &mut f32),
) {
    let inv_dir = dir.recip();
    let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
    stack.push(0);
    while let Some(index) = stack.pop() {
        let Some(node) = read_node(words, node_base, index) else {
            continue;
        };
        if node.bounds().intersect_ray(origin, inv_dir, 0.0, *t_max).is_none() {
            continue;
        }
        if node.is_leaf() {
            let first = prim_base + node.left_or_first as usize;
            for slot in first..first + node.count as usize {
                if let Some(&prim) = words.get(slot) {
                    leaf(prim, t_max);
                }
            }
        } else {
            stack.push(node.left_or_first + 1);
            stack.push(node.left_or_first);
        }
    }
}

/// Moller-Trumbore, double sided. Returns (t, u, v).
fn intersect_triangle(origin: Vec3, dir: Vec3, p: [Vec3; 3], t_max: f32) -> Option<(f32, f32, f32)> {
    let e1 = p[1] - p[0];
    let e2 = p[2] - p[0];
    let pvec = dir.cross(e2);
    let det = e1.dot(pvec);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = origin - p[0];
    let u = tvec.dot(pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(e1);
    let v = dir.dot(qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(qvec) * inv_det;
    (t > HIT_EPSILON && t < t_max).then_some((t, u, v))
}

fn closest_hit(
    uniforms: &FrameUniforms,
    scene: &SceneView<'_>,
    origin: Vec3,
    dir: Vec3,
    t_max: f32,
) -> Option<Hit> {
    let instance_count = (uniforms.instance_count as usize).min(scene.instances.len());
    if instance_count == 0 {
        return None;
    }
    let use_functions = uniforms.uses_intersection_functions();
    let mut best: Option<Hit> = None;
    let mut t_limit = t_max;

    traverse(scene.structure, 0, instance_count, origin, dir, &mut t_limit, |inst, t_limit| {
        let Some(desc) = scene.instances.get(inst as usize) else {
            return;
        };
        if desc.mask & RAY_MASK == 0 {
            return;
        }
        let Some(record) = scene.records.get(desc.acceleration_structure_index as usize) else {
            return;
        };
        if record.triangle_count == 0 {
            return;
        }
        let function = if use_functions && !desc.is_opaque() {
            scene
                .table
                .and_then(|t| {
                    t.get((desc.intersection_function_table_offset + desc.acceleration_structure_index) as usize)
                })
                .and_then(|e| IntersectionFunction::from_table(e.function, e.parameter))
        } else {
            None
        };

        // Object-space ray keeps the world-space parameterization of t.
        let w2o = desc.world_to_object();
        let o_origin = w2o.transform_point3(origin);
        let o_dir = w2o.transform_vector3(dir);

        traverse(
            scene.pool,
            record.prim_offset as usize,
            record.node_offset as usize,
            o_origin,
            o_dir,
            t_limit,
            |prim, t_limit| {
                if prim >= record.triangle_count {
                    return;
                }
                let base = (record.vertex_offset + prim * 3) as usize;
                let Some(v) = scene.vertices.get(base..base + 3) else {
                    return;
                };
                let p = [
                    Vec4::from_array(v[0]).truncate(),
                    Vec4::from_array(v[1]).truncate(),
                    Vec4::from_array(v[2]).truncate(),
                ];
                if let Some((t, u, v)) = intersect_triangle(o_origin, o_dir, p, *t_limit) {
                    if function.is_some_and(|f| !f.accepts(u, v)) {
                        return;
                    }
                    *t_limit = t;
                    best = Some(Hit {
                        t,
                        instance: inst as usize,
                        prim,
                        u,
                        v,
                    });
                }
            },
        );
    });

    best
}
