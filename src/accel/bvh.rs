//! SAH-based BVH builder.
//!
//! Builds a flat node array over arbitrary primitive bounds. Used for both
//! levels: triangles inside a geometry and instances inside the scene.

use bytemuck::{Pod, Zeroable};

use crate::util::{Aabb, Vec3};

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Ranges this small always become leaves. Larger ranges stay leaves only
/// when SAH prefers it, and never above twice this size.
pub const MAX_LEAF_SIZE: usize = 4;

/// Node layout shared with the kernels (32 bytes).
///
/// Internal node: `left_or_first` = left child index (right = left + 1), `count` = 0.
/// Leaf node: `left_or_first` = first slot in the primitive index list, `count` > 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    /// 32-bit words per node.
    pub const WORDS: usize = 8;

    fn leaf(bounds: &Aabb, first: usize, count: usize) -> Self {
        Self {
            aabb_min: bounds.min.to_array(),
            left_or_first: first as u32,
            aabb_max: bounds.max.to_array(),
            count: count as u32,
        }
    }

    fn internal(bounds: &Aabb, left: usize) -> Self {
        Self {
            aabb_min: bounds.min.to_array(),
            left_or_first: left as u32,
            aabb_max: bounds.max.to_array(),
            count: 0,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from_array(self.aabb_min), Vec3::from_array(self.aabb_max))
    }
}

/// Built BVH.
#[derive(Debug, Clone)]
pub struct Bvh {
    /// Flat node array (index 0 = root).
    pub nodes: Vec<BvhNode>,
    /// Reordered primitive indices; leaves reference ranges of this list.
    pub prim_indices: Vec<u32>,
}

impl Bvh {
    /// Worst-case node count for `prim_count` primitives.
    pub fn max_nodes(prim_count: usize) -> usize {
        (2 * prim_count).saturating_sub(1).max(1)
    }

    pub fn root_bounds(&self) -> Aabb {
        self.nodes[0].bounds()
    }

    /// Serialized form: primitive indices followed by nodes, as 32-bit words.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.prim_indices.len() + self.nodes.len() * BvhNode::WORDS);
        words.extend_from_slice(&self.prim_indices);
        words.extend_from_slice(bytemuck::cast_slice(&self.nodes));
        words
    }
}

/// SAH bin for evaluating split candidates.
#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

impl Bin {
    const EMPTY: Self = Self {
        bounds: Aabb::EMPTY,
        count: 0,
    };
}

/// Build a BVH over one box per primitive, using binned SAH on box centroids.
///
/// Primitive `i` is whatever `bounds[i]` encloses: a triangle, a procedural
/// box, or a transformed instance. Ranges of up to [`MAX_LEAF_SIZE`] boxes
/// become leaves. A larger range is split at the cheapest of the
/// 11 inner boundaries of 12 bins on each axis. It stays a leaf instead if that
/// is cheaper and it holds at most `2 * MAX_LEAF_SIZE` boxes. When no
/// boundary separates the centroids, or the leaf would be too large, the
/// range is sorted along the longest axis of its bounds and cut at the median.
///
/// Returns a flat node array plus a reordered index list. Empty input yields
/// a single empty leaf.
#[tracing::instrument(skip_all, fields(prim_count = bounds.len()))]
pub fn build_bvh(bounds: &[Aabb]) -> Bvh {
    let n = bounds.len();
    if n == 0 {
        return Bvh {
            nodes: vec![BvhNode::zeroed()],
            prim_indices: vec![],
        };
    }

    let centroids: Vec<Vec3> = bounds.iter().map(Aabb::centroid).collect();
    let mut indices: Vec<u32> = (0..n as u32).collect();
    let mut nodes: Vec<BvhNode> = Vec::with_capacity(Bvh::max_nodes(n));
    nodes.push(BvhNode::zeroed());

    struct Task {
        node_idx: usize,
        start: usize,
        end: usize, // exclusive
    }

    let mut stack = vec![Task {
        node_idx: 0,
        start: 0,
        end: n,
    }];

    while let Some(task) = stack.pop() {
        let (start, end) = (task.start, task.end);
        let count = end - start;

        let mut node_aabb = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            node_aabb.grow(&bounds[idx as usize]);
        }

        if count <= MAX_LEAF_SIZE {
            nodes[task.node_idx] = BvhNode::leaf(&node_aabb, start, count);
            continue;
        }

        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            centroid_bounds.grow_point(centroids[idx as usize]);
        }

        let split = find_best_split(&indices[start..end], bounds, &centroids, &centroid_bounds);
        let leaf_cost = count as f32 * INTERSECT_COST * node_aabb.area();

        let mid = match split {
            Some((axis, pos, cost)) if cost < leaf_cost => {
                let mid = partition(&mut indices[start..end], |&idx| centroids[idx as usize][axis] < pos) + start;
                if mid == start || mid == end {
                    (start + end) / 2
                } else {
                    mid
                }
            }
            // Leaf is cheaper, unless it would exceed the hard limit
            Some(_) if count <= 2 * MAX_LEAF_SIZE => {
                nodes[task.node_idx] = BvhNode::leaf(&node_aabb, start, count);
                continue;
            }
            // Degenerate centroids or oversized leaf: median split on the longest axis
            _ => {
                let axis = node_aabb.longest_axis();
                indices[start..end].sort_by(|&a, &b| {
                    centroids[a as usize][axis].total_cmp(&centroids[b as usize][axis])
                });
                (start + end) / 2
            }
        };

        let left_idx = nodes.len();
        nodes.push(BvhNode::zeroed());
        nodes.push(BvhNode::zeroed());
        nodes[task.node_idx] = BvhNode::internal(&node_aabb, left_idx);

        // Right first so the left subtree is processed first (depth-first)
        stack.push(Task {
            node_idx: left_idx + 1,
            start: mid,
            end,
        });
        stack.push(Task {
            node_idx: left_idx,
            start,
            end: mid,
        });
    }

    Bvh {
        nodes,
        prim_indices: indices,
    }
}

/// Bin the centroids of `indices` into `NUM_BINS` slots per axis and price
/// every boundary as `traversal + left_count * left_area + right_count * right_area`.
/// Returns (axis, split position, cost) for the cheapest boundary with boxes on
/// both sides, or `None` if the centroids span no axis.
fn find_best_split(
    indices: &[u32],
    bounds: &[Aabb],
    centroids: &[Vec3],
    centroid_bounds: &Aabb,
) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32, f32)> = None;

    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent < 1e-8 {
            continue;
        }

        let mut bins = [Bin::EMPTY; NUM_BINS];
        let inv_extent = NUM_BINS as f32 / extent;
        for &idx in indices {
            let idx = idx as usize;
            let bin_id = ((centroids[idx][axis] - centroid_bounds.min[axis]) * inv_extent) as usize;
            let bin = &mut bins[bin_id.min(NUM_BINS - 1)];
            bin.bounds.grow(&bounds[idx]);
            bin.count += 1;
        }

        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            if left_count[i - 1] == 0 || sweep_count == 0 {
                continue;
            }
            let cost = TRAVERSAL_COST
                + INTERSECT_COST
                    * (left_count[i - 1] as f32 * left_area[i - 1] + sweep_count as f32 * sweep.area());
            if best.is_none_or(|(_, _, c)| cost < c) {
                let pos = centroid_bounds.min[axis] + (i as f32 / NUM_BINS as f32) * extent;
                best = Some((axis, pos, cost));
            }
        }
    }

    best
}

/// Partition slice in-place. Returns count of elements where predicate is true.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(cx: f32, cy: f32, cz: f32) -> Aabb {
        Aabb::new(Vec3::new(cx - 0.5, cy - 0.5, cz), Vec3::new(cx + 0.5, cy + 0.5, cz))
    }

    fn check_leaves_cover(bvh: &Bvh, n: usize) {
        let mut seen = vec![0u32; n];
        for node in bvh.nodes.iter().filter(|n| n.is_leaf()) {
            assert!(node.count as usize <= 2 * MAX_LEAF_SIZE);
            let first = node.left_or_first as usize;
            for &p in &bvh.prim_indices[first..first + node.count as usize] {
                seen[p as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "every primitive in exactly one leaf");
    }

    #[test]
    fn test_empty_bvh() {
        let bvh = build_bvh(&[]);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 0);
        assert_eq!(bvh.prim_indices.len(), 0);
    }

    #[test]
    fn test_single_box() {
        let bvh = build_bvh(&[make_box(0.0, 0.0, 0.0)]);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 1);
        assert_eq!(bvh.prim_indices, vec![0]);
    }

    #[test]
    fn test_many_boxes_builds_tree() {
        let boxes: Vec<Aabb> = (0..100).map(|i| make_box(i as f32 * 2.0, 0.0, 0.0)).collect();
        let bvh = build_bvh(&boxes);

        assert!(bvh.nodes.len() > 1, "BVH should have internal nodes");
        assert!(bvh.nodes.len() <= Bvh::max_nodes(100));
        check_leaves_cover(&bvh, 100);

        let root = bvh.root_bounds();
        assert!(root.min.x < 0.0);
        assert!(root.max.x > 198.0);
    }

    #[test]
    fn test_children_inside_parent() {
        let boxes: Vec<Aabb> = (0..64)
            .map(|i| make_box((i % 8) as f32, (i / 8) as f32, (i % 3) as f32))
            .collect();
        let bvh = build_bvh(&boxes);
        for node in bvh.nodes.iter().filter(|n| !n.is_leaf()) {
            let parent = node.bounds();
            for child in [node.left_or_first as usize, node.left_or_first as usize + 1] {
                let c = bvh.nodes[child].bounds();
                assert!(c.min.cmpge(parent.min).all() && c.max.cmple(parent.max).all());
            }
        }
        check_leaves_cover(&bvh, 64);
    }

    #[test]
    fn test_coincident_boxes_still_split() {
        // All centroids equal: SAH finds nothing, median split keeps leaves small
        let boxes = vec![make_box(1.0, 1.0, 1.0); 40];
        let bvh = build_bvh(&boxes);
        check_leaves_cover(&bvh, 40);
        assert!(bvh.nodes.iter().filter(|n| n.is_leaf()).all(|n| n.count as usize <= MAX_LEAF_SIZE));
    }

    #[test]
    fn test_mixed_box_sizes() {
        // Instance-level input: large and tiny boxes sharing centroids
        let boxes: Vec<Aabb> = (0..30)
            .map(|i| {
                let c = Vec3::new((i % 5) as f32 * 3.0, 0.0, 0.0);
                let half = if i % 2 == 0 { Vec3::splat(2.0) } else { Vec3::splat(0.01) };
                Aabb::new(c - half, c + half)
            })
            .collect();
        let bvh = build_bvh(&boxes);
        check_leaves_cover(&bvh, 30);
        let root = bvh.root_bounds();
        assert_eq!(root.min, Vec3::new(-2.0, -2.0, -2.0));
        assert_eq!(root.max, Vec3::new(14.0, 2.0, 2.0));
    }

    #[test]
    fn test_leaf_count_correct() {
        let boxes = vec![make_box(0.0, 0.0, 0.0), make_box(1.0, 0.0, 0.0), make_box(2.0, 0.0, 0.0)];
        let bvh = build_bvh(&boxes);
        assert_eq!(bvh.nodes[0].count, 3);
    }

    #[test]
    fn test_word_layout() {
        let boxes = vec![make_box(0.0, 0.0, 0.0), make_box(1.0, 0.0, 0.0)];
        let bvh = build_bvh(&boxes);
        let words = bvh.to_words();
        assert_eq!(words.len(), 2 + BvhNode::WORDS);
        assert_eq!(words[2 + 7], 2); // root leaf count
        assert_eq!(f32::from_bits(words[2]), -0.5);
    }
}
