//! Builder for simple colored meshes.

use super::{Geometry, IntersectionFunction};
use crate::util::{Mat4, Result, Vec3};

/// Corner indices of each cube face, counter-clockwise seen from outside.
/// Corner `i` sits at (bit0 ? +x : -x, bit1 ? +y : -y, bit2 ? +z : -z).
const CUBE_FACES: [[usize; 4]; 6] = [
    [0, 4, 6, 2], // -x
    [1, 3, 7, 5], // +x
    [0, 1, 5, 4], // -y
    [2, 6, 7, 3], // +y
    [0, 2, 3, 1], // -z
    [4, 5, 7, 6], // +z
];

/// Accumulates triangles and colors, then produces a [`Geometry`].
#[derive(Debug, Default, Clone)]
pub struct MeshBuilder {
    vertices: Vec<Vec3>,
    colors: Vec<Vec3>,
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn add_triangle(&mut self, a: Vec3, b: Vec3, c: Vec3, color: Vec3) -> &mut Self {
        self.vertices.extend([a, b, c]);
        self.colors.extend([color; 3]);
        self
    }

    /// Quad `a b c d` as triangles (a, b, c) and (a, c, d).
    pub fn add_quad(&mut self, a: Vec3, b: Vec3, c: Vec3, d: Vec3, color: Vec3) -> &mut Self {
        self.add_triangle(a, b, c, color);
        self.add_triangle(a, c, d, color)
    }

    /// Unit cube centered at the origin, transformed by `transform`.
    pub fn add_cube(&mut self, color: Vec3, transform: Mat4) -> &mut Self {
        let corners: [Vec3; 8] = std::array::from_fn(|i| {
            let p = Vec3::new(
                if i & 1 == 0 { -0.5 } else { 0.5 },
                if i & 2 == 0 { -0.5 } else { 0.5 },
                if i & 4 == 0 { -0.5 } else { 0.5 },
            );
            transform.transform_point3(p)
        });
        for [a, b, c, d] in CUBE_FACES {
            self.add_quad(corners[a], corners[b], corners[c], corners[d], color);
        }
        self
    }

    pub fn build(self) -> Result<Geometry> {
        Geometry::new(self.vertices, self.colors)
    }

    pub fn build_with(self, label: &str, function: Option<IntersectionFunction>) -> Result<Geometry> {
        let geometry = self.build()?.with_label(label);
        Ok(match function {
            Some(f) => geometry.with_intersection_function(f),
            None => geometry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_counts_and_bounds() {
        let mut b = MeshBuilder::new();
        b.add_cube(Vec3::ONE, Mat4::IDENTITY);
        assert_eq!(b.triangle_count(), 12);
        let g = b.build().unwrap();
        assert_eq!(g.vertex_count(), 36);
        assert_eq!(g.bounds().min, Vec3::splat(-0.5));
        assert_eq!(g.bounds().max, Vec3::splat(0.5));
    }

    #[test]
    fn test_cube_faces_are_planar_and_outward() {
        let mut b = MeshBuilder::new();
        b.add_cube(Vec3::ONE, Mat4::IDENTITY);
        let g = b.build().unwrap();
        for t in 0..g.triangle_count() as usize {
            let [a, b, c] = g.triangle(t);
            let n = (b - a).cross(c - a);
            assert!(n.length() > 0.0, "degenerate triangle {t}");
            let center = (a + b + c) / 3.0;
            // Normal points away from the cube center
            assert!(n.dot(center) > 0.0, "triangle {t} faces inward");
        }
    }

    #[test]
    fn test_every_face_covers_its_side() {
        let mut b = MeshBuilder::new();
        b.add_cube(Vec3::ONE, Mat4::IDENTITY);
        let g = b.build().unwrap();
        // Each of the 6 axis planes gets exactly 2 triangles
        let mut per_side = [0; 6];
        for t in 0..12 {
            let [a, b, c] = g.triangle(t);
            let n = (b - a).cross(c - a).normalize();
            let a = n.abs();
            let axis = if a.x > 0.5 { 0 } else if a.y > 0.5 { 1 } else { 2 };
            let side = axis * 2 + (n[axis] > 0.0) as usize;
            per_side[side] += 1;
        }
        assert_eq!(per_side, [2; 6]);
    }

    #[test]
    fn test_cube_transform_applied() {
        let mut b = MeshBuilder::new();
        b.add_cube(Vec3::X, Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)));
        let g = b.build().unwrap();
        assert_eq!(g.bounds().centroid(), Vec3::new(0.0, 2.0, 0.0));
        assert!(g.colors().iter().all(|c| *c == Vec3::X));
    }
}
