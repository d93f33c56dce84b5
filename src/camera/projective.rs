//! Perspective camera with cached pose and unprojection matrices.

use serde::{Deserialize, Serialize};

use super::RtCamera;
use crate::transform;
use crate::util::{Error, Mat4, Result, UVec2, Vec3, Vec4};

/// Where pixel (0, 0) of the output surface lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceOrigin {
    /// Row 0 is the top row (wgpu, most windowing systems).
    #[default]
    TopLeft,
    /// Row 0 is the bottom row; window y is flipped before unprojection.
    BottomLeft,
}

/// Pinhole camera. Size-dependent matrices are recomputed together in
/// [`set_output_size`](RtCamera::set_output_size); `viewport_to_camera` is
/// composed from them on read.
#[derive(Debug, Clone)]
pub struct ProjectiveCamera {
    camera_to_world: Mat4,
    fov_y_degrees: f32,
    z_near: f32,
    z_far: f32,
    origin: SurfaceOrigin,
    size: UVec2,

    window_to_viewport: Mat4,
    viewport_to_ndc: Mat4,
    ndc_to_camera: Mat4,
}

impl ProjectiveCamera {
    /// Create a camera. Fails on a degenerate size, FOV or clip range.
    pub fn new(
        camera_to_world: Mat4,
        size: UVec2,
        fov_y_degrees: f32,
        z_near: f32,
        z_far: f32,
        origin: SurfaceOrigin,
    ) -> Result<Self> {
        if !(fov_y_degrees > 0.0 && fov_y_degrees < 180.0) {
            return Err(Error::degenerate(format!(
                "vertical field of view {fov_y_degrees} outside (0, 180) degrees"
            )));
        }
        // Validates the clip range up front.
        transform::inverse_perspective(z_near, z_far)?;

        let mut camera = Self {
            camera_to_world,
            fov_y_degrees,
            z_near,
            z_far,
            origin,
            size: UVec2::ZERO,
            window_to_viewport: Mat4::IDENTITY,
            viewport_to_ndc: Mat4::IDENTITY,
            ndc_to_camera: Mat4::IDENTITY,
        };
        camera.set_output_size(size)?;
        Ok(camera)
    }

    /// Camera at `position` looking at `target`.
    pub fn looking_at(
        position: Vec3,
        target: Vec3,
        up: Vec3,
        size: UVec2,
        fov_y_degrees: f32,
        z_near: f32,
        z_far: f32,
    ) -> Result<Self> {
        let pose = transform::camera_to_world(position, target, up)?;
        Self::new(pose, size, fov_y_degrees, z_near, z_far, SurfaceOrigin::TopLeft)
    }

    pub fn world_to_camera(&self) -> Mat4 {
        transform::affine_inverse(&self.camera_to_world)
    }

    /// Camera position in world space.
    pub fn position(&self) -> Vec3 {
        self.camera_to_world.w_axis.truncate()
    }

    pub fn fov_y_degrees(&self) -> f32 {
        self.fov_y_degrees
    }

    pub fn clip_range(&self) -> (f32, f32) {
        (self.z_near, self.z_far)
    }

    pub fn surface_origin(&self) -> SurfaceOrigin {
        self.origin
    }

    pub fn aspect(&self) -> f32 {
        self.size.x as f32 / self.size.y as f32
    }

    /// Forward projection (camera space -> NDC) matching the unprojection.
    pub fn projection(&self) -> Result<Mat4> {
        transform::perspective(self.fov_y_degrees, self.aspect(), self.z_near, self.z_far)
    }

    pub fn ndc_to_camera(&self) -> Mat4 {
        self.ndc_to_camera
    }

    pub fn viewport_to_ndc(&self) -> Mat4 {
        self.viewport_to_ndc
    }

    pub fn window_to_viewport(&self) -> Mat4 {
        self.window_to_viewport
    }
}

impl RtCamera for ProjectiveCamera {
    fn camera_to_world(&self) -> Mat4 {
        self.camera_to_world
    }

    fn set_camera_to_world(&mut self, pose: Mat4) {
        self.camera_to_world = pose;
    }

    fn viewport_to_camera(&self) -> Mat4 {
        self.ndc_to_camera * self.viewport_to_ndc * self.window_to_viewport
    }

    fn set_output_size(&mut self, size: UVec2) -> Result<()> {
        if size.x == 0 || size.y == 0 {
            return Err(Error::degenerate(format!("output size {}x{}", size.x, size.y)));
        }
        let (w, h) = (size.x as f32, size.y as f32);
        let aspect = w / h;
        let tan_half_fov = (transform::to_radians(self.fov_y_degrees) * 0.5).tan();

        // Build all three first so a failure leaves the camera untouched.
        let ndc_to_camera = transform::inverse_perspective(self.z_near, self.z_far)?
            * transform::scale(Vec3::new(aspect * tan_half_fov, tan_half_fov, 1.0));
        let viewport_to_ndc = Mat4::from_cols(
            Vec4::new(2.0 / w, 0.0, 0.0, 0.0),
            Vec4::new(0.0, -2.0 / h, 0.0, 0.0),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            Vec4::new(-1.0, 1.0, 0.0, 1.0),
        );
        let window_to_viewport = match self.origin {
            SurfaceOrigin::TopLeft => Mat4::IDENTITY,
            SurfaceOrigin::BottomLeft => Mat4::from_cols(
                Vec4::X,
                Vec4::NEG_Y,
                Vec4::Z,
                Vec4::new(0.0, h, 0.0, 1.0),
            ),
        };

        self.size = size;
        self.ndc_to_camera = ndc_to_camera;
        self.viewport_to_ndc = viewport_to_ndc;
        self.window_to_viewport = window_to_viewport;
        Ok(())
    }

    fn output_size(&self) -> UVec2 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unproject(m: &Mat4, x: f32, y: f32, z: f32) -> Vec3 {
        let p = *m * Vec4::new(x, y, z, 1.0);
        p.truncate() / p.w
    }

    fn camera(size: UVec2) -> ProjectiveCamera {
        ProjectiveCamera::new(Mat4::IDENTITY, size, 45.0, 0.01, 1000.0, SurfaceOrigin::TopLeft)
            .unwrap()
    }

    #[test]
    fn test_center_pixel_looks_down_negative_z() {
        let cam = camera(UVec2::new(512, 512));
        let v2c = cam.viewport_to_camera();
        let near = unproject(&v2c, 256.0, 256.0, 0.0);
        let far = unproject(&v2c, 256.0, 256.0, 1.0);
        assert!((near - Vec3::new(0.0, 0.0, -0.01)).length() < 1e-6);
        assert!((far - Vec3::new(0.0, 0.0, -1000.0)).length() < 1e-2);
    }

    #[test]
    fn test_corner_matches_field_of_view() {
        let cam = camera(UVec2::new(800, 400));
        let v2c = cam.viewport_to_camera();
        let tan_half = (22.5f32).to_radians().tan();
        // Top-left corner at depth 1 (camera z = -1 after scaling)
        let p = unproject(&v2c, 0.0, 0.0, 0.0);
        let p = p / -p.z;
        assert!((p.x + 2.0 * tan_half).abs() < 1e-4);
        assert!((p.y - tan_half).abs() < 1e-4);
    }

    #[test]
    fn test_bottom_left_origin_flips_y() {
        let mut cam = camera(UVec2::new(100, 100));
        let top = unproject(&cam.viewport_to_camera(), 50.0, 0.0, 0.0);
        cam = ProjectiveCamera::new(
            Mat4::IDENTITY,
            UVec2::new(100, 100),
            45.0,
            0.01,
            1000.0,
            SurfaceOrigin::BottomLeft,
        )
        .unwrap();
        let bottom = unproject(&cam.viewport_to_camera(), 50.0, 0.0, 0.0);
        assert!(top.y > 0.0);
        assert!((bottom.y + top.y).abs() < 1e-6);
    }

    #[test]
    fn test_unprojection_inverts_projection() {
        let cam = camera(UVec2::new(640, 480));
        let proj = cam.projection().unwrap();
        let p = Vec3::new(0.3, -0.2, -4.0);
        let clip = proj * p.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        let px = (ndc.x + 1.0) * 0.5 * 640.0;
        let py = (1.0 - ndc.y) * 0.5 * 480.0;
        let back = unproject(&cam.viewport_to_camera(), px, py, ndc.z);
        assert!((back - p).length() < 1e-3, "{back:?}");
    }

    #[test]
    fn test_same_size_same_matrices() {
        let mut a = camera(UVec2::new(320, 200));
        let mut b = camera(UVec2::new(64, 64));
        a.set_output_size(UVec2::new(1024, 768)).unwrap();
        b.set_output_size(UVec2::new(1024, 768)).unwrap();
        assert_eq!(a.viewport_to_camera(), b.viewport_to_camera());
        assert_eq!(a.output_size(), UVec2::new(1024, 768));
    }

    #[test]
    fn test_zero_size_rejected_and_state_kept() {
        let mut cam = camera(UVec2::new(64, 32));
        let before = cam.viewport_to_camera();
        assert!(cam.set_output_size(UVec2::new(0, 10)).is_err());
        assert_eq!(cam.viewport_to_camera(), before);
        assert_eq!(cam.output_size(), UVec2::new(64, 32));
    }

    #[test]
    fn test_invalid_construction() {
        let size = UVec2::new(10, 10);
        assert!(ProjectiveCamera::new(Mat4::IDENTITY, size, 45.0, 1.0, 0.5, SurfaceOrigin::TopLeft).is_err());
        assert!(ProjectiveCamera::new(Mat4::IDENTITY, size, 180.0, 0.1, 1.0, SurfaceOrigin::TopLeft).is_err());
    }

    #[test]
    fn test_world_to_camera_inverts_pose() {
        let cam = ProjectiveCamera::looking_at(
            Vec3::new(0.0, 0.0, -1.72),
            Vec3::ZERO,
            Vec3::Y,
            UVec2::new(512, 512),
            45.0,
            0.01,
            1000.0,
        )
        .unwrap();
        let m = cam.world_to_camera() * cam.camera_to_world();
        assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert_eq!(cam.position(), Vec3::new(0.0, 0.0, -1.72));
    }
}
