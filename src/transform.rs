//! 4x4 transform builders.
//!
//! All matrices are column-major `glam::Mat4` applied to column vectors
//! (`m * v`). Cameras are right-handed and look down -Z. Projections map the
//! view frustum to x,y in [-1, 1] and depth to [0, 1] (near -> 0, far -> 1).

use crate::util::{Error, Mat3, Mat4, Result, Vec3, Vec4};

const EPSILON: f32 = 1e-6;

/// Degrees to radians.
#[inline]
pub fn to_radians(degrees: f32) -> f32 {
    degrees.to_radians()
}

/// Orthonormal camera basis derived from a position/target/up triple.
struct Basis {
    right: Vec3,
    up: Vec3,
    forward: Vec3,
}

fn basis(position: Vec3, target: Vec3, up: Vec3) -> Result<Basis> {
    let forward = (target - position).try_normalize().ok_or_else(|| {
        Error::degenerate(format!("camera target {target} coincides with position"))
    })?;
    let up = up
        .try_normalize()
        .ok_or_else(|| Error::degenerate("zero-length up vector"))?;
    let right = forward
        .cross(up)
        .try_normalize()
        .ok_or_else(|| Error::degenerate("up vector is parallel to the view direction"))?;
    Ok(Basis {
        right,
        up: right.cross(forward),
        forward,
    })
}

/// World-to-camera transform for a camera at `position` looking at `target`.
///
/// The up vector is re-orthogonalized against the view direction.
pub fn look_at(position: Vec3, target: Vec3, up: Vec3) -> Result<Mat4> {
    let b = basis(position, target, up)?;
    // Rows: right, up', -forward; translation is the rotated, negated eye.
    Ok(Mat4::from_cols(
        Vec4::new(b.right.x, b.up.x, -b.forward.x, 0.0),
        Vec4::new(b.right.y, b.up.y, -b.forward.y, 0.0),
        Vec4::new(b.right.z, b.up.z, -b.forward.z, 0.0),
        Vec4::new(
            -b.right.dot(position),
            -b.up.dot(position),
            b.forward.dot(position),
            1.0,
        ),
    ))
}

/// Camera-to-world transform; the analytic inverse of [`look_at`].
pub fn camera_to_world(position: Vec3, target: Vec3, up: Vec3) -> Result<Mat4> {
    let b = basis(position, target, up)?;
    Ok(Mat4::from_cols(
        b.right.extend(0.0),
        b.up.extend(0.0),
        (-b.forward).extend(0.0),
        position.extend(1.0),
    ))
}

fn check_range(z_near: f32, z_far: f32) -> Result<()> {
    if z_near > 0.0 && z_near < z_far && z_far.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidRange {
            near: z_near,
            far: z_far,
        })
    }
}

/// Unscaled perspective: maps camera-space depth in `[-near, -far]` to `[0, 1]`
/// and leaves x/y to the homogeneous divide.
pub fn perspective_matrix(z_near: f32, z_far: f32) -> Result<Mat4> {
    check_range(z_near, z_far)?;
    let range = z_far - z_near;
    Ok(Mat4::from_cols(
        Vec4::new(1.0, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 1.0, 0.0, 0.0),
        Vec4::new(0.0, 0.0, -z_far / range, -1.0),
        Vec4::new(0.0, 0.0, -z_far * z_near / range, 0.0),
    ))
}

/// Analytic inverse of [`perspective_matrix`].
pub fn inverse_perspective(z_near: f32, z_far: f32) -> Result<Mat4> {
    check_range(z_near, z_far)?;
    Ok(Mat4::from_cols(
        Vec4::new(1.0, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 1.0, 0.0, 0.0),
        Vec4::new(0.0, 0.0, 0.0, 1.0 / z_far - 1.0 / z_near),
        Vec4::new(0.0, 0.0, -1.0, 1.0 / z_near),
    ))
}

/// Full perspective projection with a vertical field of view in degrees.
pub fn perspective(fov_y_degrees: f32, aspect: f32, z_near: f32, z_far: f32) -> Result<Mat4> {
    if !(fov_y_degrees > 0.0 && fov_y_degrees < 180.0) {
        return Err(Error::degenerate(format!(
            "vertical field of view {fov_y_degrees} outside (0, 180) degrees"
        )));
    }
    if !(aspect > 0.0 && aspect.is_finite()) {
        return Err(Error::degenerate(format!("aspect ratio {aspect}")));
    }
    let inv_tan = 1.0 / (to_radians(fov_y_degrees) * 0.5).tan();
    let scale = Mat4::from_diagonal(Vec4::new(inv_tan / aspect, inv_tan, 1.0, 1.0));
    Ok(scale * perspective_matrix(z_near, z_far)?)
}

/// 3x3 rotation of `angle_radians` around `axis` (normalized here).
pub fn rotation3(axis: Vec3, angle_radians: f32) -> Result<Mat3> {
    if axis.length_squared() < EPSILON * EPSILON {
        return Err(Error::DegenerateAxis);
    }
    Ok(Mat3::from_axis_angle(axis.normalize(), angle_radians))
}

/// Homogeneous rotation of `angle_radians` around `axis`.
pub fn rotation(axis: Vec3, angle_radians: f32) -> Result<Mat4> {
    rotation3(axis, angle_radians).map(Mat4::from_mat3)
}

#[inline]
pub fn translation(offset: Vec3) -> Mat4 {
    Mat4::from_translation(offset)
}

#[inline]
pub fn scale(factors: Vec3) -> Mat4 {
    Mat4::from_scale(factors)
}

/// Inverse of a rigid transform (orthonormal rotation + translation).
pub fn affine_inverse(m: &Mat4) -> Mat4 {
    let r = Mat3::from_mat4(*m).transpose();
    let t = -(r * m.w_axis.truncate());
    Mat4::from_cols(
        r.x_axis.extend(0.0),
        r.y_axis.extend(0.0),
        r.z_axis.extend(0.0),
        t.extend(1.0),
    )
}
