//! First-person fly-through camera.
//!
//! Movement flags translate the eye in the camera's horizontal frame, pointer
//! deltas yaw around the world up axis and pitch around the camera right axis.
//! Pitch is clamped by rejecting any step that would tilt the view further
//! past `max_pitch_degrees` from the horizon. Steps back toward the horizon
//! are always taken. Poses adopted from outside are clamped on the way in.

use serde::{Deserialize, Serialize};

use crate::transform;
use crate::util::{Mat4, Result, Vec2, Vec3};

/// Movement flags sampled once per frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveIntent {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub ascend: bool,
    pub descend: bool,
}

impl MoveIntent {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Fly-camera tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlyCameraConfig {
    /// World units per second.
    pub eye_speed: f32,
    /// Rotation per pointer unit, in degrees.
    pub degrees_per_cursor_point: f32,
    /// Maximum tilt above or below the horizon, in degrees.
    pub max_pitch_degrees: f32,
}

impl Default for FlyCameraConfig {
    fn default() -> Self {
        Self {
            eye_speed: 6.0,
            degrees_per_cursor_point: 0.5,
            max_pitch_degrees: 88.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pose {
    eye: Vec3,
    look: Vec3,
}

/// Fly-through camera controller.
#[derive(Debug, Clone)]
pub struct FlyCamera {
    eye: Vec3,
    /// Unit view direction.
    look: Vec3,
    /// World reference up. The camera's own up is derived from it.
    up: Vec3,
    home: Pose,
    config: FlyCameraConfig,
}

impl Default for FlyCamera {
    fn default() -> Self {
        Self::new(FlyCameraConfig::default())
    }
}

impl FlyCamera {
    /// Camera at the default home pose, looking at the origin.
    pub fn new(config: FlyCameraConfig) -> Self {
        let eye = Vec3::new(0.0, 1.5, -2.72);
        let look = (-eye).normalize();
        let home = Pose { eye, look };
        Self {
            eye,
            look,
            up: Vec3::Y,
            home,
            config,
        }
    }

    /// Camera whose home pose looks from `position` at `target`.
    pub fn from_placement(position: Vec3, target: Vec3, up: Vec3, config: FlyCameraConfig) -> Result<Self> {
        // Rejects coincident points and an up vector parallel to the view.
        transform::camera_to_world(position, target, up)?;
        let up = up.normalize();
        let look = clamp_pitch((target - position).normalize(), up, config.max_pitch_degrees);
        let home = Pose { eye: position, look };
        Ok(Self {
            eye: position,
            look,
            up,
            home,
            config,
        })
    }

    pub fn eye(&self) -> Vec3 {
        self.eye
    }

    pub fn look(&self) -> Vec3 {
        self.look
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn config(&self) -> &FlyCameraConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: FlyCameraConfig) {
        self.config = config;
    }

    /// Camera right axis. Falls back to an arbitrary horizontal axis when
    /// the view is vertical.
    pub fn right(&self) -> Vec3 {
        self.look
            .cross(self.up)
            .try_normalize()
            .unwrap_or_else(|| self.up.any_orthonormal_vector())
    }

    /// Elevation of the view direction above the horizon, in degrees.
    pub fn pitch_degrees(&self) -> f32 {
        self.look.dot(self.up).clamp(-1.0, 1.0).asin().to_degrees()
    }

    /// Advance the camera by one frame.
    pub fn update(&mut self, dt: f32, pointer_delta: Vec2, moves: MoveIntent) {
        // Right axis of the pre-rotation pose; pitch below pivots around it.
        let right = self.right();

        let strafe = axis(moves.right, moves.left);
        let forward = axis(moves.forward, moves.backward);
        let lift = axis(moves.ascend, moves.descend);
        if strafe != 0.0 || forward != 0.0 || lift != 0.0 {
            let dir = right * strafe + self.look * forward + self.up * lift;
            if let Some(dir) = dir.try_normalize() {
                self.eye += dir * self.config.eye_speed * dt;
            }
        }

        let deg = self.config.degrees_per_cursor_point;
        if pointer_delta.x != 0.0 {
            if let Ok(yaw) = transform::rotation3(self.up, transform::to_radians(-pointer_delta.x * deg)) {
                self.look = (yaw * self.look).normalize();
            }
        }

        if pointer_delta.y != 0.0 {
            if let Ok(pitch) = transform::rotation3(right, transform::to_radians(pointer_delta.y * deg)) {
                let candidate = (pitch * self.look).normalize();
                let limit = transform::to_radians(self.config.max_pitch_degrees).sin();
                let tilt = candidate.dot(self.up).abs();
                if tilt <= limit || tilt < self.look.dot(self.up).abs() {
                    self.look = candidate;
                }
            }
        }
    }

    /// Restore the home pose.
    pub fn reset(&mut self) {
        self.eye = self.home.eye;
        self.look = self.home.look;
    }

    /// Make the current pose the one [`reset`](Self::reset) returns to.
    pub fn set_home(&mut self) {
        self.home = Pose {
            eye: self.eye,
            look: self.look,
        };
    }

    /// World-to-camera transform.
    pub fn view_matrix(&self) -> Mat4 {
        transform::affine_inverse(&self.camera_to_world())
    }

    /// Camera-to-world transform, rebuilt from eye/look/up.
    pub fn camera_to_world(&self) -> Mat4 {
        let right = self.right();
        let cam_up = right.cross(self.look);
        Mat4::from_cols(
            right.extend(0.0),
            cam_up.extend(0.0),
            (-self.look).extend(0.0),
            self.eye.extend(1.0),
        )
    }

    /// Adopt the position and view direction of an external pose.
    pub fn set_camera_to_world(&mut self, pose: Mat4) {
        self.eye = pose.w_axis.truncate();
        if let Some(look) = (-pose.z_axis.truncate()).try_normalize() {
            self.look = clamp_pitch(look, self.up, self.config.max_pitch_degrees);
        }
    }
}

/// Tilt `look` back to `max_degrees` from the horizon if it is steeper.
/// A vertical `look` keeps no heading, so an arbitrary one is picked.
fn clamp_pitch(look: Vec3, up: Vec3, max_degrees: f32) -> Vec3 {
    let max = transform::to_radians(max_degrees);
    let elevation = look.dot(up);
    if elevation.abs() <= max.sin() {
        return look;
    }
    let heading = (look - up * elevation)
        .try_normalize()
        .unwrap_or_else(|| up.any_orthonormal_vector());
    (heading * max.cos() + up * max.sin().copysign(elevation)).normalize()
}

#[inline]
fn axis(positive: bool, negative: bool) -> f32 {
    positive as i32 as f32 - negative as i32 as f32
}
