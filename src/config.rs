//! Persistent renderer settings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::accel::BuildPolicy;
use crate::camera::{FlyCameraConfig, SurfaceOrigin};
use crate::util::{Result, UVec2, Vec3};

/// Renderer settings; missing keys fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    // Output
    pub width: u32,
    pub height: u32,
    pub surface_origin: SurfaceOrigin,
    pub background: [f32; 3],

    // Projection
    pub fov_y_degrees: f32,
    pub z_near: f32,
    pub z_far: f32,

    // Pipelining
    pub max_frames_in_flight: usize,
    pub compact_acceleration_structures: bool,

    // Navigation
    pub fly: FlyCameraConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            surface_origin: SurfaceOrigin::TopLeft,
            background: [0.1, 0.1, 0.12],
            fov_y_degrees: 45.0,
            z_near: 0.01,
            z_far: 1000.0,
            max_frames_in_flight: 3,
            compact_acceleration_structures: true,
            fly: FlyCameraConfig::default(),
        }
    }
}

const MAX_FRAMES_IN_FLIGHT: usize = 8;

impl RendererConfig {
    /// Default settings file location.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("vrtracer");
            p.push("config.json");
            p
        })
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        let config = Self::path()
            .filter(|p| p.exists())
            .and_then(|p| match Self::load_from(&p) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(path = %p.display(), "ignoring config: {e}");
                    None
                }
            })
            .unwrap_or_default();
        config.validated()
    }

    /// Load from an explicit file. Values are validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config.validated())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<()> {
        match Self::path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    /// Clamp out-of-range values; returns a note per adjusted field.
    pub fn validate(&mut self) -> Vec<String> {
        let defaults = Self::default();
        let mut notes = Vec::new();

        if !(self.fov_y_degrees > 0.0 && self.fov_y_degrees < 180.0) {
            notes.push(format!("fov_y_degrees {} out of (0, 180)", self.fov_y_degrees));
            self.fov_y_degrees = defaults.fov_y_degrees;
        }
        if !(self.z_near > 0.0 && self.z_near < self.z_far && self.z_far.is_finite()) {
            notes.push(format!("clip range {}..{} invalid", self.z_near, self.z_far));
            self.z_near = defaults.z_near;
            self.z_far = defaults.z_far;
        }
        if self.max_frames_in_flight == 0 || self.max_frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            let clamped = self.max_frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
            notes.push(format!("max_frames_in_flight {} clamped to {clamped}", self.max_frames_in_flight));
            self.max_frames_in_flight = clamped;
        }
        if self.width == 0 || self.height == 0 {
            notes.push(format!("output size {}x{} is empty", self.width, self.height));
            self.width = defaults.width;
            self.height = defaults.height;
        }
        if !(self.fly.max_pitch_degrees > 0.0 && self.fly.max_pitch_degrees < 90.0) {
            notes.push(format!("max_pitch_degrees {} out of (0, 90)", self.fly.max_pitch_degrees));
            self.fly.max_pitch_degrees = defaults.fly.max_pitch_degrees;
        }
        notes
    }

    fn validated(mut self) -> Self {
        for note in self.validate() {
            tracing::warn!("config: {note}");
        }
        self
    }

    pub fn output_size(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    pub fn background(&self) -> Vec3 {
        Vec3::from_array(self.background)
    }

    pub fn build_policy(&self) -> BuildPolicy {
        BuildPolicy {
            compact: self.compact_acceleration_structures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = RendererConfig::default();
        config.width = 320;
        config.surface_origin = SurfaceOrigin::BottomLeft;
        config.fly.eye_speed = 2.5;
        config.save_to(&path).unwrap();

        assert_eq!(RendererConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "width": 64, "fly": { "eye_speed": 1.0 } }"#).unwrap();

        let config = RendererConfig::load_from(&path).unwrap();
        assert_eq!(config.width, 64);
        assert_eq!(config.height, 512);
        assert_eq!(config.fly.eye_speed, 1.0);
        assert_eq!(config.fly.max_pitch_degrees, FlyCameraConfig::default().max_pitch_degrees);
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = RendererConfig {
            fov_y_degrees: 200.0,
            z_near: 5.0,
            z_far: 1.0,
            max_frames_in_flight: 0,
            ..Default::default()
        };
        let notes = config.validate();
        assert_eq!(notes.len(), 3);
        assert_eq!(config.fov_y_degrees, 45.0);
        assert_eq!((config.z_near, config.z_far), (0.01, 1000.0));
        assert_eq!(config.max_frames_in_flight, 1);
        assert!(RendererConfig::default().validate().is_empty());
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RendererConfig::load_from(&path), Err(crate::Error::Json(_))));
    }
}
