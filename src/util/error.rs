//! Error types for the renderer.

use thiserror::Error;

/// Main error type for vrtracer operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Clip range must satisfy `0 < near < far`
    #[error("Invalid clip range: near={near}, far={far} (need 0 < near < far)")]
    InvalidRange { near: f32, far: f32 },

    /// Rotation axis has (near) zero length
    #[error("Degenerate rotation axis")]
    DegenerateAxis,

    /// Input vectors or sizes that cannot produce a valid transform
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    /// Vertex/color arrays do not describe whole triangles
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Geometry has no device-resident copy yet
    #[error("Geometry has not been uploaded")]
    NotUploaded,

    /// Instance references a geometry id outside the scene arena
    #[error("Instance {instance} references unknown geometry {geometry}")]
    UnknownGeometry { instance: usize, geometry: usize },

    /// Setup failure (device, pipeline, buffers, acceleration structures)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend call failed after setup
    #[error("Backend error: {0}")]
    Backend(String),

    /// Display surface could not provide a drawable this tick
    #[error("Display surface unavailable")]
    SurfaceUnavailable,

    /// Uniform slot is still read by an in-flight frame
    #[error("Uniform slot {slot} is still in use by frame {frame}")]
    SlotBusy { slot: usize, frame: u64 },

    /// Dispatch reads a resource that was not made resident
    #[error("Resource not resident for dispatch: {0}")]
    NotResident(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Create a configuration (fatal setup) error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a degenerate input error.
    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateInput(msg.into())
    }

    /// True for per-frame errors after which the next frame may proceed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SurfaceUnavailable)
    }
}

/// Result type alias for vrtracer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::InvalidRange { near: 2.0, far: 1.0 };
        assert!(e.to_string().contains("near=2"));
        assert!(e.to_string().contains("far=1"));

        let e = Error::UnknownGeometry { instance: 3, geometry: 7 };
        assert!(e.to_string().contains("3"));
        assert!(e.to_string().contains("7"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::SurfaceUnavailable.is_transient());
        assert!(!Error::config("no adapter").is_transient());
        assert!(!Error::NotUploaded.is_transient());
    }
}
