//! Renderer error types.
//!
//! Backend failures (allocation, pipeline creation, device faults) are fatal for a
//! renderer instance. Scene-load failures are reported separately so callers can
//! fix the scene and call `reset` again.

use thiserror::Error;

use crate::backend::BackendError;

/// Problems found while validating or uploading a scene.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("scene has no instances")]
    EmptyScene,
    #[error("geometry {geometry} has no primitives")]
    EmptyGeometry { geometry: usize },
    #[error("geometry {geometry}: index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        geometry: usize,
        index: u32,
        vertex_count: usize,
    },
    #[error("geometry {geometry}: {vertex_count} vertices exceed the 16-bit index range")]
    TooManyVertices { geometry: usize, vertex_count: usize },
    #[error("geometry {geometry} has position, normal and color streams of different lengths")]
    MismatchedVertexStreams { geometry: usize },
    #[error("geometry {geometry} contains non-finite coordinates")]
    NonFiniteGeometry { geometry: usize },
    #[error("instance {instance} references missing geometry {geometry}")]
    MissingGeometry { instance: usize, geometry: usize },
    #[error("instance {instance} has a zero visibility mask")]
    ZeroMask { instance: usize },
    #[error("instance {instance} has a non-finite transform")]
    NonFiniteTransform { instance: usize },
    #[error("instance {instance} has a singular transform")]
    SingularTransform { instance: usize },
    #[error("geometry {geometry} needs intersection function `{function}`, which the device cannot run")]
    UnsupportedIntersectionFunction {
        geometry: usize,
        function: &'static str,
    },
}

/// Errors surfaced by the renderer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RendererError {
    #[error("GPU backend failure: {0}")]
    Backend(#[from] BackendError),
    #[error("scene load failed: {0}")]
    Scene(#[from] SceneError),
    #[error("invalid renderer configuration: {0}")]
    InvalidConfig(String),
    #[error("unsupported upscale factor {0}, expected 1, 2, 4 or 8")]
    InvalidUpscaleFactor(u32),
}

impl RendererError {
    /// Fatal errors leave the renderer unusable; everything else can be retried
    /// with corrected input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

pub type Result<T> = std::result::Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RendererError::Scene(SceneError::EmptyGeometry { geometry: 2 });
        assert_eq!(err.to_string(), "scene load failed: geometry 2 has no primitives");

        let err = RendererError::InvalidUpscaleFactor(3);
        assert_eq!(
            err.to_string(),
            "unsupported upscale factor 3, expected 1, 2, 4 or 8"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(RendererError::Backend(BackendError::OutOfMemory).is_fatal());
        assert!(!RendererError::Scene(SceneError::EmptyScene).is_fatal());
        assert!(!RendererError::InvalidConfig("x".into()).is_fatal());
    }

    #[test]
    fn test_from_backend_error() {
        let err: RendererError = BackendError::DeviceLost.into();
        assert!(matches!(err, RendererError::Backend(BackendError::DeviceLost)));
    }
}
