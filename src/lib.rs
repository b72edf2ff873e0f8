//! Progressive ray-tracing renderer core
//!
//! Every displayed frame is one stochastic sample per pixel, averaged into a
//! running estimate that converges over time. This crate owns the hard part of
//! that loop:
//! - **Acceleration structures**: one compacted BLAS per geometry, one TLAS over
//!   all instances, rebuilt synchronously on every scene reset
//! - **Bindless resources**: a fixed-stride table of raw GPU addresses indexed by
//!   geometry id
//! - **Frame pipelining**: a counting gate bounding frames in flight and a ring of
//!   256-byte aligned uniform slots
//! - **Accumulation**: ping-pong float targets plus a per-pixel seed texture
//! - **Presentation**: optional spatial upscale followed by a blit
//!
//! Two backends implement the device side:
//! - **Software**: a CPU device with an in-order queue thread, a real BVH builder and
//!   a CPU port of the ray-tracing kernel (always available)
//! - **Vulkan**: `VK_KHR_ray_query` through ash (feature `vulkan-backend`)
//!
//! # Frame anatomy
//!
//! ```text
//!  gate.acquire ─▶ uniforms[k mod N] ─▶ dispatch(src ─▶ dst) ─▶ swap ─▶ upscale? ─▶ blit
//!       ▲                                                                          │
//!       └──────────────── completion handler: gate.release, stats ◀────────────────┘
//! ```

pub mod accel;
pub mod accumulation;
pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod present;
pub mod renderer;
pub mod resource_table;
pub mod resources;
pub mod scene;
pub mod scheduler;
pub mod shaders;
pub mod stats;

pub use accel::{AccelerationStructureBuilder, BuildReport, SceneAccelerationStructures};
pub use accumulation::AccumulationBuffer;
pub use backend::{create_backend, BackendError, RayTracingBackend};
pub use dispatcher::{CameraBasis, RayTraceDispatcher};
pub use error::{RendererError, Result, SceneError};
pub use present::{Drawable, OffscreenSurface, PresentStage, PresentSurface};
pub use renderer::{DrawOutcome, Renderer};
pub use resource_table::ResourceTable;
pub use scene::{
    hoist_cornell_box, Geometry, Instance, LineUp, Scene, SphereGeometry, TriangleMesh, ViewerPose,
};
pub use scheduler::{FrameScheduler, InFlightGate, UniformRing};
pub use stats::{NullStatsSink, RenderStats, StatsSink};

/// Backend selection for the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// CPU reference device, always available
    #[default]
    Software,
    /// Vulkan via ash, falls back to software when unavailable
    Vulkan,
}

/// Upscale factors the present stage accepts.
pub const UPSCALE_FACTORS: [u32; 4] = [1, 2, 4, 8];

/// Highest number of frames the scheduler lets into flight.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 8;

/// Configuration for creating a [`Renderer`]
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Display width in pixels
    pub width: u32,
    /// Display height in pixels
    pub height: u32,
    /// Frames allowed in flight before `draw` blocks
    pub frames_in_flight: u32,
    /// Display size divided by render size, one of [`UPSCALE_FACTORS`]
    pub upscale_factor: u32,
    /// Path segments traced per sample
    pub max_bounces: u32,
    /// Seed for the per-pixel seed texture; random when `None`
    pub seed: Option<u64>,
    /// Embed per-primitive data in the acceleration structures when the device allows it
    pub use_primitive_data: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Software,
            width: 800,
            height: 600,
            frames_in_flight: 3,
            upscale_factor: 1,
            max_bounces: 3,
            seed: None,
            use_primitive_data: true,
        }
    }
}

impl RendererConfig {
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_upscale_factor(mut self, factor: u32) -> Self {
        self.upscale_factor = factor;
        self
    }

    pub fn with_max_bounces(mut self, bounces: u32) -> Self {
        self.max_bounces = bounces;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_primitive_data(mut self, enabled: bool) -> Self {
        self.use_primitive_data = enabled;
        self
    }

    /// Check value ranges before any GPU object is created.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RendererError::InvalidConfig(format!(
                "display size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(RendererError::InvalidConfig(format!(
                "frames in flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if !UPSCALE_FACTORS.contains(&self.upscale_factor) {
            return Err(RendererError::InvalidUpscaleFactor(self.upscale_factor));
        }
        if self.max_bounces == 0 || self.max_bounces > shaders::MAX_BOUNCES {
            return Err(RendererError::InvalidConfig(format!(
                "max bounces must be in 1..={}, got {}",
                shaders::MAX_BOUNCES,
                self.max_bounces
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.upscale_factor, 1);
    }

    #[test]
    fn rejects_bad_upscale_factor() {
        let config = RendererConfig::default().with_upscale_factor(3);
        assert!(matches!(
            config.validate(),
            Err(RendererError::InvalidUpscaleFactor(3))
        ));
    }

    #[test]
    fn rejects_zero_frames_in_flight() {
        let config = RendererConfig::default().with_frames_in_flight(0);
        assert!(matches!(
            config.validate(),
            Err(RendererError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_empty_display() {
        let config = RendererConfig::default().with_size(0, 480);
        assert!(config.validate().is_err());
    }
}
