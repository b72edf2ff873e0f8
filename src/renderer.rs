//! The progressive renderer and its control surface.
//!
//! ```ignore
//! let backend = progressive_rt::create_backend(BackendType::Software)?;
//! let scene = hoist_cornell_box(LineUp::ThreeByThree, true, &mut rand::thread_rng());
//! let mut renderer = Renderer::new(backend, &scene, RendererConfig::default(), Arc::new(NullStatsSink))?;
//!
//! renderer.set_frames_to_render(64);
//! while renderer.frames_remaining() > 0 {
//!     renderer.draw(&mut surface)?;
//! }
//! renderer.wait_idle()?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::accel::{AccelerationStructureBuilder, BuildReport, SceneAccelerationStructures};
use crate::accumulation::AccumulationBuffer;
use crate::backend::{
    create_backend, BackendError, BackendResult, CommandList, CompletionHandler, CompletionInfo,
    RayTracingBackend,
};
use crate::dispatcher::RayTraceDispatcher;
use crate::error::{RendererError, Result};
use crate::present::{render_size, PresentStage, PresentSurface};
use crate::resource_table::ResourceTable;
use crate::scene::{Scene, UploadedGeometry};
use crate::scheduler::FrameScheduler;
use crate::stats::StatsSink;
use crate::{RendererConfig, UPSCALE_FACTORS};

/// What [`Renderer::draw`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    /// Paused, or no frames left to render
    Skipped,
    /// A frame was submitted and handed to the surface
    Presented,
    /// A frame was accumulated but the surface had no drawable
    Dropped,
}

/// GPU state derived from one scene.
struct LoadedScene {
    geometries: Vec<UploadedGeometry>,
    structures: SceneAccelerationStructures,
    resource_table: ResourceTable,
    dispatcher: RayTraceDispatcher,
}

impl LoadedScene {
    fn load(
        backend: &dyn RayTracingBackend,
        scene: &Scene,
        config: &RendererConfig,
    ) -> Result<Self> {
        let capabilities = backend.capabilities();
        scene.validate_for(&capabilities)?;

        let use_primitive_data =
            config.use_primitive_data && capabilities.primitive_data_in_acceleration_structure;
        if !use_primitive_data && !capabilities.bindless_resources {
            return Err(RendererError::InvalidConfig(format!(
                "{} reads primitive data only from acceleration structures",
                backend.name()
            )));
        }
        let geometries = scene
            .geometries()
            .iter()
            .enumerate()
            .map(|(index, geometry)| geometry.upload(backend, index))
            .collect::<BackendResult<Vec<_>>>()?;
        let structures = AccelerationStructureBuilder::new(backend)
            .with_primitive_data(use_primitive_data)
            .build(scene, &geometries)?;
        let resource_table = ResourceTable::new(backend, &geometries)?;
        let dispatcher = RayTraceDispatcher::new(
            backend,
            scene,
            &geometries,
            &structures,
            &resource_table,
            config.max_bounces,
            use_primitive_data,
        )?;

        Ok(Self {
            geometries,
            structures,
            resource_table,
            dispatcher,
        })
    }
}

pub struct Renderer {
    backend: Arc<dyn RayTracingBackend>,
    config: RendererConfig,
    stats: Arc<dyn StatsSink>,
    scheduler: FrameScheduler,
    present: PresentStage,
    accumulation: AccumulationBuffer,
    loaded: LoadedScene,
    frame_index: u64,
    frames_remaining: u64,
    paused: bool,
    /// First device error reported by a completion handler
    fault: Arc<Mutex<Option<BackendError>>>,
}

impl Renderer {
    /// Build every GPU object for `scene` and clear the accumulation targets.
    ///
    /// Frames are rendered without limit until [`set_frames_to_render`](Self::set_frames_to_render)
    /// says otherwise.
    pub fn new(
        backend: Arc<dyn RayTracingBackend>,
        scene: &Scene,
        config: RendererConfig,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Creating renderer on {} ({}x{}, upscale {}, {} frames in flight)",
            backend.name(),
            config.width,
            config.height,
            config.upscale_factor,
            config.frames_in_flight
        );

        let scheduler = FrameScheduler::new(backend.as_ref(), config.frames_in_flight)?;
        let display = (config.width, config.height);
        let present = PresentStage::new(backend.as_ref(), display, config.upscale_factor)?;
        let (width, height) = present.render_size();
        let accumulation = AccumulationBuffer::new(backend.as_ref(), width, height, config.seed)?;
        let loaded = LoadedScene::load(backend.as_ref(), scene, &config)?;

        let mut renderer = Self {
            backend,
            config,
            stats,
            scheduler,
            present,
            accumulation,
            loaded,
            frame_index: 0,
            frames_remaining: u64::MAX,
            paused: false,
            fault: Arc::new(Mutex::new(None)),
        };
        renderer.clear_accumulation()?;
        Ok(renderer)
    }

    /// Create the backend named by `config.backend`, then the renderer.
    pub fn from_config(
        scene: &Scene,
        config: RendererConfig,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let backend = create_backend(config.backend)?;
        Self::new(backend, scene, config, stats)
    }

    fn check_fault(&self) -> Result<()> {
        match self.fault.lock().as_ref() {
            Some(error) => Err(RendererError::Backend(error.clone())),
            None => Ok(()),
        }
    }

    /// Remember fatal errors so every later call refuses with them.
    fn record(&self, error: RendererError) -> RendererError {
        if let RendererError::Backend(backend_error) = &error {
            self.fault.lock().get_or_insert_with(|| backend_error.clone());
        }
        error
    }

    fn drain(&self) -> Result<()> {
        self.scheduler.wait_for_idle();
        self.backend
            .wait_idle()
            .map_err(|e| self.record(e.into()))
    }

    fn clear_accumulation(&mut self) -> Result<()> {
        let mut commands = CommandList::new("clear_accumulation");
        self.accumulation.clear(&mut commands);
        let result = self
            .backend
            .submit(commands, None)
            .and_then(|submission| self.backend.wait(submission));
        result.map_err(|e| self.record(e.into()))
    }

    /// Replace the scene.
    ///
    /// Waits for in-flight frames, rebuilds acceleration structures, the
    /// resource table and the pipeline, clears accumulation and restarts the
    /// frame index. An invalid scene leaves the previous one in place.
    pub fn reset(&mut self, scene: &Scene) -> Result<()> {
        self.check_fault()?;
        self.drain()?;

        let loaded = LoadedScene::load(self.backend.as_ref(), scene, &self.config)
            .map_err(|e| self.record(e))?;
        self.loaded = loaded;
        self.clear_accumulation()?;
        self.frame_index = 0;

        let report = self.loaded.structures.report();
        log::info!(
            "Scene reset: {} geometries, {} instances, {} lights",
            self.loaded.geometries.len(),
            report.instance_count,
            scene.lights().len()
        );
        Ok(())
    }

    fn rebuild_targets(&mut self, display: (u32, u32), upscale_factor: u32) -> Result<()> {
        self.check_fault()?;
        self.drain()?;

        let backend = self.backend.as_ref();
        let present = PresentStage::new(backend, display, upscale_factor)
            .map_err(|e| self.record(e))?;
        let (width, height) = present.render_size();
        let accumulation = AccumulationBuffer::new(backend, width, height, self.config.seed)
            .map_err(|e| self.record(e.into()))?;

        self.present = present;
        self.accumulation = accumulation;
        self.config.width = display.0;
        self.config.height = display.1;
        self.config.upscale_factor = upscale_factor;
        self.clear_accumulation()?;
        self.frame_index = 0;

        log::info!(
            "Render targets {}x{} (display {}x{}, upscale {})",
            width,
            height,
            display.0,
            display.1,
            upscale_factor
        );
        Ok(())
    }

    /// Change the display size; reallocates accumulation and restarts it.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let max = self.backend.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(RendererError::InvalidConfig(format!(
                "display size {width}x{height} outside 1..={max}"
            )));
        }
        self.rebuild_targets((width, height), self.config.upscale_factor)
    }

    /// Render at `1 / factor` of the display resolution and upscale.
    pub fn set_upscale_factor(&mut self, factor: u32) -> Result<()> {
        if !UPSCALE_FACTORS.contains(&factor) {
            return Err(RendererError::InvalidUpscaleFactor(factor));
        }
        if factor == self.config.upscale_factor {
            return Ok(());
        }
        self.rebuild_targets(self.present.display_size(), factor)
    }

    pub fn set_frames_to_render(&mut self, frames: u64) {
        self.frames_remaining = frames;
    }

    pub fn add_frames_to_render(&mut self, frames: u64) {
        self.frames_remaining = self.frames_remaining.saturating_add(frames);
    }

    pub fn frames_remaining(&self) -> u64 {
        self.frames_remaining
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Trace one sample per pixel and present it.
    ///
    /// Blocks while the maximum number of frames is in flight.
    pub fn draw(&mut self, surface: &mut dyn PresentSurface) -> Result<DrawOutcome> {
        self.check_fault()?;
        if self.paused || self.frames_remaining == 0 {
            return Ok(DrawOutcome::Skipped);
        }

        self.scheduler.begin_frame();
        if let Err(error) = self.check_fault() {
            self.scheduler.gate().release();
            return Err(error);
        }

        let encode_start = Instant::now();
        let outcome = match self.encode_and_submit(surface) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.scheduler.gate().release();
                return Err(self.record(error.into()));
            }
        };
        self.stats.record_encode_time(encode_start.elapsed());

        self.frame_index += 1;
        if self.frames_remaining != u64::MAX {
            self.frames_remaining -= 1;
        }
        Ok(outcome)
    }

    fn completion_handler(&self) -> CompletionHandler {
        let gate = Arc::clone(self.scheduler.gate());
        let stats = Arc::clone(&self.stats);
        let fault = Arc::clone(&self.fault);
        Box::new(move |info: &CompletionInfo| {
            match &info.error {
                Some(error) => {
                    log::error!("Frame {:?} failed: {}", info.submission, error);
                    fault.lock().get_or_insert_with(|| error.clone());
                }
                None => stats.record_gpu_time(info.gpu_time),
            }
            gate.release();
        })
    }

    fn encode_and_submit(&mut self, surface: &mut dyn PresentSurface) -> BackendResult<DrawOutcome> {
        let frame_index = self.frame_index;
        let mut commands = CommandList::new(format!("frame{frame_index}"));

        self.loaded.dispatcher.encode(
            self.backend.as_ref(),
            &mut commands,
            self.scheduler.ring(),
            frame_index,
            &mut self.accumulation,
        )?;
        let drawable = self
            .present
            .encode(&mut commands, self.accumulation.latest(), surface);

        self.backend
            .submit(commands, Some(self.completion_handler()))?;

        Ok(match drawable {
            Some(drawable) => {
                surface.present(drawable);
                DrawOutcome::Presented
            }
            None => DrawOutcome::Dropped,
        })
    }

    /// Block until every submitted frame has retired.
    pub fn wait_idle(&self) -> Result<()> {
        self.drain()?;
        self.check_fault()
    }

    /// Read back the current accumulated image.
    pub fn capture(&self) -> Result<image::Rgba32FImage> {
        self.wait_idle()?;
        let texture = self.accumulation.latest();
        let bytes = self
            .backend
            .read_texture(texture)
            .map_err(|e| self.record(e.into()))?;
        let texels: Vec<f32> = bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let (width, height) = texture.size();
        image::Rgba32FImage::from_raw(width, height, texels).ok_or_else(|| {
            RendererError::Backend(BackendError::ExecutionFailed(
                "accumulation readback has the wrong size".into(),
            ))
        })
    }

    /// Frames accumulated since the last reset or resize.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn render_size(&self) -> (u32, u32) {
        self.accumulation.size()
    }

    pub fn display_size(&self) -> (u32, u32) {
        self.present.display_size()
    }

    pub fn upscale_factor(&self) -> u32 {
        self.present.upscale_factor()
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.scheduler.frames_in_flight()
    }

    /// Some frame is submitted but not yet retired.
    pub fn is_busy(&self) -> bool {
        self.scheduler.gate().in_flight() > 0
    }

    pub fn build_report(&self) -> &BuildReport {
        self.loaded.structures.report()
    }

    pub fn backend(&self) -> &Arc<dyn RayTracingBackend> {
        &self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// The render size a display size maps to under the current upscale factor.
    pub fn render_size_for(&self, display: (u32, u32)) -> (u32, u32) {
        render_size(display, self.present.upscale_factor())
    }

    pub fn accumulation(&self) -> &AccumulationBuffer {
        &self.accumulation
    }

    pub fn resource_table(&self) -> &ResourceTable {
        &self.loaded.resource_table
    }

    pub fn acceleration_structures(&self) -> &SceneAccelerationStructures {
        &self.loaded.structures
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.scheduler.wait_for_idle();
        if let Err(e) = self.backend.wait_idle() {
            log::warn!("Renderer dropped with a failed device: {}", e);
        }
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.backend.name())
            .field("frame_index", &self.frame_index)
            .field("frames_remaining", &self.frames_remaining)
            .field("paused", &self.paused)
            .field("present", &self.present)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::backend::DeviceCapabilities;
    use crate::present::OffscreenSurface;
    use crate::error::SceneError;
    use crate::scene::{hoist_cornell_box, Instance, LineUp};
    use crate::shaders::GEOMETRY_MASK_TRIANGLE;
    use crate::stats::{NullStatsSink, RenderStats};
    use glam::{Affine3A, Vec3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> RendererConfig {
        RendererConfig::default()
            .with_size(16, 12)
            .with_seed(9)
            .with_max_bounces(1)
    }

    fn cornell(use_intersection_functions: bool) -> Scene {
        hoist_cornell_box(
            LineUp::OneByOne,
            use_intersection_functions,
            &mut StdRng::seed_from_u64(5),
        )
    }

    #[test]
    fn draw_counts_frames() {
        let backend: Arc<dyn RayTracingBackend> = Arc::new(SoftwareBackend::new().unwrap());
        let stats = Arc::new(RenderStats::new());
        let mut renderer =
            Renderer::new(Arc::clone(&backend), &cornell(false), small_config(), stats.clone())
                .unwrap();
        let mut surface = OffscreenSurface::new(backend.as_ref(), 16, 12).unwrap();

        renderer.set_frames_to_render(3);
        for _ in 0..3 {
            assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Presented);
        }
        assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Skipped);
        renderer.wait_idle().unwrap();

        assert_eq!(renderer.frame_index(), 3);
        assert_eq!(surface.presented_count(), 3);
        assert_eq!(stats.frames_completed(), 3);
        assert!(!renderer.is_busy());
    }

    #[test]
    fn paused_renderer_skips() {
        let backend: Arc<dyn RayTracingBackend> = Arc::new(SoftwareBackend::new().unwrap());
        let mut renderer =
            Renderer::new(backend, &cornell(false), small_config(), Arc::new(NullStatsSink))
                .unwrap();
        let mut surface = OffscreenSurface::new(renderer.backend().as_ref(), 16, 12).unwrap();

        renderer.pause();
        assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Skipped);
        renderer.resume();
        assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Presented);
    }

    #[test]
    fn invalid_scene_keeps_previous_one() {
        let backend: Arc<dyn RayTracingBackend> = Arc::new(SoftwareBackend::new().unwrap());
        let mut renderer =
            Renderer::new(backend, &cornell(true), small_config(), Arc::new(NullStatsSink))
                .unwrap();

        let error = renderer.reset(&Scene::new()).unwrap_err();
        assert!(!error.is_fatal());
        assert_eq!(renderer.build_report().blas_builds(), 3);

        let mut surface = OffscreenSurface::new(renderer.backend().as_ref(), 16, 12).unwrap();
        assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Presented);
    }

    #[test]
    fn singular_instance_transform_is_recoverable() {
        let backend: Arc<dyn RayTracingBackend> = Arc::new(SoftwareBackend::new().unwrap());
        let mut renderer =
            Renderer::new(backend, &cornell(false), small_config(), Arc::new(NullStatsSink))
                .unwrap();
        let mut surface = OffscreenSurface::new(renderer.backend().as_ref(), 16, 12).unwrap();

        let mut flattened = cornell(false);
        flattened.add_instance(Instance::new(
            0,
            Affine3A::from_scale(Vec3::ZERO),
            GEOMETRY_MASK_TRIANGLE,
        ));
        let error = renderer.reset(&flattened).unwrap_err();
        assert!(matches!(
            error,
            RendererError::Scene(SceneError::SingularTransform { .. })
        ));
        assert!(!error.is_fatal());
        assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Presented);

        renderer.reset(&cornell(false)).unwrap();
        assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Presented);
        renderer.wait_idle().unwrap();
    }

    #[test]
    fn resource_table_path_needs_bindless_device() {
        let limited = SoftwareBackend::new().unwrap().with_capabilities(DeviceCapabilities {
            primitive_data_in_acceleration_structure: true,
            spatial_upscale: true,
            in_order_queue: true,
            ..Default::default()
        });
        let backend: Arc<dyn RayTracingBackend> = Arc::new(limited);

        let config = small_config().with_primitive_data(false);
        let error = Renderer::new(
            Arc::clone(&backend),
            &cornell(false),
            config,
            Arc::new(NullStatsSink),
        )
        .unwrap_err();
        assert!(matches!(error, RendererError::InvalidConfig(_)));
        assert!(!error.is_fatal());

        assert!(
            Renderer::new(backend, &cornell(false), small_config(), Arc::new(NullStatsSink)).is_ok()
        );
    }

    #[test]
    fn upscale_factor_changes_render_size() {
        let backend: Arc<dyn RayTracingBackend> = Arc::new(SoftwareBackend::new().unwrap());
        let mut renderer =
            Renderer::new(backend, &cornell(false), small_config(), Arc::new(NullStatsSink))
                .unwrap();

        renderer.set_upscale_factor(2).unwrap();
        assert_eq!(renderer.render_size(), (8, 6));
        assert_eq!(renderer.display_size(), (16, 12));
        assert!(matches!(
            renderer.set_upscale_factor(5),
            Err(RendererError::InvalidUpscaleFactor(5))
        ));
        assert_eq!(renderer.upscale_factor(), 2);
    }
}
