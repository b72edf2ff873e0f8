//! Presentation: optional spatial upscale, then a blit to the surface.

use std::sync::Arc;

use crate::backend::{
    BackendError, CommandList, RayTracingBackend, TextureDescriptor, TextureFormat, TextureUsage,
};
use crate::error::{RendererError, Result};
use crate::resources::Texture;
use crate::UPSCALE_FACTORS;

/// Image a surface hands out for one frame.
#[derive(Debug, Clone)]
pub struct Drawable {
    texture: Arc<Texture>,
}

impl Drawable {
    pub fn new(texture: Arc<Texture>) -> Self {
        Self { texture }
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }
}

/// Where finished frames go.
pub trait PresentSurface {
    /// The next drawable, or `None` when none is available this frame.
    fn acquire(&mut self) -> Option<Drawable>;

    /// Hand back a drawable whose blit has been submitted.
    fn present(&mut self, drawable: Drawable);
}

/// Texture-backed surface for headless rendering and tests.
pub struct OffscreenSurface {
    texture: Arc<Texture>,
    available: bool,
    presented: u64,
}

impl OffscreenSurface {
    pub fn new(backend: &dyn RayTracingBackend, width: u32, height: u32) -> Result<Self> {
        let texture = backend.create_texture(
            &TextureDescriptor::new_2d(
                width,
                height,
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
            )
            .with_label("offscreen_surface"),
        )?;
        Ok(Self {
            texture,
            available: true,
            presented: 0,
        })
    }

    /// Make [`acquire`](PresentSurface::acquire) return `None` while `false`.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn presented_count(&self) -> u64 {
        self.presented
    }

    /// Read back the last presented image. Waits for the device to go idle.
    pub fn read_image(&self, backend: &dyn RayTracingBackend) -> Result<image::RgbaImage> {
        backend.wait_idle()?;
        let (width, height) = self.texture.size();
        let bytes = backend.read_texture(&self.texture)?;
        image::RgbaImage::from_raw(width, height, bytes).ok_or_else(|| {
            RendererError::Backend(BackendError::ExecutionFailed(
                "surface readback has the wrong size".into(),
            ))
        })
    }
}

impl PresentSurface for OffscreenSurface {
    fn acquire(&mut self) -> Option<Drawable> {
        self.available
            .then(|| Drawable::new(Arc::clone(&self.texture)))
    }

    fn present(&mut self, _drawable: Drawable) {
        self.presented += 1;
    }
}

/// Render resolution for a display size and upscale factor.
pub fn render_size(display: (u32, u32), upscale_factor: u32) -> (u32, u32) {
    (
        (display.0 / upscale_factor).max(1),
        (display.1 / upscale_factor).max(1),
    )
}

pub struct PresentStage {
    upscale_factor: u32,
    display_size: (u32, u32),
    upscaled: Option<Arc<Texture>>,
}

impl PresentStage {
    pub fn new(
        backend: &dyn RayTracingBackend,
        display_size: (u32, u32),
        upscale_factor: u32,
    ) -> Result<Self> {
        if !UPSCALE_FACTORS.contains(&upscale_factor) {
            return Err(RendererError::InvalidUpscaleFactor(upscale_factor));
        }
        let upscaled = if upscale_factor > 1 {
            if !backend.capabilities().spatial_upscale {
                return Err(BackendError::FeatureNotSupported(format!(
                    "{} has no spatial upscaler",
                    backend.name()
                ))
                .into());
            }
            Some(backend.create_texture(
                &TextureDescriptor::new_2d(
                    display_size.0,
                    display_size.1,
                    TextureFormat::Rgba32Float,
                    TextureUsage::STORAGE_BINDING
                        | TextureUsage::TEXTURE_BINDING
                        | TextureUsage::COPY_SRC,
                )
                .with_label("upscaled"),
            )?)
        } else {
            None
        };
        Ok(Self {
            upscale_factor,
            display_size,
            upscaled,
        })
    }

    pub fn upscale_factor(&self) -> u32 {
        self.upscale_factor
    }

    pub fn display_size(&self) -> (u32, u32) {
        self.display_size
    }

    pub fn render_size(&self) -> (u32, u32) {
        render_size(self.display_size, self.upscale_factor)
    }

    /// Record the upscale and blit of `image` into a drawable from `surface`.
    ///
    /// Returns the drawable to present once the list is submitted, or `None`
    /// when the surface had nothing to draw into.
    pub fn encode(
        &self,
        commands: &mut CommandList,
        image: &Arc<Texture>,
        surface: &mut dyn PresentSurface,
    ) -> Option<Drawable> {
        let Some(drawable) = surface.acquire() else {
            log::trace!("PresentStage: no drawable, skipping presentation");
            return None;
        };

        let source = match &self.upscaled {
            Some(upscaled) => {
                commands.upscale(Arc::clone(image), Arc::clone(upscaled));
                upscaled
            }
            None => image,
        };
        commands.blit(Arc::clone(source), Arc::clone(drawable.texture()));
        Some(drawable)
    }
}

impl std::fmt::Debug for PresentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentStage")
            .field("upscale_factor", &self.upscale_factor)
            .field("display_size", &self.display_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::backend::Command;

    fn float_image(backend: &SoftwareBackend, width: u32, height: u32) -> Arc<Texture> {
        backend
            .create_texture(&TextureDescriptor::new_2d(
                width,
                height,
                TextureFormat::Rgba32Float,
                TextureUsage::TEXTURE_BINDING,
            ))
            .unwrap()
    }

    #[test]
    fn render_size_divides_display() {
        assert_eq!(render_size((800, 600), 1), (800, 600));
        assert_eq!(render_size((800, 600), 4), (200, 150));
        assert_eq!(render_size((4, 4), 8), (1, 1));
    }

    #[test]
    fn rejects_unsupported_factor() {
        let backend = SoftwareBackend::new().unwrap();
        assert!(matches!(
            PresentStage::new(&backend, (64, 64), 3),
            Err(RendererError::InvalidUpscaleFactor(3))
        ));
    }

    #[test]
    fn missing_drawable_records_nothing() {
        let backend = SoftwareBackend::new().unwrap();
        let stage = PresentStage::new(&backend, (8, 8), 2).unwrap();
        let mut surface = OffscreenSurface::new(&backend, 8, 8).unwrap();
        surface.set_available(false);

        let mut commands = CommandList::new("present");
        let image = float_image(&backend, 4, 4);
        assert!(stage.encode(&mut commands, &image, &mut surface).is_none());
        assert!(commands.is_empty());
    }

    #[test]
    fn upscale_precedes_blit() {
        let backend = SoftwareBackend::new().unwrap();
        let stage = PresentStage::new(&backend, (8, 8), 2).unwrap();
        let mut surface = OffscreenSurface::new(&backend, 8, 8).unwrap();

        let mut commands = CommandList::new("present");
        let image = float_image(&backend, 4, 4);
        let drawable = stage.encode(&mut commands, &image, &mut surface);

        assert!(drawable.is_some());
        let names: Vec<_> = commands.commands().iter().map(Command::name).collect();
        assert_eq!(names, ["upscale", "blit"]);
    }
}
