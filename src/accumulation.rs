//! Ping-pong accumulation targets and the per-pixel seed texture.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::{
    BackendResult, CommandList, RayTracingBackend, TextureDescriptor, TextureFormat, TextureUsage,
};
use crate::resources::Texture;

/// Seeds are drawn from `0..SEED_RANGE`; the kernel adds the frame index.
pub const SEED_RANGE: u32 = 1024 * 1024;

pub const ACCUMULATION_FORMAT: TextureFormat = TextureFormat::Rgba32Float;

/// Running per-pixel average of every sample traced since the last reset.
///
/// Frame `k` reads [`source`](Self::source) and writes
/// [`target`](Self::target); [`swap`](Self::swap) then makes the freshly
/// written image the next frame's source.
pub struct AccumulationBuffer {
    targets: [Arc<Texture>; 2],
    source: usize,
    seeds: Arc<Texture>,
    width: u32,
    height: u32,
}

impl AccumulationBuffer {
    pub fn new(
        backend: &dyn RayTracingBackend,
        width: u32,
        height: u32,
        seed: Option<u64>,
    ) -> BackendResult<Self> {
        let usage = TextureUsage::STORAGE_BINDING
            | TextureUsage::TEXTURE_BINDING
            | TextureUsage::COPY_SRC
            | TextureUsage::COPY_DST;
        let target = |label: &str| {
            backend.create_texture(
                &TextureDescriptor::new_2d(width, height, ACCUMULATION_FORMAT, usage)
                    .with_label(label),
            )
        };
        let targets = [target("accumulation_a")?, target("accumulation_b")?];

        let seeds = backend.create_texture(
            &TextureDescriptor::new_2d(
                width,
                height,
                TextureFormat::R32Uint,
                TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            )
            .with_label("random_seeds"),
        )?;
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let values: Vec<u32> = (0..width as usize * height as usize)
            .map(|_| rng.gen_range(0..SEED_RANGE))
            .collect();
        backend.write_texture(&seeds, bytemuck::cast_slice(&values))?;

        log::debug!("Accumulation buffer {}x{}", width, height);

        Ok(Self {
            targets,
            source: 0,
            seeds,
            width,
            height,
        })
    }

    /// Record clears of both targets.
    pub fn clear(&mut self, commands: &mut CommandList) {
        for target in &self.targets {
            commands.clear_texture(Arc::clone(target));
        }
        self.source = 0;
    }

    /// Image the next frame averages into.
    pub fn source(&self) -> &Arc<Texture> {
        &self.targets[self.source]
    }

    /// Image the next frame writes.
    pub fn target(&self) -> &Arc<Texture> {
        &self.targets[1 - self.source]
    }

    pub fn swap(&mut self) {
        self.source = 1 - self.source;
    }

    /// Most recently written image.
    pub fn latest(&self) -> &Arc<Texture> {
        self.source()
    }

    pub fn seeds(&self) -> &Arc<Texture> {
        &self.seeds
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl std::fmt::Debug for AccumulationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccumulationBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn swap_alternates_roles() {
        let backend = SoftwareBackend::new().unwrap();
        let mut accumulation = AccumulationBuffer::new(&backend, 4, 2, Some(7)).unwrap();

        let first_target = Arc::clone(accumulation.target());
        assert!(!Arc::ptr_eq(accumulation.source(), accumulation.target()));
        accumulation.swap();
        assert!(Arc::ptr_eq(accumulation.latest(), &first_target));
        accumulation.swap();
        assert!(Arc::ptr_eq(accumulation.target(), &first_target));
        assert_eq!(accumulation.size(), (4, 2));
    }

    #[test]
    fn seeds_are_in_range_and_reproducible() {
        let backend = SoftwareBackend::new().unwrap();
        let a = AccumulationBuffer::new(&backend, 8, 8, Some(42)).unwrap();
        let b = AccumulationBuffer::new(&backend, 8, 8, Some(42)).unwrap();

        let seeds_a = backend.read_texture(a.seeds()).unwrap();
        let seeds_b = backend.read_texture(b.seeds()).unwrap();
        assert_eq!(seeds_a, seeds_b);
        for word in seeds_a.chunks_exact(4) {
            assert!(bytemuck::pod_read_unaligned::<u32>(word) < SEED_RANGE);
        }
    }

    #[test]
    fn clear_zeroes_both_targets() {
        let backend = SoftwareBackend::new().unwrap();
        let mut accumulation = AccumulationBuffer::new(&backend, 2, 2, Some(1)).unwrap();
        let ones = vec![0x3F_u8; 2 * 2 * 16];
        backend.write_texture(accumulation.source(), &ones).unwrap();
        backend.write_texture(accumulation.target(), &ones).unwrap();

        let mut commands = CommandList::new("clear");
        accumulation.clear(&mut commands);
        let submission = backend.submit(commands, None).unwrap();
        backend.wait(submission).unwrap();

        for texture in [accumulation.source(), accumulation.target()] {
            assert!(backend.read_texture(texture).unwrap().iter().all(|&b| b == 0));
        }
    }
}
