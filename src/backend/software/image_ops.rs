//! Texture passes: clear, bilinear upscale, blit.

use glam::Vec4;

use super::{software_texture, SoftwareTexture};
use crate::backend::{BackendError, BackendResult, TextureFormat};
use crate::resources::Texture;

pub(crate) fn load_texel(format: TextureFormat, words: &[u32], index: usize) -> Vec4 {
    match format {
        TextureFormat::Rgba32Float => {
            let floats: &[f32] = bytemuck::cast_slice(&words[index * 4..index * 4 + 4]);
            Vec4::from_slice(floats)
        }
        TextureFormat::Rgba8Unorm => {
            let [r, g, b, a] = words[index].to_le_bytes();
            Vec4::new(r as f32, g as f32, b as f32, a as f32) / 255.0
        }
        TextureFormat::Bgra8Unorm => {
            let [b, g, r, a] = words[index].to_le_bytes();
            Vec4::new(r as f32, g as f32, b as f32, a as f32) / 255.0
        }
        TextureFormat::R32Uint => Vec4::new(words[index] as f32, 0.0, 0.0, 1.0),
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

pub(crate) fn store_texel(format: TextureFormat, words: &mut [u32], index: usize, texel: Vec4) {
    match format {
        TextureFormat::Rgba32Float => {
            let floats: &mut [f32] = bytemuck::cast_slice_mut(&mut words[index * 4..index * 4 + 4]);
            texel.write_to_slice(floats);
        }
        TextureFormat::Rgba8Unorm => {
            words[index] = u32::from_le_bytes([
                unorm8(texel.x),
                unorm8(texel.y),
                unorm8(texel.z),
                unorm8(texel.w),
            ]);
        }
        TextureFormat::Bgra8Unorm => {
            words[index] = u32::from_le_bytes([
                unorm8(texel.z),
                unorm8(texel.y),
                unorm8(texel.x),
                unorm8(texel.w),
            ]);
        }
        TextureFormat::R32Uint => words[index] = texel.x.max(0.0) as u32,
    }
}

fn distinct<'a>(
    source: &'a Texture,
    destination: &'a Texture,
    pass: &str,
) -> BackendResult<(&'a SoftwareTexture, &'a SoftwareTexture)> {
    if std::ptr::eq(source, destination) {
        return Err(BackendError::InvalidParameter(format!(
            "{pass} source and destination are the same texture"
        )));
    }
    Ok((software_texture(source)?, software_texture(destination)?))
}

pub(crate) fn clear(texture: &Texture) -> BackendResult<()> {
    software_texture(texture)?.words_mut().fill(0);
    Ok(())
}

/// Bilinear resample of `source` onto `destination`, texel centres aligned.
pub(crate) fn upscale(source: &Texture, destination: &Texture) -> BackendResult<()> {
    let (src, dst) = distinct(source, destination, "upscale")?;
    let (sw, sh) = source.size();
    let (dw, dh) = destination.size();
    let words = src.words();
    let mut out = dst.words_mut();

    let fetch = |x: i64, y: i64| {
        let x = x.clamp(0, sw as i64 - 1) as usize;
        let y = y.clamp(0, sh as i64 - 1) as usize;
        load_texel(source.format(), &words, y * sw as usize + x)
    };

    for y in 0..dh {
        let v = (y as f32 + 0.5) * sh as f32 / dh as f32 - 0.5;
        let y0 = v.floor();
        let fy = v - y0;
        for x in 0..dw {
            let u = (x as f32 + 0.5) * sw as f32 / dw as f32 - 0.5;
            let x0 = u.floor();
            let fx = u - x0;
            let (x0, y0) = (x0 as i64, y0 as i64);
            let top = fetch(x0, y0).lerp(fetch(x0 + 1, y0), fx);
            let bottom = fetch(x0, y0 + 1).lerp(fetch(x0 + 1, y0 + 1), fx);
            store_texel(
                destination.format(),
                &mut out,
                (y * dw + x) as usize,
                top.lerp(bottom, fy),
            );
        }
    }
    Ok(())
}

/// Nearest-neighbour copy with format conversion.
pub(crate) fn blit(source: &Texture, destination: &Texture) -> BackendResult<()> {
    let (src, dst) = distinct(source, destination, "blit")?;
    let (sw, sh) = source.size();
    let (dw, dh) = destination.size();
    let words = src.words();
    let mut out = dst.words_mut();

    for y in 0..dh {
        let sy = (y as u64 * sh as u64 / dh as u64) as usize;
        for x in 0..dw {
            let sx = (x as u64 * sw as u64 / dw as u64) as usize;
            let texel = load_texel(source.format(), &words, sy * sw as usize + sx);
            store_texel(destination.format(), &mut out, (y * dw + x) as usize, texel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unorm_conversion_clamps() {
        let mut words = [0u32; 1];
        store_texel(
            TextureFormat::Rgba8Unorm,
            &mut words,
            0,
            Vec4::new(2.0, -1.0, 0.5, 1.0),
        );
        assert_eq!(words[0].to_le_bytes(), [255, 0, 128, 255]);

        let back = load_texel(TextureFormat::Rgba8Unorm, &words, 0);
        assert_eq!(back.x, 1.0);
        assert_eq!(back.y, 0.0);
    }

    #[test]
    fn bgra_swaps_channels() {
        let mut words = [0u32; 1];
        store_texel(TextureFormat::Bgra8Unorm, &mut words, 0, Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(words[0].to_le_bytes(), [0, 0, 255, 255]);
        assert_eq!(
            load_texel(TextureFormat::Bgra8Unorm, &words, 0),
            Vec4::new(1.0, 0.0, 0.0, 1.0)
        );
    }

    #[test]
    fn float_texels_round_trip() {
        let mut words = [0u32; 8];
        let texel = Vec4::new(0.25, 1.5, -3.0, 1.0);
        store_texel(TextureFormat::Rgba32Float, &mut words, 1, texel);
        assert_eq!(load_texel(TextureFormat::Rgba32Float, &words, 1), texel);
        assert_eq!(load_texel(TextureFormat::Rgba32Float, &words, 0), Vec4::ZERO);
    }
}
