//! Host images and their texture encodings.

use crate::error::{Result, RuntimeError};
use tensorgraph_core::Error;
use tensorgraph_operators::{ImageExtent, ImageFormat};

/// An RGBA image on the host, row-major, channels in `[0, 1]` for 8-bit
/// formats.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
}

impl Image {
    /// A transparent black image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0.0; 4]; width as usize * height as usize],
        }
    }

    pub fn from_pixels(width: u32, height: u32, pixels: Vec<[f32; 4]>) -> Result<Self> {
        let image = Self {
            width,
            height,
            pixels,
        };
        image.validate()?;
        Ok(image)
    }

    /// Check that `pixels` holds exactly `width × height` entries.
    pub fn validate(&self) -> Result<()> {
        let expected = self.width as usize * self.height as usize;
        if self.pixels.len() != expected {
            return Err(Error::configuration(format!(
                "{}x{} image needs {expected} pixels, got {}",
                self.width,
                self.height,
                self.pixels.len()
            ))
            .into());
        }
        Ok(())
    }

    /// Build an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> [f32; 4]) -> Self {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn extent(&self) -> ImageExtent {
        ImageExtent::new(self.width, self.height)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Tightly packed texel bytes in `format`.
    pub fn to_bytes(&self, format: ImageFormat) -> Vec<u8> {
        match format {
            ImageFormat::Rgba8Unorm => self
                .pixels
                .iter()
                .flat_map(|pixel| pixel.map(to_unorm8))
                .collect(),
            ImageFormat::Rgba32Float => bytemuck::cast_slice(&self.pixels).to_vec(),
        }
    }

    /// Decode tightly packed texel bytes.
    pub fn from_bytes(width: u32, height: u32, format: ImageFormat, bytes: &[u8]) -> Result<Self> {
        let pixel_size = format.pixel_size() as usize;
        let expected = width as usize * height as usize * pixel_size;
        if bytes.len() != expected {
            return Err(Error::configuration(format!(
                "{width}x{height} {format:?} image needs {expected} bytes, got {}",
                bytes.len()
            ))
            .into());
        }
        let pixels = bytes
            .chunks_exact(pixel_size)
            .map(|texel| match format {
                ImageFormat::Rgba8Unorm => {
                    [texel[0], texel[1], texel[2], texel[3]].map(|v| v as f32 / 255.0)
                }
                ImageFormat::Rgba32Float => {
                    let mut pixel = [0.0f32; 4];
                    for (channel, chunk) in pixel.iter_mut().zip(texel.chunks_exact(4)) {
                        *channel = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    }
                    pixel
                }
            })
            .collect();
        Self::from_pixels(width, height, pixels)
    }
}

fn to_unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Texture format backing `format`.
pub fn texture_format(format: ImageFormat) -> wgpu::TextureFormat {
    match format {
        ImageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

/// The image format a texture can be read back as, if any.
pub fn image_format(format: wgpu::TextureFormat) -> Option<ImageFormat> {
    match format {
        wgpu::TextureFormat::Rgba8Unorm => Some(ImageFormat::Rgba8Unorm),
        wgpu::TextureFormat::Rgba32Float => Some(ImageFormat::Rgba32Float),
        _ => None,
    }
}

/// Bytes per row of a texture copy, padded to the copy alignment.
pub(crate) fn padded_row_bytes(width: u32, format: ImageFormat) -> u32 {
    (width * format.pixel_size()).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

pub(crate) fn create_texture(
    device: &wgpu::Device,
    label: &str,
    extent: ImageExtent,
    format: ImageFormat,
    usage: wgpu::TextureUsages,
) -> Result<wgpu::Texture> {
    let limit = device.limits().max_texture_dimension_2d;
    if extent.width == 0 || extent.height == 0 || extent.width > limit || extent.height > limit {
        return Err(RuntimeError::Allocation(format!(
            "{label}: {}x{} texture outside 1..={limit}",
            extent.width, extent.height
        )));
    }
    Ok(device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: extent.width,
            height: extent.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: texture_format(format),
        usage,
        view_formats: &[],
    }))
}
