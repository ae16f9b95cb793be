//! Output images, texture resolution and PNG export.
//!
//! The device writes float pixels into an [`OutputImage`]. The
//! [`OutputResolver`] turns the latest image into a host-visible RGBA
//! texture, reusing the texture while dimensions stay the same and handing
//! out a fresh [`TextureHandle`] whenever it has to reallocate.

use std::path::Path;

use crate::util::{Error, Result};

/// Pixel layout of an [`OutputImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba32Float,
    Rgb32Float,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            Self::Rgba32Float => 4,
            Self::Rgb32Float => 3,
        }
    }
}

/// Float image written by a trace dispatch. Row 0 is the top row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<f32>,
}

impl OutputImage {
    /// Zero-filled image. Both dimensions must be non-zero.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::precondition(format!(
                "output image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        let len = width as usize * height as usize * format.channels();
        Ok(Self {
            width,
            height,
            format,
            data: vec![0.0; len],
        })
    }

    /// Wrap existing pixel data (e.g. a device readback).
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<f32>) -> Result<Self> {
        let mut image = Self::new(width, height, format)?;
        if data.len() != image.data.len() {
            return Err(Error::precondition(format!(
                "{} values for a {}x{} {:?} image",
                data.len(),
                width,
                height,
                format
            )));
        }
        image.data = data;
        Ok(image)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// RGBA value at `(x, y)`; RGB images report alpha 1.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let c = self.format.channels();
        let i = (y as usize * self.width as usize + x as usize) * c;
        let p = &self.data[i..i + c];
        [p[0], p[1], p[2], if c == 4 { p[3] } else { 1.0 }]
    }

    /// Pixels as RGBA floats.
    pub fn to_rgba(&self) -> Result<Vec<f32>> {
        match self.format {
            PixelFormat::Rgba32Float => Ok(self.data.clone()),
            PixelFormat::Rgb32Float => rgb_to_rgba(&self.data),
        }
    }
}

/// Pad packed RGB floats to RGBA with alpha 1.
pub fn rgb_to_rgba(rgb: &[f32]) -> Result<Vec<f32>> {
    if rgb.len() % 3 != 0 {
        tracing::warn!(len = rgb.len(), "RGB buffer length is not divisible by 3");
        return Err(Error::precondition(format!(
            "RGB buffer of {} values is not divisible by 3",
            rgb.len()
        )));
    }
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for p in rgb.chunks_exact(3) {
        rgba.extend_from_slice(&[p[0], p[1], p[2], 1.0]);
    }
    Ok(rgba)
}

/// Quantize floats to bytes: `clamp(v, 0, 1) * 255`, truncated.
pub fn to_rgba8(rgba: &[f32]) -> Vec<u8> {
    rgba.iter().map(|&v| (v.clamp(0.0, 1.0) * 255.0) as u8).collect()
}

/// Handle to a resolved texture. Becomes stale when the texture is
/// reallocated or invalidated by a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    id: u64,
}

impl TextureHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Host-visible RGBA float texture.
#[derive(Debug, Clone)]
pub struct ResolvedTexture {
    handle: TextureHandle,
    width: u32,
    height: u32,
    rgba: Vec<f32>,
}

impl ResolvedTexture {
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn rgba(&self) -> &[f32] {
        &self.rgba
    }

    pub fn to_rgba8(&self) -> Vec<u8> {
        to_rgba8(&self.rgba)
    }
}

/// Converts device output into a host texture.
#[derive(Debug, Default)]
pub struct OutputResolver {
    texture: Option<ResolvedTexture>,
    next_id: u64,
    allocations: u64,
}

impl OutputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the current texture; its handle becomes stale.
    pub fn invalidate(&mut self) {
        if let Some(tex) = self.texture.take() {
            tracing::debug!(texture = tex.handle.id, "texture invalidated");
        }
    }

    /// Handle of the current texture, if any.
    pub fn current(&self) -> Option<TextureHandle> {
        self.texture.as_ref().map(|t| t.handle)
    }

    /// Number of texture allocations so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Resolve `image` into the texture, updating in place when the
    /// dimensions match and reallocating otherwise.
    pub fn resolve(&mut self, image: &OutputImage) -> Result<TextureHandle> {
        let rgba = image.to_rgba()?;
        let (width, height) = image.size();
        match self.texture.as_mut() {
            Some(tex) if tex.width == width && tex.height == height => {
                tex.rgba.copy_from_slice(&rgba);
                Ok(tex.handle)
            }
            _ => {
                let handle = TextureHandle { id: self.next_id };
                self.next_id += 1;
                self.allocations += 1;
                tracing::debug!(texture = handle.id, width, height, "texture allocated");
                self.texture = Some(ResolvedTexture {
                    handle,
                    width,
                    height,
                    rgba,
                });
                Ok(handle)
            }
        }
    }

    /// Texture behind `handle`. Stale handles are a precondition violation.
    pub fn texture(&self, handle: TextureHandle) -> Result<&ResolvedTexture> {
        match &self.texture {
            Some(tex) if tex.handle == handle => Ok(tex),
            _ => Err(Error::precondition(format!("stale texture handle {}", handle.id))),
        }
    }

    /// Write the current texture as an 8-bit RGBA PNG.
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        let tex = self
            .texture
            .as_ref()
            .ok_or_else(|| Error::precondition("no resolved frame to save"))?;
        save_png(path.as_ref(), tex.width, tex.height, &tex.rgba)
    }
}

/// Write RGBA floats as an 8-bit PNG.
pub fn save_png(path: &Path, width: u32, height: u32, rgba: &[f32]) -> Result<()> {
    let bytes = to_rgba8(rgba);
    let img = image::RgbaImage::from_raw(width, height, bytes)
        .ok_or_else(|| Error::other(format!("pixel buffer does not match {}x{}", width, height)))?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    img.save_with_format(path, image::ImageFormat::Png)?;
    tracing::info!(path = %path.display(), width, height, "frame saved");
    Ok(())
}
