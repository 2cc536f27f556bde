//! Image Decoder Adapter
//!
//! Turns an encoded image file into tightly packed RGBA8 rows.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use crate::error::{RenderError, Result};
use crate::layout::RGBA8_BYTES_PER_PIXEL;

/// Decoded RGBA8 image, row-major, no row padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::EmptyImage { width, height });
        }
        let expected = width as usize * height as usize * RGBA8_BYTES_PER_PIXEL as usize;
        if pixels.len() != expected {
            return Err(RenderError::PixelBufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decode an in-memory image of any enabled format.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let image = image::load_from_memory(bytes).context("Failed to decode image")?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self::from_rgba(width, height, rgba.into_raw())?)
    }

    /// Read and decode an image file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        let bitmap =
            Self::decode(&bytes).with_context(|| format!("Invalid image {}", path.display()))?;
        info!(
            "Loaded image {} ({}x{})",
            path.display(),
            bitmap.width,
            bitmap.height
        );
        Ok(bitmap)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Bytes of row `y`
    #[cfg(test)]
    pub fn row(&self, y: u32) -> &[u8] {
        let row = self.width as usize * RGBA8_BYTES_PER_PIXEL as usize;
        let start = y as usize * row;
        &self.pixels[start..start + row]
    }

    /// RGBA of the texel at (`x`, `y`)
    #[cfg(test)]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let start = (y as usize * self.width as usize + x as usize) * 4;
        let mut texel = [0; 4];
        texel.copy_from_slice(&self.pixels[start..start + 4]);
        texel
    }
}
