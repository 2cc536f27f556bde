//! GPU Memory Layout Module
//!
//! Pure arithmetic for placing 2D image data in linear GPU buffers. Devices
//! require each row of a buffer-side texture copy to start on an aligned pitch,
//! so the tightly packed rows of a decoded image cannot be copied in one block.

use crate::error::{RenderError, Result};

/// Row pitch alignment for buffer <-> texture copies (D3D12_TEXTURE_DATA_PITCH_ALIGNMENT)
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u32 = 256;

/// Size granularity of constant buffer views
pub const CONSTANT_BUFFER_ALIGNMENT: u32 = 256;

/// Bytes per RGBA8 texel
pub const RGBA8_BYTES_PER_PIXEL: u32 = 4;

/// Pixel formats the engine creates resources in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Rgba8Unorm,
    D32Float,
}

impl Format {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Rgba8Unorm => RGBA8_BYTES_PER_PIXEL,
            Format::D32Float => 4,
        }
    }
}

/// Layout of one subresource inside a linear buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedFootprint {
    /// Byte offset of the first row inside the buffer
    pub offset: u64,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    /// Distance in bytes between the starts of consecutive rows
    pub row_pitch: u32,
}

/// Everything a device reports about copying one subresource through a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyableFootprint {
    pub placed: PlacedFootprint,
    pub num_rows: u32,
    /// Meaningful bytes per row (`width * bytes_per_pixel`), never padded
    pub row_size_in_bytes: u64,
    /// Buffer size required to hold the subresource
    pub total_bytes: u64,
}

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Footprint of a single-mip 2D texture placed at offset 0.
///
/// The total size leaves the last row unpadded, matching what
/// `GetCopyableFootprints` reports.
pub fn texture_footprint(
    width: u32,
    height: u32,
    format: Format,
    pitch_alignment: u32,
) -> Result<CopyableFootprint> {
    if width == 0 || height == 0 {
        return Err(RenderError::EmptyImage { width, height });
    }
    if !pitch_alignment.is_power_of_two() {
        return Err(RenderError::InvalidAlignment(pitch_alignment));
    }

    let row_size_in_bytes = width as u64 * format.bytes_per_pixel() as u64;
    let row_pitch = align_up(row_size_in_bytes, pitch_alignment as u64);
    let total_bytes = row_pitch * (height as u64 - 1) + row_size_in_bytes;

    Ok(CopyableFootprint {
        placed: PlacedFootprint {
            offset: 0,
            format,
            width,
            height,
            row_pitch: row_pitch as u32,
        },
        num_rows: height,
        row_size_in_bytes,
        total_bytes,
    })
}

/// Size of a constant buffer holding `size` bytes of data.
pub fn constant_buffer_size(size: usize) -> u64 {
    align_up(size as u64, CONSTANT_BUFFER_ALIGNMENT as u64)
}

/// Copy tightly packed rows into a pitched destination.
///
/// Exactly `row_size_in_bytes` bytes are copied per row; padding between rows
/// in `dst` is left untouched.
pub fn copy_rows_to_pitched(src: &[u8], dst: &mut [u8], footprint: &CopyableFootprint) {
    let row = footprint.row_size_in_bytes as usize;
    let pitch = footprint.placed.row_pitch as usize;
    let base = footprint.placed.offset as usize;

    for (y, src_row) in src.chunks_exact(row).take(footprint.num_rows as usize).enumerate() {
        let start = base + y * pitch;
        dst[start..start + row].copy_from_slice(src_row);
    }
}

/// Inverse of [`copy_rows_to_pitched`]: gather pitched rows into a packed vector.
pub fn copy_rows_from_pitched(src: &[u8], footprint: &CopyableFootprint) -> Vec<u8> {
    let row = footprint.row_size_in_bytes as usize;
    let pitch = footprint.placed.row_pitch as usize;
    let base = footprint.placed.offset as usize;

    let mut packed = Vec::with_capacity(row * footprint.num_rows as usize);
    for y in 0..footprint.num_rows as usize {
        let start = base + y * pitch;
        packed.extend_from_slice(&src[start..start + row]);
    }
    packed
}
