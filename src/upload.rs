//! Texture Upload Module
//!
//! Moves a decoded bitmap into a device-local texture through an upload-heap
//! staging buffer, and copies textures back out for inspection.

use tracing::{debug, info};

use crate::backend::{Backend, BufferDesc, MemoryKind, TextureDesc, TextureUsage};
use crate::bitmap::Bitmap;
use crate::command::CommandList;
use crate::descriptor::DescriptorHeaps;
use crate::error::Result;
use crate::layout::{copy_rows_from_pitched, copy_rows_to_pitched, Format};
use crate::state::{ResourceState, TrackedResource};
use crate::sync::FenceSynchronizer;

pub fn texture_desc(width: u32, height: u32) -> TextureDesc {
    TextureDesc {
        width,
        height,
        format: Format::Rgba8Unorm,
        usage: TextureUsage::Sampled,
    }
}

/// Upload `bitmap` into a new texture and write its SRV at the texture slot.
///
/// The returned texture is in `PixelShaderResource` and the GPU has finished
/// the copy; the staging buffer and the bitmap are gone.
pub fn upload_texture<B: Backend>(
    backend: &mut B,
    list: &mut CommandList,
    fence: &mut FenceSynchronizer,
    heaps: &DescriptorHeaps,
    bitmap: Bitmap,
) -> Result<TrackedResource> {
    let desc = texture_desc(bitmap.width(), bitmap.height());
    let mut texture = backend.create_texture(&desc, ResourceState::CopyDest)?;

    let footprint = backend.copyable_footprint(&desc)?;
    debug!(
        "Texture {}x{}: row {} B, pitch {} B, staging {} B",
        bitmap.width(),
        bitmap.height(),
        footprint.row_size_in_bytes,
        footprint.placed.row_pitch,
        footprint.total_bytes
    );

    let staging = backend.create_buffer(&BufferDesc {
        size: footprint.total_bytes,
        memory: MemoryKind::Upload,
    })?;

    let mut region = backend.map(&staging)?;
    copy_rows_to_pitched(bitmap.pixels(), region.as_mut_slice(), &footprint);
    drop(region);
    backend.unmap(&staging);

    list.reset(false);
    list.copy_buffer_to_texture(&staging, &footprint.placed, &texture)?;
    list.transition(&mut texture, ResourceState::PixelShaderResource);
    list.close();
    backend.execute(list)?;

    backend.create_shader_resource_view(&texture, heaps.texture_cpu()?)?;
    fence.wait_for_gpu(backend)?;

    backend.release(staging);
    drop(bitmap);

    info!("Texture uploaded as resource {}", texture.id());
    Ok(texture)
}

/// Copy a sampled texture back to the CPU as tightly packed RGBA8.
///
/// The texture is returned to `PixelShaderResource` before this returns.
pub fn read_back_texture<B: Backend>(
    backend: &mut B,
    list: &mut CommandList,
    fence: &mut FenceSynchronizer,
    texture: &mut TrackedResource,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let footprint = backend.copyable_footprint(&texture_desc(width, height))?;
    let readback = backend.create_buffer(&BufferDesc {
        size: footprint.total_bytes,
        memory: MemoryKind::Readback,
    })?;

    let restore = texture.state();
    list.reset(false);
    list.transition(texture, ResourceState::CopySource);
    list.copy_texture_to_buffer(texture, &readback, &footprint.placed)?;
    list.transition(texture, restore);
    list.close();
    backend.execute(list)?;
    fence.wait_for_gpu(backend)?;

    let region = backend.map(&readback)?;
    let pixels = copy_rows_from_pitched(region.as_slice(), &footprint);
    drop(region);
    backend.unmap(&readback);
    backend.release(readback);

    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, HeadlessOptions};
    use crate::command::Command;

    struct Fixture {
        backend: HeadlessBackend,
        list: CommandList,
        fence: FenceSynchronizer,
        heaps: DescriptorHeaps,
    }

    fn fixture(pitch_alignment: u32) -> Fixture {
        let mut backend = HeadlessBackend::new(HeadlessOptions {
            pitch_alignment,
            ..HeadlessOptions::default()
        });
        let heaps = DescriptorHeaps::create(&mut backend).unwrap();
        let fence = FenceSynchronizer::create(&mut backend).unwrap();
        Fixture {
            backend,
            list: CommandList::new("upload"),
            fence,
            heaps,
        }
    }

    fn gradient(width: u32, height: u32) -> Bitmap {
        let pixels = (0..width * height * 4).map(|i| (i % 251) as u8).collect();
        Bitmap::from_rgba(width, height, pixels).unwrap()
    }

    #[test]
    fn test_upload_records_copy_then_barrier() {
        let mut f = fixture(256);
        let texture = upload_texture(
            &mut f.backend,
            &mut f.list,
            &mut f.fence,
            &f.heaps,
            gradient(3, 2),
        )
        .unwrap();

        assert_eq!(texture.state(), ResourceState::PixelShaderResource);
        let commands = f.list.commands();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], Command::CopyBufferToTexture { .. }));
        assert_eq!(
            commands[1],
            Command::Transition {
                resource: texture.id(),
                before: ResourceState::CopyDest,
                after: ResourceState::PixelShaderResource,
            }
        );
        assert_eq!(f.fence.last_signaled(), 1);
        assert!(f.fence.is_idle(&f.backend).unwrap());
    }

    #[test]
    fn test_upload_frees_staging_buffer() {
        let mut f = fixture(256);
        let before = f.backend.live_resources();
        upload_texture(
            &mut f.backend,
            &mut f.list,
            &mut f.fence,
            &f.heaps,
            gradient(4, 4),
        )
        .unwrap();
        // only the texture remains
        assert_eq!(f.backend.live_resources(), before + 1);
    }

    #[test]
    fn test_round_trip_with_padded_pitch() {
        for alignment in [256, 512, 64] {
            let mut f = fixture(alignment);
            let bitmap = gradient(5, 3);
            let expected = bitmap.clone();

            let mut texture =
                upload_texture(&mut f.backend, &mut f.list, &mut f.fence, &f.heaps, bitmap)
                    .unwrap();
            let pixels = read_back_texture(
                &mut f.backend,
                &mut f.list,
                &mut f.fence,
                &mut texture,
                5,
                3,
            )
            .unwrap();

            for y in 0..3 {
                let row = &pixels[y * 20..y * 20 + 20];
                assert_eq!(row, expected.row(y as u32), "alignment {}", alignment);
            }
            assert_eq!(texture.state(), ResourceState::PixelShaderResource);
        }
    }

    #[test]
    fn test_upload_writes_srv_at_texture_slot() {
        let mut f = fixture(256);
        let texture = upload_texture(
            &mut f.backend,
            &mut f.list,
            &mut f.fence,
            &f.heaps,
            gradient(2, 2),
        )
        .unwrap();
        let slot = f.backend.view_at(f.heaps.texture_cpu().unwrap());
        assert_eq!(slot, Some(texture.id()));
    }
}
