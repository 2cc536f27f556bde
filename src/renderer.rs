//! Renderer Module
//!
//! Owns the backend and every GPU object the viewer uses, and drives the
//! init / update / render / destroy lifecycle.

use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BufferDesc, MappedRegion, MemoryKind, PipelineDesc, ResourceId, Surface,
    TextureDesc, TextureUsage,
};
use crate::bitmap::Bitmap;
use crate::camera::{Camera, CameraConstants, CameraSettings};
use crate::command::{CommandList, VertexBufferView};
use crate::descriptor::DescriptorHeaps;
use crate::error::{RenderError, Result};
use crate::frame::{FrameResources, FRAME_COUNT};
use crate::input::{process_events, EventQueue, KeyState};
use crate::layout::{constant_buffer_size, Format};
use crate::recorder::{CommandRecorder, FrameTargets, DEFAULT_CLEAR_COLOR};
use crate::scene::{Vertex, VERTEX_STRIDE};
use crate::state::{ResourceState, TrackedResource};
use crate::sync::FenceSynchronizer;
use crate::upload;

/// Tunables the renderer is created with
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub clear_color: [f32; 4],
    /// Wait for vertical blank on present
    pub vsync: bool,
    pub camera: CameraSettings,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            clear_color: DEFAULT_CLEAR_COLOR,
            vsync: true,
            camera: CameraSettings::default(),
        }
    }
}

/// Persistently mapped camera constant buffer
struct ConstantBuffer {
    resource: TrackedResource,
    mapped: MappedRegion,
}

struct VertexBuffer {
    resource: TrackedResource,
    view: VertexBufferView,
}

pub struct Renderer<B: Backend> {
    backend: B,
    width: u32,
    height: u32,
    heaps: DescriptorHeaps,
    frames: FrameResources,
    list: CommandList,
    recorder: CommandRecorder,
    fence: FenceSynchronizer,
    vertex_buffer: Option<VertexBuffer>,
    constant_buffer: Option<ConstantBuffer>,
    depth: Option<TrackedResource>,
    texture: Option<TrackedResource>,
    texture_size: (u32, u32),
    camera: Camera,
    keys: KeyState,
    sync_interval: u32,
    destroyed: bool,
}

impl<B: Backend> Renderer<B> {
    /// Build every GPU object and upload the scene.
    ///
    /// `bitmap` is released once the texture upload has completed on the GPU.
    pub fn init(
        mut backend: B,
        surface: &Surface,
        vertices: &[Vertex],
        bitmap: Bitmap,
        settings: RendererSettings,
    ) -> Result<Self> {
        if surface.width == 0 || surface.height == 0 {
            return Err(RenderError::EmptySurface {
                width: surface.width,
                height: surface.height,
            });
        }
        info!(
            "Initializing renderer on {} ({}x{})",
            backend.name(),
            surface.width,
            surface.height
        );

        backend.create_swap_chain(surface, FRAME_COUNT)?;
        let heaps = DescriptorHeaps::create(&mut backend)?;
        let frames = FrameResources::create(&mut backend, &heaps)?;

        backend.create_pipeline(&PipelineDesc {
            vertex_stride: VERTEX_STRIDE,
            render_target_format: Format::Rgba8Unorm,
            depth_format: Format::D32Float,
        })?;

        let vertex_buffer = create_vertex_buffer(&mut backend, vertices)?;
        let constant_buffer = create_constant_buffer(&mut backend, &heaps)?;
        let depth = create_depth_buffer(&mut backend, &heaps, surface.width, surface.height)?;

        let mut fence = FenceSynchronizer::create(&mut backend)?;
        let mut list = CommandList::new("direct");
        let texture_size = (bitmap.width(), bitmap.height());
        let texture = upload::upload_texture(&mut backend, &mut list, &mut fence, &heaps, bitmap)?;

        let mut renderer = Self {
            backend,
            width: surface.width,
            height: surface.height,
            heaps,
            frames,
            list,
            recorder: CommandRecorder::new(surface.width, surface.height, settings.clear_color),
            fence,
            vertex_buffer,
            constant_buffer: Some(constant_buffer),
            depth: Some(depth),
            texture: Some(texture),
            texture_size,
            camera: Camera::new(settings.camera),
            keys: KeyState::new(),
            sync_interval: settings.vsync as u32,
            destroyed: false,
        };
        renderer.write_constants()?;

        info!("Renderer initialized");
        Ok(renderer)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(RenderError::NotInitialized("renderer"));
        }
        Ok(())
    }

    fn write_constants(&mut self) -> Result<()> {
        let constants = self.camera.constants(self.recorder.aspect_ratio());
        let cb = self
            .constant_buffer
            .as_mut()
            .ok_or(RenderError::NotInitialized("constant buffer"))?;
        cb.mapped.write(0, bytemuck::bytes_of(&constants));
        Ok(())
    }

    /// Drain pending window events; returns `false` once the viewer should exit.
    pub fn tick(&mut self, events: &mut EventQueue) -> Result<bool> {
        let request = process_events(events, &mut self.keys);
        if request.quit {
            return Ok(false);
        }
        if let Some((width, height)) = request.resize {
            self.resize(width, height)?;
        }
        if request.redraw {
            self.update()?;
            self.render()?;
        }
        Ok(true)
    }

    /// Move the camera from held keys and rewrite the constant buffer.
    pub fn update(&mut self) -> Result<()> {
        self.ensure_alive()?;
        // single constant buffer: the GPU must be done with the previous frame
        debug_assert!(
            self.fence.is_idle(&self.backend).unwrap_or(false),
            "constant buffer rewritten while the GPU may still read it"
        );
        if self.camera.update(&self.keys) {
            debug!(
                "Camera at {:?}, yaw {:.3}",
                self.camera.position(),
                self.camera.yaw()
            );
        }
        self.write_constants()
    }

    /// Record, submit and present one frame, then wait for the GPU.
    pub fn render(&mut self) -> Result<()> {
        self.ensure_alive()?;
        let (back_buffer, rtv) = self.frames.current_mut(&self.heaps)?;
        let depth = self
            .depth
            .as_ref()
            .ok_or(RenderError::NotInitialized("depth buffer"))?;
        let texture = self
            .texture
            .as_ref()
            .ok_or(RenderError::NotInitialized("texture"))?;

        self.recorder.record(
            &mut self.list,
            &self.heaps,
            FrameTargets {
                back_buffer,
                rtv,
                depth,
                texture,
                vertex_buffer: self.vertex_buffer.as_ref().map(|vb| vb.view),
            },
        )?;

        self.backend.execute(&self.list)?;
        self.backend.present(self.sync_interval)?;
        self.wait_for_previous_frame()
    }

    fn wait_for_previous_frame(&mut self) -> Result<()> {
        self.fence.wait_for_gpu(&mut self.backend)?;
        self.frames.refresh_index(&self.backend)?;
        Ok(())
    }

    /// Rebuild size-dependent resources. Zero sizes (minimized) are ignored.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_alive()?;
        if width == 0 || height == 0 || (width, height) == (self.width, self.height) {
            return Ok(());
        }
        info!("Resizing to {}x{}", width, height);

        self.fence.wait_for_gpu(&mut self.backend)?;
        self.frames.release(&mut self.backend);
        if let Some(depth) = self.depth.take() {
            self.backend.release(depth);
        }

        self.backend.resize_swap_chain(width, height)?;
        self.frames = FrameResources::create(&mut self.backend, &self.heaps)?;
        self.depth = Some(create_depth_buffer(
            &mut self.backend,
            &self.heaps,
            width,
            height,
        )?);
        self.recorder.resize(width, height);
        self.width = width;
        self.height = height;
        self.write_constants()
    }

    /// Copy the mesh texture back to the CPU as packed RGBA8.
    pub fn read_back_texture(&mut self) -> Result<Vec<u8>> {
        self.ensure_alive()?;
        let texture = self
            .texture
            .as_mut()
            .ok_or(RenderError::NotInitialized("texture"))?;
        let (width, height) = self.texture_size;
        upload::read_back_texture(
            &mut self.backend,
            &mut self.list,
            &mut self.fence,
            texture,
            width,
            height,
        )
    }

    /// Drain the GPU and release every resource. Safe to call more than once.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.fence.wait_for_gpu(&mut self.backend)?;
        self.destroyed = true;

        if let Some(cb) = self.constant_buffer.take() {
            drop(cb.mapped);
            self.backend.unmap(&cb.resource);
            self.backend.release(cb.resource);
        }
        if let Some(vb) = self.vertex_buffer.take() {
            self.backend.release(vb.resource);
        }
        for resource in [self.depth.take(), self.texture.take()].into_iter().flatten() {
            self.backend.release(resource);
        }
        self.frames.release(&mut self.backend);

        info!("Renderer destroyed");
        Ok(())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[cfg(test)]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[cfg(test)]
    pub fn frame_index(&self) -> u32 {
        self.frames.current_index()
    }

    #[cfg(test)]
    pub fn fence(&self) -> &FenceSynchronizer {
        &self.fence
    }

    #[cfg(test)]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    #[cfg(test)]
    pub fn heaps(&self) -> &DescriptorHeaps {
        &self.heaps
    }

    #[cfg(test)]
    pub fn texture_id(&self) -> Option<ResourceId> {
        self.texture.as_ref().map(|t| t.id())
    }

    #[cfg(test)]
    pub fn constant_buffer_id(&self) -> Option<ResourceId> {
        self.constant_buffer.as_ref().map(|cb| cb.resource.id())
    }

    /// Bytes of vertex data on the GPU; zero for an empty scene
    #[cfg(test)]
    pub fn vertex_buffer_size(&self) -> u64 {
        self.vertex_buffer
            .as_ref()
            .map_or(0, |vb| vb.view.size_in_bytes as u64)
    }

    /// Commands of the most recently recorded list
    #[cfg(test)]
    pub fn last_commands(&self) -> &[crate::command::Command] {
        self.list.commands()
    }

    /// Camera record as currently stored in the constant buffer
    #[cfg(test)]
    pub fn constants(&self) -> Option<CameraConstants> {
        let cb = self.constant_buffer.as_ref()?;
        let size = std::mem::size_of::<CameraConstants>();
        Some(bytemuck::pod_read_unaligned(&cb.mapped.as_slice()[..size]))
    }
}

impl<B: Backend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Renderer teardown failed: {}", e);
        }
    }
}

/// Vertex buffer views address at most `u32::MAX` bytes.
fn vertex_view_size(bytes: usize) -> Result<u32> {
    u32::try_from(bytes).map_err(|_| RenderError::VertexDataTooLarge(bytes))
}

fn create_vertex_buffer<B: Backend>(
    backend: &mut B,
    vertices: &[Vertex],
) -> Result<Option<VertexBuffer>> {
    if vertices.is_empty() {
        info!("Scene has no triangles; skipping vertex buffer");
        return Ok(None);
    }
    let bytes: &[u8] = bytemuck::cast_slice(vertices);
    let size_in_bytes = vertex_view_size(bytes.len())?;
    let resource = backend.create_buffer(&BufferDesc {
        size: bytes.len() as u64,
        memory: MemoryKind::Upload,
    })?;

    let mut mapped = backend.map(&resource)?;
    mapped.write(0, bytes);
    drop(mapped);
    backend.unmap(&resource);

    let view = VertexBufferView {
        resource: resource.id(),
        size_in_bytes,
        stride_in_bytes: VERTEX_STRIDE,
    };
    debug!("Vertex buffer: {} vertices, {} bytes", vertices.len(), bytes.len());
    Ok(Some(VertexBuffer { resource, view }))
}

fn create_constant_buffer<B: Backend>(
    backend: &mut B,
    heaps: &DescriptorHeaps,
) -> Result<ConstantBuffer> {
    let size = constant_buffer_size(std::mem::size_of::<CameraConstants>());
    let resource = backend.create_buffer(&BufferDesc {
        size,
        memory: MemoryKind::Upload,
    })?;
    backend.create_constant_buffer_view(&resource, size as u32, heaps.constant_buffer_cpu()?)?;
    // stays mapped until destroy
    let mapped = backend.map(&resource)?;
    Ok(ConstantBuffer { resource, mapped })
}

fn create_depth_buffer<B: Backend>(
    backend: &mut B,
    heaps: &DescriptorHeaps,
    width: u32,
    height: u32,
) -> Result<TrackedResource> {
    let depth = backend.create_texture(
        &TextureDesc {
            width,
            height,
            format: Format::D32Float,
            usage: TextureUsage::DepthStencil,
        },
        ResourceState::DepthWrite,
    )?;
    backend.create_depth_stencil_view(&depth, heaps.depth_stencil()?)?;
    Ok(depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, HeadlessOptions};
    use crate::command::Command;
    use crate::input::{Key, WindowEvent};
    use crate::scene::{parse_obj, VERTEX_COLOR};

    const QUAD: &str = "v -1 -1 2\nv 1 -1 2\nv 1 1 2\nv -1 1 2\n\
                        vt 0 1\nvt 1 1\nvt 1 0\nvt 0 0\n\
                        f 1/1 3/3 2/2\nf 1/1 4/4 3/3\n";

    const RED: [u8; 4] = [255, 0, 0, 255];
    const GREEN: [u8; 4] = [0, 255, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];
    const WHITE: [u8; 4] = [255, 255, 255, 255];

    fn checker() -> Bitmap {
        Bitmap::from_rgba(2, 2, [RED, GREEN, BLUE, WHITE].concat()).unwrap()
    }

    fn renderer_with(
        options: HeadlessOptions,
        obj: &str,
        bitmap: Bitmap,
    ) -> Renderer<HeadlessBackend> {
        let scene = parse_obj(obj.as_bytes()).unwrap();
        Renderer::init(
            HeadlessBackend::new(options),
            &Surface::headless(320, 240),
            scene.vertices(),
            bitmap,
            RendererSettings::default(),
        )
        .unwrap()
    }

    fn renderer() -> Renderer<HeadlessBackend> {
        renderer_with(HeadlessOptions::default(), QUAD, checker())
    }

    #[test]
    fn test_init_writes_fixed_slots() {
        let r = renderer();
        let gpu = r.backend();
        assert_eq!(
            gpu.view_at(r.heaps().constant_buffer_cpu().unwrap()),
            r.constant_buffer_id()
        );
        assert_eq!(gpu.view_at(r.heaps().texture_cpu().unwrap()), r.texture_id());
        assert_eq!(r.frame_index(), 0);
        assert_eq!(
            gpu.gpu_state(r.texture_id().unwrap()),
            Some(ResourceState::PixelShaderResource)
        );
    }

    #[test]
    fn test_init_rejects_empty_surface() {
        let result = Renderer::init(
            HeadlessBackend::new(HeadlessOptions::default()),
            &Surface::headless(0, 0),
            &[],
            checker(),
            RendererSettings::default(),
        );
        assert!(matches!(result, Err(RenderError::EmptySurface { .. })));
    }

    #[test]
    fn test_vertex_buffer_size() {
        let r = renderer();
        assert_eq!(r.vertex_buffer_size(), 3 * 2 * VERTEX_STRIDE as u64);
    }

    #[test]
    fn test_frames_cycle_and_fence_advances() {
        let mut r = renderer();
        // the texture upload used value 1
        let mut expected = r.fence().last_signaled();

        for frame in 0..7 {
            r.update().unwrap();
            r.render().unwrap();
            expected += 1;

            assert!(r.frame_index() < FRAME_COUNT);
            assert_eq!(r.frame_index(), (frame + 1) % 2);
            assert_eq!(r.fence().last_signaled(), expected);
            assert_eq!(r.fence().next_value(), expected + 1);
            assert_eq!(
                r.backend().completed_value(r.fence().fence()).unwrap(),
                expected
            );
        }
        assert_eq!(r.backend().draws().len(), 7);
        assert_eq!(r.backend().presented_frames(), 7);
        assert!(r.backend().draws().iter().all(|d| d.vertex_count == 6));
    }

    #[test]
    fn test_back_buffer_cleared_to_clear_color() {
        let mut r = renderer();
        r.render().unwrap();
        let target = r.backend().draws()[0].render_target;
        let texels = r.backend().texture_data(target).unwrap();
        assert_eq!(&texels[..4], &[0, 51, 102, 255]);
        assert_eq!(r.backend().gpu_state(target), Some(ResourceState::Present));
    }

    #[test]
    fn test_empty_scene_draws_nothing() {
        let mut r = renderer_with(HeadlessOptions::default(), "", checker());
        assert_eq!(r.vertex_buffer_size(), 0);

        r.update().unwrap();
        r.render().unwrap();
        assert!(r.backend().draws().is_empty());
        assert_eq!(r.backend().presented_frames(), 1);
        assert!(!r
            .last_commands()
            .iter()
            .any(|c| matches!(c, Command::Draw { .. })));
    }

    #[test]
    fn test_texture_corners_sample_back() {
        let r = renderer();
        let gpu = r.backend();
        let id = r.texture_id().unwrap();
        assert_eq!(gpu.sample(id, 0.0, 0.0).unwrap(), RED);
        assert_eq!(gpu.sample(id, 1.0, 0.0).unwrap(), GREEN);
        assert_eq!(gpu.sample(id, 0.0, 1.0).unwrap(), BLUE);
        assert_eq!(gpu.sample(id, 1.0, 1.0).unwrap(), WHITE);
    }

    #[test]
    fn test_texture_read_back_with_odd_pitch() {
        let pixels: Vec<u8> = (0..7 * 5 * 4).map(|i| (i * 7 % 256) as u8).collect();
        let bitmap = Bitmap::from_rgba(7, 5, pixels.clone()).unwrap();
        let mut r = renderer_with(
            HeadlessOptions {
                pitch_alignment: 512,
                ..HeadlessOptions::default()
            },
            QUAD,
            bitmap,
        );

        assert_eq!(r.read_back_texture().unwrap(), pixels);
        // the texture is usable for drawing afterwards
        r.render().unwrap();
        assert_eq!(r.backend().draws().len(), 1);
    }

    #[test]
    fn test_update_without_keys_keeps_constants() {
        let mut r = renderer();
        let before = r.constants().unwrap();
        r.update().unwrap();
        r.render().unwrap();
        r.update().unwrap();
        assert_eq!(r.constants().unwrap(), before);
    }

    #[test]
    fn test_tick_drives_camera_and_frames() {
        let mut r = renderer();
        let mut events = EventQueue::new();
        events.push(WindowEvent::KeyDown(Key::W));
        events.push(WindowEvent::Paint);
        assert!(r.tick(&mut events).unwrap());
        assert!((r.camera().position().z - 0.05).abs() < 1e-6);
        assert_eq!(r.backend().presented_frames(), 1);

        events.push(WindowEvent::KeyUp(Key::W));
        events.push(WindowEvent::Paint);
        assert!(r.tick(&mut events).unwrap());
        assert!((r.camera().position().z - 0.05).abs() < 1e-6);

        // no paint, no frame
        assert!(r.tick(&mut events).unwrap());
        assert_eq!(r.backend().presented_frames(), 2);

        events.push(WindowEvent::KeyDown(Key::Escape));
        assert!(!r.tick(&mut events).unwrap());
    }

    #[test]
    fn test_resize_rebuilds_targets() {
        let mut r = renderer();
        r.render().unwrap();
        let before = r.constants().unwrap();

        let mut events = EventQueue::new();
        events.push(WindowEvent::Resized {
            width: 640,
            height: 240,
        });
        events.push(WindowEvent::Paint);
        assert!(r.tick(&mut events).unwrap());

        assert_eq!(r.size(), (640, 240));
        assert_ne!(r.constants().unwrap(), before);
        assert_eq!(r.backend().draws().len(), 2);
        let target = r.backend().draws()[1].render_target;
        assert_eq!(r.backend().texture_data(target).unwrap().len(), 640 * 240 * 4);
    }

    #[test]
    fn test_minimize_is_ignored() {
        let mut r = renderer();
        r.resize(0, 0).unwrap();
        assert_eq!(r.size(), (320, 240));
        r.render().unwrap();
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut r = renderer();
        r.render().unwrap();
        r.destroy().unwrap();
        r.destroy().unwrap();

        // only the swap chain's own buffers remain
        assert_eq!(r.backend().live_resources(), FRAME_COUNT as usize);
        assert_eq!(r.backend().pending_operations(), 0);
        assert!(matches!(r.render(), Err(RenderError::NotInitialized(_))));
    }

    #[test]
    fn test_vertex_view_size_rejects_overflow() {
        assert_eq!(vertex_view_size(6 * VERTEX_STRIDE as usize).unwrap(), 6 * VERTEX_STRIDE);
        assert_eq!(vertex_view_size(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            vertex_view_size(u32::MAX as usize + 1),
            Err(RenderError::VertexDataTooLarge(bytes)) if bytes == u32::MAX as usize + 1
        ));
    }

    #[test]
    fn test_vertices_are_white() {
        let scene = parse_obj(QUAD.as_bytes()).unwrap();
        assert!(scene.vertices().iter().all(|v| v.color == VERTEX_COLOR));
    }
}
