//! Per-Frame Command Recorder
//!
//! Builds the single command list drawn every frame.

use tracing::trace;

use crate::backend::CpuDescriptor;
use crate::command::{CommandList, PrimitiveTopology, ScissorRect, VertexBufferView, Viewport};
use crate::descriptor::{DescriptorHeaps, CONSTANT_BUFFER_TABLE, TEXTURE_TABLE};
use crate::error::Result;
use crate::state::{ResourceState, TrackedResource};

/// Default clear colour (dark blue)
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.0, 0.2, 0.4, 1.0];

/// Everything one frame draws with
pub struct FrameTargets<'a> {
    pub back_buffer: &'a mut TrackedResource,
    pub rtv: CpuDescriptor,
    pub depth: &'a TrackedResource,
    pub texture: &'a TrackedResource,
    /// `None` for a scene without triangles
    pub vertex_buffer: Option<VertexBufferView>,
}

#[derive(Debug, Clone)]
pub struct CommandRecorder {
    viewport: Viewport,
    scissor: ScissorRect,
    clear_color: [f32; 4],
}

impl CommandRecorder {
    pub fn new(width: u32, height: u32, clear_color: [f32; 4]) -> Self {
        Self {
            viewport: Viewport::full(width, height),
            scissor: ScissorRect::full(width, height),
            clear_color,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.viewport = Viewport::full(width, height);
        self.scissor = ScissorRect::full(width, height);
    }

    #[cfg(test)]
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Width over height of the render target
    pub fn aspect_ratio(&self) -> f32 {
        self.viewport.width / self.viewport.height
    }

    /// Reset `list` and record one frame into it, leaving it closed.
    pub fn record(
        &self,
        list: &mut CommandList,
        heaps: &DescriptorHeaps,
        frame: FrameTargets<'_>,
    ) -> Result<()> {
        list.reset(true);

        list.set_graphics_root_signature();
        list.set_descriptor_heap(heaps.cbv_srv.id());
        list.set_root_descriptor_table(CONSTANT_BUFFER_TABLE, heaps.constant_buffer_gpu()?);
        frame.texture.ensure_state(ResourceState::PixelShaderResource)?;
        list.set_root_descriptor_table(TEXTURE_TABLE, heaps.texture_gpu()?);
        list.set_viewport(self.viewport);
        list.set_scissor_rect(self.scissor);

        list.transition(frame.back_buffer, ResourceState::RenderTarget);

        let dsv = heaps.depth_stencil()?;
        list.set_render_targets(frame.back_buffer, frame.rtv, Some((frame.depth, dsv)))?;
        list.clear_render_target(frame.back_buffer, frame.rtv, self.clear_color)?;
        list.clear_depth(frame.depth, dsv, 1.0)?;
        list.set_primitive_topology(PrimitiveTopology::TriangleList);

        if let Some(view) = frame.vertex_buffer {
            list.set_vertex_buffer(view);
            list.draw(view.vertex_count(), 1);
        }

        list.transition(frame.back_buffer, ResourceState::Present);
        list.close();

        trace!("Recorded frame into {} commands", list.commands().len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, HeadlessOptions};
    use crate::command::Command;
    use crate::error::RenderError;

    struct Fixture {
        heaps: DescriptorHeaps,
        back_buffer: TrackedResource,
        depth: TrackedResource,
        texture: TrackedResource,
    }

    fn fixture() -> Fixture {
        let mut backend = HeadlessBackend::new(HeadlessOptions::default());
        Fixture {
            heaps: DescriptorHeaps::create(&mut backend).unwrap(),
            back_buffer: TrackedResource::new(1, ResourceState::Present),
            depth: TrackedResource::new(2, ResourceState::DepthWrite),
            texture: TrackedResource::new(3, ResourceState::PixelShaderResource),
        }
    }

    fn vertex_buffer(triangles: u32) -> VertexBufferView {
        VertexBufferView {
            resource: 4,
            size_in_bytes: triangles * 3 * 36,
            stride_in_bytes: 36,
        }
    }

    #[test]
    fn test_frame_order() {
        let mut f = fixture();
        let recorder = CommandRecorder::new(800, 600, DEFAULT_CLEAR_COLOR);
        let mut list = CommandList::new("frame");
        let rtv = f.heaps.render_target(0).unwrap();
        let dsv = f.heaps.depth_stencil().unwrap();

        recorder
            .record(
                &mut list,
                &f.heaps,
                FrameTargets {
                    back_buffer: &mut f.back_buffer,
                    rtv,
                    depth: &f.depth,
                    texture: &f.texture,
                    vertex_buffer: Some(vertex_buffer(2)),
                },
            )
            .unwrap();

        assert!(!list.is_open());
        assert!(list.binds_pipeline());
        assert_eq!(f.back_buffer.state(), ResourceState::Present);
        assert_eq!(
            list.commands(),
            &[
                Command::SetGraphicsRootSignature,
                Command::SetDescriptorHeap(f.heaps.cbv_srv.id()),
                Command::SetRootDescriptorTable {
                    parameter: 0,
                    base: f.heaps.constant_buffer_gpu().unwrap(),
                },
                Command::SetRootDescriptorTable {
                    parameter: 1,
                    base: f.heaps.texture_gpu().unwrap(),
                },
                Command::SetViewport(Viewport::full(800, 600)),
                Command::SetScissorRect(ScissorRect::full(800, 600)),
                Command::Transition {
                    resource: 1,
                    before: ResourceState::Present,
                    after: ResourceState::RenderTarget,
                },
                Command::SetRenderTargets {
                    rtv,
                    dsv: Some(dsv),
                },
                Command::ClearRenderTarget {
                    rtv,
                    color: DEFAULT_CLEAR_COLOR,
                },
                Command::ClearDepth { dsv, depth: 1.0 },
                Command::SetPrimitiveTopology(PrimitiveTopology::TriangleList),
                Command::SetVertexBuffer(vertex_buffer(2)),
                Command::Draw {
                    vertex_count: 6,
                    instance_count: 1,
                },
                Command::Transition {
                    resource: 1,
                    before: ResourceState::RenderTarget,
                    after: ResourceState::Present,
                },
            ]
        );
    }

    #[test]
    fn test_empty_scene_records_no_draw() {
        let mut f = fixture();
        let recorder = CommandRecorder::new(64, 64, DEFAULT_CLEAR_COLOR);
        let mut list = CommandList::new("frame");
        let rtv = f.heaps.render_target(1).unwrap();

        recorder
            .record(
                &mut list,
                &f.heaps,
                FrameTargets {
                    back_buffer: &mut f.back_buffer,
                    rtv,
                    depth: &f.depth,
                    texture: &f.texture,
                    vertex_buffer: None,
                },
            )
            .unwrap();

        assert!(!list
            .commands()
            .iter()
            .any(|c| matches!(c, Command::Draw { .. } | Command::SetVertexBuffer(_))));
        assert!(list
            .commands()
            .iter()
            .any(|c| matches!(c, Command::ClearRenderTarget { .. })));
    }

    #[test]
    fn test_unready_texture_is_rejected() {
        let mut f = fixture();
        let texture = TrackedResource::new(3, ResourceState::CopyDest);
        let recorder = CommandRecorder::new(64, 64, DEFAULT_CLEAR_COLOR);
        let mut list = CommandList::new("frame");
        let rtv = f.heaps.render_target(0).unwrap();

        let result = recorder.record(
            &mut list,
            &f.heaps,
            FrameTargets {
                back_buffer: &mut f.back_buffer,
                rtv,
                depth: &f.depth,
                texture: &texture,
                vertex_buffer: None,
            },
        );
        assert!(matches!(
            result,
            Err(RenderError::InvalidResourceState {
                resource: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_resize_updates_viewport() {
        let mut recorder = CommandRecorder::new(64, 64, DEFAULT_CLEAR_COLOR);
        assert_eq!(recorder.aspect_ratio(), 1.0);
        recorder.resize(200, 100);
        assert_eq!(recorder.viewport(), Viewport::full(200, 100));
        assert_eq!(recorder.aspect_ratio(), 2.0);
    }
}
