//! Command Recording Module
//!
//! A `CommandList` is a recorded sequence of `Command`s that a backend either
//! translates into native calls or executes itself. Recording methods that touch
//! a resource check its tracked state first, so a frame that uses a resource in
//! the wrong state fails while it is being recorded instead of on the GPU.

use tracing::trace;

use crate::backend::{CpuDescriptor, GpuDescriptor, HeapId, ResourceId};
use crate::error::{RenderError, Result};
use crate::layout::PlacedFootprint;
use crate::state::{ResourceState, TrackedResource};

/// Rasterizer viewport
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub top_left_x: f32,
    pub top_left_y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Whole render target, full depth range.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            top_left_x: 0.0,
            top_left_y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
}

/// Vertex buffer binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub resource: ResourceId,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

impl VertexBufferView {
    pub fn vertex_count(&self) -> u32 {
        self.size_in_bytes / self.stride_in_bytes
    }
}

/// One recorded GPU command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetDescriptorHeap(HeapId),
    SetGraphicsRootSignature,
    SetRootDescriptorTable {
        parameter: u32,
        base: GpuDescriptor,
    },
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    SetRenderTargets {
        rtv: CpuDescriptor,
        dsv: Option<CpuDescriptor>,
    },
    ClearRenderTarget {
        rtv: CpuDescriptor,
        color: [f32; 4],
    },
    ClearDepth {
        dsv: CpuDescriptor,
        depth: f32,
    },
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffer(VertexBufferView),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    CopyBufferToTexture {
        source: ResourceId,
        footprint: PlacedFootprint,
        destination: ResourceId,
    },
    CopyTextureToBuffer {
        source: ResourceId,
        destination: ResourceId,
        footprint: PlacedFootprint,
    },
}

/// A reusable list of recorded commands.
#[derive(Debug)]
pub struct CommandList {
    name: &'static str,
    commands: Vec<Command>,
    open: bool,
    binds_pipeline: bool,
}

impl CommandList {
    /// Create a closed, empty list.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            commands: Vec::new(),
            open: false,
            binds_pipeline: false,
        }
    }

    /// Discard previous contents and open the list for recording.
    ///
    /// With `bind_pipeline` the list starts with the pipeline state bound.
    pub fn reset(&mut self, bind_pipeline: bool) {
        self.commands.clear();
        self.open = true;
        self.binds_pipeline = bind_pipeline;
    }

    pub fn close(&mut self) {
        self.open = false;
        trace!("Closed {} list with {} commands", self.name, self.commands.len());
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn binds_pipeline(&self) -> bool {
        self.binds_pipeline
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Fail if the list is still open; backends call this before executing.
    pub fn ensure_closed(&self) -> Result<()> {
        if self.open {
            return Err(RenderError::CommandListOpen);
        }
        Ok(())
    }

    fn push(&mut self, command: Command) {
        debug_assert!(self.open, "recording into closed {} list", self.name);
        self.commands.push(command);
    }

    pub fn set_descriptor_heap(&mut self, heap: HeapId) {
        self.push(Command::SetDescriptorHeap(heap));
    }

    pub fn set_graphics_root_signature(&mut self) {
        self.push(Command::SetGraphicsRootSignature);
    }

    pub fn set_root_descriptor_table(&mut self, parameter: u32, base: GpuDescriptor) {
        self.push(Command::SetRootDescriptorTable { parameter, base });
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.push(Command::SetViewport(viewport));
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.push(Command::SetScissorRect(rect));
    }

    /// Record a barrier from the tracked state to `after`.
    ///
    /// Nothing is recorded when the resource is already in `after`.
    pub fn transition(&mut self, resource: &mut TrackedResource, after: ResourceState) {
        let before = resource.state();
        if before == after {
            return;
        }
        resource.set_state(after);
        self.push(Command::Transition {
            resource: resource.id(),
            before,
            after,
        });
    }

    /// Bind a render target and optional depth target, both in their write states.
    pub fn set_render_targets(
        &mut self,
        target: &TrackedResource,
        rtv: CpuDescriptor,
        depth: Option<(&TrackedResource, CpuDescriptor)>,
    ) -> Result<()> {
        target.ensure_state(ResourceState::RenderTarget)?;
        let dsv = match depth {
            Some((depth, dsv)) => {
                depth.ensure_state(ResourceState::DepthWrite)?;
                Some(dsv)
            }
            None => None,
        };
        self.push(Command::SetRenderTargets { rtv, dsv });
        Ok(())
    }

    pub fn clear_render_target(
        &mut self,
        target: &TrackedResource,
        rtv: CpuDescriptor,
        color: [f32; 4],
    ) -> Result<()> {
        target.ensure_state(ResourceState::RenderTarget)?;
        self.push(Command::ClearRenderTarget { rtv, color });
        Ok(())
    }

    pub fn clear_depth(
        &mut self,
        depth: &TrackedResource,
        dsv: CpuDescriptor,
        value: f32,
    ) -> Result<()> {
        depth.ensure_state(ResourceState::DepthWrite)?;
        self.push(Command::ClearDepth { dsv, depth: value });
        Ok(())
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.push(Command::SetPrimitiveTopology(topology));
    }

    pub fn set_vertex_buffer(&mut self, view: VertexBufferView) {
        self.push(Command::SetVertexBuffer(view));
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    /// Copy a placed buffer region into subresource 0 of `destination`.
    ///
    /// The source may be an upload buffer, which stays in `GenericRead`.
    pub fn copy_buffer_to_texture(
        &mut self,
        source: &TrackedResource,
        footprint: &PlacedFootprint,
        destination: &TrackedResource,
    ) -> Result<()> {
        if source.state() != ResourceState::GenericRead {
            source.ensure_state(ResourceState::CopySource)?;
        }
        destination.ensure_state(ResourceState::CopyDest)?;
        self.push(Command::CopyBufferToTexture {
            source: source.id(),
            footprint: *footprint,
            destination: destination.id(),
        });
        Ok(())
    }

    /// Copy subresource 0 of `source` into a buffer laid out as `footprint`.
    pub fn copy_texture_to_buffer(
        &mut self,
        source: &TrackedResource,
        destination: &TrackedResource,
        footprint: &PlacedFootprint,
    ) -> Result<()> {
        source.ensure_state(ResourceState::CopySource)?;
        destination.ensure_state(ResourceState::CopyDest)?;
        self.push(Command::CopyTextureToBuffer {
            source: source.id(),
            destination: destination.id(),
            footprint: *footprint,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{texture_footprint, Format};

    #[test]
    fn test_new_list_is_closed() {
        let list = CommandList::new("test");
        assert!(!list.is_open());
        assert!(list.ensure_closed().is_ok());
        assert!(list.commands().is_empty());
    }

    #[test]
    fn test_reset_clears_and_opens() {
        let mut list = CommandList::new("test");
        list.reset(true);
        list.draw(3, 1);
        list.close();
        assert_eq!(list.commands().len(), 1);

        list.reset(false);
        assert!(list.is_open());
        assert!(!list.binds_pipeline());
        assert!(list.commands().is_empty());
        assert!(matches!(list.ensure_closed(), Err(RenderError::CommandListOpen)));
    }

    #[test]
    fn test_transition_takes_before_from_tracker() {
        let mut list = CommandList::new("test");
        let mut res = TrackedResource::new(4, ResourceState::Present);
        list.reset(false);
        list.transition(&mut res, ResourceState::RenderTarget);
        list.transition(&mut res, ResourceState::RenderTarget);
        list.transition(&mut res, ResourceState::Present);
        list.close();

        assert_eq!(
            list.commands(),
            &[
                Command::Transition {
                    resource: 4,
                    before: ResourceState::Present,
                    after: ResourceState::RenderTarget,
                },
                Command::Transition {
                    resource: 4,
                    before: ResourceState::RenderTarget,
                    after: ResourceState::Present,
                },
            ]
        );
        assert_eq!(res.state(), ResourceState::Present);
    }

    #[test]
    fn test_clear_requires_render_target_state() {
        let mut list = CommandList::new("test");
        let target = TrackedResource::new(1, ResourceState::Present);
        list.reset(false);
        let result = list.clear_render_target(&target, CpuDescriptor { ptr: 0 }, [0.0; 4]);
        assert!(matches!(
            result,
            Err(RenderError::InvalidResourceState {
                expected: ResourceState::RenderTarget,
                ..
            })
        ));
        assert!(list.commands().is_empty());
    }

    #[test]
    fn test_copy_states() {
        let fp = texture_footprint(2, 2, Format::Rgba8Unorm, 256).unwrap();
        let staging = TrackedResource::new(1, ResourceState::GenericRead);
        let texture = TrackedResource::new(2, ResourceState::CopyDest);
        let sampled = TrackedResource::new(3, ResourceState::PixelShaderResource);

        let mut list = CommandList::new("test");
        list.reset(false);
        assert!(list.copy_buffer_to_texture(&staging, &fp.placed, &texture).is_ok());
        assert!(list.copy_buffer_to_texture(&staging, &fp.placed, &sampled).is_err());
        assert!(list.copy_texture_to_buffer(&sampled, &texture, &fp.placed).is_err());
        assert_eq!(list.commands().len(), 1);
    }

    #[test]
    fn test_vertex_count() {
        let view = VertexBufferView {
            resource: 1,
            size_in_bytes: 36 * 6,
            stride_in_bytes: 36,
        };
        assert_eq!(view.vertex_count(), 6);
    }
}
