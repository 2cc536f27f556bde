//! GPU Backend Module
//!
//! The engine records work against this seam. A backend instance is the device
//! together with its single direct queue; it owns every native object and hands
//! out small integer ids for them.

#[cfg(windows)]
pub mod d3d12;
pub mod headless;

use std::ptr::NonNull;

use raw_window_handle::RawWindowHandle;

use crate::command::CommandList;
use crate::error::Result;
use crate::layout::{CopyableFootprint, Format};
use crate::state::{ResourceState, TrackedResource};

/// Resource ID type
pub type ResourceId = u32;
/// Descriptor heap ID type
pub type HeapId = u32;
/// Fence ID type
pub type FenceId = u32;

/// Kind of view a descriptor heap holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    RenderTarget,
    DepthStencil,
    /// Constant buffer and shader resource views
    ShaderResource,
}

/// CPU address of a descriptor, used when writing views
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDescriptor {
    pub ptr: usize,
}

/// GPU address of a descriptor, used when binding tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDescriptor {
    pub ptr: u64,
}

/// What the backend reports for a freshly created heap
#[derive(Debug, Clone, Copy)]
pub struct HeapInfo {
    pub id: HeapId,
    pub cpu_start: CpuDescriptor,
    /// Present only for shader-visible heaps
    pub gpu_start: Option<GpuDescriptor>,
}

/// Memory a buffer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// CPU-writable, GPU-readable; created in `GenericRead`
    Upload,
    /// GPU-writable, CPU-readable; created in `CopyDest`
    Readback,
}

impl MemoryKind {
    pub fn initial_state(self) -> ResourceState {
        match self {
            MemoryKind::Upload => ResourceState::GenericRead,
            MemoryKind::Readback => ResourceState::CopyDest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub memory: MemoryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    /// Sampled by the pixel shader
    Sampled,
    /// Depth target, cleared to 1.0
    DepthStencil,
}

/// Single-mip, single-sample 2D texture in device-local memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub usage: TextureUsage,
}

/// Presentation target handed over by the window layer
#[derive(Debug, Clone, Copy)]
pub struct Surface {
    /// `None` when rendering without a window
    #[cfg_attr(not(windows), allow(dead_code))]
    pub window: Option<RawWindowHandle>,
    pub width: u32,
    pub height: u32,
}

impl Surface {
    pub fn headless(width: u32, height: u32) -> Self {
        Self {
            window: None,
            width,
            height,
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// Fixed-function and binding setup of the single graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineDesc {
    pub vertex_stride: u32,
    pub render_target_format: Format,
    pub depth_format: Format,
}

/// CPU view of a mapped buffer.
///
/// The backend keeps the memory valid until the buffer is unmapped or
/// released; the owner of the region must not outlive either.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until unmapped.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: validity guaranteed by the constructor contract
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: validity guaranteed by the constructor contract
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Overwrite `bytes.len()` bytes starting at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.as_mut_slice()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Device + direct queue of an explicit-submission GPU API.
pub trait Backend {
    /// Adapter description for logging
    fn name(&self) -> &str;

    // Swap chain

    fn create_swap_chain(&mut self, surface: &Surface, buffer_count: u32) -> Result<()>;
    /// Back buffer `index`, in the `Present` state
    fn back_buffer(&mut self, index: u32) -> Result<TrackedResource>;
    /// Buffer the driver will hand out next; not necessarily a rotation
    fn current_back_buffer_index(&self) -> Result<u32>;
    fn present(&mut self, sync_interval: u32) -> Result<()>;
    /// All back buffers must have been released first
    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()>;

    // Descriptors

    /// Device-reported byte stride between descriptors of `kind`
    fn descriptor_increment(&self, kind: HeapKind) -> u32;
    fn create_descriptor_heap(
        &mut self,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HeapInfo>;
    fn create_render_target_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()>;
    fn create_depth_stencil_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()>;
    fn create_constant_buffer_view(
        &mut self,
        resource: &TrackedResource,
        size: u32,
        dest: CpuDescriptor,
    ) -> Result<()>;
    fn create_shader_resource_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()>;

    // Pipeline

    /// Root signature and pipeline state; lists reset with a pipeline bind it
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<()>;

    // Resources

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<TrackedResource>;
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: ResourceState,
    ) -> Result<TrackedResource>;
    /// Buffer layout the device requires to copy into a texture like `desc`
    fn copyable_footprint(&self, desc: &TextureDesc) -> Result<CopyableFootprint>;
    fn map(&mut self, resource: &TrackedResource) -> Result<MappedRegion>;
    fn unmap(&mut self, resource: &TrackedResource);
    fn release(&mut self, resource: TrackedResource);

    // Submission

    /// Queue a closed command list; returns before the GPU runs it
    fn execute(&mut self, list: &CommandList) -> Result<()>;

    // Fences

    fn create_fence(&mut self, initial_value: u64) -> Result<FenceId>;
    /// Queue a signal that sets the fence once all prior work has completed
    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()>;
    fn completed_value(&self, fence: FenceId) -> Result<u64>;
    /// Block the calling thread until the fence reaches `value`
    fn wait_for_value(&mut self, fence: FenceId, value: u64) -> Result<()>;
}
