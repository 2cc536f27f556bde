//! Descriptor Heap Module
//!
//! Three heaps with fixed capacities and fixed slot assignments, allocated once
//! at startup. Slot addresses are computed from the increment the device
//! reports for each heap kind.

use tracing::debug;

use crate::backend::{Backend, CpuDescriptor, GpuDescriptor, HeapId, HeapKind};
use crate::error::{RenderError, Result};

/// Render target views, one per back buffer
pub const RTV_CAPACITY: u32 = 2;
/// Depth stencil views
pub const DSV_CAPACITY: u32 = 1;
/// Constant buffer and shader resource views
pub const CBV_SRV_CAPACITY: u32 = 2;

/// CBV/SRV slot of the camera constant buffer
pub const CONSTANT_BUFFER_SLOT: u32 = 0;
/// CBV/SRV slot of the mesh texture
pub const TEXTURE_SLOT: u32 = 1;

/// Root parameter of the constant buffer table (vertex stage)
pub const CONSTANT_BUFFER_TABLE: u32 = 0;
/// Root parameter of the texture table (pixel stage)
pub const TEXTURE_TABLE: u32 = 1;

/// A fixed-capacity descriptor heap
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeap {
    id: HeapId,
    kind: HeapKind,
    capacity: u32,
    increment: u32,
    cpu_start: CpuDescriptor,
    gpu_start: Option<GpuDescriptor>,
}

impl DescriptorHeap {
    pub fn create<B: Backend>(
        backend: &mut B,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self> {
        let info = backend.create_descriptor_heap(kind, capacity, shader_visible)?;
        let increment = backend.descriptor_increment(kind);
        debug!(
            "Created {:?} heap {}: {} slots, increment {}",
            kind, info.id, capacity, increment
        );

        Ok(Self {
            id: info.id,
            kind,
            capacity,
            increment,
            cpu_start: info.cpu_start,
            gpu_start: info.gpu_start,
        })
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    #[cfg(test)]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[cfg(test)]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.capacity {
            return Err(RenderError::DescriptorOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// CPU address of slot `index`
    pub fn cpu_handle(&self, index: u32) -> Result<CpuDescriptor> {
        self.check_index(index)?;
        Ok(CpuDescriptor {
            ptr: self.cpu_start.ptr + (index as usize) * (self.increment as usize),
        })
    }

    /// GPU address of slot `index`; shader-visible heaps only
    pub fn gpu_handle(&self, index: u32) -> Result<GpuDescriptor> {
        self.check_index(index)?;
        let start = self.gpu_start.ok_or(RenderError::HeapNotShaderVisible(self.id))?;
        Ok(GpuDescriptor {
            ptr: start.ptr + index as u64 * self.increment as u64,
        })
    }
}

/// The renderer's three heaps
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeaps {
    pub rtv: DescriptorHeap,
    pub dsv: DescriptorHeap,
    pub cbv_srv: DescriptorHeap,
}

impl DescriptorHeaps {
    pub fn create<B: Backend>(backend: &mut B) -> Result<Self> {
        Ok(Self {
            rtv: DescriptorHeap::create(backend, HeapKind::RenderTarget, RTV_CAPACITY, false)?,
            dsv: DescriptorHeap::create(backend, HeapKind::DepthStencil, DSV_CAPACITY, false)?,
            cbv_srv: DescriptorHeap::create(
                backend,
                HeapKind::ShaderResource,
                CBV_SRV_CAPACITY,
                true,
            )?,
        })
    }

    pub fn render_target(&self, index: u32) -> Result<CpuDescriptor> {
        self.rtv.cpu_handle(index)
    }

    pub fn depth_stencil(&self) -> Result<CpuDescriptor> {
        self.dsv.cpu_handle(0)
    }

    pub fn constant_buffer_cpu(&self) -> Result<CpuDescriptor> {
        self.cbv_srv.cpu_handle(CONSTANT_BUFFER_SLOT)
    }

    pub fn texture_cpu(&self) -> Result<CpuDescriptor> {
        self.cbv_srv.cpu_handle(TEXTURE_SLOT)
    }

    pub fn constant_buffer_gpu(&self) -> Result<GpuDescriptor> {
        self.cbv_srv.gpu_handle(CONSTANT_BUFFER_SLOT)
    }

    pub fn texture_gpu(&self) -> Result<GpuDescriptor> {
        self.cbv_srv.gpu_handle(TEXTURE_SLOT)
    }
}
