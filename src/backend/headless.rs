//! Headless Backend
//!
//! A simulated GPU for running without a display. Resources live in host
//! memory and submitted work sits in a queue until the CPU blocks on a fence,
//! so code that forgets to wait sees stale data just as it would on hardware.
//! Executed commands are validated against the state the GPU actually has.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;

use tracing::{debug, info, trace, warn};

use super::{
    Backend, BufferDesc, CpuDescriptor, FenceId, GpuDescriptor, HeapId, HeapInfo, HeapKind,
    MappedRegion, PipelineDesc, ResourceId, Surface, TextureDesc, TextureUsage,
};
use crate::command::{
    Command, CommandList, PrimitiveTopology, ScissorRect, VertexBufferView, Viewport,
};
use crate::error::{RenderError, Result};
use crate::layout::{
    texture_footprint, CopyableFootprint, Format, PlacedFootprint, CONSTANT_BUFFER_ALIGNMENT,
};
use crate::state::{ResourceState, TrackedResource};

const CPU_DESCRIPTOR_BASE: usize = 0x1_0000;
const GPU_DESCRIPTOR_BASE: u64 = 0x8000_0000;
/// Unused address space left between heaps so stray offsets never alias
const HEAP_GUARD: u64 = 0x1000;

/// Device properties the simulator reports
#[derive(Debug, Clone, Copy)]
pub struct HeadlessOptions {
    /// Row pitch alignment for buffer/texture copies
    pub pitch_alignment: u32,
    pub rtv_increment: u32,
    pub dsv_increment: u32,
    pub cbv_srv_increment: u32,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            pitch_alignment: 256,
            rtv_increment: 32,
            dsv_increment: 32,
            cbv_srv_increment: 64,
        }
    }
}

enum Storage {
    Buffer { bytes: Box<[u8]> },
    Texture { desc: TextureDesc, texels: Vec<u8> },
}

struct SimResource {
    storage: Storage,
    /// State as of the last executed command
    gpu_state: ResourceState,
    map_count: u32,
}

struct SimHeap {
    kind: HeapKind,
    capacity: u32,
    increment: u32,
    cpu_start: usize,
    gpu_start: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewKind {
    RenderTarget,
    DepthStencil,
    ConstantBuffer { size: u32 },
    ShaderResource,
}

#[derive(Debug, Clone, Copy)]
struct View {
    kind: ViewKind,
    resource: ResourceId,
}

struct SwapChain {
    buffers: Vec<ResourceId>,
    current: u32,
}

enum QueueOp {
    Execute {
        commands: Vec<Command>,
        binds_pipeline: bool,
    },
    Signal {
        fence: FenceId,
        value: u64,
    },
    Present {
        buffer: ResourceId,
    },
}

/// A draw the simulated GPU accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub struct DrawRecord {
    pub vertex_count: u32,
    pub render_target: ResourceId,
    pub texture: ResourceId,
}

/// Binding state of one executing command list
#[derive(Default)]
struct ListState {
    pipeline: bool,
    root_signature: bool,
    heap: Option<HeapId>,
    tables: [Option<(HeapId, u32)>; 2],
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    render_target: Option<ResourceId>,
    depth: Option<ResourceId>,
    topology: Option<PrimitiveTopology>,
    vertex_buffer: Option<VertexBufferView>,
}

pub struct HeadlessBackend {
    options: HeadlessOptions,
    resources: HashMap<ResourceId, SimResource>,
    next_resource_id: ResourceId,
    heaps: HashMap<HeapId, SimHeap>,
    next_heap_id: HeapId,
    next_cpu_address: usize,
    next_gpu_address: u64,
    views: HashMap<(HeapId, u32), View>,
    fences: HashMap<FenceId, u64>,
    next_fence_id: FenceId,
    pipeline: Option<PipelineDesc>,
    swap_chain: Option<SwapChain>,
    /// Back buffers currently handed out to the engine
    borrowed_back_buffers: HashSet<ResourceId>,
    queue: VecDeque<QueueOp>,
    draws: Vec<DrawRecord>,
    presented_frames: u64,
}

impl HeadlessBackend {
    pub fn new(options: HeadlessOptions) -> Self {
        info!("Creating headless device: {:?}", options);
        Self {
            options,
            resources: HashMap::new(),
            next_resource_id: 1,
            heaps: HashMap::new(),
            next_heap_id: 1,
            next_cpu_address: CPU_DESCRIPTOR_BASE,
            next_gpu_address: GPU_DESCRIPTOR_BASE,
            views: HashMap::new(),
            fences: HashMap::new(),
            next_fence_id: 1,
            pipeline: None,
            swap_chain: None,
            borrowed_back_buffers: HashSet::new(),
            queue: VecDeque::new(),
            draws: Vec::new(),
            presented_frames: 0,
        }
    }

    // Inspection helpers

    /// Resources alive on the device, swap chain buffers included
    #[cfg(test)]
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    /// Submissions, signals and presents not yet run
    #[cfg(test)]
    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented_frames
    }

    #[cfg(test)]
    pub fn gpu_state(&self, id: ResourceId) -> Option<ResourceState> {
        self.resources.get(&id).map(|r| r.gpu_state)
    }

    /// Resource whose view lives at `descriptor`
    #[cfg(test)]
    pub fn view_at(&self, descriptor: CpuDescriptor) -> Option<ResourceId> {
        let slot = self.resolve_cpu(descriptor).ok()?;
        self.views.get(&slot).map(|v| v.resource)
    }

    /// Tightly packed texels of a texture
    pub fn texture_data(&self, id: ResourceId) -> Result<&[u8]> {
        match &self.resource(id)?.storage {
            Storage::Texture { texels, .. } => Ok(texels),
            Storage::Buffer { .. } => Err(RenderError::backend("texture_data", "not a texture")),
        }
    }

    /// Point-sample an RGBA8 texture at (`u`, `v`), clamping to the edge.
    #[cfg(test)]
    pub fn sample(&self, id: ResourceId, u: f32, v: f32) -> Result<[u8; 4]> {
        let desc = match &self.resource(id)?.storage {
            Storage::Texture { desc, .. } => *desc,
            Storage::Buffer { .. } => return Err(RenderError::backend("sample", "not a texture")),
        };
        let texel = |coord: f32, size: u32| ((coord.max(0.0) * size as f32) as u32).min(size - 1);
        let (x, y) = (texel(u, desc.width), texel(v, desc.height));
        let start = ((y * desc.width + x) * 4) as usize;

        let texels = self.texture_data(id)?;
        let mut out = [0; 4];
        out.copy_from_slice(&texels[start..start + 4]);
        Ok(out)
    }

    /// Run everything queued so far.
    #[cfg(test)]
    pub fn flush(&mut self) -> Result<()> {
        while let Some(op) = self.queue.pop_front() {
            self.run(op)?;
        }
        Ok(())
    }

    // Internals

    fn resource(&self, id: ResourceId) -> Result<&SimResource> {
        self.resources.get(&id).ok_or(RenderError::UnknownResource(id))
    }

    fn resource_mut(&mut self, id: ResourceId) -> Result<&mut SimResource> {
        self.resources
            .get_mut(&id)
            .ok_or(RenderError::UnknownResource(id))
    }

    fn insert_resource(&mut self, storage: Storage, state: ResourceState) -> ResourceId {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        self.resources.insert(
            id,
            SimResource {
                storage,
                gpu_state: state,
                map_count: 0,
            },
        );
        id
    }

    fn insert_texture(&mut self, desc: &TextureDesc, state: ResourceState) -> Result<ResourceId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RenderError::EmptyImage {
                width: desc.width,
                height: desc.height,
            });
        }
        let len = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel() as usize;
        Ok(self.insert_resource(
            Storage::Texture {
                desc: *desc,
                texels: vec![0; len],
            },
            state,
        ))
    }

    fn resolve_cpu(&self, descriptor: CpuDescriptor) -> Result<(HeapId, u32)> {
        for (&id, heap) in &self.heaps {
            let end = heap.cpu_start + (heap.capacity * heap.increment) as usize;
            if (heap.cpu_start..end).contains(&descriptor.ptr) {
                let offset = descriptor.ptr - heap.cpu_start;
                if offset % heap.increment as usize != 0 {
                    break;
                }
                return Ok((id, (offset / heap.increment as usize) as u32));
            }
        }
        Err(RenderError::backend(
            "descriptor lookup",
            format!("CPU descriptor {:#x} is not a heap slot", descriptor.ptr),
        ))
    }

    fn resolve_gpu(&self, descriptor: GpuDescriptor) -> Result<(HeapId, u32)> {
        for (&id, heap) in &self.heaps {
            let Some(start) = heap.gpu_start else { continue };
            let end = start + (heap.capacity * heap.increment) as u64;
            if (start..end).contains(&descriptor.ptr) {
                let offset = descriptor.ptr - start;
                if offset % heap.increment as u64 != 0 {
                    break;
                }
                return Ok((id, (offset / heap.increment as u64) as u32));
            }
        }
        Err(RenderError::backend(
            "descriptor lookup",
            format!("GPU descriptor {:#x} is not a heap slot", descriptor.ptr),
        ))
    }

    /// Check `descriptor` lies in a heap of `kind` and record a view there.
    fn write_view(
        &mut self,
        descriptor: CpuDescriptor,
        heap_kind: HeapKind,
        view: View,
    ) -> Result<()> {
        let slot = self.resolve_cpu(descriptor)?;
        let kind = self.heaps[&slot.0].kind;
        if kind != heap_kind {
            return Err(RenderError::backend(
                "create view",
                format!("{:?} view written into {:?} heap", view.kind, kind),
            ));
        }
        trace!("View {:?} -> heap {} slot {}", view, slot.0, slot.1);
        self.views.insert(slot, view);
        Ok(())
    }

    fn texture_desc(&self, id: ResourceId) -> Result<TextureDesc> {
        match &self.resource(id)?.storage {
            Storage::Texture { desc, .. } => Ok(*desc),
            Storage::Buffer { .. } => Err(RenderError::backend(
                "texture access",
                format!("resource {} is a buffer", id),
            )),
        }
    }

    fn buffer_len(&self, id: ResourceId) -> Result<usize> {
        match &self.resource(id)?.storage {
            Storage::Buffer { bytes, .. } => Ok(bytes.len()),
            Storage::Texture { .. } => Err(RenderError::backend(
                "buffer access",
                format!("resource {} is a texture", id),
            )),
        }
    }

    fn expect_gpu_state(&self, id: ResourceId, expected: ResourceState) -> Result<()> {
        let actual = self.resource(id)?.gpu_state;
        if actual != expected {
            return Err(RenderError::InvalidResourceState {
                resource: id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn view(&self, slot: (HeapId, u32)) -> Result<View> {
        self.views.get(&slot).copied().ok_or_else(|| {
            RenderError::InvalidDraw(format!("no view at heap {} slot {}", slot.0, slot.1))
        })
    }

    fn run(&mut self, op: QueueOp) -> Result<()> {
        match op {
            QueueOp::Execute {
                commands,
                binds_pipeline,
            } => {
                let mut list = ListState {
                    pipeline: binds_pipeline,
                    ..ListState::default()
                };
                for command in &commands {
                    self.run_command(&mut list, command)?;
                }
                Ok(())
            }
            QueueOp::Signal { fence, value } => {
                let completed = self
                    .fences
                    .get_mut(&fence)
                    .ok_or(RenderError::UnknownFence(fence))?;
                *completed = (*completed).max(value);
                trace!("Fence {} reached {}", fence, value);
                Ok(())
            }
            QueueOp::Present { buffer } => {
                self.expect_gpu_state(buffer, ResourceState::Present)?;
                self.presented_frames += 1;
                trace!("Presented resource {}", buffer);
                Ok(())
            }
        }
    }

    fn run_command(&mut self, list: &mut ListState, command: &Command) -> Result<()> {
        match *command {
            Command::SetDescriptorHeap(id) => {
                let heap = self.heaps.get(&id).ok_or(RenderError::UnknownHeap(id))?;
                if heap.gpu_start.is_none() {
                    return Err(RenderError::HeapNotShaderVisible(id));
                }
                list.heap = Some(id);
            }
            Command::SetGraphicsRootSignature => {
                if self.pipeline.is_none() {
                    return Err(RenderError::NotInitialized("root signature"));
                }
                list.root_signature = true;
            }
            Command::SetRootDescriptorTable { parameter, base } => {
                if !list.root_signature {
                    return Err(RenderError::InvalidDraw(
                        "descriptor table set before root signature".into(),
                    ));
                }
                let slot = self.resolve_gpu(base)?;
                if list.heap != Some(slot.0) {
                    return Err(RenderError::InvalidDraw(format!(
                        "table {} points outside the bound descriptor heap",
                        parameter
                    )));
                }
                let table = list.tables.get_mut(parameter as usize).ok_or_else(|| {
                    RenderError::InvalidDraw(format!("no root parameter {}", parameter))
                })?;
                *table = Some(slot);
            }
            Command::SetViewport(viewport) => list.viewport = Some(viewport),
            Command::SetScissorRect(rect) => list.scissor = Some(rect),
            Command::Transition {
                resource,
                before,
                after,
            } => {
                let res = self.resource_mut(resource)?;
                if res.gpu_state != before {
                    return Err(RenderError::BarrierMismatch {
                        resource,
                        before,
                        actual: res.gpu_state,
                    });
                }
                res.gpu_state = after;
            }
            Command::SetRenderTargets { rtv, dsv } => {
                let view = self.view(self.resolve_cpu(rtv)?)?;
                if view.kind != ViewKind::RenderTarget {
                    return Err(RenderError::InvalidDraw("render target is not an RTV".into()));
                }
                list.render_target = Some(view.resource);
                list.depth = match dsv {
                    Some(dsv) => {
                        let view = self.view(self.resolve_cpu(dsv)?)?;
                        if view.kind != ViewKind::DepthStencil {
                            return Err(RenderError::InvalidDraw("depth target is not a DSV".into()));
                        }
                        Some(view.resource)
                    }
                    None => None,
                };
            }
            Command::ClearRenderTarget { rtv, color } => {
                let view = self.view(self.resolve_cpu(rtv)?)?;
                self.expect_gpu_state(view.resource, ResourceState::RenderTarget)?;
                let texel = color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
                if let Storage::Texture { texels, .. } =
                    &mut self.resource_mut(view.resource)?.storage
                {
                    for chunk in texels.chunks_exact_mut(4) {
                        chunk.copy_from_slice(&texel);
                    }
                }
            }
            Command::ClearDepth { dsv, depth } => {
                let view = self.view(self.resolve_cpu(dsv)?)?;
                self.expect_gpu_state(view.resource, ResourceState::DepthWrite)?;
                if let Storage::Texture { texels, .. } =
                    &mut self.resource_mut(view.resource)?.storage
                {
                    for chunk in texels.chunks_exact_mut(4) {
                        chunk.copy_from_slice(&depth.to_le_bytes());
                    }
                }
            }
            Command::SetPrimitiveTopology(topology) => list.topology = Some(topology),
            Command::SetVertexBuffer(view) => {
                if view.size_in_bytes as usize > self.buffer_len(view.resource)? {
                    return Err(RenderError::InvalidDraw(
                        "vertex buffer view larger than its buffer".into(),
                    ));
                }
                self.expect_gpu_state(view.resource, ResourceState::GenericRead)?;
                list.vertex_buffer = Some(view);
            }
            Command::Draw {
                vertex_count,
                instance_count,
            } => {
                let record = self.validate_draw(list, vertex_count, instance_count)?;
                trace!("Draw {:?}", record);
                self.draws.push(record);
            }
            Command::CopyBufferToTexture {
                source,
                footprint,
                destination,
            } => {
                let src_state = self.resource(source)?.gpu_state;
                if src_state != ResourceState::GenericRead {
                    self.expect_gpu_state(source, ResourceState::CopySource)?;
                }
                self.expect_gpu_state(destination, ResourceState::CopyDest)?;
                self.check_footprint(&footprint, destination, source)?;

                let rows = self.read_pitched(source, &footprint)?;
                if let Storage::Texture { texels, .. } = &mut self.resource_mut(destination)?.storage
                {
                    texels.copy_from_slice(&rows);
                }
            }
            Command::CopyTextureToBuffer {
                source,
                destination,
                footprint,
            } => {
                self.expect_gpu_state(source, ResourceState::CopySource)?;
                self.expect_gpu_state(destination, ResourceState::CopyDest)?;
                self.check_footprint(&footprint, source, destination)?;

                let texels = self.texture_data(source)?.to_vec();
                let row = footprint.width as usize * footprint.format.bytes_per_pixel() as usize;
                let pitch = footprint.row_pitch as usize;
                let base = footprint.offset as usize;
                if let Storage::Buffer { bytes, .. } = &mut self.resource_mut(destination)?.storage {
                    for (y, src_row) in texels.chunks_exact(row).enumerate() {
                        let start = base + y * pitch;
                        bytes[start..start + row].copy_from_slice(src_row);
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_draw(
        &self,
        list: &ListState,
        vertex_count: u32,
        instance_count: u32,
    ) -> Result<DrawRecord> {
        let fail = |msg: &str| Err(RenderError::InvalidDraw(msg.to_string()));

        if !list.pipeline {
            return fail("no pipeline state bound");
        }
        if !list.root_signature {
            return fail("no root signature bound");
        }
        if list.viewport.is_none() || list.scissor.is_none() {
            return fail("viewport or scissor not set");
        }
        if list.topology.is_none() {
            return fail("primitive topology not set");
        }
        if instance_count == 0 {
            return fail("zero instances");
        }

        let (Some(cb_slot), Some(tex_slot)) = (list.tables[0], list.tables[1]) else {
            return fail("descriptor tables not bound");
        };
        let cb = self.view(cb_slot)?;
        let ViewKind::ConstantBuffer { size } = cb.kind else {
            return fail("table 0 does not start with a CBV");
        };
        if size as usize > self.buffer_len(cb.resource)? {
            return fail("constant buffer view runs past its buffer");
        }
        let tex = self.view(tex_slot)?;
        if tex.kind != ViewKind::ShaderResource {
            return fail("table 1 does not start with an SRV");
        }
        self.expect_gpu_state(tex.resource, ResourceState::PixelShaderResource)?;

        let Some(render_target) = list.render_target else {
            return fail("no render target bound");
        };
        self.expect_gpu_state(render_target, ResourceState::RenderTarget)?;
        let Some(depth) = list.depth else {
            return fail("no depth target bound");
        };
        self.expect_gpu_state(depth, ResourceState::DepthWrite)?;

        let Some(vb) = list.vertex_buffer else {
            return fail("no vertex buffer bound");
        };
        let stride = self.pipeline.map(|p| p.vertex_stride).unwrap_or(0);
        if vb.stride_in_bytes != stride {
            return fail("vertex buffer stride does not match the input layout");
        }
        if vertex_count as u64 * stride as u64 > vb.size_in_bytes as u64 {
            return fail("draw reads past the end of the vertex buffer");
        }

        Ok(DrawRecord {
            vertex_count,
            render_target,
            texture: tex.resource,
        })
    }

    /// Validate a placed footprint against a texture and the buffer it lives in.
    fn check_footprint(
        &self,
        footprint: &PlacedFootprint,
        texture: ResourceId,
        buffer: ResourceId,
    ) -> Result<()> {
        let desc = self.texture_desc(texture)?;
        let row = footprint.width as u64 * footprint.format.bytes_per_pixel() as u64;
        let problem = if footprint.width != desc.width
            || footprint.height != desc.height
            || footprint.format != desc.format
        {
            Some("footprint does not match the texture")
        } else if footprint.row_pitch % self.options.pitch_alignment != 0 {
            Some("row pitch is not aligned")
        } else if (footprint.row_pitch as u64) < row {
            Some("row pitch smaller than a row")
        } else if footprint.offset
            + footprint.row_pitch as u64 * (footprint.height as u64 - 1)
            + row
            > self.buffer_len(buffer)? as u64
        {
            Some("footprint runs past the end of the buffer")
        } else {
            None
        };
        match problem {
            Some(problem) => Err(RenderError::backend("CopyTextureRegion", problem)),
            None => Ok(()),
        }
    }

    fn read_pitched(&self, buffer: ResourceId, footprint: &PlacedFootprint) -> Result<Vec<u8>> {
        let Storage::Buffer { bytes, .. } = &self.resource(buffer)?.storage else {
            return Err(RenderError::backend("CopyTextureRegion", "source is not a buffer"));
        };
        let row = footprint.width as usize * footprint.format.bytes_per_pixel() as usize;
        let mut packed = Vec::with_capacity(row * footprint.height as usize);
        for y in 0..footprint.height as usize {
            let start = footprint.offset as usize + y * footprint.row_pitch as usize;
            packed.extend_from_slice(&bytes[start..start + row]);
        }
        Ok(packed)
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &str {
        "Headless simulator"
    }

    fn create_swap_chain(&mut self, surface: &Surface, buffer_count: u32) -> Result<()> {
        if surface.width == 0 || surface.height == 0 {
            return Err(RenderError::EmptySurface {
                width: surface.width,
                height: surface.height,
            });
        }
        let desc = back_buffer_desc(surface.width, surface.height);
        let buffers = (0..buffer_count)
            .map(|_| self.insert_texture(&desc, ResourceState::Present))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "Swap chain: {} buffers of {}x{}",
            buffer_count, surface.width, surface.height
        );
        self.swap_chain = Some(SwapChain {
            buffers,
            current: 0,
        });
        Ok(())
    }

    fn back_buffer(&mut self, index: u32) -> Result<TrackedResource> {
        let chain = self
            .swap_chain
            .as_ref()
            .ok_or(RenderError::NotInitialized("swap chain"))?;
        let id = *chain
            .buffers
            .get(index as usize)
            .ok_or(RenderError::BackBufferIndex {
                index,
                count: chain.buffers.len() as u32,
            })?;
        self.borrowed_back_buffers.insert(id);
        Ok(TrackedResource::new(id, ResourceState::Present))
    }

    fn current_back_buffer_index(&self) -> Result<u32> {
        self.swap_chain
            .as_ref()
            .map(|chain| chain.current)
            .ok_or(RenderError::NotInitialized("swap chain"))
    }

    fn present(&mut self, _sync_interval: u32) -> Result<()> {
        let chain = self
            .swap_chain
            .as_mut()
            .ok_or(RenderError::NotInitialized("swap chain"))?;
        let buffer = chain.buffers[chain.current as usize];
        chain.current = (chain.current + 1) % chain.buffers.len() as u32;
        self.queue.push_back(QueueOp::Present { buffer });
        Ok(())
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(RenderError::EmptySurface { width, height });
        }
        if !self.borrowed_back_buffers.is_empty() {
            return Err(RenderError::backend(
                "ResizeBuffers",
                "back buffers are still referenced",
            ));
        }
        let old = self
            .swap_chain
            .take()
            .ok_or(RenderError::NotInitialized("swap chain"))?;
        for id in &old.buffers {
            self.resources.remove(id);
        }
        self.create_swap_chain(&Surface::headless(width, height), old.buffers.len() as u32)
    }

    fn descriptor_increment(&self, kind: HeapKind) -> u32 {
        match kind {
            HeapKind::RenderTarget => self.options.rtv_increment,
            HeapKind::DepthStencil => self.options.dsv_increment,
            HeapKind::ShaderResource => self.options.cbv_srv_increment,
        }
    }

    fn create_descriptor_heap(
        &mut self,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HeapInfo> {
        if shader_visible && kind != HeapKind::ShaderResource {
            return Err(RenderError::backend(
                "CreateDescriptorHeap",
                format!("{:?} heaps cannot be shader visible", kind),
            ));
        }
        let increment = self.descriptor_increment(kind);
        let span = (capacity * increment) as u64 + HEAP_GUARD;

        let id = self.next_heap_id;
        self.next_heap_id += 1;
        let cpu_start = self.next_cpu_address;
        self.next_cpu_address += span as usize;
        let gpu_start = shader_visible.then(|| {
            let start = self.next_gpu_address;
            self.next_gpu_address += span;
            start
        });

        self.heaps.insert(
            id,
            SimHeap {
                kind,
                capacity,
                increment,
                cpu_start,
                gpu_start,
            },
        );
        Ok(HeapInfo {
            id,
            cpu_start: CpuDescriptor { ptr: cpu_start },
            gpu_start: gpu_start.map(|ptr| GpuDescriptor { ptr }),
        })
    }

    fn create_render_target_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()> {
        if self.texture_desc(resource.id())?.format != Format::Rgba8Unorm {
            return Err(RenderError::backend("CreateRenderTargetView", "not a colour texture"));
        }
        self.write_view(
            dest,
            HeapKind::RenderTarget,
            View {
                kind: ViewKind::RenderTarget,
                resource: resource.id(),
            },
        )
    }

    fn create_depth_stencil_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()> {
        if self.texture_desc(resource.id())?.usage != TextureUsage::DepthStencil {
            return Err(RenderError::backend("CreateDepthStencilView", "not a depth texture"));
        }
        self.write_view(
            dest,
            HeapKind::DepthStencil,
            View {
                kind: ViewKind::DepthStencil,
                resource: resource.id(),
            },
        )
    }

    fn create_constant_buffer_view(
        &mut self,
        resource: &TrackedResource,
        size: u32,
        dest: CpuDescriptor,
    ) -> Result<()> {
        if size % CONSTANT_BUFFER_ALIGNMENT != 0 || size as usize > self.buffer_len(resource.id())? {
            return Err(RenderError::backend(
                "CreateConstantBufferView",
                format!("invalid view size {}", size),
            ));
        }
        self.write_view(
            dest,
            HeapKind::ShaderResource,
            View {
                kind: ViewKind::ConstantBuffer { size },
                resource: resource.id(),
            },
        )
    }

    fn create_shader_resource_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()> {
        if self.texture_desc(resource.id())?.usage != TextureUsage::Sampled {
            return Err(RenderError::backend("CreateShaderResourceView", "not a sampled texture"));
        }
        self.write_view(
            dest,
            HeapKind::ShaderResource,
            View {
                kind: ViewKind::ShaderResource,
                resource: resource.id(),
            },
        )
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<()> {
        if desc.vertex_stride == 0 {
            return Err(RenderError::backend("CreateGraphicsPipelineState", "zero vertex stride"));
        }
        debug!("Pipeline: {:?}", desc);
        self.pipeline = Some(*desc);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<TrackedResource> {
        let state = desc.memory.initial_state();
        let id = self.insert_resource(
            Storage::Buffer {
                bytes: vec![0; desc.size as usize].into_boxed_slice(),
            },
            state,
        );
        trace!("Buffer {}: {} bytes ({:?})", id, desc.size, desc.memory);
        Ok(TrackedResource::new(id, state))
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: ResourceState,
    ) -> Result<TrackedResource> {
        let id = self.insert_texture(desc, initial)?;
        trace!("Texture {}: {:?} in {:?}", id, desc, initial);
        Ok(TrackedResource::new(id, initial))
    }

    fn copyable_footprint(&self, desc: &TextureDesc) -> Result<CopyableFootprint> {
        texture_footprint(desc.width, desc.height, desc.format, self.options.pitch_alignment)
    }

    fn map(&mut self, resource: &TrackedResource) -> Result<MappedRegion> {
        let res = self.resource_mut(resource.id())?;
        let Storage::Buffer { bytes, .. } = &mut res.storage else {
            return Err(RenderError::backend("Map", "textures cannot be mapped"));
        };
        let len = bytes.len();
        let ptr = NonNull::new(bytes.as_mut_ptr())
            .ok_or_else(|| RenderError::backend("Map", "empty buffer"))?;
        res.map_count += 1;
        // SAFETY: the boxed slice is never reallocated and is only freed by
        // `release`, after which the engine no longer holds the region
        Ok(unsafe { MappedRegion::new(ptr, len) })
    }

    fn unmap(&mut self, resource: &TrackedResource) {
        if let Some(res) = self.resources.get_mut(&resource.id()) {
            res.map_count = res.map_count.saturating_sub(1);
        }
    }

    fn release(&mut self, resource: TrackedResource) {
        let id = resource.id();
        if self.borrowed_back_buffers.remove(&id) {
            return;
        }
        let in_flight = self.queue.iter().any(|op| match op {
            QueueOp::Execute { commands, .. } => commands.iter().any(|c| references(c, id)),
            QueueOp::Present { buffer } => *buffer == id,
            QueueOp::Signal { .. } => false,
        });
        if in_flight {
            warn!("Resource {} released while queued work still uses it", id);
        }
        match self.resources.remove(&id) {
            Some(res) if res.map_count > 0 => warn!("Resource {} released while mapped", id),
            Some(_) => trace!("Released resource {}", id),
            None => warn!("Attempted to release non-existent resource {}", id),
        }
    }

    fn execute(&mut self, list: &CommandList) -> Result<()> {
        list.ensure_closed()?;
        if list.binds_pipeline() && self.pipeline.is_none() {
            return Err(RenderError::NotInitialized("pipeline state"));
        }
        self.queue.push_back(QueueOp::Execute {
            commands: list.commands().to_vec(),
            binds_pipeline: list.binds_pipeline(),
        });
        Ok(())
    }

    fn create_fence(&mut self, initial_value: u64) -> Result<FenceId> {
        let id = self.next_fence_id;
        self.next_fence_id += 1;
        self.fences.insert(id, initial_value);
        Ok(id)
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()> {
        if !self.fences.contains_key(&fence) {
            return Err(RenderError::UnknownFence(fence));
        }
        self.queue.push_back(QueueOp::Signal { fence, value });
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        self.fences
            .get(&fence)
            .copied()
            .ok_or(RenderError::UnknownFence(fence))
    }

    fn wait_for_value(&mut self, fence: FenceId, value: u64) -> Result<()> {
        while self.completed_value(fence)? < value {
            let op = self.queue.pop_front().ok_or_else(|| {
                RenderError::backend(
                    "WaitForSingleObject",
                    format!("fence {} will never reach {}", fence, value),
                )
            })?;
            self.run(op)?;
        }
        Ok(())
    }
}

fn back_buffer_desc(width: u32, height: u32) -> TextureDesc {
    TextureDesc {
        width,
        height,
        format: Format::Rgba8Unorm,
        usage: TextureUsage::Sampled,
    }
}

fn references(command: &Command, id: ResourceId) -> bool {
    match *command {
        Command::Transition { resource, .. } => resource == id,
        Command::SetVertexBuffer(view) => view.resource == id,
        Command::CopyBufferToTexture {
            source,
            destination,
            ..
        }
        | Command::CopyTextureToBuffer {
            source,
            destination,
            ..
        } => source == id || destination == id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKind;

    fn open_list() -> CommandList {
        let mut list = CommandList::new("test");
        list.reset(false);
        list
    }

    #[test]
    fn test_work_runs_only_when_waited_on() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let fence = gpu.create_fence(0).unwrap();
        let mut tex = gpu
            .create_texture(
                &back_buffer_desc(2, 2),
                ResourceState::CopyDest,
            )
            .unwrap();

        let mut list = open_list();
        list.transition(&mut tex, ResourceState::PixelShaderResource);
        list.close();
        gpu.execute(&list).unwrap();
        gpu.signal(fence, 1).unwrap();

        assert_eq!(gpu.gpu_state(tex.id()), Some(ResourceState::CopyDest));
        assert_eq!(gpu.pending_operations(), 2);

        gpu.wait_for_value(fence, 1).unwrap();
        assert_eq!(gpu.gpu_state(tex.id()), Some(ResourceState::PixelShaderResource));
        assert_eq!(gpu.completed_value(fence).unwrap(), 1);
    }

    #[test]
    fn test_barrier_mismatch_is_caught() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let tex = gpu
            .create_texture(&back_buffer_desc(1, 1), ResourceState::CopyDest)
            .unwrap();

        // a tracker that disagrees with the GPU
        let mut stale = TrackedResource::new(tex.id(), ResourceState::RenderTarget);
        let mut list = open_list();
        list.transition(&mut stale, ResourceState::Present);
        list.close();
        gpu.execute(&list).unwrap();

        assert!(matches!(
            gpu.flush(),
            Err(RenderError::BarrierMismatch {
                before: ResourceState::RenderTarget,
                actual: ResourceState::CopyDest,
                ..
            })
        ));
    }

    #[test]
    fn test_open_list_is_refused() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let list = open_list();
        assert!(matches!(gpu.execute(&list), Err(RenderError::CommandListOpen)));
    }

    #[test]
    fn test_wait_without_signal_fails() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let fence = gpu.create_fence(0).unwrap();
        assert!(gpu.wait_for_value(fence, 1).is_err());
    }

    #[test]
    fn test_present_rotates_index() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        gpu.create_swap_chain(&Surface::headless(8, 8), 2).unwrap();
        assert_eq!(gpu.current_back_buffer_index().unwrap(), 0);
        gpu.present(1).unwrap();
        assert_eq!(gpu.current_back_buffer_index().unwrap(), 1);
        gpu.present(1).unwrap();
        assert_eq!(gpu.current_back_buffer_index().unwrap(), 0);
        gpu.flush().unwrap();
        assert_eq!(gpu.presented_frames(), 2);
    }

    #[test]
    fn test_resize_requires_released_back_buffers() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        gpu.create_swap_chain(&Surface::headless(8, 8), 2).unwrap();
        let buffer = gpu.back_buffer(0).unwrap();
        assert!(gpu.resize_swap_chain(16, 16).is_err());

        gpu.release(buffer);
        gpu.resize_swap_chain(16, 16).unwrap();
        let buffer = gpu.back_buffer(1).unwrap();
        assert_eq!(gpu.texture_desc(buffer.id()).unwrap().width, 16);
    }

    #[test]
    fn test_empty_surface_rejected() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        assert!(matches!(
            gpu.create_swap_chain(&Surface::headless(0, 8), 2),
            Err(RenderError::EmptySurface { .. })
        ));
    }

    #[test]
    fn test_view_must_match_heap_kind() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let rtv_heap = gpu
            .create_descriptor_heap(HeapKind::RenderTarget, 2, false)
            .unwrap();
        let tex = gpu
            .create_texture(&back_buffer_desc(4, 4), ResourceState::PixelShaderResource)
            .unwrap();
        assert!(gpu.create_shader_resource_view(&tex, rtv_heap.cpu_start).is_err());
        gpu.create_render_target_view(&tex, rtv_heap.cpu_start).unwrap();
        assert_eq!(gpu.view_at(rtv_heap.cpu_start), Some(tex.id()));
    }

    #[test]
    fn test_misaligned_descriptor_rejected() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let heap = gpu
            .create_descriptor_heap(HeapKind::RenderTarget, 2, false)
            .unwrap();
        let tex = gpu
            .create_texture(&back_buffer_desc(4, 4), ResourceState::Present)
            .unwrap();
        let bad = CpuDescriptor {
            ptr: heap.cpu_start.ptr + 8,
        };
        assert!(gpu.create_render_target_view(&tex, bad).is_err());
    }

    #[test]
    fn test_mapped_writes_are_visible_to_copies() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let fence = gpu.create_fence(0).unwrap();
        let desc = back_buffer_desc(2, 1);
        let fp = gpu.copyable_footprint(&desc).unwrap();
        let tex = gpu.create_texture(&desc, ResourceState::CopyDest).unwrap();
        let staging = gpu
            .create_buffer(&BufferDesc {
                size: fp.total_bytes,
                memory: MemoryKind::Upload,
            })
            .unwrap();

        let mut region = gpu.map(&staging).unwrap();
        region.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        drop(region);
        gpu.unmap(&staging);

        let mut list = open_list();
        list.copy_buffer_to_texture(&staging, &fp.placed, &tex).unwrap();
        list.close();
        gpu.execute(&list).unwrap();
        gpu.signal(fence, 1).unwrap();
        gpu.wait_for_value(fence, 1).unwrap();

        assert_eq!(gpu.texture_data(tex.id()).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(gpu.sample(tex.id(), 0.0, 0.0).unwrap(), [1, 2, 3, 4]);
        assert_eq!(gpu.sample(tex.id(), 1.0, 1.0).unwrap(), [5, 6, 7, 8]);
    }

    #[test]
    fn test_unaligned_footprint_rejected() {
        let mut gpu = HeadlessBackend::new(HeadlessOptions::default());
        let desc = back_buffer_desc(2, 2);
        let tex = gpu.create_texture(&desc, ResourceState::CopyDest).unwrap();
        let staging = gpu
            .create_buffer(&BufferDesc {
                size: 16,
                memory: MemoryKind::Upload,
            })
            .unwrap();
        // tightly packed rows: the naive bulk copy layout
        let packed = PlacedFootprint {
            offset: 0,
            format: Format::Rgba8Unorm,
            width: 2,
            height: 2,
            row_pitch: 8,
        };

        let mut list = open_list();
        list.copy_buffer_to_texture(&staging, &packed, &tex).unwrap();
        list.close();
        gpu.execute(&list).unwrap();
        assert!(gpu.flush().is_err());
    }
}
