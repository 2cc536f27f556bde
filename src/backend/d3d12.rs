//! Direct3D 12 Backend Module
//!
//! Translates recorded command lists into native calls on a single direct
//! queue. Resources, heaps and fences are kept in id maps so the engine never
//! touches a COM pointer.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::mem::{transmute_copy, ManuallyDrop};
use std::ptr::NonNull;

use raw_window_handle::RawWindowHandle;
use tracing::{debug, info, trace, warn};
use windows::core::{s, Interface, PCSTR};
use windows::Win32::Foundation::{
    CloseHandle, HANDLE, HWND, RECT, WAIT_EVENT, WAIT_FAILED, WAIT_OBJECT_0,
};
use windows::Win32::Graphics::Direct3D::Fxc::{
    D3DCompile, D3DCOMPILE_DEBUG, D3DCOMPILE_SKIP_OPTIMIZATION,
};
use windows::Win32::Graphics::Direct3D::{
    ID3DBlob, D3D_FEATURE_LEVEL_12_0, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use super::{
    Backend, BufferDesc, CpuDescriptor, FenceId, GpuDescriptor, HeapId, HeapInfo, HeapKind,
    MappedRegion, MemoryKind, PipelineDesc, ResourceId, Surface, TextureDesc, TextureUsage,
};
use crate::command::{Command, CommandList, PrimitiveTopology};
use crate::error::{RenderError, Result};
use crate::layout::{CopyableFootprint, Format, PlacedFootprint};
use crate::state::{ResourceState, TrackedResource};

const SHADER_SOURCE: &str = include_str!("../shaders.hlsl");

struct NativeResource {
    resource: ID3D12Resource,
    /// Byte size for buffers, zero for textures
    size: u64,
    memory: Option<MemoryKind>,
}

struct SwapChain {
    swap_chain: IDXGISwapChain3,
    buffers: Vec<ResourceId>,
}

struct Pipeline {
    root_signature: ID3D12RootSignature,
    state: ID3D12PipelineState,
}

/// Hardware (or WARP) device with one direct queue.
pub struct D3D12Backend {
    adapter_name: String,
    factory: IDXGIFactory4,
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    fence_event: HANDLE,

    swap_chain: Option<SwapChain>,
    borrowed_back_buffers: HashSet<ResourceId>,
    pipeline: Option<Pipeline>,
    resources: HashMap<ResourceId, NativeResource>,
    heaps: HashMap<HeapId, ID3D12DescriptorHeap>,
    fences: HashMap<FenceId, ID3D12Fence>,
    next_id: u32,
}

impl D3D12Backend {
    /// Create the device and its direct queue.
    pub fn new(use_warp_device: bool) -> Result<Self> {
        info!("Creating D3D12 device...");

        let mut factory_flags = DXGI_CREATE_FACTORY_FLAGS(0);
        if cfg!(debug_assertions) {
            unsafe {
                let mut debug: Option<ID3D12Debug> = None;
                if let Some(debug) = D3D12GetDebugInterface(&mut debug).ok().and(debug) {
                    debug.EnableDebugLayer();
                    factory_flags |= DXGI_CREATE_FACTORY_DEBUG;
                    debug!("D3D12 debug layer enabled");
                } else {
                    warn!("D3D12 debug layer unavailable");
                }
            }
        }

        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(factory_flags) }?;
        let adapter: IDXGIAdapter1 = if use_warp_device {
            unsafe { factory.EnumWarpAdapter() }?
        } else {
            hardware_adapter(&factory)?
        };
        let adapter_name = unsafe { adapter.GetDesc1() }
            .map(|desc| {
                let end = desc.Description.iter().position(|&c| c == 0).unwrap_or(128);
                String::from_utf16_lossy(&desc.Description[..end])
            })
            .unwrap_or_else(|_| "unknown adapter".to_string());

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_12_0, &mut device) }?;
        let device = device.ok_or_else(|| RenderError::backend("D3D12CreateDevice", "no device"))?;

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }?;
        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }?;
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }?;
        unsafe { list.Close() }?;

        let fence_event = unsafe { CreateEventW(None, false, false, None) }?;

        info!("D3D12 device created on {}", adapter_name);
        Ok(Self {
            adapter_name,
            factory,
            device,
            queue,
            allocator,
            list,
            fence_event,
            swap_chain: None,
            borrowed_back_buffers: HashSet::new(),
            pipeline: None,
            resources: HashMap::new(),
            heaps: HashMap::new(),
            fences: HashMap::new(),
            next_id: 1,
        })
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert_resource(
        &mut self,
        resource: ID3D12Resource,
        size: u64,
        memory: Option<MemoryKind>,
    ) -> ResourceId {
        let id = self.allocate_id();
        self.resources.insert(
            id,
            NativeResource {
                resource,
                size,
                memory,
            },
        );
        id
    }

    fn native(&self, id: ResourceId) -> Result<&NativeResource> {
        self.resources.get(&id).ok_or(RenderError::UnknownResource(id))
    }

    fn fence(&self, id: FenceId) -> Result<&ID3D12Fence> {
        self.fences.get(&id).ok_or(RenderError::UnknownFence(id))
    }

    fn swap_chain(&self) -> Result<&SwapChain> {
        self.swap_chain
            .as_ref()
            .ok_or(RenderError::NotInitialized("swap chain"))
    }

    fn register_back_buffers(
        &mut self,
        swap_chain: &IDXGISwapChain3,
        count: u32,
    ) -> Result<Vec<ResourceId>> {
        (0..count)
            .map(|i| {
                let buffer: ID3D12Resource = unsafe { swap_chain.GetBuffer(i) }?;
                Ok(self.insert_resource(buffer, 0, None))
            })
            .collect()
    }

    fn translate(&self, command: &Command) -> Result<()> {
        let list = &self.list;
        unsafe {
            match *command {
                Command::SetDescriptorHeap(id) => {
                    let heap = self.heaps.get(&id).ok_or(RenderError::UnknownHeap(id))?;
                    list.SetDescriptorHeaps(&[Some(heap.clone())]);
                }
                Command::SetGraphicsRootSignature => {
                    let pipeline = self
                        .pipeline
                        .as_ref()
                        .ok_or(RenderError::NotInitialized("pipeline"))?;
                    list.SetGraphicsRootSignature(&pipeline.root_signature);
                }
                Command::SetRootDescriptorTable { parameter, base } => {
                    list.SetGraphicsRootDescriptorTable(parameter, gpu_handle(base));
                }
                Command::SetViewport(v) => list.RSSetViewports(&[D3D12_VIEWPORT {
                    TopLeftX: v.top_left_x,
                    TopLeftY: v.top_left_y,
                    Width: v.width,
                    Height: v.height,
                    MinDepth: v.min_depth,
                    MaxDepth: v.max_depth,
                }]),
                Command::SetScissorRect(r) => list.RSSetScissorRects(&[RECT {
                    left: r.left,
                    top: r.top,
                    right: r.right,
                    bottom: r.bottom,
                }]),
                Command::Transition {
                    resource,
                    before,
                    after,
                } => {
                    let native = self.native(resource)?;
                    list.ResourceBarrier(&[transition_barrier(
                        &native.resource,
                        native_state(before),
                        native_state(after),
                    )]);
                }
                Command::SetRenderTargets { rtv, dsv } => {
                    let rtv = cpu_handle(rtv);
                    let dsv = dsv.map(cpu_handle);
                    let dsv = dsv.as_ref().map(|d| d as *const _);
                    list.OMSetRenderTargets(1, Some(&rtv), false, dsv);
                }
                Command::ClearRenderTarget { rtv, color } => {
                    list.ClearRenderTargetView(cpu_handle(rtv), &color, None);
                }
                Command::ClearDepth { dsv, depth } => {
                    let dsv = cpu_handle(dsv);
                    list.ClearDepthStencilView(dsv, D3D12_CLEAR_FLAG_DEPTH, depth, 0, &[]);
                }
                Command::SetPrimitiveTopology(PrimitiveTopology::TriangleList) => {
                    list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
                }
                Command::SetVertexBuffer(view) => {
                    let native = self.native(view.resource)?;
                    list.IASetVertexBuffers(
                        0,
                        Some(&[D3D12_VERTEX_BUFFER_VIEW {
                            BufferLocation: native.resource.GetGPUVirtualAddress(),
                            SizeInBytes: view.size_in_bytes,
                            StrideInBytes: view.stride_in_bytes,
                        }]),
                    );
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                } => list.DrawInstanced(vertex_count, instance_count, 0, 0),
                Command::CopyBufferToTexture {
                    source,
                    footprint,
                    destination,
                } => {
                    let src = footprint_location(&self.native(source)?.resource, &footprint);
                    let dst = subresource_location(&self.native(destination)?.resource);
                    list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
                }
                Command::CopyTextureToBuffer {
                    source,
                    destination,
                    footprint,
                } => {
                    let src = subresource_location(&self.native(source)?.resource);
                    let dst = footprint_location(&self.native(destination)?.resource, &footprint);
                    list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
                }
            }
        }
        Ok(())
    }
}

impl Drop for D3D12Backend {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.fence_event) } {
            warn!("Failed to close fence event: {}", e);
        }
    }
}

impl Backend for D3D12Backend {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn create_swap_chain(&mut self, surface: &Surface, buffer_count: u32) -> Result<()> {
        let hwnd = match surface.window {
            Some(RawWindowHandle::Win32(handle)) => HWND(handle.hwnd.get() as *mut c_void),
            _ => {
                return Err(RenderError::backend(
                    "CreateSwapChainForHwnd",
                    "surface has no Win32 window",
                ))
            }
        };
        if surface.width == 0 || surface.height == 0 {
            return Err(RenderError::EmptySurface {
                width: surface.width,
                height: surface.height,
            });
        }

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            BufferCount: buffer_count,
            Width: surface.width,
            Height: surface.height,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let swap_chain: IDXGISwapChain3 = unsafe {
            self.factory
                .CreateSwapChainForHwnd(&self.queue, hwnd, &desc, None, None)?
                .cast()?
        };
        unsafe { self.factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }?;

        let buffers = self.register_back_buffers(&swap_chain, buffer_count)?;
        debug!(
            "Swap chain: {} buffers of {}x{}",
            buffer_count, surface.width, surface.height
        );
        self.swap_chain = Some(SwapChain {
            swap_chain,
            buffers,
        });
        Ok(())
    }

    fn back_buffer(&mut self, index: u32) -> Result<TrackedResource> {
        let chain = self.swap_chain()?;
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
        Ok(unsafe { self.swap_chain()?.swap_chain.GetCurrentBackBufferIndex() })
    }

    fn present(&mut self, sync_interval: u32) -> Result<()> {
        let chain = self.swap_chain()?;
        unsafe { chain.swap_chain.Present(sync_interval, DXGI_PRESENT(0)) }.ok()?;
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
        let chain = self
            .swap_chain
            .take()
            .ok_or(RenderError::NotInitialized("swap chain"))?;
        for id in &chain.buffers {
            self.resources.remove(id);
        }

        let count = chain.buffers.len() as u32;
        unsafe {
            chain.swap_chain.ResizeBuffers(
                count,
                width,
                height,
                DXGI_FORMAT_R8G8B8A8_UNORM,
                DXGI_SWAP_CHAIN_FLAG(0),
            )
        }?;
        let buffers = self.register_back_buffers(&chain.swap_chain, count)?;
        debug!("Swap chain resized to {}x{}", width, height);
        self.swap_chain = Some(SwapChain {
            swap_chain: chain.swap_chain,
            buffers,
        });
        Ok(())
    }

    fn descriptor_increment(&self, kind: HeapKind) -> u32 {
        unsafe { self.device.GetDescriptorHandleIncrementSize(heap_type(kind)) }
    }

    fn create_descriptor_heap(
        &mut self,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HeapInfo> {
        let heap: ID3D12DescriptorHeap = unsafe {
            self.device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type(kind),
                NumDescriptors: capacity,
                Flags: if shader_visible {
                    D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
                } else {
                    D3D12_DESCRIPTOR_HEAP_FLAG_NONE
                },
                NodeMask: 0,
            })
        }?;

        let cpu_start = CpuDescriptor {
            ptr: unsafe { heap.GetCPUDescriptorHandleForHeapStart() }.ptr,
        };
        let gpu_start = shader_visible.then(|| GpuDescriptor {
            ptr: unsafe { heap.GetGPUDescriptorHandleForHeapStart() }.ptr,
        });

        let id = self.allocate_id();
        self.heaps.insert(id, heap);
        debug!("Descriptor heap {}: {:?} x{}", id, kind, capacity);
        Ok(HeapInfo {
            id,
            cpu_start,
            gpu_start,
        })
    }

    fn create_render_target_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()> {
        let native = self.native(resource.id())?;
        unsafe {
            self.device
                .CreateRenderTargetView(&native.resource, None, cpu_handle(dest))
        };
        Ok(())
    }

    fn create_depth_stencil_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()> {
        let native = self.native(resource.id())?;
        unsafe {
            self.device
                .CreateDepthStencilView(&native.resource, None, cpu_handle(dest))
        };
        Ok(())
    }

    fn create_constant_buffer_view(
        &mut self,
        resource: &TrackedResource,
        size: u32,
        dest: CpuDescriptor,
    ) -> Result<()> {
        let native = self.native(resource.id())?;
        let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
            BufferLocation: unsafe { native.resource.GetGPUVirtualAddress() },
            SizeInBytes: size,
        };
        unsafe {
            self.device
                .CreateConstantBufferView(Some(&desc), cpu_handle(dest))
        };
        Ok(())
    }

    fn create_shader_resource_view(
        &mut self,
        resource: &TrackedResource,
        dest: CpuDescriptor,
    ) -> Result<()> {
        let native = self.native(resource.id())?;
        let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_SRV {
                    MipLevels: 1,
                    ..Default::default()
                },
            },
        };
        unsafe {
            self.device
                .CreateShaderResourceView(&native.resource, Some(&desc), cpu_handle(dest))
        };
        Ok(())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<()> {
        let root_signature = create_root_signature(&self.device)?;
        let state = create_pipeline_state(&self.device, &root_signature, desc)?;
        debug!("Pipeline: {:?}", desc);
        self.pipeline = Some(Pipeline {
            root_signature,
            state,
        });
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<TrackedResource> {
        let heap_type = match desc.memory {
            MemoryKind::Upload => D3D12_HEAP_TYPE_UPLOAD,
            MemoryKind::Readback => D3D12_HEAP_TYPE_READBACK,
        };
        let state = desc.memory.initial_state();
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: desc.size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            ..Default::default()
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: heap_type,
                    ..Default::default()
                },
                D3D12_HEAP_FLAG_NONE,
                &resource_desc,
                native_state(state),
                None,
                &mut resource,
            )
        }?;
        let resource =
            resource.ok_or_else(|| RenderError::backend("CreateCommittedResource", "no buffer"))?;

        let id = self.insert_resource(resource, desc.size, Some(desc.memory));
        trace!("Buffer {}: {} bytes ({:?})", id, desc.size, desc.memory);
        Ok(TrackedResource::new(id, state))
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: ResourceState,
    ) -> Result<TrackedResource> {
        let (flags, clear) = match desc.usage {
            TextureUsage::Sampled => (D3D12_RESOURCE_FLAG_NONE, None),
            TextureUsage::DepthStencil => (
                D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL,
                Some(D3D12_CLEAR_VALUE {
                    Format: native_format(desc.format),
                    Anonymous: D3D12_CLEAR_VALUE_0 {
                        DepthStencil: D3D12_DEPTH_STENCIL_VALUE {
                            Depth: 1.0,
                            Stencil: 0,
                        },
                    },
                }),
            ),
        };
        let resource_desc = D3D12_RESOURCE_DESC {
            Flags: flags,
            ..texture_resource_desc(desc)
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_DEFAULT,
                    ..Default::default()
                },
                D3D12_HEAP_FLAG_NONE,
                &resource_desc,
                native_state(initial),
                clear.as_ref().map(|c| c as *const _),
                &mut resource,
            )
        }?;
        let resource =
            resource.ok_or_else(|| RenderError::backend("CreateCommittedResource", "no texture"))?;

        let id = self.insert_resource(resource, 0, None);
        trace!("Texture {}: {}x{} {:?}", id, desc.width, desc.height, desc.format);
        Ok(TrackedResource::new(id, initial))
    }

    fn copyable_footprint(&self, desc: &TextureDesc) -> Result<CopyableFootprint> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RenderError::EmptyImage {
                width: desc.width,
                height: desc.height,
            });
        }
        let resource_desc = texture_resource_desc(desc);
        let mut layout = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
        let mut num_rows = 0u32;
        let mut row_size_in_bytes = 0u64;
        let mut total_bytes = 0u64;
        unsafe {
            self.device.GetCopyableFootprints(
                &resource_desc,
                0,
                1,
                0,
                Some(&mut layout),
                Some(&mut num_rows),
                Some(&mut row_size_in_bytes),
                Some(&mut total_bytes),
            )
        };

        Ok(CopyableFootprint {
            placed: PlacedFootprint {
                offset: layout.Offset,
                format: desc.format,
                width: layout.Footprint.Width,
                height: layout.Footprint.Height,
                row_pitch: layout.Footprint.RowPitch,
            },
            num_rows,
            row_size_in_bytes,
            total_bytes,
        })
    }

    fn map(&mut self, resource: &TrackedResource) -> Result<MappedRegion> {
        let native = self.native(resource.id())?;
        // Upload memory is never read back on the CPU
        let read_range = D3D12_RANGE { Begin: 0, End: 0 };
        let read_range = match native.memory {
            Some(MemoryKind::Upload) => Some(&read_range as *const _),
            _ => None,
        };

        let mut data: *mut c_void = std::ptr::null_mut();
        unsafe { native.resource.Map(0, read_range, Some(&mut data)) }?;
        let ptr = NonNull::new(data as *mut u8)
            .ok_or_else(|| RenderError::backend("Map", "null mapping"))?;
        // SAFETY: the committed buffer stays mapped until `unmap` or `release`
        Ok(unsafe { MappedRegion::new(ptr, native.size as usize) })
    }

    fn unmap(&mut self, resource: &TrackedResource) {
        match self.resources.get(&resource.id()) {
            Some(native) => unsafe { native.resource.Unmap(0, None) },
            None => warn!("Attempted to unmap non-existent resource {}", resource.id()),
        }
    }

    fn release(&mut self, resource: TrackedResource) {
        let id = resource.id();
        if self.borrowed_back_buffers.remove(&id) {
            return;
        }
        match self.resources.remove(&id) {
            Some(_) => trace!("Released resource {}", id),
            None => warn!("Attempted to release non-existent resource {}", id),
        }
    }

    fn execute(&mut self, list: &CommandList) -> Result<()> {
        list.ensure_closed()?;
        // The engine waits for the queue to drain after every submission, so
        // the single allocator is always idle here.
        unsafe {
            self.allocator.Reset()?;
            if list.binds_pipeline() {
                let pipeline = self
                    .pipeline
                    .as_ref()
                    .ok_or(RenderError::NotInitialized("pipeline"))?;
                self.list.Reset(&self.allocator, Some(&pipeline.state))?;
            } else {
                self.list.Reset(&self.allocator, None)?;
            }
        }

        let translated = list.commands().iter().try_for_each(|c| self.translate(c));
        unsafe { self.list.Close() }?;
        translated?;

        let native: ID3D12CommandList = self.list.cast()?;
        unsafe { self.queue.ExecuteCommandLists(&[Some(native)]) };
        trace!("Executed {} commands", list.commands().len());
        Ok(())
    }

    fn create_fence(&mut self, initial_value: u64) -> Result<FenceId> {
        let fence: ID3D12Fence =
            unsafe { self.device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE) }?;
        let id = self.allocate_id();
        self.fences.insert(id, fence);
        Ok(id)
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let native = self.fence(fence)?;
        unsafe { self.queue.Signal(native, value) }?;
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        Ok(unsafe { self.fence(fence)?.GetCompletedValue() })
    }

    fn wait_for_value(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let native = self.fence(fence)?;
        unsafe {
            if native.GetCompletedValue() < value {
                native.SetEventOnCompletion(value, self.fence_event)?;
                check_wait(WaitForSingleObject(self.fence_event, INFINITE))?;
            }
        }
        Ok(())
    }
}

/// Anything but a signaled event means the fence wait did not happen.
fn check_wait(result: WAIT_EVENT) -> Result<()> {
    match result {
        WAIT_OBJECT_0 => Ok(()),
        WAIT_FAILED => Err(RenderError::backend(
            "WaitForSingleObject",
            windows::core::Error::from_win32().message(),
        )),
        other => Err(RenderError::backend(
            "WaitForSingleObject",
            format!("unexpected wait result {:#x}", other.0),
        )),
    }
}

fn hardware_adapter(factory: &IDXGIFactory4) -> Result<IDXGIAdapter1> {
    for i in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(i) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => return Err(e.into()),
        };
        let desc = unsafe { adapter.GetDesc1() }?;

        if (DXGI_ADAPTER_FLAG(desc.Flags as i32) & DXGI_ADAPTER_FLAG_SOFTWARE)
            != DXGI_ADAPTER_FLAG_NONE
        {
            continue;
        }

        let supported = unsafe {
            D3D12CreateDevice(
                &adapter,
                D3D_FEATURE_LEVEL_12_0,
                std::ptr::null_mut::<Option<ID3D12Device>>(),
            )
        };
        if supported.is_ok() {
            return Ok(adapter);
        }
    }
    Err(RenderError::backend(
        "EnumAdapters1",
        "no hardware adapter supports feature level 12.0",
    ))
}

/// Two descriptor tables (CBV b0 for the vertex stage, SRV t0 for the pixel
/// stage) and a static linear-wrap sampler at s0.
fn create_root_signature(device: &ID3D12Device) -> Result<ID3D12RootSignature> {
    let cbv_range = D3D12_DESCRIPTOR_RANGE {
        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
        NumDescriptors: 1,
        BaseShaderRegister: 0,
        RegisterSpace: 0,
        OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
    };
    let srv_range = D3D12_DESCRIPTOR_RANGE {
        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
        ..cbv_range
    };
    let parameters = [
        descriptor_table(&cbv_range, D3D12_SHADER_VISIBILITY_VERTEX),
        descriptor_table(&srv_range, D3D12_SHADER_VISIBILITY_PIXEL),
    ];

    let sampler = D3D12_STATIC_SAMPLER_DESC {
        Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressV: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressW: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
        MaxLOD: D3D12_FLOAT32_MAX,
        ShaderRegister: 0,
        RegisterSpace: 0,
        ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        ..Default::default()
    };

    let desc = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: 1,
        pStaticSamplers: &sampler,
        Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
    };

    let mut signature: Option<ID3DBlob> = None;
    let mut error: Option<ID3DBlob> = None;
    let serialized = unsafe {
        D3D12SerializeRootSignature(
            &desc,
            D3D_ROOT_SIGNATURE_VERSION_1,
            &mut signature,
            Some(&mut error),
        )
    };
    if let Err(e) = serialized {
        let message = error
            .map(|blob| blob_text(&blob))
            .unwrap_or_else(|| e.message().to_string());
        return Err(RenderError::backend("D3D12SerializeRootSignature", message));
    }
    let signature = signature
        .ok_or_else(|| RenderError::backend("D3D12SerializeRootSignature", "empty blob"))?;

    Ok(unsafe { device.CreateRootSignature(0, blob_bytes(&signature)) }?)
}

fn descriptor_table(
    range: &D3D12_DESCRIPTOR_RANGE,
    visibility: D3D12_SHADER_VISIBILITY,
) -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                NumDescriptorRanges: 1,
                pDescriptorRanges: range,
            },
        },
        ShaderVisibility: visibility,
    }
}

fn create_pipeline_state(
    device: &ID3D12Device,
    root_signature: &ID3D12RootSignature,
    desc: &PipelineDesc,
) -> Result<ID3D12PipelineState> {
    let vertex_shader = compile_shader("vertex", s!("VSMain"), s!("vs_5_0"))?;
    let pixel_shader = compile_shader("pixel", s!("PSMain"), s!("ps_5_0"))?;

    let input_element_descs = [
        input_element(s!("POSITION"), DXGI_FORMAT_R32G32B32_FLOAT, 0),
        input_element(s!("COLOR"), DXGI_FORMAT_R32G32B32A32_FLOAT, 12),
        input_element(s!("TEXCOORD"), DXGI_FORMAT_R32G32_FLOAT, 28),
    ];

    let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
    rtv_formats[0] = native_format(desc.render_target_format);

    let pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
        pRootSignature: unsafe { transmute_copy(root_signature) },
        VS: D3D12_SHADER_BYTECODE {
            pShaderBytecode: unsafe { vertex_shader.GetBufferPointer() },
            BytecodeLength: unsafe { vertex_shader.GetBufferSize() },
        },
        PS: D3D12_SHADER_BYTECODE {
            pShaderBytecode: unsafe { pixel_shader.GetBufferPointer() },
            BytecodeLength: unsafe { pixel_shader.GetBufferSize() },
        },
        InputLayout: D3D12_INPUT_LAYOUT_DESC {
            pInputElementDescs: input_element_descs.as_ptr(),
            NumElements: input_element_descs.len() as u32,
        },
        RasterizerState: D3D12_RASTERIZER_DESC {
            FillMode: D3D12_FILL_MODE_SOLID,
            CullMode: D3D12_CULL_MODE_BACK,
            DepthClipEnable: true.into(),
            ..Default::default()
        },
        BlendState: D3D12_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            IndependentBlendEnable: false.into(),
            RenderTarget: [D3D12_RENDER_TARGET_BLEND_DESC {
                BlendEnable: false.into(),
                LogicOpEnable: false.into(),
                RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
                ..Default::default()
            }; 8],
        },
        DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
            DepthEnable: true.into(),
            DepthWriteMask: D3D12_DEPTH_WRITE_MASK_ALL,
            DepthFunc: D3D12_COMPARISON_FUNC_LESS,
            StencilEnable: false.into(),
            ..Default::default()
        },
        DSVFormat: native_format(desc.depth_format),
        SampleMask: u32::MAX,
        PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
        NumRenderTargets: 1,
        RTVFormats: rtv_formats,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        ..Default::default()
    };
    debug_assert_eq!(desc.vertex_stride, 36);

    Ok(unsafe { device.CreateGraphicsPipelineState(&pso_desc) }?)
}

fn input_element(semantic: PCSTR, format: DXGI_FORMAT, offset: u32) -> D3D12_INPUT_ELEMENT_DESC {
    D3D12_INPUT_ELEMENT_DESC {
        SemanticName: semantic,
        SemanticIndex: 0,
        Format: format,
        InputSlot: 0,
        AlignedByteOffset: offset,
        InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
        InstanceDataStepRate: 0,
    }
}

fn compile_shader(stage: &'static str, entry_point: PCSTR, target: PCSTR) -> Result<ID3DBlob> {
    let flags = if cfg!(debug_assertions) {
        D3DCOMPILE_DEBUG | D3DCOMPILE_SKIP_OPTIMIZATION
    } else {
        0
    };

    let mut blob: Option<ID3DBlob> = None;
    let mut error: Option<ID3DBlob> = None;
    let result = unsafe {
        D3DCompile(
            SHADER_SOURCE.as_ptr() as *const c_void,
            SHADER_SOURCE.len(),
            None,
            None,
            None,
            entry_point,
            target,
            flags,
            0,
            &mut blob,
            Some(&mut error),
        )
    };
    if let Err(e) = result {
        let message = error
            .map(|blob| blob_text(&blob))
            .unwrap_or_else(|| e.message().to_string());
        return Err(RenderError::ShaderCompile { stage, message });
    }
    blob.ok_or_else(|| RenderError::ShaderCompile {
        stage,
        message: "compiler returned no bytecode".to_string(),
    })
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    }
}

fn blob_text(blob: &ID3DBlob) -> String {
    String::from_utf8_lossy(blob_bytes(blob)).trim_end_matches('\0').to_string()
}

fn texture_resource_desc(desc: &TextureDesc) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        Width: desc.width as u64,
        Height: desc.height,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: native_format(desc.format),
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
        Flags: D3D12_RESOURCE_FLAG_NONE,
        ..Default::default()
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // borrowed pointer; no reference is added or released
                pResource: unsafe { transmute_copy(resource) },
                StateBefore: before,
                StateAfter: after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    }
}

fn subresource_location(resource: &ID3D12Resource) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { transmute_copy(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            SubresourceIndex: 0,
        },
    }
}

fn footprint_location(
    resource: &ID3D12Resource,
    footprint: &PlacedFootprint,
) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { transmute_copy(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: footprint.offset,
                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: native_format(footprint.format),
                    Width: footprint.width,
                    Height: footprint.height,
                    Depth: 1,
                    RowPitch: footprint.row_pitch,
                },
            },
        },
    }
}

fn cpu_handle(descriptor: CpuDescriptor) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE {
        ptr: descriptor.ptr,
    }
}

fn gpu_handle(descriptor: GpuDescriptor) -> D3D12_GPU_DESCRIPTOR_HANDLE {
    D3D12_GPU_DESCRIPTOR_HANDLE {
        ptr: descriptor.ptr,
    }
}

fn heap_type(kind: HeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        HeapKind::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        HeapKind::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
        HeapKind::ShaderResource => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
    }
}

fn native_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::D32Float => DXGI_FORMAT_D32_FLOAT,
    }
}

fn native_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::Foundation::WAIT_TIMEOUT;

    #[test]
    fn test_check_wait_accepts_only_signaled() {
        assert!(check_wait(WAIT_OBJECT_0).is_ok());
        assert!(matches!(
            check_wait(WAIT_FAILED),
            Err(RenderError::Backend { operation: "WaitForSingleObject", .. })
        ));
        assert!(check_wait(WAIT_TIMEOUT).is_err());
    }

    #[test]
    fn test_hardware_adapter_ends_enumeration_cleanly() {
        let factory: IDXGIFactory4 =
            unsafe { CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)) }.unwrap();
        // either a usable adapter or the descriptive error, never the raw
        // end-of-list HRESULT
        match hardware_adapter(&factory) {
            Ok(_) => {}
            Err(RenderError::Backend { message, .. }) => {
                assert!(message.contains("no hardware adapter"), "{}", message);
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}
