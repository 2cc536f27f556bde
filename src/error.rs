//! Engine Error Module
//!
//! Every failure below the application boundary is a [`RenderError`]. None of
//! them are recoverable: the service loop logs the error and terminates.

use thiserror::Error;

use crate::backend::{FenceId, HeapId, ResourceId};
use crate::state::ResourceState;

/// Engine result alias
pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    /// A native API call failed (device, queue, swap chain, heap, resource, fence...)
    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    /// A resource was used in a state it was not transitioned into
    #[error("resource {resource} is in state {actual:?}, expected {expected:?}")]
    InvalidResourceState {
        resource: ResourceId,
        expected: ResourceState,
        actual: ResourceState,
    },

    /// A GPU-side barrier named a `before` state the resource is not in
    #[error("barrier on resource {resource} expects {before:?} but resource is {actual:?}")]
    BarrierMismatch {
        resource: ResourceId,
        before: ResourceState,
        actual: ResourceState,
    },

    #[error("descriptor slot {index} out of range for heap of capacity {capacity}")]
    DescriptorOutOfRange { index: u32, capacity: u32 },

    #[error("descriptor heap {0} is not shader visible")]
    HeapNotShaderVisible(HeapId),

    #[error("image has zero width or height ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    PixelBufferSize { expected: usize, actual: usize },

    #[error("alignment {0} is not a non-zero power of two")]
    InvalidAlignment(u32),

    #[error("surface has zero width or height ({width}x{height})")]
    EmptySurface { width: u32, height: u32 },

    #[error("command list executed while still open")]
    CommandListOpen,

    #[error("unknown resource id {0}")]
    UnknownResource(ResourceId),

    #[error("unknown descriptor heap id {0}")]
    UnknownHeap(HeapId),

    #[error("unknown fence id {0}")]
    UnknownFence(FenceId),

    #[error("back buffer index {index} outside swap chain of {count} buffers")]
    BackBufferIndex { index: u32, count: u32 },

    #[error("{stage} shader failed to compile: {message}")]
    #[cfg_attr(not(windows), allow(dead_code))]
    ShaderCompile { stage: &'static str, message: String },

    /// Draw-time validation failure reported by the simulated GPU
    #[error("invalid draw: {0}")]
    InvalidDraw(String),

    #[error("vertex data of {0} bytes does not fit a vertex buffer view")]
    VertexDataTooLarge(usize),

    #[error("{0} used before it was created")]
    NotInitialized(&'static str),
}

impl RenderError {
    pub fn backend(operation: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            operation,
            message: message.to_string(),
        }
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for RenderError {
    fn from(error: windows::core::Error) -> Self {
        Self::backend("Direct3D call", error.message())
    }
}
