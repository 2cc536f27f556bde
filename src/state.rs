//! Resource State Tracking
//!
//! Each resource the engine holds carries the state it will be in once all
//! recorded work has executed. Barriers take their `before` state from here.

use crate::backend::ResourceId;
use crate::error::{RenderError, Result};

/// Usage state of a GPU resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Present,
    RenderTarget,
    CopyDest,
    CopySource,
    PixelShaderResource,
    DepthWrite,
    GenericRead,
}

/// A GPU resource exclusively owned by the engine, plus its tracked state.
///
/// Deliberately not `Clone`: giving the handle back to the backend
/// (`Backend::release`) consumes it.
#[derive(Debug)]
pub struct TrackedResource {
    id: ResourceId,
    state: ResourceState,
}

impl TrackedResource {
    pub fn new(id: ResourceId, state: ResourceState) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Fail unless the resource is currently in `expected`.
    pub fn ensure_state(&self, expected: ResourceState) -> Result<()> {
        if self.state != expected {
            return Err(RenderError::InvalidResourceState {
                resource: self.id,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Record the new state; returns the previous one.
    pub(crate) fn set_state(&mut self, state: ResourceState) -> ResourceState {
        std::mem::replace(&mut self.state, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_state() {
        let res = TrackedResource::new(7, ResourceState::CopyDest);
        assert!(res.ensure_state(ResourceState::CopyDest).is_ok());

        match res.ensure_state(ResourceState::PixelShaderResource) {
            Err(RenderError::InvalidResourceState {
                resource,
                expected,
                actual,
            }) => {
                assert_eq!(resource, 7);
                assert_eq!(expected, ResourceState::PixelShaderResource);
                assert_eq!(actual, ResourceState::CopyDest);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_set_state_returns_previous() {
        let mut res = TrackedResource::new(1, ResourceState::Present);
        assert_eq!(res.set_state(ResourceState::RenderTarget), ResourceState::Present);
        assert_eq!(res.state(), ResourceState::RenderTarget);
    }
}
