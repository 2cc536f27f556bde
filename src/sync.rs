//! Fence Synchronizer
//!
//! Full-stall CPU/GPU synchronization: every wait signals the next fence value
//! on the queue and blocks until the GPU has reached it.

use tracing::trace;

use crate::backend::{Backend, FenceId};
use crate::error::Result;

pub struct FenceSynchronizer {
    fence: FenceId,
    next_value: u64,
    last_signaled: u64,
}

impl FenceSynchronizer {
    pub fn create<B: Backend>(backend: &mut B) -> Result<Self> {
        let fence = backend.create_fence(0)?;
        Ok(Self {
            fence,
            next_value: 1,
            last_signaled: 0,
        })
    }

    #[cfg(test)]
    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Value the next wait will signal
    #[cfg(test)]
    pub fn next_value(&self) -> u64 {
        self.next_value
    }

    #[cfg(test)]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Block until all work submitted so far has completed.
    ///
    /// Returns the fence value that was waited on.
    pub fn wait_for_gpu<B: Backend>(&mut self, backend: &mut B) -> Result<u64> {
        let target = self.next_value;
        backend.signal(self.fence, target)?;
        self.last_signaled = target;
        self.next_value += 1;

        if backend.completed_value(self.fence)? < target {
            trace!("Waiting for fence value {}", target);
            backend.wait_for_value(self.fence, target)?;
        }
        Ok(target)
    }

    /// True when the GPU has reached the last signaled value.
    pub fn is_idle<B: Backend>(&self, backend: &B) -> Result<bool> {
        Ok(backend.completed_value(self.fence)? >= self.last_signaled)
    }
}
