//! Frame Resource Ring
//!
//! Owns the swap chain's back buffers and their render target views. The
//! current index always comes from the swap chain; under flip-discard the
//! driver decides which buffer is handed out next.

use tracing::{debug, trace};

use crate::backend::{Backend, CpuDescriptor};
use crate::descriptor::DescriptorHeaps;
use crate::error::{RenderError, Result};
use crate::state::TrackedResource;

/// Number of swap chain buffers
pub const FRAME_COUNT: u32 = 2;

pub struct FrameResources {
    back_buffers: Vec<TrackedResource>,
    current: u32,
}

impl FrameResources {
    /// Fetch every back buffer and write its RTV at the matching heap slot.
    pub fn create<B: Backend>(backend: &mut B, heaps: &DescriptorHeaps) -> Result<Self> {
        let mut back_buffers = Vec::with_capacity(FRAME_COUNT as usize);
        for index in 0..FRAME_COUNT {
            let buffer = backend.back_buffer(index)?;
            backend.create_render_target_view(&buffer, heaps.render_target(index)?)?;
            debug!("Back buffer {} is resource {}", index, buffer.id());
            back_buffers.push(buffer);
        }

        let mut frames = Self {
            back_buffers,
            current: 0,
        };
        frames.refresh_index(backend)?;
        Ok(frames)
    }

    pub fn current_index(&self) -> u32 {
        self.current
    }

    /// Re-query the swap chain for the buffer to render into next.
    pub fn refresh_index<B: Backend>(&mut self, backend: &B) -> Result<u32> {
        let index = backend.current_back_buffer_index()?;
        if index >= self.back_buffers.len() as u32 {
            return Err(RenderError::BackBufferIndex {
                index,
                count: self.back_buffers.len() as u32,
            });
        }
        trace!("Current back buffer: {}", index);
        self.current = index;
        Ok(index)
    }

    /// Current back buffer together with its RTV.
    pub fn current_mut(
        &mut self,
        heaps: &DescriptorHeaps,
    ) -> Result<(&mut TrackedResource, CpuDescriptor)> {
        let rtv = heaps.render_target(self.current)?;
        let count = self.back_buffers.len() as u32;
        let buffer = self
            .back_buffers
            .get_mut(self.current as usize)
            .ok_or(RenderError::BackBufferIndex {
                index: self.current,
                count,
            })?;
        Ok((buffer, rtv))
    }

    #[cfg(test)]
    pub fn back_buffers(&self) -> &[TrackedResource] {
        &self.back_buffers
    }

    /// Hand every back buffer back to the backend (before a resize or teardown).
    pub fn release<B: Backend>(&mut self, backend: &mut B) {
        for buffer in self.back_buffers.drain(..) {
            backend.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, HeadlessOptions};
    use crate::backend::Surface;
    use crate::state::ResourceState;

    fn setup() -> (HeadlessBackend, DescriptorHeaps) {
        let mut backend = HeadlessBackend::new(HeadlessOptions::default());
        backend
            .create_swap_chain(&Surface::headless(64, 32), FRAME_COUNT)
            .unwrap();
        let heaps = DescriptorHeaps::create(&mut backend).unwrap();
        (backend, heaps)
    }

    #[test]
    fn test_create_wraps_every_back_buffer() {
        let (mut backend, heaps) = setup();
        let frames = FrameResources::create(&mut backend, &heaps).unwrap();
        assert_eq!(frames.back_buffers().len(), 2);
        assert!(frames
            .back_buffers()
            .iter()
            .all(|b| b.state() == ResourceState::Present));
        assert_eq!(frames.current_index(), 0);
    }

    #[test]
    fn test_index_follows_swap_chain() {
        let (mut backend, heaps) = setup();
        let mut frames = FrameResources::create(&mut backend, &heaps).unwrap();

        backend.present(0).unwrap();
        assert_eq!(frames.refresh_index(&backend).unwrap(), 1);
        backend.present(0).unwrap();
        assert_eq!(frames.refresh_index(&backend).unwrap(), 0);
    }

    #[test]
    fn test_current_rtv_matches_index() {
        let (mut backend, heaps) = setup();
        let mut frames = FrameResources::create(&mut backend, &heaps).unwrap();
        backend.present(0).unwrap();
        frames.refresh_index(&backend).unwrap();

        let expected = heaps.render_target(1).unwrap();
        let (buffer, rtv) = frames.current_mut(&heaps).unwrap();
        assert_eq!(rtv, expected);
        assert_eq!(buffer.state(), ResourceState::Present);
    }

    #[test]
    fn test_release_empties_ring() {
        let (mut backend, heaps) = setup();
        let mut frames = FrameResources::create(&mut backend, &heaps).unwrap();
        frames.release(&mut backend);
        assert!(frames.back_buffers().is_empty());
        assert!(frames.current_mut(&heaps).is_err());
    }
}
