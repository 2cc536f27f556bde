//! Input Event Module
//!
//! The window layer pushes events; the service loop drains them in order once
//! per tick and folds key transitions into a held-key set.

use std::collections::{HashSet, VecDeque};

use tracing::trace;

/// Keys the viewer reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    A,
    S,
    D,
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    KeyDown(Key),
    KeyUp(Key),
    Resized { width: u32, height: u32 },
    /// Surface wants a new frame
    Paint,
    CloseRequested,
}

/// FIFO of pending window events
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<WindowEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `event`. A `Paint` is dropped while another one is still pending.
    pub fn push(&mut self, event: WindowEvent) {
        if event == WindowEvent::Paint && self.events.contains(&WindowEvent::Paint) {
            return;
        }
        trace!("Event queued: {:?}", event);
        self.events.push_back(event);
    }

    /// Take every pending event, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = WindowEvent> + '_ {
        self.events.drain(..)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Keys currently held down
#[derive(Debug, Default, Clone)]
pub struct KeyState {
    held: HashSet<Key>,
}

impl KeyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&mut self, key: Key) {
        self.held.insert(key);
    }

    pub fn release(&mut self, key: Key) {
        self.held.remove(&key);
    }

    pub fn is_held(&self, key: Key) -> bool {
        self.held.contains(&key)
    }

    /// Update from a key event; other events are ignored.
    pub fn apply(&mut self, event: &WindowEvent) {
        match *event {
            WindowEvent::KeyDown(key) => self.press(key),
            WindowEvent::KeyUp(key) => self.release(key),
            _ => {}
        }
    }
}

/// What one tick's worth of events asks the service to do
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickRequest {
    pub redraw: bool,
    pub quit: bool,
    /// Last resize seen this tick
    pub resize: Option<(u32, u32)>,
}

/// Drain `queue` in order, updating `keys`.
pub fn process_events(queue: &mut EventQueue, keys: &mut KeyState) -> TickRequest {
    let mut request = TickRequest::default();
    for event in queue.drain() {
        keys.apply(&event);
        match event {
            WindowEvent::KeyDown(Key::Escape) | WindowEvent::CloseRequested => {
                request.quit = true;
            }
            WindowEvent::Resized { width, height } => request.resize = Some((width, height)),
            WindowEvent::Paint => request.redraw = true,
            _ => {}
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let mut queue = EventQueue::new();
        queue.push(WindowEvent::KeyDown(Key::W));
        queue.push(WindowEvent::Paint);
        queue.push(WindowEvent::KeyUp(Key::W));

        let events: Vec<_> = queue.drain().collect();
        assert_eq!(
            events,
            vec![
                WindowEvent::KeyDown(Key::W),
                WindowEvent::Paint,
                WindowEvent::KeyUp(Key::W),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pending_paints_coalesce() {
        let mut queue = EventQueue::new();
        let mut keys = KeyState::new();
        for _ in 0..1000 {
            queue.push(WindowEvent::Paint);
        }
        queue.push(WindowEvent::KeyDown(Key::W));
        queue.push(WindowEvent::Paint);
        assert_eq!(queue.len(), 2);

        let request = process_events(&mut queue, &mut keys);
        assert!(request.redraw);
        assert!(queue.is_empty());

        // one frame request per tick keeps the queue bounded
        for _ in 0..100 {
            queue.push(WindowEvent::Paint);
            queue.push(WindowEvent::Paint);
            assert_eq!(queue.len(), 1);
            assert!(process_events(&mut queue, &mut keys).redraw);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_key_state_tracks_held_keys() {
        let mut keys = KeyState::new();
        keys.apply(&WindowEvent::KeyDown(Key::A));
        keys.apply(&WindowEvent::KeyDown(Key::D));
        keys.apply(&WindowEvent::KeyUp(Key::A));
        keys.apply(&WindowEvent::Paint);
        assert!(!keys.is_held(Key::A));
        assert!(keys.is_held(Key::D));
    }

    #[test]
    fn test_process_events() {
        let mut queue = EventQueue::new();
        let mut keys = KeyState::new();
        queue.push(WindowEvent::KeyDown(Key::S));
        queue.push(WindowEvent::Resized {
            width: 10,
            height: 20,
        });
        queue.push(WindowEvent::Resized {
            width: 30,
            height: 40,
        });
        queue.push(WindowEvent::Paint);

        let request = process_events(&mut queue, &mut keys);
        assert!(request.redraw);
        assert!(!request.quit);
        assert_eq!(request.resize, Some((30, 40)));
        assert!(keys.is_held(Key::S));
    }

    #[test]
    fn test_escape_and_close_quit() {
        let mut keys = KeyState::new();
        for event in [WindowEvent::KeyDown(Key::Escape), WindowEvent::CloseRequested] {
            let mut queue = EventQueue::new();
            queue.push(event);
            assert!(process_events(&mut queue, &mut keys).quit);
        }
    }
}
