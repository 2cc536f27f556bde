//! Presentation Module
//!
//! Where frames go: nowhere (headless) or a borderless Win32 window covering
//! the desktop. The window procedure only translates messages into
//! [`WindowEvent`]s; the service loop decides what to do with them.

use std::str::FromStr;

use anyhow::{bail, Result};

use crate::input::Key;

/// Presentation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationMode {
    /// Render a fixed number of frames without a window
    Headless,
    /// Create a window and present frames
    Windowed,
}

impl FromStr for PresentationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "headless" => Ok(Self::Headless),
            "windowed" => Ok(Self::Windowed),
            other => bail!("unknown presentation mode '{}'", other),
        }
    }
}

/// Virtual-key code of the Escape key
const VIRTUAL_KEY_ESCAPE: u16 = 0x1B;

/// Map a Win32 virtual-key code to a viewer key.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn map_virtual_key(code: u16) -> Option<Key> {
    match code {
        c if c == b'W' as u16 => Some(Key::W),
        c if c == b'A' as u16 => Some(Key::A),
        c if c == b'S' as u16 => Some(Key::S),
        c if c == b'D' as u16 => Some(Key::D),
        VIRTUAL_KEY_ESCAPE => Some(Key::Escape),
        _ => None,
    }
}

#[cfg(windows)]
pub use self::win32::Window;

#[cfg(windows)]
mod win32 {
    use std::ffi::c_void;
    use std::num::NonZeroIsize;

    use anyhow::{Context, Result};
    use raw_window_handle::{RawWindowHandle, Win32WindowHandle};
    use tracing::{debug, info};
    use windows::core::{s, PCSTR};
    use windows::Win32::Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::Graphics::Gdi::{BeginPaint, EndPaint, PAINTSTRUCT};
    use windows::Win32::System::LibraryLoader::GetModuleHandleA;
    use windows::Win32::UI::WindowsAndMessaging::*;

    use super::map_virtual_key;
    use crate::backend::Surface;
    use crate::input::{EventQueue, Key, WindowEvent};

    const CLASS_NAME: PCSTR = s!("MeshViewWindow");

    /// Borderless popup window feeding an event queue.
    pub struct Window {
        hwnd: HWND,
        /// Shared with the window procedure through GWLP_USERDATA
        events: *mut EventQueue,
        width: u32,
        height: u32,
        closed: bool,
    }

    impl Window {
        /// Create and show the window. A zero `width` or `height` means the
        /// desktop size in that direction.
        pub fn create(title: &str, width: u32, height: u32) -> Result<Self> {
            let instance = HINSTANCE::from(unsafe { GetModuleHandleA(None) }?);

            let class = WNDCLASSEXA {
                cbSize: std::mem::size_of::<WNDCLASSEXA>() as u32,
                style: CS_HREDRAW | CS_VREDRAW,
                lpfnWndProc: Some(wndproc),
                hInstance: instance,
                hCursor: unsafe { LoadCursorW(None, IDC_ARROW) }?,
                lpszClassName: CLASS_NAME,
                ..Default::default()
            };
            let atom = unsafe { RegisterClassExA(&class) };
            debug_assert_ne!(atom, 0);

            let width = match width {
                0 => (unsafe { GetSystemMetrics(SM_CXSCREEN) }) as u32,
                w => w,
            };
            let height = match height {
                0 => (unsafe { GetSystemMetrics(SM_CYSCREEN) }) as u32,
                h => h,
            };

            let events = Box::into_raw(Box::new(EventQueue::new()));
            let title = format!("{}\0", title);
            let hwnd = unsafe {
                CreateWindowExA(
                    WINDOW_EX_STYLE::default(),
                    CLASS_NAME,
                    PCSTR(title.as_ptr()),
                    WS_POPUP | WS_VISIBLE,
                    0,
                    0,
                    width as i32,
                    height as i32,
                    None,
                    None,
                    instance,
                    Some(events as *const c_void),
                )
            };
            let hwnd = match hwnd {
                Ok(hwnd) => hwnd,
                Err(e) => {
                    // SAFETY: the window never saw the pointer
                    drop(unsafe { Box::from_raw(events) });
                    return Err(e).context("failed to create window");
                }
            };
            unsafe {
                let _ = ShowWindow(hwnd, SW_SHOW);
            }

            info!("Window created: {}x{}", width, height);
            Ok(Self {
                hwnd,
                events,
                width,
                height,
                closed: false,
            })
        }

        pub fn surface(&self) -> Surface {
            let handle = Win32WindowHandle::new(
                NonZeroIsize::new(self.hwnd.0 as isize).unwrap_or(NonZeroIsize::MIN),
            );
            Surface {
                window: Some(RawWindowHandle::Win32(handle)),
                width: self.width,
                height: self.height,
            }
        }

        /// Dispatch every pending message. Returns `false` once the window is gone.
        pub fn pump(&mut self) -> bool {
            let mut message = MSG::default();
            unsafe {
                while PeekMessageA(&mut message, None, 0, 0, PM_REMOVE).into() {
                    if message.message == WM_QUIT {
                        self.closed = true;
                        break;
                    }
                    let _ = TranslateMessage(&message);
                    DispatchMessageA(&message);
                }
            }
            !self.closed
        }

        pub fn events(&mut self) -> &mut EventQueue {
            // SAFETY: owned by this window; the window procedure only runs
            // inside `pump`, which holds `&mut self`
            unsafe { &mut *self.events }
        }
    }

    impl Drop for Window {
        fn drop(&mut self) {
            unsafe {
                if IsWindow(self.hwnd).as_bool() {
                    let _ = DestroyWindow(self.hwnd);
                }
                drop(Box::from_raw(self.events));
            }
        }
    }

    fn queue_event(window: HWND, event: WindowEvent) {
        let user_data = unsafe { GetWindowLongPtrA(window, GWLP_USERDATA) };
        if let Some(queue) = std::ptr::NonNull::new(user_data as *mut EventQueue) {
            // SAFETY: set from the owning `Window` at WM_CREATE, cleared on WM_DESTROY
            unsafe { (*queue.as_ptr()).push(event) };
        }
    }

    extern "system" fn wndproc(
        window: HWND,
        message: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        match message {
            WM_CREATE => {
                unsafe {
                    let create_struct = &*(lparam.0 as *const CREATESTRUCTA);
                    SetWindowLongPtrA(window, GWLP_USERDATA, create_struct.lpCreateParams as _);
                }
                LRESULT(0)
            }
            WM_KEYDOWN => {
                if let Some(key) = map_virtual_key(wparam.0 as u16) {
                    queue_event(window, WindowEvent::KeyDown(key));
                    if key == Key::Escape {
                        unsafe {
                            let _ = DestroyWindow(window);
                        }
                    }
                }
                LRESULT(0)
            }
            WM_KEYUP => {
                if let Some(key) = map_virtual_key(wparam.0 as u16) {
                    queue_event(window, WindowEvent::KeyUp(key));
                }
                LRESULT(0)
            }
            WM_SIZE => {
                let width = (lparam.0 & 0xFFFF) as u32;
                let height = ((lparam.0 >> 16) & 0xFFFF) as u32;
                queue_event(window, WindowEvent::Resized { width, height });
                LRESULT(0)
            }
            WM_PAINT => {
                // validate the update region or the message is regenerated forever
                let mut paint = PAINTSTRUCT::default();
                unsafe {
                    BeginPaint(window, &mut paint);
                    let _ = EndPaint(window, &paint);
                }
                queue_event(window, WindowEvent::Paint);
                LRESULT(0)
            }
            WM_DESTROY => {
                debug!("Window destroyed");
                queue_event(window, WindowEvent::CloseRequested);
                unsafe {
                    SetWindowLongPtrA(window, GWLP_USERDATA, 0);
                    PostQuitMessage(0);
                }
                LRESULT(0)
            }
            _ => unsafe { DefWindowProcA(window, message, wparam, lparam) },
        }
    }
}
