//! Window collaborator and event loop using winit

use std::sync::Arc;
use winit::{
    dpi::PhysicalSize,
    error::{EventLoopError, OsError},
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window as WinitWindow, WindowBuilder},
};

/// The surface the RHI renders into: client-area size plus an optional native window.
///
/// A window without a native handle is headless; the device then renders to an
/// offscreen back buffer.
#[derive(Debug, Clone)]
pub struct Window {
    native: Option<Arc<WinitWindow>>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
}

impl Window {
    /// Create a native window with the given title and client size
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, OsError> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)?;

        let size = window.inner_size();
        Ok(Self {
            native: Some(Arc::new(window)),
            width: size.width,
            height: size.height,
            resized: false,
            close_requested: false,
        })
    }

    /// A window with no native surface
    pub fn headless(width: u32, height: u32) -> Self {
        Self {
            native: None,
            width,
            height,
            resized: false,
            close_requested: false,
        }
    }

    /// Native window for surface creation, if any
    pub fn native(&self) -> Option<Arc<WinitWindow>> {
        self.native.clone()
    }

    /// Current client-area dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check if the window was resized since the flag was last cleared
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Track size and close requests
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    pub fn request_redraw(&self) {
        if let Some(window) = &self.native {
            window.request_redraw();
        }
    }
}

/// What the frame callback is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// The client area changed size
    Resized { width: u32, height: u32 },
    /// A key went down
    KeyPressed(KeyCode),
    /// Run one HandleEvents/Update/Render iteration
    Frame,
}

/// Run the event loop, forwarding resizes, key presses and frame ticks to `callback`.
pub fn run<F>(
    event_loop: EventLoop<()>,
    mut window: Window,
    mut callback: F,
) -> Result<(), EventLoopError>
where
    F: FnMut(&mut Window, FrameEvent) + 'static,
{
    event_loop.run(move |event, elwt: &EventLoopWindowTarget<()>| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => {
                window.handle_event(&event);

                match event {
                    WindowEvent::CloseRequested => elwt.exit(),
                    WindowEvent::Resized(size) => callback(
                        &mut window,
                        FrameEvent::Resized {
                            width: size.width,
                            height: size.height,
                        },
                    ),
                    WindowEvent::KeyboardInput {
                        event:
                            KeyEvent {
                                physical_key: PhysicalKey::Code(code),
                                state: ElementState::Pressed,
                                repeat: false,
                                ..
                            },
                        ..
                    } => {
                        if code == KeyCode::Escape {
                            elwt.exit();
                        } else {
                            callback(&mut window, FrameEvent::KeyPressed(code));
                        }
                    }
                    WindowEvent::RedrawRequested => callback(&mut window, FrameEvent::Frame),
                    _ => {}
                }
            }
            Event::AboutToWait => {
                window.request_redraw();
            }
            _ => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_window_has_no_native_surface() {
        let window = Window::headless(800, 600);
        assert!(window.native().is_none());
        assert_eq!(window.dimensions(), (800, 600));
    }

    #[test]
    fn test_resize_event_updates_dimensions() {
        let mut window = Window::headless(800, 600);
        window.handle_event(&WindowEvent::Resized(PhysicalSize::new(1920, 1080)));
        assert!(window.was_resized());
        assert_eq!(window.dimensions(), (1920, 1080));

        window.clear_resize_flag();
        assert!(!window.was_resized());
    }
}
