// Window - the windowing collaborator of the frame loop
//
// winit drives events through ApplicationHandler; the loop pumps it without
// blocking once per frame instead of handing control to run_app.

use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::c_char;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

use crate::backend::swapchain::SurfaceTarget;
use crate::config::WindowConfig;
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::frame_loop::EventPump;

/// Upper bound on pump rounds spent waiting for the window to appear
const CREATE_ATTEMPTS: usize = 100;

struct WindowState {
    attributes: WindowAttributes,
    window: Option<Window>,
    create_error: Option<String>,
    close_requested: bool,
    resized: Option<(u32, u32)>,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(window),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.create_error = Some(e.to_string());
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resized = Some((size.width, size.height));
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                }
            }
            _ => {}
        }
    }
}

pub struct AppWindow {
    // Window (inside state) is dropped before the event loop
    state: WindowState,
    event_loop: EventLoop<()>,
    title: String,
}

impl AppWindow {
    pub fn new(config: &WindowConfig) -> RenderResult<Self> {
        let mut event_loop =
            EventLoop::new().map_err(|e| RenderError::Window(e.to_string()))?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(config.width, config.height));

        let mut state = WindowState {
            attributes,
            window: None,
            create_error: None,
            close_requested: false,
            resized: None,
        };

        // The window is created in `resumed`, which arrives on the first pumps
        for _ in 0..CREATE_ATTEMPTS {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::from_millis(10)), &mut state)
            {
                return Err(RenderError::Window(format!(
                    "event loop exited during startup (code {})",
                    code
                )));
            }
            if let Some(error) = state.create_error.take() {
                return Err(RenderError::Window(error));
            }
            if state.window.is_some() {
                break;
            }
        }
        if state.window.is_none() {
            return Err(RenderError::Window("window was never created".to_string()));
        }

        // Startup resize events describe the initial size, not a change
        state.resized = None;

        Ok(Self {
            state,
            event_loop,
            title: config.title.clone(),
        })
    }

    fn window(&self) -> RenderResult<&Window> {
        self.state
            .window
            .as_ref()
            .ok_or_else(|| RenderError::Window("window is gone".to_string()))
    }

    /// Instance extensions needed to present to this window
    pub fn required_extensions(&self) -> RenderResult<Vec<*const c_char>> {
        let window = self.window()?;
        let extensions = ash_window::enumerate_required_extensions(window.raw_display_handle())
            .call("vkEnumerateInstanceExtensionProperties")?;
        Ok(extensions.to_vec())
    }

    pub fn surface_target(&self) -> RenderResult<SurfaceTarget> {
        let window = self.window()?;
        let size = window.inner_size();
        Ok(SurfaceTarget {
            display: window.raw_display_handle(),
            window: window.raw_window_handle(),
            width: size.width,
            height: size.height,
        })
    }
}

impl EventPump for AppWindow {
    fn poll_events(&mut self) -> RenderResult<()> {
        if let PumpStatus::Exit(_) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state)
        {
            self.state.close_requested = true;
        }
        Ok(())
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        self.state
            .window
            .as_ref()
            .map_or((0, 0), |window| {
                let size = window.inner_size();
                (size.width, size.height)
            })
    }

    fn take_resize(&mut self) -> Option<(u32, u32)> {
        self.state.resized.take()
    }

    fn report_fps(&mut self, fps: f32, frame_ms: f32) {
        if let Some(window) = &self.state.window {
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms)",
                self.title, fps, frame_ms
            ));
        }
    }
}
