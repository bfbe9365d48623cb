// src/lib.rs

pub mod assets;
pub mod camera;
pub mod config;
pub mod context;
pub mod cube;
pub mod error;
pub mod fps_counter;
pub mod frame;
pub mod gltf_loader;
pub mod gpu;
pub mod gui;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod skybox;
pub mod time;
pub mod transform;
pub mod uniforms;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::anyhow;
use log::{error, info};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

pub use config::DemoConfig;
pub use context::{Context, OptionContext};
pub use error::{Error, FrameError, Result};
pub use renderer::{CubeProgram, Program};

use gpu::WgpuDevice;
use time::FrameTimer;

/// Opens the window and runs the demo until it quits or fails.
pub fn run(config: DemoConfig) -> anyhow::Result<()> {
    config.validate()?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = DemoApp {
        config,
        timer: FrameTimer::new(),
        running: None,
        error: None,
    };
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ----------------------------------------------------------------------------
// winit 0.30 + wgpu 22 App State
// ----------------------------------------------------------------------------

/// Everything that lives while the window is open. Fields drop in order:
/// GPU resources before the device, the device before the window.
struct Running {
    program: CubeProgram<WgpuDevice>,
    gui_state: egui_winit::State,
    device: Arc<WgpuDevice>,
    window: Arc<Window>,
}

struct DemoApp {
    config: DemoConfig,
    timer: FrameTimer,
    running: Option<Running>,
    error: Option<anyhow::Error>,
}

impl DemoApp {
    fn start(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<Running> {
        let win = &self.config.window;
        let attrs = Window::default_attributes()
            .with_title(win.title.clone())
            .with_inner_size(LogicalSize::new(win.width, win.height))
            .with_resizable(win.resizable);
        let window = Arc::new(event_loop.create_window(attrs)?);

        let device = Arc::new(WgpuDevice::new(Arc::clone(&window), win.vsync)?);
        let mut program = CubeProgram::new(Arc::clone(&device), self.config.clone());
        program.init()?;

        let gui_state = egui_winit::State::new(
            program.gui_context(),
            egui::ViewportId::ROOT,
            &*window,
            Some(window.scale_factor() as f32),
            None,
            None,
        );

        Ok(Running {
            program,
            gui_state,
            device,
            window,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.error = Some(e);
        self.running = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }
        match self.start(event_loop) {
            Ok(running) => {
                running.window.request_redraw();
                self.running = Some(running);
                info!("Window open");
            }
            Err(e) => self.fail(event_loop, e.context("initialization failed")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(running) = self.running.as_mut() else { return };
        if running.window.id() != window_id {
            return;
        }

        let _ = running.gui_state.on_window_event(&running.window, &event);
        if !running.program.poll(&event) {
            self.fail(event_loop, anyhow!("event polling failed"));
            return;
        }

        match event {
            WindowEvent::Resized(size) => {
                running.device.resize(size.width, size.height);
            }
            WindowEvent::RedrawRequested => {
                let dt = self.timer.tick();
                let size = running.window.inner_size();
                let raw_input = running.gui_state.take_egui_input(&running.window);
                running.program.set_gui_input(raw_input, [size.width, size.height]);
                running.program.update(dt);

                if !running.program.draw() {
                    self.fail(event_loop, anyhow!("frame {} failed to draw", self.timer.frame()));
                    return;
                }
                if let Some(output) = running.program.take_platform_output() {
                    running.gui_state.handle_platform_output(&running.window, output);
                }
            }
            _ => {}
        }

        if running.program.should_quit() {
            info!("Quit requested after {} frames", self.timer.frame());
            self.running = None;
            event_loop.exit();
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running) = &self.running {
            running.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.running = None;
    }
}
