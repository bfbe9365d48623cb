// src/renderer.rs
//! The cube demo program: init, per-frame update and draw.

use std::sync::Arc;

use log::{error, info, warn};
use winit::event::{ElementState, WindowEvent};
use winit::keyboard::{Key, NamedKey};

use crate::assets::{DiskImages, ImageSource, MeshProvider};
use crate::config::DemoConfig;
use crate::context::{Context, OptionContext};
use crate::cube::CubeAssets;
use crate::error::{Error, Result};
use crate::fps_counter::FpsCounter;
use crate::frame::Frame;
use crate::gltf_loader::GltfLoader;
use crate::gpu::{GpuDevice, SamplerDesc};
use crate::gui::{FrameStats, Gui, SceneView};
use crate::resources::{GpuResources, TargetFormats};
use crate::scene::SceneState;
use crate::skybox::Skybox;

/// A program drives the GPU device and window it is handed but never
/// creates or destroys them.
pub trait Program {
    /// Creates every GPU resource. Nothing may be drawn before this succeeds.
    fn init(&mut self) -> Result<()>;
    /// Handles one window event. `false` means polling failed.
    fn poll(&mut self, event: &WindowEvent) -> bool;
    /// Advances the scene by `dt` seconds.
    fn update(&mut self, dt: f32);
    /// Records and submits one frame. `false` is fatal.
    fn draw(&mut self) -> bool;
    fn should_quit(&self) -> bool;
}

/// How a frame ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    Presented,
    /// No swapchain image; an empty command buffer was submitted.
    Skipped,
    /// Submission failed; the frame is lost.
    Dropped,
}

pub struct CubeProgram<D: GpuDevice + ?Sized> {
    // Declared before `device` so they release first.
    skybox: Option<Skybox<D>>,
    resources: GpuResources<D>,
    device: Arc<D>,

    config: DemoConfig,
    images: Box<dyn ImageSource>,
    scene: SceneState,

    gui: Gui,
    gui_input: egui::RawInput,
    platform_output: Option<egui::PlatformOutput>,
    window_size: [u32; 2],
    scene_texture: Option<egui::TextureId>,

    fps: FpsCounter,
    stats: FrameStats,
    quit: bool,
}

impl<D: GpuDevice + ?Sized> CubeProgram<D> {
    pub fn new(device: Arc<D>, config: DemoConfig) -> Self {
        let scene = SceneState::from_config(&config);
        let window_size = [config.window.width, config.window.height];
        Self {
            skybox: None,
            resources: GpuResources::new(Arc::clone(&device)),
            device,
            config,
            images: Box::new(DiskImages),
            scene,
            gui: Gui::new(),
            gui_input: egui::RawInput::default(),
            platform_output: None,
            window_size,
            scene_texture: None,
            fps: FpsCounter::new(),
            stats: FrameStats::default(),
            quit: false,
        }
    }

    /// Replaces the image decoder used for the cube texture and skybox faces.
    pub fn with_image_source(mut self, images: Box<dyn ImageSource>) -> Self {
        self.images = images;
        self
    }

    pub fn scene(&self) -> &SceneState {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut SceneState {
        &mut self.scene
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// The egui context the window's input translator must feed.
    pub fn gui_context(&self) -> egui::Context {
        self.gui.context().clone()
    }

    pub fn resources(&self) -> &GpuResources<D> {
        &self.resources
    }

    /// Input for the next GUI frame and the window size it is drawn at.
    pub fn set_gui_input(&mut self, raw_input: egui::RawInput, window_size: [u32; 2]) {
        self.gui_input = raw_input;
        self.window_size = window_size;
    }

    /// Platform output (cursor, clipboard) of the last GUI frame.
    pub fn take_platform_output(&mut self) -> Option<egui::PlatformOutput> {
        self.platform_output.take()
    }

    fn load_mesh_provider(&self) -> Result<Box<dyn MeshProvider>> {
        let provider: Box<dyn MeshProvider> = match &self.config.model {
            Some(path) => Box::new(GltfLoader::load(path)?),
            None => Box::new(CubeAssets::load(&self.config.texture, &*self.images)?),
        };
        Ok(provider)
    }

    fn register_scene_texture(&mut self) -> Result<()> {
        let color = self
            .resources
            .color_target()
            .context("color target was not created")?;
        let id = self.device.register_gui_texture(color)?;
        if let Some(old) = self.scene_texture.replace(id) {
            self.device.unregister_gui_texture(old);
        }
        Ok(())
    }

    /// Recreates the scene targets at the new size and points the GUI at
    /// the new color target.
    fn resize_viewport(&mut self, width: u32, height: u32) -> Result<()> {
        self.resources.recreate_render_targets(width, height)?;
        self.register_scene_texture()?;
        self.scene.set_viewport(width, height);
        info!("Scene viewport resized to {}x{}", width, height);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<FrameOutcome> {
        let device = Arc::clone(&self.device);
        let mut frame = Frame::begin(&*device).context("acquire_command_buffer")?;

        let swapchain = frame
            .acquire_swapchain_texture()
            .context("acquire_swapchain_texture")?;
        if swapchain.is_none() {
            return Ok(submit_frame(frame, FrameOutcome::Skipped));
        }

        let uniforms = self.scene.uniforms();
        let inputs = self.resources.scene_inputs(
            self.scene.wireframe,
            self.config.clear_color,
            self.scene.instancing.instance_count(),
        )?;
        frame
            .render_scene_pass(&uniforms, &inputs, self.skybox.as_ref())
            .context("render_scene_pass")?;

        let view = SceneView {
            texture: self.scene_texture,
            size: self.scene.viewport,
        };
        let output = self.gui.build(
            std::mem::take(&mut self.gui_input),
            self.window_size,
            &mut self.scene,
            view,
            &self.stats,
        );
        self.platform_output = Some(output.platform_output);
        frame
            .render_gui_pass(output.draw_data)
            .context("render_gui_pass")?;

        Ok(submit_frame(frame, FrameOutcome::Presented))
    }
}

fn submit_frame<D: GpuDevice + ?Sized>(frame: Frame<'_, D>, outcome: FrameOutcome) -> FrameOutcome {
    match frame.submit() {
        Ok(()) => outcome,
        Err(e) => {
            warn!("submit: {e}; dropping frame");
            FrameOutcome::Dropped
        }
    }
}

impl<D: GpuDevice + ?Sized> Program for CubeProgram<D> {
    fn init(&mut self) -> Result<()> {
        let shaders = &self.config.shaders;
        self.resources
            .load_shaders(&shaders.vertex, &shaders.fragment)
            .context("loading scene shaders")?;
        self.resources.create_pipelines(TargetFormats::SCENE)?;

        let provider = self.load_mesh_provider().context("loading mesh")?;
        let mesh = provider
            .meshes()
            .first()
            .ok_or_else(|| Error::init("no mesh to draw"))?;
        let image = provider
            .surfaces()
            .first()
            .ok_or_else(|| Error::init("no texture for the mesh"))?;
        info!(
            "Mesh {}: {} vertices, {} indices",
            mesh.name,
            mesh.vertices.len(),
            mesh.indices.len()
        );

        self.resources
            .send_vertex_data(&mesh.vertices, &mesh.indices)
            .context("sending vertex data")?;
        self.resources.create_sampler(&SamplerDesc::default())?;
        let (width, height) = self.scene.viewport;
        self.resources.create_render_targets(width, height)?;
        self.resources.load_texture(image).context("loading mesh texture")?;

        if let Some(sky) = &self.config.skybox {
            let skybox = Skybox::new(Arc::clone(&self.device), sky, TargetFormats::SCENE, &*self.images)
                .context("creating skybox")?;
            self.skybox = Some(skybox);
        }

        self.register_scene_texture()?;
        info!("Initialized cube program");
        Ok(())
    }

    fn poll(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::CloseRequested => self.quit = true,
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed
                    && event.logical_key == Key::Named(NamedKey::Escape) =>
            {
                self.quit = true
            }
            WindowEvent::Resized(size) => self.window_size = [size.width, size.height],
            _ => {}
        }
        true
    }

    fn update(&mut self, dt: f32) {
        self.fps.record(dt);
        self.fps.log_every(600);
        let (fps, frame_ms) = self.fps.averaged();
        self.stats.fps = fps;
        self.stats.frame_ms = frame_ms;

        if let Some((width, height)) = self.scene.requested_viewport.take() {
            if let Err(e) = self.resize_viewport(width, height) {
                warn!("resizing scene viewport to {width}x{height}: {e}");
            }
        }

        self.scene.update(dt);
    }

    fn draw(&mut self) -> bool {
        match self.render_frame() {
            Ok(outcome) => {
                self.stats.frames += 1;
                if outcome == FrameOutcome::Dropped {
                    self.stats.dropped += 1;
                }
                true
            }
            Err(e) => {
                error!("draw: {e}");
                false
            }
        }
    }

    fn should_quit(&self) -> bool {
        self.quit
    }
}

impl<D: GpuDevice + ?Sized> Drop for CubeProgram<D> {
    fn drop(&mut self) {
        if let Some(id) = self.scene_texture.take() {
            self.device.unregister_gui_texture(id);
        }
        info!("Releasing cube program");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Image;
    use crate::config::SkyboxConfig;
    use crate::gpu::recording::{Call, SwapchainMode};
    use crate::gpu::{DrawIndexed, RecordingDevice, Viewport};
    use crate::testing::{shader_path, MemoryImages};

    fn config() -> DemoConfig {
        let mut config = DemoConfig::default();
        config.shaders.vertex = shader_path("cube.vert.wgsl");
        config.shaders.fragment = shader_path("cube.frag.wgsl");
        config.texture = "cube.png".into();
        config
    }

    fn images() -> MemoryImages {
        MemoryImages::skybox_faces(4).with("cube.png", Image::solid(2, 2, [200, 100, 50, 255]))
    }

    fn program(device: &Arc<RecordingDevice>, config: DemoConfig) -> CubeProgram<RecordingDevice> {
        CubeProgram::new(Arc::clone(device), config).with_image_source(Box::new(images()))
    }

    fn ready(device: &Arc<RecordingDevice>) -> CubeProgram<RecordingDevice> {
        let mut program = program(device, config());
        program.init().unwrap();
        device.clear_calls();
        program
    }

    fn bound_pipelines(device: &RecordingDevice) -> Vec<crate::gpu::PipelineId> {
        device
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BindPipeline(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn init_creates_every_resource() {
        let device = Arc::new(RecordingDevice::new());
        let _program = ready(&device);
        let live = device.live_objects();
        assert_eq!((live.shaders, live.pipelines, live.buffers), (2, 2, 2));
        assert_eq!((live.textures, live.samplers, live.transfer_buffers), (3, 1, 0));
    }

    #[test]
    fn drop_releases_everything() {
        let device = Arc::new(RecordingDevice::new());
        let mut config = config();
        config.skybox = Some(SkyboxConfig {
            directory: "sky".into(),
            vertex_shader: shader_path("skybox.vert.wgsl"),
            fragment_shader: shader_path("skybox.frag.wgsl"),
        });
        let mut program = program(&device, config);
        program.init().unwrap();
        assert!(program.draw());
        drop(program);
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn frame_draws_instanced_mesh_and_gui() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        program.scene_mut().instancing.dimension = 3;

        assert!(program.draw());
        assert!(device.calls().contains(&Call::DrawIndexed(DrawIndexed {
            index_count: 36,
            instance_count: 27,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        })));
        assert_eq!(device.count_calls(|c| matches!(c, Call::RenderGui { .. })), 1);
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 1);
        assert_eq!(program.stats().frames, 1);
        assert!(program.take_platform_output().is_some());
    }

    #[test]
    fn unavailable_swapchain_submits_without_passes() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        device.set_swapchain_mode(SwapchainMode::Unavailable);

        assert!(program.draw());
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 1);
        assert_eq!(device.count_calls(|c| matches!(c, Call::BeginRenderPass { .. })), 0);
    }

    #[test]
    fn wireframe_only_swaps_the_pipeline() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);

        assert!(program.draw());
        let solid_calls = device.calls().len();
        assert_eq!(bound_pipelines(&device), vec![program.resources().pipeline(false).unwrap()]);

        device.clear_calls();
        program.scene_mut().wireframe = true;
        assert!(program.draw());
        assert_eq!(bound_pipelines(&device), vec![program.resources().pipeline(true).unwrap()]);
        assert_eq!(device.calls().len(), solid_calls);
    }

    #[test]
    fn uniforms_are_pushed_before_the_scene_pass() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        assert!(program.draw());

        let calls = device.calls();
        let begin = calls
            .iter()
            .position(|c| matches!(c, Call::BeginRenderPass { .. }))
            .unwrap();
        let pushes: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::PushVertexUniform { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pushes.len(), 4);
        assert!(pushes.iter().all(|&i| i < begin));
    }

    #[test]
    fn command_buffer_failure_is_fatal() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        device.fail_command_buffers(true);

        assert!(!program.draw());
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 0);
    }

    #[test]
    fn swapchain_failure_cancels_the_frame() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        device.set_swapchain_mode(SwapchainMode::Fail);

        assert!(!program.draw());
        assert_eq!(device.count_calls(|c| matches!(c, Call::Cancel(_))), 1);
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 0);
    }

    #[test]
    fn submit_failure_drops_the_frame() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        device.fail_submits(true);

        assert!(program.draw());
        assert_eq!(program.stats().dropped, 1);

        device.fail_submits(false);
        assert!(program.draw());
        assert_eq!(program.stats().dropped, 1);
        assert_eq!(program.stats().frames, 2);
    }

    #[test]
    fn dropped_first_frame_keeps_gui_textures() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        device.fail_submits(true);

        assert!(program.draw());
        assert_eq!(program.stats().dropped, 1);
        assert!(device.egui_textures() > 0);

        device.fail_submits(false);
        assert!(program.draw());
        assert!(device.egui_textures() > 0);
    }

    #[test]
    fn draw_before_init_fails() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = program(&device, config());
        assert!(!program.draw());
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 0);
        assert_eq!(device.open_command_buffers(), 0);
    }

    #[test]
    fn skybox_face_mismatch_fails_init_without_leaks() {
        let device = Arc::new(RecordingDevice::new());
        let mut config = config();
        config.skybox = Some(SkyboxConfig {
            directory: "sky".into(),
            vertex_shader: shader_path("skybox.vert.wgsl"),
            fragment_shader: shader_path("skybox.frag.wgsl"),
        });
        let images = images().with("back.jpg", Image::solid(8, 8, [0; 4]));
        let mut program = CubeProgram::new(Arc::clone(&device), config).with_image_source(Box::new(images));

        assert!(program.init().unwrap_err().is_init());
        drop(program);
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn missing_texture_fails_init() {
        let device = Arc::new(RecordingDevice::new());
        let mut config = config();
        config.texture = "missing.png".into();
        let mut program = program(&device, config);
        let err = program.init().unwrap_err();
        assert!(err.to_string().contains("missing.png"));
    }

    #[test]
    fn viewport_request_recreates_targets_between_frames() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        program.scene_mut().requested_viewport = Some((128, 64));

        program.update(0.016);
        assert_eq!(program.resources().target_size(), (128, 64));
        assert_eq!(program.scene().viewport, (128, 64));
        assert_eq!(program.scene().requested_viewport, None);
        assert_eq!(device.live_objects().textures, 3);

        assert!(program.draw());
        assert!(device.calls().contains(&Call::SetViewport(Viewport::from_size(128, 64))));
    }

    #[test]
    fn update_spins_the_mesh() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = ready(&device);
        program.update(0.5);
        assert!((program.scene().mesh_transform.rotation.y - 0.5).abs() < 1e-6);
        assert!(program.stats().fps > 0.0);
    }

    #[test]
    fn close_request_quits() {
        let device = Arc::new(RecordingDevice::new());
        let mut program = program(&device, config());
        assert!(!program.should_quit());
        assert!(program.poll(&WindowEvent::CloseRequested));
        assert!(program.should_quit());
    }
}
