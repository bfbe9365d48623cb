// src/frame.rs
//! One frame's command buffer, walked through its phases in order:
//!
//! `Idle → CommandAcquired → SwapchainAcquired → ScenePass → GuiPass → Submitted`
//!
//! `SwapchainAcquired → Submitted` is also legal, for frames without a
//! swapchain image. A [`Frame`] dropped before `submit` cancels its command
//! buffer, so an aborted frame never submits partial work.

use log::trace;

use crate::error::{FrameError, Result};
use crate::gpu::{
    BufferBinding, BufferId, ColorTarget, CommandBufferId, DepthTarget, DrawIndexed, GpuDevice,
    LoadOp, PipelineId, TextureId, TextureSamplerBinding, Viewport,
};
use crate::gui::GuiDrawData;
use crate::skybox::Skybox;
use crate::uniforms::FrameUniforms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    CommandAcquired,
    SwapchainAcquired,
    ScenePass,
    GuiPass,
    Submitted,
}

impl FramePhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::CommandAcquired => "CommandAcquired",
            Self::SwapchainAcquired => "SwapchainAcquired",
            Self::ScenePass => "ScenePass",
            Self::GuiPass => "GuiPass",
            Self::Submitted => "Submitted",
        }
    }

    pub fn can_advance_to(self, next: FramePhase) -> bool {
        use FramePhase::*;
        matches!(
            (self, next),
            (Idle, CommandAcquired)
                | (CommandAcquired, SwapchainAcquired)
                | (SwapchainAcquired, ScenePass)
                | (SwapchainAcquired, Submitted)
                | (ScenePass, GuiPass)
                | (GuiPass, Submitted)
        )
    }
}

/// Objects the scene pass binds, all owned elsewhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenePassInputs {
    pub pipeline: PipelineId,
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub index_format: wgpu::IndexFormat,
    pub index_count: u32,
    pub texture: TextureSamplerBinding,
    pub color_target: TextureId,
    pub depth_target: TextureId,
    pub viewport: Viewport,
    pub clear_color: [f32; 4],
    pub instance_count: u32,
}

pub struct Frame<'d, D: GpuDevice + ?Sized> {
    device: &'d D,
    cmd: CommandBufferId,
    phase: FramePhase,
    swapchain: Option<TextureId>,
}

impl<'d, D: GpuDevice + ?Sized> Frame<'d, D> {
    /// Acquires the frame's command buffer.
    pub fn begin(device: &'d D) -> Result<Self> {
        let cmd = device.acquire_command_buffer()?;
        trace!("frame: acquired command buffer {}", cmd.raw());
        Ok(Self {
            device,
            cmd,
            phase: FramePhase::CommandAcquired,
            swapchain: None,
        })
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn command_buffer(&self) -> CommandBufferId {
        self.cmd
    }

    fn advance(&mut self, next: FramePhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(FrameError::InvalidTransition {
                from: self.phase.name(),
                to: next.name(),
            }
            .into());
        }
        self.phase = next;
        Ok(())
    }

    /// `None` when no image is available; the frame must then be submitted
    /// without passes.
    pub fn acquire_swapchain_texture(&mut self) -> Result<Option<TextureId>> {
        self.advance(FramePhase::SwapchainAcquired)?;
        self.swapchain = self.device.acquire_swapchain_texture(self.cmd)?;
        Ok(self.swapchain)
    }

    /// Pushes the uniforms, then records the offscreen pass: the instanced
    /// mesh draw followed by the skybox.
    pub fn render_scene_pass(
        &mut self,
        uniforms: &FrameUniforms,
        inputs: &ScenePassInputs,
        skybox: Option<&Skybox<D>>,
    ) -> Result<()> {
        self.advance(FramePhase::ScenePass)?;
        let device = self.device;

        uniforms.push(device, self.cmd)?;

        let color = ColorTarget {
            texture: inputs.color_target,
            load: LoadOp::Clear,
            clear_color: inputs.clear_color,
            store: true,
        };
        let depth = DepthTarget {
            texture: inputs.depth_target,
            load: LoadOp::Clear,
            clear_depth: 1.0,
            store: true,
        };
        let pass = device.begin_render_pass(self.cmd, &[color], Some(&depth))?;

        device.set_viewport(pass, &inputs.viewport)?;
        device.bind_pipeline(pass, inputs.pipeline)?;
        device.bind_vertex_buffers(pass, 0, &[BufferBinding { buffer: inputs.vertex_buffer, offset: 0 }])?;
        device.bind_index_buffer(
            pass,
            BufferBinding { buffer: inputs.index_buffer, offset: 0 },
            inputs.index_format,
        )?;
        device.bind_fragment_samplers(pass, 0, &[inputs.texture])?;
        device.draw_indexed(
            pass,
            DrawIndexed {
                index_count: inputs.index_count,
                instance_count: inputs.instance_count,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            },
        )?;

        if let Some(skybox) = skybox {
            skybox.draw(pass)?;
        }

        device.end_render_pass(pass)
    }

    /// Draws the GUI over the swapchain image, keeping its contents.
    pub fn render_gui_pass(&mut self, draw_data: GuiDrawData) -> Result<()> {
        self.advance(FramePhase::GuiPass)?;
        let swapchain = self
            .swapchain
            .ok_or_else(|| FrameError::Recording("GUI pass without a swapchain image".into()))?;

        let color = ColorTarget {
            texture: swapchain,
            load: LoadOp::Load,
            clear_color: [0.0; 4],
            store: true,
        };
        let pass = self.device.begin_render_pass(self.cmd, &[color], None)?;
        self.device.render_gui(pass, draw_data)?;
        self.device.end_render_pass(pass)
    }

    /// Submits the command buffer. It is consumed even if submission fails.
    pub fn submit(mut self) -> Result<()> {
        self.advance(FramePhase::Submitted)?;
        self.device.submit(self.cmd)
    }
}

impl<D: GpuDevice + ?Sized> Drop for Frame<'_, D> {
    fn drop(&mut self) {
        if !matches!(self.phase, FramePhase::Idle | FramePhase::Submitted) {
            trace!("frame: cancelling command buffer {} in {}", self.cmd.raw(), self.phase.name());
            self.device.cancel_command_buffer(self.cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::assets::Image;
    use crate::cube::{cube_indices, CUBE_VERTICES};
    use crate::error::Error;
    use crate::gpu::recording::{Call, SwapchainMode};
    use crate::gpu::{RecordingDevice, SamplerDesc};
    use crate::resources::{GpuResources, TargetFormats};
    use crate::scene::InstanceConfig;
    use crate::testing::shader_path;

    fn resources(device: &Arc<RecordingDevice>) -> GpuResources<RecordingDevice> {
        let mut res = GpuResources::new(Arc::clone(device));
        res.load_shaders(&shader_path("cube.vert.wgsl"), &shader_path("cube.frag.wgsl")).unwrap();
        res.create_pipelines(TargetFormats::SCENE).unwrap();
        res.send_vertex_data(&CUBE_VERTICES, &cube_indices()).unwrap();
        res.create_sampler(&SamplerDesc::default()).unwrap();
        res.create_render_targets(32, 32).unwrap();
        res.load_texture(&Image::solid(1, 1, [255; 4])).unwrap();
        res
    }

    fn uniforms() -> FrameUniforms {
        FrameUniforms {
            view_proj: glam::Mat4::IDENTITY,
            model: glam::Mat4::IDENTITY,
            instancing: InstanceConfig { spread: 1.5, dimension: 2 },
            sky_view_proj: glam::Mat4::IDENTITY,
        }
    }

    fn empty_gui() -> GuiDrawData {
        GuiDrawData::empty([32, 32])
    }

    #[test]
    fn transitions_follow_the_chain() {
        use FramePhase::*;
        assert!(Idle.can_advance_to(CommandAcquired));
        assert!(SwapchainAcquired.can_advance_to(Submitted));
        assert!(!CommandAcquired.can_advance_to(ScenePass));
        assert!(!ScenePass.can_advance_to(Submitted));
        assert!(!Submitted.can_advance_to(Idle));
    }

    #[test]
    fn full_frame_records_both_passes() {
        let device = Arc::new(RecordingDevice::new());
        let res = resources(&device);
        device.clear_calls();

        let mut frame = Frame::begin(&*device).unwrap();
        assert!(frame.acquire_swapchain_texture().unwrap().is_some());
        let inputs = res.scene_inputs(false, [0.1, 0.1, 0.1, 1.0], 8).unwrap();
        frame.render_scene_pass(&uniforms(), &inputs, None).unwrap();
        frame.render_gui_pass(empty_gui()).unwrap();
        frame.submit().unwrap();

        let calls = device.calls();
        let first_begin = calls
            .iter()
            .position(|c| matches!(c, Call::BeginRenderPass { .. }))
            .unwrap();
        let last_push = calls
            .iter()
            .rposition(|c| matches!(c, Call::PushVertexUniform { .. }))
            .unwrap();
        assert!(last_push < first_begin);

        assert!(calls.contains(&Call::DrawIndexed(DrawIndexed {
            index_count: 36,
            instance_count: 8,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        })));
        assert!(calls.contains(&Call::SetViewport(Viewport::from_size(32, 32))));
        assert_eq!(device.count_calls(|c| matches!(c, Call::BeginRenderPass { .. })), 2);
        assert!(matches!(calls.last(), Some(Call::Submit(_))));

        let gui_pass = calls
            .iter()
            .filter_map(|c| match c {
                Call::BeginRenderPass { color, depth, .. } => Some((color[0].load, depth.is_none())),
                _ => None,
            })
            .last();
        assert_eq!(gui_pass, Some((LoadOp::Load, true)));
    }

    #[test]
    fn out_of_order_pass_is_rejected() {
        let device = RecordingDevice::new();
        let mut frame = Frame::begin(&device).unwrap();
        let err = frame.render_gui_pass(empty_gui()).unwrap_err();
        assert!(matches!(
            err,
            Error::Frame(FrameError::InvalidTransition { from: "CommandAcquired", to: "GuiPass" })
        ));
        assert_eq!(frame.phase(), FramePhase::CommandAcquired);
    }

    #[test]
    fn gui_pass_without_swapchain_is_a_recording_error() {
        let device = Arc::new(RecordingDevice::new());
        let res = resources(&device);
        device.clear_calls();
        device.set_swapchain_mode(SwapchainMode::Unavailable);

        let mut frame = Frame::begin(&*device).unwrap();
        assert_eq!(frame.acquire_swapchain_texture().unwrap(), None);
        let inputs = res.scene_inputs(false, [0.0; 4], 1).unwrap();
        frame.render_scene_pass(&uniforms(), &inputs, None).unwrap();

        let err = frame.render_gui_pass(empty_gui()).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::Recording(_))));
        drop(frame);
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 0);
    }

    #[test]
    fn dropped_frame_cancels_command_buffer() {
        let device = RecordingDevice::new();
        {
            let mut frame = Frame::begin(&device).unwrap();
            frame.acquire_swapchain_texture().unwrap();
        }
        assert_eq!(device.count_calls(|c| matches!(c, Call::Cancel(_))), 1);
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 0);
        assert_eq!(device.open_command_buffers(), 0);
    }

    #[test]
    fn unavailable_swapchain_submits_empty_buffer() {
        let device = RecordingDevice::new();
        device.set_swapchain_mode(SwapchainMode::Unavailable);
        let mut frame = Frame::begin(&device).unwrap();
        assert_eq!(frame.acquire_swapchain_texture().unwrap(), None);
        frame.submit().unwrap();
        assert_eq!(device.count_calls(|c| matches!(c, Call::Submit(_))), 1);
        assert_eq!(device.count_calls(|c| matches!(c, Call::Cancel(_))), 0);
    }

    #[test]
    fn failed_submit_is_not_cancelled() {
        let device = RecordingDevice::new();
        device.fail_submits(true);
        device.set_swapchain_mode(SwapchainMode::Unavailable);
        let mut frame = Frame::begin(&device).unwrap();
        frame.acquire_swapchain_texture().unwrap();
        assert!(frame.submit().unwrap_err().is_frame());
        assert_eq!(device.count_calls(|c| matches!(c, Call::Cancel(_))), 0);
        assert_eq!(device.open_command_buffers(), 0);
    }
}
