// src/gpu/recording.rs
//! Headless [`GpuDevice`] that records every call.
//!
//! Buffers and textures keep their contents in memory so uploads can be read
//! back. Copies recorded in a copy pass only happen at `submit`, so releasing
//! a transfer buffer too early shows up as a submit error, just like on a
//! real device. Failures can be injected per operation.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use log::trace;

use super::*;
use crate::error::{Error, FrameError, Result};
use crate::gui::GuiDrawData;

/// Resource categories, in the order they show up in [`LiveObjects`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Shader,
    Pipeline,
    Buffer,
    TransferBuffer,
    Texture,
    Sampler,
}

/// One recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    AcquireCommandBuffer(CommandBufferId),
    AcquireSwapchainTexture {
        cmd: CommandBufferId,
        texture: Option<TextureId>,
    },
    PushVertexUniform {
        cmd: CommandBufferId,
        slot: u32,
        data: Vec<u8>,
    },
    BeginCopyPass(CommandBufferId),
    UploadToBuffer {
        source: TransferLocation,
        destination: BufferRegion,
    },
    UploadToTexture {
        source: TransferLocation,
        destination: TextureRegion,
    },
    EndCopyPass,
    BeginRenderPass {
        cmd: CommandBufferId,
        color: Vec<ColorTarget>,
        depth: Option<DepthTarget>,
    },
    BindPipeline(PipelineId),
    BindVertexBuffers(Vec<BufferBinding>),
    BindIndexBuffer(BufferBinding, wgpu::IndexFormat),
    BindFragmentSamplers(Vec<TextureSamplerBinding>),
    SetViewport(Viewport),
    DrawIndexed(DrawIndexed),
    RenderGui {
        primitives: usize,
    },
    EndRenderPass,
    Submit(CommandBufferId),
    Cancel(CommandBufferId),
    Release(ResourceKind, u64),
    WaitIdle,
}

/// Swapchain behavior for `acquire_swapchain_texture`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwapchainMode {
    #[default]
    Available,
    /// Returns `Ok(None)`, like a minimized window.
    Unavailable,
    /// Returns a hard error.
    Fail,
}

/// Number of live objects per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub shaders: usize,
    pub pipelines: usize,
    pub buffers: usize,
    pub transfer_buffers: usize,
    pub textures: usize,
    pub samplers: usize,
}

impl LiveObjects {
    pub fn total(&self) -> usize {
        self.shaders
            + self.pipelines
            + self.buffers
            + self.transfer_buffers
            + self.textures
            + self.samplers
    }
}

#[derive(Debug, Default)]
struct Failures {
    command_buffer: bool,
    swapchain: SwapchainMode,
    submit: bool,
    pipeline: bool,
    transfer_buffer: bool,
    /// Texture creations still allowed before failing.
    textures_left: Option<usize>,
}

struct BufferState {
    usage: BufferUsage,
    data: Vec<u8>,
}

struct TextureState {
    desc: TextureDesc,
    data: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpenPass {
    Copy(u64),
    Render(u64),
}

enum PendingCopy {
    Buffer {
        source: TransferLocation,
        destination: BufferRegion,
    },
    Texture {
        source: TransferLocation,
        destination: TextureRegion,
    },
}

#[derive(Default)]
struct CommandState {
    open_pass: Option<OpenPass>,
    copies: Vec<PendingCopy>,
    swapchain: Option<u64>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    calls: Vec<Call>,
    shaders: HashMap<u64, ShaderDesc>,
    pipelines: HashMap<u64, PipelineDesc>,
    buffers: HashMap<u64, BufferState>,
    transfer_buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, TextureState>,
    samplers: HashMap<u64, SamplerDesc>,
    commands: HashMap<u64, CommandState>,
    /// Pass id → owning command buffer id.
    passes: HashMap<u64, u64>,
    gui_textures: HashMap<u64, u64>,
    /// egui-managed textures (font atlas, user images) uploaded so far.
    egui_textures: HashSet<egui::TextureId>,
    egui_frees: Vec<egui::TextureId>,
    failures: Failures,
}

impl Inner {
    fn free_egui_textures(&mut self) {
        for id in std::mem::take(&mut self.egui_frees) {
            self.egui_textures.remove(&id);
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn command(&mut self, cmd: CommandBufferId) -> Result<&mut CommandState> {
        self.commands
            .get_mut(&cmd.0)
            .ok_or_else(|| FrameError::Recording(format!("unknown command buffer {}", cmd.0)).into())
    }

    fn render_pass(&mut self, pass: RenderPassId) -> Result<()> {
        let owner = self.passes.get(&pass.0).copied();
        let open = owner
            .and_then(|cmd| self.commands.get(&cmd))
            .and_then(|state| state.open_pass);
        match open {
            Some(OpenPass::Render(id)) if id == pass.0 => Ok(()),
            _ => Err(FrameError::Recording(format!("render pass {} is not open", pass.0)).into()),
        }
    }

    fn copy_pass(&mut self, pass: CopyPassId) -> Result<&mut CommandState> {
        let owner = self
            .passes
            .get(&pass.0)
            .copied()
            .ok_or_else(|| Error::upload(format!("unknown copy pass {}", pass.0)))?;
        let state = self
            .commands
            .get_mut(&owner)
            .ok_or_else(|| Error::upload(format!("copy pass {} has no command buffer", pass.0)))?;
        match state.open_pass {
            Some(OpenPass::Copy(id)) if id == pass.0 => Ok(state),
            _ => Err(Error::upload(format!("copy pass {} is not open", pass.0))),
        }
    }

    fn texture_exists(&self, texture: TextureId) -> bool {
        self.textures.contains_key(&texture.0)
            || self.commands.values().any(|c| c.swapchain == Some(texture.0))
    }

    fn apply_copy(&mut self, copy: &PendingCopy) -> std::result::Result<(), String> {
        match copy {
            PendingCopy::Buffer { source, destination } => {
                let src = self
                    .transfer_buffers
                    .get(&source.transfer_buffer.0)
                    .ok_or("transfer buffer released before submission")?;
                let start = source.offset as usize;
                let bytes = src
                    .get(start..start + destination.size as usize)
                    .ok_or("copy source out of range")?
                    .to_vec();
                let dst = self
                    .buffers
                    .get_mut(&destination.buffer.0)
                    .ok_or("destination buffer released before submission")?;
                let at = destination.offset as usize;
                dst.data
                    .get_mut(at..at + bytes.len())
                    .ok_or("copy destination out of range")?
                    .copy_from_slice(&bytes);
            }
            PendingCopy::Texture { source, destination } => {
                let src = self
                    .transfer_buffers
                    .get(&source.transfer_buffer.0)
                    .ok_or("transfer buffer released before submission")?;
                let dst = self
                    .textures
                    .get_mut(&destination.texture.0)
                    .ok_or("destination texture released before submission")?;
                let layer_size = dst.desc.layer_size() as usize;
                let start = source.offset as usize;
                let bytes = src
                    .get(start..start + layer_size)
                    .ok_or("copy source out of range")?;
                let at = destination.layer as usize * layer_size;
                dst.data
                    .get_mut(at..at + layer_size)
                    .ok_or("copy destination out of range")?
                    .copy_from_slice(bytes);
            }
        }
        Ok(())
    }

    fn release(&mut self, kind: ResourceKind, id: u64) {
        let existed = match kind {
            ResourceKind::Shader => self.shaders.remove(&id).is_some(),
            ResourceKind::Pipeline => self.pipelines.remove(&id).is_some(),
            ResourceKind::Buffer => self.buffers.remove(&id).is_some(),
            ResourceKind::TransferBuffer => self.transfer_buffers.remove(&id).is_some(),
            ResourceKind::Texture => self.textures.remove(&id).is_some(),
            ResourceKind::Sampler => self.samplers.remove(&id).is_some(),
        };
        if existed {
            self.calls.push(Call::Release(kind, id));
        }
    }
}

/// In-memory device used by tests and headless runs.
#[derive(Default)]
pub struct RecordingDevice {
    inner: RefCell<Inner>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------ inspection

    pub fn calls(&self) -> Vec<Call> {
        self.inner.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.borrow_mut().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.inner.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn live_objects(&self) -> LiveObjects {
        let inner = self.inner.borrow();
        LiveObjects {
            shaders: inner.shaders.len(),
            pipelines: inner.pipelines.len(),
            buffers: inner.buffers.len(),
            transfer_buffers: inner.transfer_buffers.len(),
            textures: inner.textures.len(),
            samplers: inner.samplers.len(),
        }
    }

    /// Contents of a device buffer.
    pub fn read_buffer(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.inner.borrow().buffers.get(&buffer.0).map(|b| b.data.clone())
    }

    pub fn buffer_usage(&self, buffer: BufferId) -> Option<BufferUsage> {
        self.inner.borrow().buffers.get(&buffer.0).map(|b| b.usage)
    }

    /// Contents of a texture, all layers back to back.
    pub fn read_texture(&self, texture: TextureId) -> Option<Vec<u8>> {
        self.inner.borrow().textures.get(&texture.0).map(|t| t.data.clone())
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.inner.borrow().textures.get(&texture.0).map(|t| t.desc)
    }

    pub fn shader_desc(&self, shader: ShaderId) -> Option<ShaderDesc> {
        self.inner.borrow().shaders.get(&shader.0).cloned()
    }

    pub fn pipeline_desc(&self, pipeline: PipelineId) -> Option<PipelineDesc> {
        self.inner.borrow().pipelines.get(&pipeline.0).cloned()
    }

    /// egui-managed textures currently uploaded.
    pub fn egui_textures(&self) -> usize {
        self.inner.borrow().egui_textures.len()
    }

    pub fn open_command_buffers(&self) -> usize {
        self.inner.borrow().commands.len()
    }

    // ------------------------------------------------------- failure injection

    pub fn fail_command_buffers(&self, fail: bool) {
        self.inner.borrow_mut().failures.command_buffer = fail;
    }

    pub fn set_swapchain_mode(&self, mode: SwapchainMode) {
        self.inner.borrow_mut().failures.swapchain = mode;
    }

    pub fn fail_submits(&self, fail: bool) {
        self.inner.borrow_mut().failures.submit = fail;
    }

    pub fn fail_pipelines(&self, fail: bool) {
        self.inner.borrow_mut().failures.pipeline = fail;
    }

    pub fn fail_transfer_buffers(&self, fail: bool) {
        self.inner.borrow_mut().failures.transfer_buffer = fail;
    }

    /// Lets `count` more textures be created, then fails every creation.
    pub fn fail_textures_after(&self, count: usize) {
        self.inner.borrow_mut().failures.textures_left = Some(count);
    }
}

impl GpuDevice for RecordingDevice {
    fn create_shader(&self, desc: &ShaderDesc) -> Result<ShaderId> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.shaders.insert(id, desc.clone());
        Ok(ShaderId(id))
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        let mut inner = self.inner.borrow_mut();
        if inner.failures.pipeline {
            return Err(Error::init(format!("pipeline creation failed: {}", desc.label)));
        }
        for shader in [desc.vertex_shader, desc.fragment_shader] {
            if !inner.shaders.contains_key(&shader.0) {
                return Err(Error::init(format!("{}: unknown shader {}", desc.label, shader.0)));
            }
        }
        let stages = (
            inner.shaders[&desc.vertex_shader.0].stage,
            inner.shaders[&desc.fragment_shader.0].stage,
        );
        if stages != (ShaderStage::Vertex, ShaderStage::Fragment) {
            return Err(Error::init(format!("{}: shader stages mismatch", desc.label)));
        }
        let id = inner.next_id();
        inner.pipelines.insert(id, desc.clone());
        Ok(PipelineId(id))
    }

    fn create_buffer(&self, _label: &str, usage: BufferUsage, size: u64) -> Result<BufferId> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.buffers.insert(
            id,
            BufferState {
                usage,
                data: vec![0; size as usize],
            },
        );
        Ok(BufferId(id))
    }

    fn create_transfer_buffer(&self, size: u64) -> Result<TransferBufferId> {
        let mut inner = self.inner.borrow_mut();
        if inner.failures.transfer_buffer {
            return Err(Error::upload("transfer buffer creation failed"));
        }
        let id = inner.next_id();
        inner.transfer_buffers.insert(id, vec![0; size as usize]);
        Ok(TransferBufferId(id))
    }

    fn write_transfer_buffer(
        &self,
        transfer_buffer: TransferBufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let memory = inner
            .transfer_buffers
            .get_mut(&transfer_buffer.0)
            .ok_or_else(|| Error::upload(format!("unknown transfer buffer {}", transfer_buffer.0)))?;
        let start = offset as usize;
        memory
            .get_mut(start..start + data.len())
            .ok_or_else(|| Error::upload("transfer buffer write out of range"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&self, label: &str, desc: &TextureDesc) -> Result<TextureId> {
        let mut inner = self.inner.borrow_mut();
        if let Some(left) = inner.failures.textures_left.as_mut() {
            if *left == 0 {
                return Err(Error::init(format!("texture creation failed: {label}")));
            }
            *left -= 1;
        }
        let id = inner.next_id();
        let size = desc.layer_size() as usize * desc.layers as usize;
        inner.textures.insert(
            id,
            TextureState {
                desc: *desc,
                data: vec![0; size],
            },
        );
        Ok(TextureId(id))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.samplers.insert(id, *desc);
        Ok(SamplerId(id))
    }

    fn release_shader(&self, shader: ShaderId) {
        self.inner.borrow_mut().release(ResourceKind::Shader, shader.0);
    }

    fn release_pipeline(&self, pipeline: PipelineId) {
        self.inner.borrow_mut().release(ResourceKind::Pipeline, pipeline.0);
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.inner.borrow_mut().release(ResourceKind::Buffer, buffer.0);
    }

    fn release_transfer_buffer(&self, transfer_buffer: TransferBufferId) {
        self.inner
            .borrow_mut()
            .release(ResourceKind::TransferBuffer, transfer_buffer.0);
    }

    fn release_texture(&self, texture: TextureId) {
        self.inner.borrow_mut().release(ResourceKind::Texture, texture.0);
    }

    fn release_sampler(&self, sampler: SamplerId) {
        self.inner.borrow_mut().release(ResourceKind::Sampler, sampler.0);
    }

    fn wait_idle(&self) -> Result<()> {
        self.inner.borrow_mut().calls.push(Call::WaitIdle);
        Ok(())
    }

    fn acquire_command_buffer(&self) -> Result<CommandBufferId> {
        let mut inner = self.inner.borrow_mut();
        if inner.failures.command_buffer {
            return Err(FrameError::DeviceBusy("no command buffer available".into()).into());
        }
        let id = inner.next_id();
        inner.commands.insert(id, CommandState::default());
        inner.calls.push(Call::AcquireCommandBuffer(CommandBufferId(id)));
        Ok(CommandBufferId(id))
    }

    fn acquire_swapchain_texture(&self, cmd: CommandBufferId) -> Result<Option<TextureId>> {
        let mut inner = self.inner.borrow_mut();
        inner.command(cmd)?;
        let texture = match inner.failures.swapchain {
            SwapchainMode::Fail => {
                return Err(FrameError::Swapchain("surface lost".into()).into());
            }
            SwapchainMode::Unavailable => None,
            SwapchainMode::Available => {
                let id = inner.next_id();
                inner.command(cmd)?.swapchain = Some(id);
                Some(TextureId(id))
            }
        };
        inner.calls.push(Call::AcquireSwapchainTexture { cmd, texture });
        Ok(texture)
    }

    fn push_vertex_uniform(&self, cmd: CommandBufferId, slot: u32, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.command(cmd)?;
        inner.calls.push(Call::PushVertexUniform {
            cmd,
            slot,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn submit(&self, cmd: CommandBufferId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let state = inner
            .commands
            .remove(&cmd.0)
            .ok_or_else(|| FrameError::Submit(format!("unknown command buffer {}", cmd.0)))?;
        if state.open_pass.is_some() {
            return Err(FrameError::Submit("a pass is still open".into()).into());
        }
        inner.free_egui_textures();
        if inner.failures.submit {
            return Err(FrameError::Submit("device lost".into()).into());
        }
        for copy in &state.copies {
            inner.apply_copy(copy).map_err(|e| FrameError::Submit(e.to_owned()))?;
        }
        trace!("submitted command buffer {} ({} copies)", cmd.0, state.copies.len());
        inner.calls.push(Call::Submit(cmd));
        Ok(())
    }

    fn cancel_command_buffer(&self, cmd: CommandBufferId) {
        let mut inner = self.inner.borrow_mut();
        if inner.commands.remove(&cmd.0).is_some() {
            inner.passes.retain(|_, owner| *owner != cmd.0);
            inner.free_egui_textures();
            inner.calls.push(Call::Cancel(cmd));
        }
    }

    fn begin_copy_pass(&self, cmd: CommandBufferId) -> Result<CopyPassId> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        let state = inner.command(cmd).map_err(|e| Error::upload(e.to_string()))?;
        if state.open_pass.is_some() {
            return Err(Error::upload("a pass is already open"));
        }
        state.open_pass = Some(OpenPass::Copy(id));
        inner.passes.insert(id, cmd.0);
        inner.calls.push(Call::BeginCopyPass(cmd));
        Ok(CopyPassId(id))
    }

    fn upload_to_buffer(
        &self,
        pass: CopyPassId,
        source: TransferLocation,
        destination: BufferRegion,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let src_len = inner
            .transfer_buffers
            .get(&source.transfer_buffer.0)
            .map(|t| t.len() as u64)
            .ok_or_else(|| Error::upload("unknown transfer buffer"))?;
        let dst_len = inner
            .buffers
            .get(&destination.buffer.0)
            .map(|b| b.data.len() as u64)
            .ok_or_else(|| Error::upload("unknown destination buffer"))?;
        if source.offset + destination.size > src_len
            || destination.offset + destination.size > dst_len
        {
            return Err(Error::upload("buffer upload out of range"));
        }
        inner
            .copy_pass(pass)?
            .copies
            .push(PendingCopy::Buffer { source, destination });
        inner.calls.push(Call::UploadToBuffer { source, destination });
        Ok(())
    }

    fn upload_to_texture(
        &self,
        pass: CopyPassId,
        source: TransferLocation,
        destination: TextureRegion,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let desc = inner
            .textures
            .get(&destination.texture.0)
            .map(|t| t.desc)
            .ok_or_else(|| Error::upload("unknown destination texture"))?;
        if destination.layer >= desc.layers
            || destination.width != desc.width
            || destination.height != desc.height
        {
            return Err(Error::upload("texture upload region mismatch"));
        }
        inner
            .copy_pass(pass)?
            .copies
            .push(PendingCopy::Texture { source, destination });
        inner.calls.push(Call::UploadToTexture { source, destination });
        Ok(())
    }

    fn end_copy_pass(&self, pass: CopyPassId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.copy_pass(pass)?.open_pass = None;
        inner.passes.remove(&pass.0);
        inner.calls.push(Call::EndCopyPass);
        Ok(())
    }

    fn begin_render_pass(
        &self,
        cmd: CommandBufferId,
        color: &[ColorTarget],
        depth: Option<&DepthTarget>,
    ) -> Result<RenderPassId> {
        let mut inner = self.inner.borrow_mut();
        let targets = color.iter().map(|c| c.texture).chain(depth.map(|d| d.texture));
        for texture in targets {
            if !inner.texture_exists(texture) {
                return Err(FrameError::Recording(format!("unknown render target {}", texture.0)).into());
            }
        }
        let id = inner.next_id();
        let state = inner.command(cmd)?;
        if state.open_pass.is_some() {
            return Err(FrameError::Recording("a pass is already open".into()).into());
        }
        state.open_pass = Some(OpenPass::Render(id));
        inner.passes.insert(id, cmd.0);
        inner.calls.push(Call::BeginRenderPass {
            cmd,
            color: color.to_vec(),
            depth: depth.copied(),
        });
        Ok(RenderPassId(id))
    }

    fn bind_pipeline(&self, pass: RenderPassId, pipeline: PipelineId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.render_pass(pass)?;
        if !inner.pipelines.contains_key(&pipeline.0) {
            return Err(FrameError::Recording(format!("unknown pipeline {}", pipeline.0)).into());
        }
        inner.calls.push(Call::BindPipeline(pipeline));
        Ok(())
    }

    fn bind_vertex_buffers(
        &self,
        pass: RenderPassId,
        _first_slot: u32,
        bindings: &[BufferBinding],
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.render_pass(pass)?;
        for binding in bindings {
            let usage = inner.buffers.get(&binding.buffer.0).map(|b| b.usage);
            if !usage.is_some_and(|u| u.contains(BufferUsage::VERTEX)) {
                return Err(FrameError::Recording(format!("{} is not a vertex buffer", binding.buffer.0)).into());
            }
        }
        inner.calls.push(Call::BindVertexBuffers(bindings.to_vec()));
        Ok(())
    }

    fn bind_index_buffer(
        &self,
        pass: RenderPassId,
        binding: BufferBinding,
        format: wgpu::IndexFormat,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.render_pass(pass)?;
        let usage = inner.buffers.get(&binding.buffer.0).map(|b| b.usage);
        if !usage.is_some_and(|u| u.contains(BufferUsage::INDEX)) {
            return Err(FrameError::Recording(format!("{} is not an index buffer", binding.buffer.0)).into());
        }
        inner.calls.push(Call::BindIndexBuffer(binding, format));
        Ok(())
    }

    fn bind_fragment_samplers(
        &self,
        pass: RenderPassId,
        _first_slot: u32,
        bindings: &[TextureSamplerBinding],
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.render_pass(pass)?;
        for binding in bindings {
            if !inner.textures.contains_key(&binding.texture.0)
                || !inner.samplers.contains_key(&binding.sampler.0)
            {
                return Err(FrameError::Recording("unknown texture or sampler binding".into()).into());
            }
        }
        inner.calls.push(Call::BindFragmentSamplers(bindings.to_vec()));
        Ok(())
    }

    fn set_viewport(&self, pass: RenderPassId, viewport: &Viewport) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.render_pass(pass)?;
        inner.calls.push(Call::SetViewport(*viewport));
        Ok(())
    }

    fn draw_indexed(&self, pass: RenderPassId, draw: DrawIndexed) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.render_pass(pass)?;
        inner.calls.push(Call::DrawIndexed(draw));
        Ok(())
    }

    fn render_gui(&self, pass: RenderPassId, draw_data: GuiDrawData) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let delta = &draw_data.textures_delta;
        inner.egui_textures.extend(delta.set.iter().map(|(id, _)| *id));
        inner.egui_frees.extend(delta.free.iter().copied());
        inner.render_pass(pass)?;
        inner.calls.push(Call::RenderGui {
            primitives: draw_data.primitives.len(),
        });
        Ok(())
    }

    fn end_render_pass(&self, pass: RenderPassId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.render_pass(pass)?;
        if let Some(cmd) = inner.passes.remove(&pass.0) {
            if let Some(state) = inner.commands.get_mut(&cmd) {
                state.open_pass = None;
            }
        }
        inner.calls.push(Call::EndRenderPass);
        Ok(())
    }

    fn register_gui_texture(&self, texture: TextureId) -> Result<egui::TextureId> {
        let mut inner = self.inner.borrow_mut();
        if !inner.textures.contains_key(&texture.0) {
            return Err(Error::init(format!("unknown texture {}", texture.0)));
        }
        let id = inner.next_id();
        inner.gui_textures.insert(id, texture.0);
        Ok(egui::TextureId::User(id))
    }

    fn unregister_gui_texture(&self, id: egui::TextureId) {
        if let egui::TextureId::User(raw) = id {
            self.inner.borrow_mut().gui_textures.remove(&raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(device: &RecordingDevice, bytes: &[u8]) -> TransferBufferId {
        let tb = device.create_transfer_buffer(bytes.len() as u64).unwrap();
        device.write_transfer_buffer(tb, 0, bytes).unwrap();
        tb
    }

    #[test]
    fn copies_happen_at_submit() {
        let device = RecordingDevice::new();
        let buffer = device.create_buffer("vb", BufferUsage::VERTEX, 4).unwrap();
        let tb = staged(&device, &[1, 2, 3, 4]);

        let cmd = device.acquire_command_buffer().unwrap();
        let pass = device.begin_copy_pass(cmd).unwrap();
        let region = BufferRegion { buffer, offset: 0, size: 4 };
        device
            .upload_to_buffer(pass, TransferLocation { transfer_buffer: tb, offset: 0 }, region)
            .unwrap();
        device.end_copy_pass(pass).unwrap();
        assert_eq!(device.read_buffer(buffer).unwrap(), vec![0; 4]);

        device.submit(cmd).unwrap();
        assert_eq!(device.read_buffer(buffer).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn early_transfer_release_fails_submit() {
        let device = RecordingDevice::new();
        let buffer = device.create_buffer("ib", BufferUsage::INDEX, 2).unwrap();
        let tb = staged(&device, &[9, 9]);

        let cmd = device.acquire_command_buffer().unwrap();
        let pass = device.begin_copy_pass(cmd).unwrap();
        let region = BufferRegion { buffer, offset: 0, size: 2 };
        device
            .upload_to_buffer(pass, TransferLocation { transfer_buffer: tb, offset: 0 }, region)
            .unwrap();
        device.end_copy_pass(pass).unwrap();
        device.release_transfer_buffer(tb);

        assert!(device.submit(cmd).unwrap_err().is_frame());
    }

    #[test]
    fn release_is_idempotent() {
        let device = RecordingDevice::new();
        let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();
        device.release_sampler(sampler);
        device.release_sampler(sampler);
        assert_eq!(
            device.count_calls(|c| matches!(c, Call::Release(ResourceKind::Sampler, _))),
            1
        );
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn draws_require_an_open_pass() {
        let device = RecordingDevice::new();
        let cmd = device.acquire_command_buffer().unwrap();
        let target = device.acquire_swapchain_texture(cmd).unwrap().unwrap();
        let color = ColorTarget {
            texture: target,
            load: LoadOp::Clear,
            clear_color: [0.0; 4],
            store: true,
        };
        let pass = device.begin_render_pass(cmd, &[color], None).unwrap();
        let nested = device.begin_render_pass(cmd, &[color], None).unwrap_err();
        assert!(matches!(nested, Error::Frame(FrameError::Recording(_))));
        device.end_render_pass(pass).unwrap();

        let draw = DrawIndexed {
            index_count: 3,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        };
        let err = device.draw_indexed(pass, draw).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::Recording(_))));
        assert!(err.to_string().contains("recording failed"));
        device.submit(cmd).unwrap();
    }

    fn gui_frame(device: &RecordingDevice, delta: egui::TexturesDelta) -> CommandBufferId {
        let cmd = device.acquire_command_buffer().unwrap();
        let target = device.acquire_swapchain_texture(cmd).unwrap().unwrap();
        let color = ColorTarget {
            texture: target,
            load: LoadOp::Load,
            clear_color: [0.0; 4],
            store: true,
        };
        let pass = device.begin_render_pass(cmd, &[color], None).unwrap();
        let mut data = GuiDrawData::empty([8, 8]);
        data.textures_delta = delta;
        device.render_gui(pass, data).unwrap();
        device.end_render_pass(pass).unwrap();
        cmd
    }

    #[test]
    fn gui_texture_deltas_survive_lost_frames() {
        let device = RecordingDevice::new();
        let font = egui::TextureId::Managed(5);

        let mut upload = egui::TexturesDelta::default();
        let image = egui::ColorImage::new([1, 1], egui::Color32::WHITE);
        upload
            .set
            .push((font, egui::epaint::ImageDelta::full(image, egui::TextureOptions::default())));
        let cmd = gui_frame(&device, upload);
        device.cancel_command_buffer(cmd);
        assert_eq!(device.egui_textures(), 1);

        let mut free = egui::TexturesDelta::default();
        free.free.push(font);
        let cmd = gui_frame(&device, free);
        device.fail_submits(true);
        assert!(device.submit(cmd).is_err());
        assert_eq!(device.egui_textures(), 0);
    }

    #[test]
    fn texture_failure_budget() {
        let device = RecordingDevice::new();
        device.fail_textures_after(1);
        let desc = TextureDesc {
            kind: TextureKind::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            width: 1,
            height: 1,
            layers: 1,
            usage: TextureUsage::SAMPLER,
        };
        assert!(device.create_texture("a", &desc).is_ok());
        assert!(device.create_texture("b", &desc).unwrap_err().is_init());
    }
}
