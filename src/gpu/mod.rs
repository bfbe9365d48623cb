// src/gpu/mod.rs
//! Explicit command-buffer GPU interface.
//!
//! Everything the renderer does to the GPU goes through [`GpuDevice`]:
//! resources are opaque ids, work is recorded into command buffers made of
//! copy passes and render passes, and nothing executes until `submit`.
//!
//! Two backends implement it:
//! - [`WgpuDevice`]: records passes and replays them onto a `wgpu` encoder.
//! - [`RecordingDevice`]: headless, keeps resource contents in memory and
//!   logs every call. Used by the tests and for readback.
//!
//! Backends use interior mutability (`RefCell`), so a device is meant to be
//! driven from a single thread.

use bitflags::bitflags;

use crate::error::Result;
use crate::gui::GuiDrawData;

pub mod recording;
pub mod shader;
pub mod wgpu_device;

pub use recording::RecordingDevice;
pub use shader::load_shader;
pub use wgpu_device::WgpuDevice;

macro_rules! gpu_ids {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u64);

            impl $name {
                #[inline]
                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

gpu_ids!(
    /// Device-local vertex or index buffer.
    BufferId,
    /// Host-visible staging memory for uploads.
    TransferBufferId,
    /// 2D texture, cubemap, render target or swapchain image.
    TextureId,
    SamplerId,
    ShaderId,
    PipelineId,
    CommandBufferId,
    RenderPassId,
    CopyPassId,
);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLER = 1 << 0;
        const COLOR_TARGET = 1 << 1;
        const DEPTH_TARGET = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    /// Infers the stage from a `"vert"` / `"frag"` substring in the file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.contains("vert") {
            Some(Self::Vertex)
        } else if name.contains("frag") {
            Some(Self::Fragment)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShaderCode {
    SpirV(Vec<u8>),
    Wgsl(String),
}

/// Resource counts a shader declares. They must match the shader code or
/// pipeline creation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderResources {
    pub samplers: u32,
    pub uniform_buffers: u32,
    pub storage_buffers: u32,
    pub storage_textures: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TextureKind {
    #[default]
    D2,
    Cube,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderDesc {
    pub label: String,
    pub code: ShaderCode,
    pub stage: ShaderStage,
    pub resources: ShaderResources,
    /// View dimension of every texture this shader samples.
    pub sampler_kind: TextureKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Array layers; 6 for cubemaps.
    pub layers: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Bytes per texel for the formats this crate uploads or renders to.
    pub fn bytes_per_texel(&self) -> u32 {
        self.format.block_copy_size(None).unwrap_or(4)
    }

    pub fn layer_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.bytes_per_texel() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: wgpu::FilterMode,
    pub mag_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::FilterMode,
    pub address_mode: wgpu::AddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: wgpu::FilterMode::Nearest,
            mag_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            address_mode: wgpu::AddressMode::ClampToEdge,
        }
    }
}

/// Interleaved vertex layouts understood by the pipeline builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexLayout {
    /// `float3` position.
    Position,
    /// `float3` position + `float3` color.
    PositionColor,
    /// `float3` position + `float2` uv.
    PositionUv,
}

impl VertexLayout {
    pub fn stride(self) -> u64 {
        match self {
            Self::Position => 12,
            Self::PositionColor => 24,
            Self::PositionUv => 20,
        }
    }

    pub fn attributes(self) -> &'static [wgpu::VertexAttribute] {
        const POSITION: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];
        const POSITION_COLOR: [wgpu::VertexAttribute; 2] =
            wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];
        const POSITION_UV: [wgpu::VertexAttribute; 2] =
            wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x2];

        match self {
            Self::Position => &POSITION,
            Self::PositionColor => &POSITION_COLOR,
            Self::PositionUv => &POSITION_UV,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FillMode {
    #[default]
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub format: wgpu::TextureFormat,
    pub write: bool,
    pub compare: wgpu::CompareFunction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub label: String,
    pub vertex_shader: ShaderId,
    pub fragment_shader: ShaderId,
    pub vertex_layout: VertexLayout,
    pub color_format: wgpu::TextureFormat,
    pub depth: Option<DepthState>,
    pub fill_mode: FillMode,
    pub cull_mode: Option<wgpu::Face>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Clear,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    pub texture: TextureId,
    pub load: LoadOp,
    pub clear_color: [f32; 4],
    pub store: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    pub texture: TextureId,
    pub load: LoadOp,
    pub clear_depth: f32,
    pub store: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: BufferId,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSamplerBinding {
    pub texture: TextureId,
    pub sampler: SamplerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLocation {
    pub transfer_buffer: TransferBufferId,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRegion {
    pub texture: TextureId,
    pub layer: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndexed {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Index element types the upload and draw paths accept.
pub trait IndexElement: bytemuck::Pod {
    const FORMAT: wgpu::IndexFormat;
}

impl IndexElement for u16 {
    const FORMAT: wgpu::IndexFormat = wgpu::IndexFormat::Uint16;
}

impl IndexElement for u32 {
    const FORMAT: wgpu::IndexFormat = wgpu::IndexFormat::Uint32;
}

/// An explicit command-buffer GPU device.
///
/// Creation calls fail with [`Error::Init`](crate::Error::Init); per-frame
/// calls fail with [`Error::Frame`](crate::Error::Frame). Release calls are
/// idempotent: releasing an unknown or already released id does nothing.
pub trait GpuDevice {
    // ---------------------------------------------------------------- resources
    fn create_shader(&self, desc: &ShaderDesc) -> Result<ShaderId>;
    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId>;
    /// `size` is in bytes.
    fn create_buffer(&self, label: &str, usage: BufferUsage, size: u64) -> Result<BufferId>;
    fn create_transfer_buffer(&self, size: u64) -> Result<TransferBufferId>;
    /// Maps the transfer buffer, copies `data` in at `offset`, unmaps it.
    fn write_transfer_buffer(
        &self,
        transfer_buffer: TransferBufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<()>;
    fn create_texture(&self, label: &str, desc: &TextureDesc) -> Result<TextureId>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId>;

    fn release_shader(&self, shader: ShaderId);
    fn release_pipeline(&self, pipeline: PipelineId);
    fn release_buffer(&self, buffer: BufferId);
    fn release_transfer_buffer(&self, transfer_buffer: TransferBufferId);
    fn release_texture(&self, texture: TextureId);
    fn release_sampler(&self, sampler: SamplerId);

    /// Blocks until every submitted command buffer finished executing.
    fn wait_idle(&self) -> Result<()>;

    // ---------------------------------------------------------- command buffers
    fn acquire_command_buffer(&self) -> Result<CommandBufferId>;
    /// `Ok(None)` means no swapchain image is available this frame (e.g. the
    /// window is minimized). The command buffer must still be submitted.
    fn acquire_swapchain_texture(&self, cmd: CommandBufferId) -> Result<Option<TextureId>>;
    /// Sets vertex uniform `slot` for every draw recorded after this call.
    fn push_vertex_uniform(&self, cmd: CommandBufferId, slot: u32, data: &[u8]) -> Result<()>;
    /// Consumes the command buffer. Recorded work executes in submission order.
    fn submit(&self, cmd: CommandBufferId) -> Result<()>;
    /// Discards a command buffer without executing anything recorded in it.
    fn cancel_command_buffer(&self, cmd: CommandBufferId);

    // --------------------------------------------------------------- copy passes
    fn begin_copy_pass(&self, cmd: CommandBufferId) -> Result<CopyPassId>;
    fn upload_to_buffer(
        &self,
        pass: CopyPassId,
        source: TransferLocation,
        destination: BufferRegion,
    ) -> Result<()>;
    fn upload_to_texture(
        &self,
        pass: CopyPassId,
        source: TransferLocation,
        destination: TextureRegion,
    ) -> Result<()>;
    fn end_copy_pass(&self, pass: CopyPassId) -> Result<()>;

    // ------------------------------------------------------------- render passes
    fn begin_render_pass(
        &self,
        cmd: CommandBufferId,
        color: &[ColorTarget],
        depth: Option<&DepthTarget>,
    ) -> Result<RenderPassId>;
    fn bind_pipeline(&self, pass: RenderPassId, pipeline: PipelineId) -> Result<()>;
    fn bind_vertex_buffers(
        &self,
        pass: RenderPassId,
        first_slot: u32,
        bindings: &[BufferBinding],
    ) -> Result<()>;
    fn bind_index_buffer(
        &self,
        pass: RenderPassId,
        binding: BufferBinding,
        format: wgpu::IndexFormat,
    ) -> Result<()>;
    fn bind_fragment_samplers(
        &self,
        pass: RenderPassId,
        first_slot: u32,
        bindings: &[TextureSamplerBinding],
    ) -> Result<()>;
    fn set_viewport(&self, pass: RenderPassId, viewport: &Viewport) -> Result<()>;
    fn draw_indexed(&self, pass: RenderPassId, draw: DrawIndexed) -> Result<()>;
    /// Records GUI draw data into the pass. The backend prepares its buffers
    /// before the pass begins on replay. Texture uploads in the delta take
    /// effect immediately; its frees apply once the command buffer is
    /// submitted or cancelled, even if submission fails.
    fn render_gui(&self, pass: RenderPassId, draw_data: GuiDrawData) -> Result<()>;
    fn end_render_pass(&self, pass: RenderPassId) -> Result<()>;

    // -------------------------------------------------------------------- GUI
    /// Makes a texture sampleable by the GUI (e.g. the offscreen scene target).
    fn register_gui_texture(&self, texture: TextureId) -> Result<egui::TextureId>;
    fn unregister_gui_texture(&self, id: egui::TextureId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_from_file_name() {
        assert_eq!(ShaderStage::from_file_name("cube.vert.wgsl"), Some(ShaderStage::Vertex));
        assert_eq!(ShaderStage::from_file_name("frag.spv"), Some(ShaderStage::Fragment));
        assert_eq!(ShaderStage::from_file_name("compute.spv"), None);
    }

    #[test]
    fn vertex_layout_strides_match_attributes() {
        for layout in [VertexLayout::Position, VertexLayout::PositionColor, VertexLayout::PositionUv] {
            let last = layout.attributes().last().unwrap();
            assert_eq!(last.offset + last.format.size(), layout.stride());
        }
    }

    #[test]
    fn layer_size_uses_format() {
        let desc = TextureDesc {
            kind: TextureKind::D2,
            format: wgpu::TextureFormat::Depth16Unorm,
            width: 4,
            height: 2,
            layers: 1,
            usage: TextureUsage::DEPTH_TARGET,
        };
        assert_eq!(desc.layer_size(), 16);
    }
}
