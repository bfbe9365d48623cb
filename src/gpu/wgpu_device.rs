// src/gpu/wgpu_device.rs
//! [`GpuDevice`] backed by `wgpu`.
//!
//! Command buffers are recordings: passes and their commands are stored when
//! issued and replayed onto a `wgpu::CommandEncoder` at `submit`, followed by
//! a queue submission and swapchain present.
//!
//! Binding convention:
//! - group 0, binding *i*: vertex uniform slot *i* (dynamic offset into a
//!   per-submission uniform ring)
//! - group 1, bindings 2*j* / 2*j*+1: fragment texture / sampler *j*
//!
//! Copy passes replay as `queue.write_buffer` / `queue.write_texture`, which
//! execute before everything else in the same submission. Record copies in
//! their own command buffer (as the upload helpers do) to keep ordering exact.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use log::{debug, info, warn};
use winit::window::Window;

use super::*;
use crate::error::{Error, FrameError, Result};
use crate::gui::GuiDrawData;

/// Stride between uniform slots inside the ring (the WebGPU offset alignment).
const UNIFORM_SLOT_SIZE: u64 = 256;
/// Uniform bytes available per submission.
const UNIFORM_RING_SIZE: u64 = 256 * 1024;
const ENTRY_POINT: &str = "main";

struct ShaderEntry {
    module: wgpu::ShaderModule,
    stage: ShaderStage,
    resources: ShaderResources,
    sampler_kind: TextureKind,
}

struct PipelineEntry {
    pipeline: wgpu::RenderPipeline,
    uniform_count: u32,
    sampler_count: u32,
    sampler_kind: TextureKind,
}

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

enum CopyOp {
    Buffer {
        source: TransferLocation,
        destination: BufferRegion,
    },
    Texture {
        source: TransferLocation,
        destination: TextureRegion,
    },
}

enum PassOp {
    Pipeline(PipelineId),
    VertexBuffers(u32, Vec<BufferBinding>),
    IndexBuffer(BufferBinding, wgpu::IndexFormat),
    Samplers(u32, Vec<TextureSamplerBinding>),
    Viewport(Viewport),
    Draw {
        draw: DrawIndexed,
        uniforms: Vec<Option<Vec<u8>>>,
    },
    Gui(GuiDrawData),
}

struct RenderPassRecord {
    color: Vec<ColorTarget>,
    depth: Option<DepthTarget>,
    ops: Vec<PassOp>,
}

enum RecordedPass {
    Copy(Vec<CopyOp>),
    Render(RenderPassRecord),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpenPass {
    Copy(u64),
    Render(u64),
}

struct SwapchainImage {
    id: u64,
    frame: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
}

#[derive(Default)]
struct CommandRecord {
    passes: Vec<RecordedPass>,
    open: Option<OpenPass>,
    /// Current vertex uniform state, snapshotted into every draw.
    uniforms: Vec<Option<Vec<u8>>>,
    swapchain: Option<SwapchainImage>,
}

#[derive(Default)]
struct Objects {
    next_id: u64,
    shaders: HashMap<u64, ShaderEntry>,
    pipelines: HashMap<u64, PipelineEntry>,
    buffers: HashMap<u64, wgpu::Buffer>,
    transfer_buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, TextureEntry>,
    samplers: HashMap<u64, wgpu::Sampler>,
    commands: HashMap<u64, CommandRecord>,
    /// Pass id → owning command buffer id.
    passes: HashMap<u64, u64>,
}

impl Objects {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn command(&mut self, cmd: CommandBufferId) -> Result<&mut CommandRecord> {
        self.commands
            .get_mut(&cmd.0)
            .ok_or_else(|| FrameError::Recording(format!("unknown command buffer {}", cmd.0)).into())
    }
}

struct UniformBinding {
    layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
}

/// Real GPU device rendering into a window surface.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: RefCell<wgpu::SurfaceConfiguration>,
    minimized: Cell<bool>,
    objects: RefCell<Objects>,
    uniform_ring: wgpu::Buffer,
    /// Keyed by uniform slot count.
    uniform_bindings: RefCell<HashMap<u32, UniformBinding>>,
    /// Keyed by (sampler count, view dimension).
    sampler_layouts: RefCell<HashMap<(u32, TextureKind), wgpu::BindGroupLayout>>,
    gui_renderer: RefCell<egui_wgpu::Renderer>,
    gui_frees: RefCell<GuiTextureFrees>,
}

/// egui textures freed by recorded GUI frames, released once that frame's
/// command buffer is submitted or cancelled.
#[derive(Debug, Default)]
struct GuiTextureFrees(Vec<egui::TextureId>);

impl GuiTextureFrees {
    fn defer(&mut self, delta: &egui::TexturesDelta) {
        self.0.extend(delta.free.iter().copied());
    }

    fn take(&mut self) -> Vec<egui::TextureId> {
        std::mem::take(&mut self.0)
    }
}

impl WgpuDevice {
    /// Creates the device and configures the window surface.
    ///
    /// Fails with [`Error::Init`] when no adapter is available or the adapter
    /// lacks wireframe (`POLYGON_MODE_LINE`) support.
    pub fn new(window: Arc<Window>, vsync: bool) -> Result<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    async fn new_async(window: Arc<Window>, vsync: bool) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let size = window.inner_size();
        let surface = instance
            .create_surface(window)
            .map_err(|e| Error::init(format!("creating surface: {e}")))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::init("no compatible GPU adapter"))?;

        let info = adapter.get_info();
        info!("Using {} ({:?})", info.name, info.backend);

        let required_features = wgpu::Features::POLYGON_MODE_LINE;
        if !adapter.features().contains(required_features) {
            return Err(Error::init(
                "adapter does not support line fill mode (POLYGON_MODE_LINE)",
            ));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("cube_demo_device"),
                    required_features,
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::init(format!("requesting device: {e}")))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| Error::init("surface reports no supported formats"))?;

        let present_mode = if vsync {
            wgpu::PresentMode::Fifo
        } else {
            caps.present_modes
                .iter()
                .copied()
                .find(|m| matches!(m, wgpu::PresentMode::Mailbox | wgpu::PresentMode::Immediate))
                .unwrap_or(wgpu::PresentMode::Fifo)
        };

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        let minimized = size.width == 0 || size.height == 0;
        if !minimized {
            surface.configure(&device, &surface_config);
        }
        debug!("Surface {:?} {}x{} {:?}", format, size.width, size.height, present_mode);

        let uniform_ring = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("uniform_ring"),
            size: UNIFORM_RING_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let gui_renderer = egui_wgpu::Renderer::new(&device, format, None, 1, false);

        Ok(Self {
            device,
            queue,
            surface,
            surface_config: RefCell::new(surface_config),
            minimized: Cell::new(minimized),
            objects: RefCell::new(Objects::default()),
            uniform_ring,
            uniform_bindings: RefCell::new(HashMap::new()),
            sampler_layouts: RefCell::new(HashMap::new()),
            gui_renderer: RefCell::new(gui_renderer),
            gui_frees: RefCell::new(GuiTextureFrees::default()),
        })
    }

    /// Reconfigures the surface for a new window size. A zero size marks the
    /// window minimized; swapchain acquisition then yields no image.
    pub fn resize(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            self.minimized.set(true);
            return;
        }
        self.minimized.set(false);
        let mut config = self.surface_config.borrow_mut();
        config.width = width;
        config.height = height;
        self.surface.configure(&self.device, &config);
    }

    /// Runs `f` inside a validation error scope.
    fn scoped<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(Error::init(format!("{what}: {err}"))),
            None => Ok(value),
        }
    }

    fn ensure_uniform_binding(&self, count: u32) {
        let mut bindings = self.uniform_bindings.borrow_mut();
        if bindings.contains_key(&count) {
            return;
        }

        let layout_entries: Vec<_> = (0..count)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("vertex_uniforms"),
            entries: &layout_entries,
        });

        let entries: Vec<_> = (0..count)
            .map(|binding| wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &self.uniform_ring,
                    offset: 0,
                    size: NonZeroU64::new(UNIFORM_SLOT_SIZE),
                }),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("vertex_uniforms"),
            layout: &layout,
            entries: &entries,
        });

        bindings.insert(count, UniformBinding { layout, bind_group });
    }

    fn ensure_sampler_layout(&self, count: u32, kind: TextureKind) {
        let mut layouts = self.sampler_layouts.borrow_mut();
        if layouts.contains_key(&(count, kind)) {
            return;
        }

        let view_dimension = match kind {
            TextureKind::D2 => wgpu::TextureViewDimension::D2,
            TextureKind::Cube => wgpu::TextureViewDimension::Cube,
        };
        let entries: Vec<_> = (0..count)
            .flat_map(|slot| {
                [
                    wgpu::BindGroupLayoutEntry {
                        binding: slot * 2,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: slot * 2 + 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ]
            })
            .collect();
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("fragment_samplers"),
            entries: &entries,
        });
        layouts.insert((count, kind), layout);
    }

    fn with_render_pass(
        &self,
        pass: RenderPassId,
        make: impl FnOnce(&CommandRecord) -> PassOp,
    ) -> Result<()> {
        let mut objects = self.objects.borrow_mut();
        let cmd = *objects
            .passes
            .get(&pass.0)
            .ok_or_else(|| FrameError::Recording(format!("unknown render pass {}", pass.0)))?;
        let record = objects.command(CommandBufferId(cmd))?;
        let op = make(record);
        match (record.open, record.passes.last_mut()) {
            (Some(OpenPass::Render(id)), Some(RecordedPass::Render(rec))) if id == pass.0 => {
                rec.ops.push(op);
                Ok(())
            }
            _ => Err(FrameError::Recording(format!("render pass {} is not open", pass.0)).into()),
        }
    }

    fn with_copy_pass(&self, pass: CopyPassId, op: CopyOp) -> Result<()> {
        let mut objects = self.objects.borrow_mut();
        let cmd = *objects
            .passes
            .get(&pass.0)
            .ok_or_else(|| Error::upload(format!("unknown copy pass {}", pass.0)))?;
        let record = objects.command(CommandBufferId(cmd))?;
        match (record.open, record.passes.last_mut()) {
            (Some(OpenPass::Copy(id)), Some(RecordedPass::Copy(ops))) if id == pass.0 => {
                ops.push(op);
                Ok(())
            }
            _ => Err(Error::upload(format!("copy pass {} is not open", pass.0))),
        }
    }

    // --------------------------------------------------------------- replay

    fn replay_copy(&self, objects: &Objects, op: &CopyOp) -> Result<()> {
        let missing = || FrameError::Submit("transfer buffer released before submission".into());
        match op {
            CopyOp::Buffer { source, destination } => {
                let staging = objects
                    .transfer_buffers
                    .get(&source.transfer_buffer.0)
                    .ok_or_else(missing)?;
                let buffer = objects
                    .buffers
                    .get(&destination.buffer.0)
                    .ok_or_else(|| FrameError::Submit("destination buffer released".into()))?;
                let start = source.offset as usize;
                let bytes = staging
                    .get(start..start + destination.size as usize)
                    .ok_or_else(|| FrameError::Submit("copy source out of range".into()))?;
                // write_buffer wants 4-byte multiples; buffers are created padded.
                let padded = wgpu::util::align_to(bytes.len(), wgpu::COPY_BUFFER_ALIGNMENT as usize);
                if padded == bytes.len() {
                    self.queue.write_buffer(buffer, destination.offset, bytes);
                } else {
                    let mut data = bytes.to_vec();
                    data.resize(padded, 0);
                    self.queue.write_buffer(buffer, destination.offset, &data);
                }
            }
            CopyOp::Texture { source, destination } => {
                let staging = objects
                    .transfer_buffers
                    .get(&source.transfer_buffer.0)
                    .ok_or_else(missing)?;
                let entry = objects
                    .textures
                    .get(&destination.texture.0)
                    .ok_or_else(|| FrameError::Submit("destination texture released".into()))?;
                let bytes_per_row = destination.width * entry.desc.bytes_per_texel();
                let layer_size = bytes_per_row as usize * destination.height as usize;
                let start = source.offset as usize;
                let bytes = staging
                    .get(start..start + layer_size)
                    .ok_or_else(|| FrameError::Submit("copy source out of range".into()))?;
                self.queue.write_texture(
                    wgpu::ImageCopyTexture {
                        texture: &entry.texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d {
                            x: 0,
                            y: 0,
                            z: destination.layer,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    bytes,
                    wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(destination.height),
                    },
                    wgpu::Extent3d {
                        width: destination.width,
                        height: destination.height,
                        depth_or_array_layers: 1,
                    },
                );
            }
        }
        Ok(())
    }

    fn attachment_view<'a>(
        objects: &'a Objects,
        record: &'a CommandRecord,
        texture: TextureId,
    ) -> Result<&'a wgpu::TextureView> {
        if let Some(image) = record.swapchain.as_ref().filter(|img| img.id == texture.0) {
            return Ok(&image.view);
        }
        objects
            .textures
            .get(&texture.0)
            .map(|entry| &entry.view)
            .ok_or_else(|| FrameError::Submit(format!("unknown render target {}", texture.0)).into())
    }

    fn sampler_bind_group(
        &self,
        objects: &Objects,
        pipeline: &PipelineEntry,
        bound: &[Option<TextureSamplerBinding>],
    ) -> Result<wgpu::BindGroup> {
        let layouts = self.sampler_layouts.borrow();
        let layout = layouts
            .get(&(pipeline.sampler_count, pipeline.sampler_kind))
            .ok_or_else(|| FrameError::Submit("missing sampler layout".into()))?;

        let mut entries = Vec::with_capacity(pipeline.sampler_count as usize * 2);
        for slot in 0..pipeline.sampler_count {
            let binding = bound
                .get(slot as usize)
                .copied()
                .flatten()
                .ok_or_else(|| FrameError::Submit(format!("fragment sampler {slot} not bound")))?;
            let texture = objects
                .textures
                .get(&binding.texture.0)
                .ok_or_else(|| FrameError::Submit(format!("unknown texture {}", binding.texture.0)))?;
            let sampler = objects
                .samplers
                .get(&binding.sampler.0)
                .ok_or_else(|| FrameError::Submit(format!("unknown sampler {}", binding.sampler.0)))?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot * 2,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: slot * 2 + 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fragment_samplers"),
            layout,
            entries: &entries,
        }))
    }

    /// Uploads the GUI texture changes immediately and queues the frees.
    fn apply_gui_textures(&self, delta: &egui::TexturesDelta) {
        let mut gui = self.gui_renderer.borrow_mut();
        for (id, image) in &delta.set {
            gui.update_texture(&self.device, &self.queue, *id, image);
        }
        self.gui_frees.borrow_mut().defer(delta);
    }

    fn free_gui_textures(&self) {
        let frees = self.gui_frees.borrow_mut().take();
        let mut gui = self.gui_renderer.borrow_mut();
        for id in &frees {
            gui.free_texture(id);
        }
    }

    /// Encodes a recording. Returns the command buffers to submit (GUI
    /// callback buffers first) and the uniform ring contents.
    fn replay(&self, record: &CommandRecord) -> Result<(Vec<wgpu::CommandBuffer>, Vec<u8>)> {
        let objects = self.objects.borrow();
        let uniform_bindings = self.uniform_bindings.borrow();
        let mut gui = self.gui_renderer.borrow_mut();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("frame") });
        let mut buffers = Vec::new();
        let mut ring = Vec::new();

        for pass in &record.passes {
            let rec = match pass {
                RecordedPass::Copy(ops) => {
                    for op in ops {
                        self.replay_copy(&objects, op)?;
                    }
                    continue;
                }
                RecordedPass::Render(rec) => rec,
            };

            // GUI buffers are prepared before the pass begins.
            for op in &rec.ops {
                if let PassOp::Gui(data) = op {
                    buffers.extend(gui.update_buffers(
                        &self.device,
                        &self.queue,
                        &mut encoder,
                        &data.primitives,
                        &data.screen_descriptor(),
                    ));
                }
            }

            let color_attachments = rec
                .color
                .iter()
                .map(|target| -> Result<Option<wgpu::RenderPassColorAttachment<'_>>> {
                    let view = Self::attachment_view(&objects, record, target.texture)?;
                    let [r, g, b, a] = target.clear_color.map(f64::from);
                    Ok(Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: match target.load {
                                LoadOp::Clear => wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                                LoadOp::Load => wgpu::LoadOp::Load,
                            },
                            store: store_op(target.store),
                        },
                    }))
                })
                .collect::<Result<Vec<_>>>()?;

            let depth_attachment = match &rec.depth {
                Some(target) => Some(wgpu::RenderPassDepthStencilAttachment {
                    view: Self::attachment_view(&objects, record, target.texture)?,
                    depth_ops: Some(wgpu::Operations {
                        load: match target.load {
                            LoadOp::Clear => wgpu::LoadOp::Clear(target.clear_depth),
                            LoadOp::Load => wgpu::LoadOp::Load,
                        },
                        store: store_op(target.store),
                    }),
                    stencil_ops: None,
                }),
                None => None,
            };

            let mut rpass = encoder
                .begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("render_pass"),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment: depth_attachment,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                })
                .forget_lifetime();

            let mut current: Option<&PipelineEntry> = None;
            let mut samplers: Vec<Option<TextureSamplerBinding>> = Vec::new();

            for op in &rec.ops {
                match op {
                    PassOp::Pipeline(id) => {
                        let entry = objects
                            .pipelines
                            .get(&id.0)
                            .ok_or_else(|| FrameError::Submit(format!("unknown pipeline {}", id.0)))?;
                        rpass.set_pipeline(&entry.pipeline);
                        current = Some(entry);
                    }
                    PassOp::VertexBuffers(first, bindings) => {
                        for (slot, binding) in (*first..).zip(bindings) {
                            let buffer = objects.buffers.get(&binding.buffer.0).ok_or_else(|| {
                                FrameError::Submit(format!("unknown buffer {}", binding.buffer.0))
                            })?;
                            rpass.set_vertex_buffer(slot, buffer.slice(binding.offset..));
                        }
                    }
                    PassOp::IndexBuffer(binding, format) => {
                        let buffer = objects.buffers.get(&binding.buffer.0).ok_or_else(|| {
                            FrameError::Submit(format!("unknown buffer {}", binding.buffer.0))
                        })?;
                        rpass.set_index_buffer(buffer.slice(binding.offset..), *format);
                    }
                    PassOp::Samplers(first, bindings) => {
                        for (slot, binding) in (*first as usize..).zip(bindings) {
                            if samplers.len() <= slot {
                                samplers.resize(slot + 1, None);
                            }
                            samplers[slot] = Some(*binding);
                        }
                    }
                    PassOp::Viewport(v) => {
                        rpass.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
                    }
                    PassOp::Draw { draw, uniforms } => {
                        let pipeline = current
                            .ok_or_else(|| FrameError::Submit("draw without a bound pipeline".into()))?;

                        let binding = uniform_bindings
                            .get(&pipeline.uniform_count)
                            .ok_or_else(|| FrameError::Submit("missing uniform layout".into()))?;
                        let offsets = stage_uniforms(&mut ring, uniforms, pipeline.uniform_count)?;
                        rpass.set_bind_group(0, &binding.bind_group, &offsets);

                        if pipeline.sampler_count > 0 {
                            let group = self.sampler_bind_group(&objects, pipeline, &samplers)?;
                            rpass.set_bind_group(1, &group, &[]);
                        }

                        rpass.draw_indexed(
                            draw.first_index..draw.first_index + draw.index_count,
                            draw.vertex_offset,
                            draw.first_instance..draw.first_instance + draw.instance_count,
                        );
                    }
                    PassOp::Gui(data) => {
                        gui.render(&mut rpass, &data.primitives, &data.screen_descriptor());
                    }
                }
            }
        }

        buffers.push(encoder.finish());
        Ok((buffers, ring))
    }
}

fn store_op(store: bool) -> wgpu::StoreOp {
    if store {
        wgpu::StoreOp::Store
    } else {
        wgpu::StoreOp::Discard
    }
}

/// Appends one slot per uniform binding to the ring and returns the dynamic
/// offsets. Slots never pushed read as zeros.
fn stage_uniforms(ring: &mut Vec<u8>, uniforms: &[Option<Vec<u8>>], count: u32) -> Result<Vec<u32>> {
    let mut offsets = Vec::with_capacity(count as usize);
    for slot in 0..count as usize {
        let offset = ring.len();
        if (offset as u64) + UNIFORM_SLOT_SIZE > UNIFORM_RING_SIZE {
            return Err(FrameError::Submit("uniform ring exhausted".into()).into());
        }
        if let Some(Some(data)) = uniforms.get(slot) {
            ring.extend_from_slice(data);
        }
        ring.resize(offset + UNIFORM_SLOT_SIZE as usize, 0);
        offsets.push(offset as u32);
    }
    Ok(offsets)
}

impl GpuDevice for WgpuDevice {
    fn create_shader(&self, desc: &ShaderDesc) -> Result<ShaderId> {
        let source = match &desc.code {
            ShaderCode::SpirV(bytes) => {
                if bytes.len() % 4 != 0 {
                    return Err(Error::init(format!("{}: SPIR-V length is not a multiple of 4", desc.label)));
                }
                wgpu::util::make_spirv(bytes)
            }
            ShaderCode::Wgsl(source) => wgpu::ShaderSource::Wgsl(Cow::Borrowed(source.as_str())),
        };

        let module = self.scoped(&format!("compiling {}", desc.label), |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.label),
                source,
            })
        })?;

        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.shaders.insert(
            id,
            ShaderEntry {
                module,
                stage: desc.stage,
                resources: desc.resources,
                sampler_kind: desc.sampler_kind,
            },
        );
        Ok(ShaderId(id))
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        let objects = self.objects.borrow();
        let vs = objects
            .shaders
            .get(&desc.vertex_shader.0)
            .ok_or_else(|| Error::init(format!("{}: unknown vertex shader", desc.label)))?;
        let fs = objects
            .shaders
            .get(&desc.fragment_shader.0)
            .ok_or_else(|| Error::init(format!("{}: unknown fragment shader", desc.label)))?;
        if vs.stage != ShaderStage::Vertex || fs.stage != ShaderStage::Fragment {
            return Err(Error::init(format!("{}: shader stages mismatch", desc.label)));
        }

        let uniform_count = vs.resources.uniform_buffers;
        let sampler_count = fs.resources.samplers;
        let sampler_kind = fs.sampler_kind;
        self.ensure_uniform_binding(uniform_count);
        self.ensure_sampler_layout(sampler_count, sampler_kind);

        let uniform_bindings = self.uniform_bindings.borrow();
        let sampler_layouts = self.sampler_layouts.borrow();
        let mut group_layouts = Vec::with_capacity(2);
        if let Some(binding) = uniform_bindings.get(&uniform_count) {
            group_layouts.push(&binding.layout);
        }
        if sampler_count > 0 {
            if let Some(layout) = sampler_layouts.get(&(sampler_count, sampler_kind)) {
                group_layouts.push(layout);
            }
        }

        let pipeline = self.scoped(&format!("creating pipeline {}", desc.label), |device| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&desc.label),
                bind_group_layouts: &group_layouts,
                push_constant_ranges: &[],
            });

            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&desc.label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &vs.module,
                    entry_point: ENTRY_POINT,
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: desc.vertex_layout.stride(),
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: desc.vertex_layout.attributes(),
                    }],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &fs.module,
                    entry_point: ENTRY_POINT,
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: desc.color_format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: desc.cull_mode,
                    unclipped_depth: false,
                    polygon_mode: match desc.fill_mode {
                        FillMode::Fill => wgpu::PolygonMode::Fill,
                        FillMode::Line => wgpu::PolygonMode::Line,
                    },
                    conservative: false,
                },
                depth_stencil: desc.depth.map(|depth| wgpu::DepthStencilState {
                    format: depth.format,
                    depth_write_enabled: depth.write,
                    depth_compare: depth.compare,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        })?;

        drop(uniform_bindings);
        drop(sampler_layouts);
        drop(objects);

        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.pipelines.insert(
            id,
            PipelineEntry {
                pipeline,
                uniform_count,
                sampler_count,
                sampler_kind,
            },
        );
        Ok(PipelineId(id))
    }

    fn create_buffer(&self, label: &str, usage: BufferUsage, size: u64) -> Result<BufferId> {
        let mut usages = wgpu::BufferUsages::COPY_DST;
        if usage.contains(BufferUsage::VERTEX) {
            usages |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::INDEX) {
            usages |= wgpu::BufferUsages::INDEX;
        }

        let buffer = self.scoped(&format!("creating buffer {label}"), |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: wgpu::util::align_to(size.max(1), wgpu::COPY_BUFFER_ALIGNMENT),
                usage: usages,
                mapped_at_creation: false,
            })
        })?;

        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.buffers.insert(id, buffer);
        Ok(BufferId(id))
    }

    fn create_transfer_buffer(&self, size: u64) -> Result<TransferBufferId> {
        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.transfer_buffers.insert(id, vec![0; size as usize]);
        Ok(TransferBufferId(id))
    }

    fn write_transfer_buffer(
        &self,
        transfer_buffer: TransferBufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut objects = self.objects.borrow_mut();
        let memory = objects
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
        let mut usage = wgpu::TextureUsages::COPY_DST;
        if desc.usage.contains(TextureUsage::SAMPLER) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if desc.usage.intersects(TextureUsage::COLOR_TARGET | TextureUsage::DEPTH_TARGET) {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }

        let (texture, view) = self.scoped(&format!("creating texture {label}"), |device| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: desc.layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: desc.format,
                usage,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(label),
                dimension: Some(match desc.kind {
                    TextureKind::D2 => wgpu::TextureViewDimension::D2,
                    TextureKind::Cube => wgpu::TextureViewDimension::Cube,
                }),
                ..Default::default()
            });
            (texture, view)
        })?;

        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.textures.insert(
            id,
            TextureEntry {
                texture,
                view,
                desc: *desc,
            },
        );
        Ok(TextureId(id))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("sampler"),
            address_mode_u: desc.address_mode,
            address_mode_v: desc.address_mode,
            address_mode_w: desc.address_mode,
            mag_filter: desc.mag_filter,
            min_filter: desc.min_filter,
            mipmap_filter: desc.mipmap_filter,
            ..Default::default()
        });
        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.samplers.insert(id, sampler);
        Ok(SamplerId(id))
    }

    fn release_shader(&self, shader: ShaderId) {
        self.objects.borrow_mut().shaders.remove(&shader.0);
    }

    fn release_pipeline(&self, pipeline: PipelineId) {
        self.objects.borrow_mut().pipelines.remove(&pipeline.0);
    }

    fn release_buffer(&self, buffer: BufferId) {
        if let Some(buffer) = self.objects.borrow_mut().buffers.remove(&buffer.0) {
            buffer.destroy();
        }
    }

    fn release_transfer_buffer(&self, transfer_buffer: TransferBufferId) {
        self.objects.borrow_mut().transfer_buffers.remove(&transfer_buffer.0);
    }

    fn release_texture(&self, texture: TextureId) {
        if let Some(entry) = self.objects.borrow_mut().textures.remove(&texture.0) {
            entry.texture.destroy();
        }
    }

    fn release_sampler(&self, sampler: SamplerId) {
        self.objects.borrow_mut().samplers.remove(&sampler.0);
    }

    fn wait_idle(&self) -> Result<()> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn acquire_command_buffer(&self) -> Result<CommandBufferId> {
        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.commands.insert(id, CommandRecord::default());
        Ok(CommandBufferId(id))
    }

    fn acquire_swapchain_texture(&self, cmd: CommandBufferId) -> Result<Option<TextureId>> {
        self.objects.borrow_mut().command(cmd)?;
        if self.minimized.get() {
            return Ok(None);
        }

        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Timeout) => {
                debug!("Swapchain acquisition timed out");
                return Ok(None);
            }
            Err(err @ (wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost)) => {
                warn!("Swapchain {err}, reconfiguring surface");
                self.surface.configure(&self.device, &self.surface_config.borrow());
                return Ok(None);
            }
            Err(err) => return Err(FrameError::Swapchain(err.to_string()).into()),
        };

        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        objects.command(cmd)?.swapchain = Some(SwapchainImage { id, frame, view });
        Ok(Some(TextureId(id)))
    }

    fn push_vertex_uniform(&self, cmd: CommandBufferId, slot: u32, data: &[u8]) -> Result<()> {
        if data.len() as u64 > UNIFORM_SLOT_SIZE {
            return Err(FrameError::Submit(format!(
                "uniform slot {slot}: {} bytes exceeds {UNIFORM_SLOT_SIZE}",
                data.len()
            ))
            .into());
        }
        let mut objects = self.objects.borrow_mut();
        let record = objects.command(cmd)?;
        let slot = slot as usize;
        if record.uniforms.len() <= slot {
            record.uniforms.resize(slot + 1, None);
        }
        record.uniforms[slot] = Some(data.to_vec());
        Ok(())
    }

    fn submit(&self, cmd: CommandBufferId) -> Result<()> {
        let record = {
            let mut objects = self.objects.borrow_mut();
            objects.passes.retain(|_, owner| *owner != cmd.0);
            objects
                .commands
                .remove(&cmd.0)
                .ok_or_else(|| FrameError::Submit(format!("unknown command buffer {}", cmd.0)))?
        };
        if record.open.is_some() {
            return Err(FrameError::Submit("a pass is still open".into()).into());
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let submitted = self.replay(&record).map(|(buffers, ring)| {
            if !ring.is_empty() {
                self.queue.write_buffer(&self.uniform_ring, 0, &ring);
            }
            self.queue.submit(buffers);
        });
        let scope_error = pollster::block_on(self.device.pop_error_scope());
        self.free_gui_textures();

        submitted?;
        if let Some(err) = scope_error {
            return Err(FrameError::Submit(err.to_string()).into());
        }

        if let Some(image) = record.swapchain {
            image.frame.present();
        }
        Ok(())
    }

    fn cancel_command_buffer(&self, cmd: CommandBufferId) {
        {
            let mut objects = self.objects.borrow_mut();
            objects.passes.retain(|_, owner| *owner != cmd.0);
            objects.commands.remove(&cmd.0);
        }
        self.free_gui_textures();
    }

    fn begin_copy_pass(&self, cmd: CommandBufferId) -> Result<CopyPassId> {
        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        let record = objects.command(cmd).map_err(|e| Error::upload(e.to_string()))?;
        if record.open.is_some() {
            return Err(Error::upload("a pass is already open"));
        }
        record.open = Some(OpenPass::Copy(id));
        record.passes.push(RecordedPass::Copy(Vec::new()));
        objects.passes.insert(id, cmd.0);
        Ok(CopyPassId(id))
    }

    fn upload_to_buffer(
        &self,
        pass: CopyPassId,
        source: TransferLocation,
        destination: BufferRegion,
    ) -> Result<()> {
        self.with_copy_pass(pass, CopyOp::Buffer { source, destination })
    }

    fn upload_to_texture(
        &self,
        pass: CopyPassId,
        source: TransferLocation,
        destination: TextureRegion,
    ) -> Result<()> {
        self.with_copy_pass(pass, CopyOp::Texture { source, destination })
    }

    fn end_copy_pass(&self, pass: CopyPassId) -> Result<()> {
        let mut objects = self.objects.borrow_mut();
        let cmd = objects
            .passes
            .remove(&pass.0)
            .ok_or_else(|| Error::upload(format!("unknown copy pass {}", pass.0)))?;
        let record = objects.command(CommandBufferId(cmd))?;
        match record.open {
            Some(OpenPass::Copy(id)) if id == pass.0 => {
                record.open = None;
                Ok(())
            }
            _ => Err(Error::upload(format!("copy pass {} is not open", pass.0))),
        }
    }

    fn begin_render_pass(
        &self,
        cmd: CommandBufferId,
        color: &[ColorTarget],
        depth: Option<&DepthTarget>,
    ) -> Result<RenderPassId> {
        let mut objects = self.objects.borrow_mut();
        let id = objects.next_id();
        let record = objects.command(cmd)?;
        if record.open.is_some() {
            return Err(FrameError::Recording("a pass is already open".into()).into());
        }
        record.open = Some(OpenPass::Render(id));
        record.passes.push(RecordedPass::Render(RenderPassRecord {
            color: color.to_vec(),
            depth: depth.copied(),
            ops: Vec::new(),
        }));
        objects.passes.insert(id, cmd.0);
        Ok(RenderPassId(id))
    }

    fn bind_pipeline(&self, pass: RenderPassId, pipeline: PipelineId) -> Result<()> {
        self.with_render_pass(pass, |_| PassOp::Pipeline(pipeline))
    }

    fn bind_vertex_buffers(
        &self,
        pass: RenderPassId,
        first_slot: u32,
        bindings: &[BufferBinding],
    ) -> Result<()> {
        self.with_render_pass(pass, |_| PassOp::VertexBuffers(first_slot, bindings.to_vec()))
    }

    fn bind_index_buffer(
        &self,
        pass: RenderPassId,
        binding: BufferBinding,
        format: wgpu::IndexFormat,
    ) -> Result<()> {
        self.with_render_pass(pass, |_| PassOp::IndexBuffer(binding, format))
    }

    fn bind_fragment_samplers(
        &self,
        pass: RenderPassId,
        first_slot: u32,
        bindings: &[TextureSamplerBinding],
    ) -> Result<()> {
        self.with_render_pass(pass, |_| PassOp::Samplers(first_slot, bindings.to_vec()))
    }

    fn set_viewport(&self, pass: RenderPassId, viewport: &Viewport) -> Result<()> {
        self.with_render_pass(pass, |_| PassOp::Viewport(*viewport))
    }

    fn draw_indexed(&self, pass: RenderPassId, draw: DrawIndexed) -> Result<()> {
        self.with_render_pass(pass, |record| PassOp::Draw {
            draw,
            uniforms: record.uniforms.clone(),
        })
    }

    fn render_gui(&self, pass: RenderPassId, draw_data: GuiDrawData) -> Result<()> {
        // Texture deltas take effect when recorded; egui never resends them.
        self.apply_gui_textures(&draw_data.textures_delta);
        self.with_render_pass(pass, |_| PassOp::Gui(draw_data))
    }

    fn end_render_pass(&self, pass: RenderPassId) -> Result<()> {
        let mut objects = self.objects.borrow_mut();
        let cmd = objects
            .passes
            .remove(&pass.0)
            .ok_or_else(|| FrameError::Recording(format!("unknown render pass {}", pass.0)))?;
        let record = objects.command(CommandBufferId(cmd))?;
        match record.open {
            Some(OpenPass::Render(id)) if id == pass.0 => {
                record.open = None;
                Ok(())
            }
            _ => Err(FrameError::Recording(format!("render pass {} is not open", pass.0)).into()),
        }
    }

    fn register_gui_texture(&self, texture: TextureId) -> Result<egui::TextureId> {
        let objects = self.objects.borrow();
        let entry = objects
            .textures
            .get(&texture.0)
            .ok_or_else(|| Error::init(format!("unknown texture {}", texture.0)))?;
        Ok(self.gui_renderer.borrow_mut().register_native_texture(
            &self.device,
            &entry.view,
            wgpu::FilterMode::Linear,
        ))
    }

    fn unregister_gui_texture(&self, id: egui::TextureId) {
        self.gui_renderer.borrow_mut().free_texture(&id);
    }
}
