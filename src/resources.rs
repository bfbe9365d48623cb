// src/resources.rs
//! GPU resource set: every buffer, texture, sampler, shader and pipeline the
//! scene pass uses, created once at init and released once at shutdown.
//!
//! Uploads go through a transfer buffer and a one-shot copy command buffer.
//! The transfer buffer is released only after that command buffer was
//! submitted.

use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use log::{debug, info, warn};

use crate::assets::Image;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::frame::ScenePassInputs;
use crate::gpu::{
    load_shader, BufferId, BufferRegion, BufferUsage, CopyPassId, DepthState, FillMode,
    GpuDevice, IndexElement, PipelineDesc, PipelineId, SamplerDesc, SamplerId, ShaderId,
    ShaderResources, TextureDesc, TextureId, TextureKind, TextureRegion, TextureSamplerBinding,
    TextureUsage, TransferLocation, VertexLayout, Viewport,
};
use crate::uniforms::SCENE_UNIFORM_COUNT;

pub const SCENE_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const SCENE_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth16Unorm;

/// Attachment formats a pipeline renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetFormats {
    pub color: wgpu::TextureFormat,
    pub depth: Option<wgpu::TextureFormat>,
}

impl TargetFormats {
    /// The offscreen scene targets.
    pub const SCENE: Self = Self {
        color: SCENE_COLOR_FORMAT,
        depth: Some(SCENE_DEPTH_FORMAT),
    };
}

/// Triangle-list pipeline descriptor. Depth test and write are on whenever
/// `formats` has a depth format.
pub fn pipeline_desc(
    label: &str,
    vertex_shader: ShaderId,
    fragment_shader: ShaderId,
    vertex_layout: VertexLayout,
    formats: TargetFormats,
    fill_mode: FillMode,
) -> PipelineDesc {
    PipelineDesc {
        label: label.to_owned(),
        vertex_shader,
        fragment_shader,
        vertex_layout,
        color_format: formats.color,
        depth: formats.depth.map(|format| DepthState {
            format,
            write: true,
            compare: wgpu::CompareFunction::Less,
        }),
        fill_mode,
        cull_mode: None,
    }
}

pub fn create_pipeline<D: GpuDevice + ?Sized>(
    device: &D,
    label: &str,
    vertex_shader: ShaderId,
    fragment_shader: ShaderId,
    vertex_layout: VertexLayout,
    formats: TargetFormats,
    fill_mode: FillMode,
) -> Result<PipelineId> {
    let desc = pipeline_desc(label, vertex_shader, fragment_shader, vertex_layout, formats, fill_mode);
    device
        .create_pipeline(&desc)
        .with_context(|| format!("creating pipeline {label}"))
}

/// Vertex + index buffers filled from one staging upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertex: BufferId,
    pub index: BufferId,
    pub index_count: u32,
    pub index_format: wgpu::IndexFormat,
}

/// Records a one-shot copy pass and submits it. The command buffer is
/// cancelled if recording fails.
pub fn submit_copy<D, F>(device: &D, record: F) -> Result<()>
where
    D: GpuDevice + ?Sized,
    F: FnOnce(CopyPassId) -> Result<()>,
{
    let cmd = device
        .acquire_command_buffer()
        .map_err(|e| Error::upload(format!("no command buffer for upload: {e}")))?;

    let recorded = device.begin_copy_pass(cmd).and_then(|pass| {
        record(pass)?;
        device.end_copy_pass(pass)
    });
    if let Err(e) = recorded {
        device.cancel_command_buffer(cmd);
        return Err(Error::upload(format!("recording upload: {e}")));
    }

    device
        .submit(cmd)
        .map_err(|e| Error::upload(format!("submitting upload: {e}")))
}

/// Creates vertex and index buffers and fills them from a single transfer
/// buffer holding the vertices followed by the indices.
pub fn upload_mesh<D, V, I>(device: &D, label: &str, vertices: &[V], indices: &[I]) -> Result<MeshBuffers>
where
    D: GpuDevice + ?Sized,
    V: Pod,
    I: IndexElement,
{
    crate::ensure!(
        !vertices.is_empty() && !indices.is_empty(),
        Error::upload(format!("{label}: empty mesh"))
    );
    let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    let vertex_size = vertex_bytes.len() as u64;
    let index_size = index_bytes.len() as u64;

    let vertex = device.create_buffer(&format!("{label} vertices"), BufferUsage::VERTEX, vertex_size)?;
    let index = match device.create_buffer(&format!("{label} indices"), BufferUsage::INDEX, index_size) {
        Ok(index) => index,
        Err(e) => {
            device.release_buffer(vertex);
            return Err(e);
        }
    };

    let uploaded = device
        .create_transfer_buffer(vertex_size + index_size)
        .and_then(|staging| {
            let result = device
                .write_transfer_buffer(staging, 0, vertex_bytes)
                .and_then(|_| device.write_transfer_buffer(staging, vertex_size, index_bytes))
                .and_then(|_| {
                    submit_copy(device, |pass| {
                        device.upload_to_buffer(
                            pass,
                            TransferLocation { transfer_buffer: staging, offset: 0 },
                            BufferRegion { buffer: vertex, offset: 0, size: vertex_size },
                        )?;
                        device.upload_to_buffer(
                            pass,
                            TransferLocation { transfer_buffer: staging, offset: vertex_size },
                            BufferRegion { buffer: index, offset: 0, size: index_size },
                        )
                    })
                });
            device.release_transfer_buffer(staging);
            result
        });

    if let Err(e) = uploaded {
        device.release_buffer(index);
        device.release_buffer(vertex);
        return Err(e.context(format!("uploading {label}")));
    }

    debug!(
        "Uploaded {label}: {} vertices, {} indices ({} bytes)",
        vertices.len(),
        indices.len(),
        vertex_size + index_size
    );
    Ok(MeshBuffers {
        vertex,
        index,
        index_count: indices.len() as u32,
        index_format: I::FORMAT,
    })
}

/// Uploads one pixel array per layer of `texture` through one transfer
/// buffer.
pub fn upload_texture_layers<D: GpuDevice + ?Sized>(
    device: &D,
    texture: TextureId,
    desc: &TextureDesc,
    layers: &[&[u8]],
) -> Result<()> {
    let layer_size = desc.layer_size();
    crate::ensure!(
        layers.len() as u32 == desc.layers,
        Error::upload(format!("expected {} layers, got {}", desc.layers, layers.len()))
    );
    if let Some(bad) = layers.iter().position(|layer| layer.len() as u64 != layer_size) {
        return Err(Error::upload(format!(
            "layer {bad} is {} bytes, expected {layer_size}",
            layers[bad].len()
        )));
    }

    let staging = device.create_transfer_buffer(layer_size * layers.len() as u64)?;
    let result = layers
        .iter()
        .enumerate()
        .try_for_each(|(i, pixels)| device.write_transfer_buffer(staging, i as u64 * layer_size, pixels))
        .and_then(|_| {
            submit_copy(device, |pass| {
                (0..desc.layers).try_for_each(|layer| {
                    device.upload_to_texture(
                        pass,
                        TransferLocation {
                            transfer_buffer: staging,
                            offset: layer as u64 * layer_size,
                        },
                        TextureRegion {
                            texture,
                            layer,
                            width: desc.width,
                            height: desc.height,
                        },
                    )
                })
            })
        });
    device.release_transfer_buffer(staging);
    result
}

/// Creates the offscreen color and depth targets. Both or neither.
pub fn create_render_targets<D: GpuDevice + ?Sized>(
    device: &D,
    width: u32,
    height: u32,
) -> Result<(TextureId, TextureId)> {
    let color = device
        .create_texture(
            "scene color",
            &TextureDesc {
                kind: TextureKind::D2,
                format: SCENE_COLOR_FORMAT,
                width,
                height,
                layers: 1,
                usage: TextureUsage::SAMPLER | TextureUsage::COLOR_TARGET,
            },
        )
        .context("creating color target")?;

    let depth = device.create_texture(
        "scene depth",
        &TextureDesc {
            kind: TextureKind::D2,
            format: SCENE_DEPTH_FORMAT,
            width,
            height,
            layers: 1,
            usage: TextureUsage::SAMPLER | TextureUsage::DEPTH_TARGET,
        },
    );
    match depth {
        Ok(depth) => Ok((color, depth)),
        Err(e) => {
            device.release_texture(color);
            Err(e.context("creating depth target"))
        }
    }
}

/// Creates a sampled 2D texture holding `image`.
pub fn load_texture<D: GpuDevice + ?Sized>(device: &D, label: &str, image: &Image) -> Result<TextureId> {
    let desc = TextureDesc {
        kind: TextureKind::D2,
        format: image.format.texture_format(),
        width: image.width,
        height: image.height,
        layers: 1,
        usage: TextureUsage::SAMPLER,
    };
    let texture = device.create_texture(label, &desc)?;
    if let Err(e) = upload_texture_layers(device, texture, &desc, &[&image.pixels]) {
        device.release_texture(texture);
        return Err(e.context(format!("uploading {label}")));
    }
    Ok(texture)
}

/// Releases the id in every slot, leaving the slots empty.
fn release_slots<T: Copy>(slots: &mut [&mut Option<T>], mut release: impl FnMut(T)) {
    for slot in slots.iter_mut() {
        if let Some(id) = slot.take() {
            release(id);
        }
    }
}

/// Owned GPU objects of the scene. Every slot starts empty, so `release`
/// (and `Drop`) is safe after a partial init.
pub struct GpuResources<D: GpuDevice + ?Sized> {
    device: Arc<D>,

    vertex_shader: Option<ShaderId>,
    fragment_shader: Option<ShaderId>,
    fill_pipeline: Option<PipelineId>,
    line_pipeline: Option<PipelineId>,

    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    index_count: u32,
    index_format: wgpu::IndexFormat,

    color_target: Option<TextureId>,
    depth_target: Option<TextureId>,
    target_size: (u32, u32),

    texture: Option<TextureId>,
    sampler: Option<SamplerId>,
}

impl<D: GpuDevice + ?Sized> GpuResources<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            vertex_shader: None,
            fragment_shader: None,
            fill_pipeline: None,
            line_pipeline: None,
            vertex_buffer: None,
            index_buffer: None,
            index_count: 0,
            index_format: wgpu::IndexFormat::Uint32,
            color_target: None,
            depth_target: None,
            target_size: (0, 0),
            texture: None,
            sampler: None,
        }
    }

    /// Loads the scene vertex shader (three uniform slots) and fragment
    /// shader (one texture/sampler pair).
    pub fn load_shaders(&mut self, vertex: &Path, fragment: &Path) -> Result<()> {
        let vertex_resources = ShaderResources {
            uniform_buffers: SCENE_UNIFORM_COUNT,
            ..Default::default()
        };
        let fragment_resources = ShaderResources {
            samplers: 1,
            ..Default::default()
        };
        self.vertex_shader = Some(load_shader(&*self.device, vertex, vertex_resources, TextureKind::D2)?);
        self.fragment_shader = Some(load_shader(&*self.device, fragment, fragment_resources, TextureKind::D2)?);
        Ok(())
    }

    /// Creates the solid and wireframe pipelines from one descriptor.
    pub fn create_pipelines(&mut self, formats: TargetFormats) -> Result<()> {
        let (Some(vs), Some(fs)) = (self.vertex_shader, self.fragment_shader) else {
            return Err(Error::init("shaders must be loaded before creating pipelines"));
        };
        let layout = VertexLayout::PositionUv;
        self.fill_pipeline = Some(create_pipeline(&*self.device, "scene fill", vs, fs, layout, formats, FillMode::Fill)?);
        self.line_pipeline = Some(create_pipeline(&*self.device, "scene line", vs, fs, layout, formats, FillMode::Line)?);
        info!("Created scene pipelines");
        Ok(())
    }

    /// Uploads the mesh into fresh vertex and index buffers.
    pub fn send_vertex_data<V: Pod, I: IndexElement>(&mut self, vertices: &[V], indices: &[I]) -> Result<()> {
        let mesh = upload_mesh(&*self.device, "mesh", vertices, indices)?;
        release_slots(&mut [&mut self.vertex_buffer, &mut self.index_buffer], |id| {
            self.device.release_buffer(id)
        });
        self.vertex_buffer = Some(mesh.vertex);
        self.index_buffer = Some(mesh.index);
        self.index_count = mesh.index_count;
        self.index_format = mesh.index_format;
        Ok(())
    }

    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<()> {
        let sampler = self.device.create_sampler(desc).context("creating sampler")?;
        if let Some(old) = self.sampler.replace(sampler) {
            self.device.release_sampler(old);
        }
        Ok(())
    }

    pub fn create_render_targets(&mut self, width: u32, height: u32) -> Result<()> {
        let (color, depth) = create_render_targets(&*self.device, width, height)?;
        release_slots(&mut [&mut self.color_target, &mut self.depth_target], |id| {
            self.device.release_texture(id)
        });
        self.color_target = Some(color);
        self.depth_target = Some(depth);
        self.target_size = (width, height);
        debug!("Scene targets {}x{}", width, height);
        Ok(())
    }

    /// Replaces both targets with new ones of the given size. The old
    /// targets stay in place if creation fails.
    pub fn recreate_render_targets(&mut self, width: u32, height: u32) -> Result<()> {
        self.device.wait_idle()?;
        self.create_render_targets(width, height)
    }

    pub fn load_texture(&mut self, image: &Image) -> Result<()> {
        let texture = load_texture(&*self.device, "mesh texture", image)?;
        if let Some(old) = self.texture.replace(texture) {
            self.device.release_texture(old);
        }
        Ok(())
    }

    pub fn pipeline(&self, wireframe: bool) -> Option<PipelineId> {
        if wireframe {
            self.line_pipeline
        } else {
            self.fill_pipeline
        }
    }

    pub fn color_target(&self) -> Option<TextureId> {
        self.color_target
    }

    pub fn target_size(&self) -> (u32, u32) {
        self.target_size
    }

    /// Everything the scene pass binds, or an error naming the first
    /// missing object.
    pub fn scene_inputs(&self, wireframe: bool, clear_color: [f32; 4], instance_count: u32) -> Result<ScenePassInputs> {
        fn need<T>(slot: Option<T>, what: &str) -> Result<T> {
            slot.ok_or_else(|| Error::custom(format!("{what} was not created")))
        }
        Ok(ScenePassInputs {
            pipeline: need(self.pipeline(wireframe), "pipeline")?,
            vertex_buffer: need(self.vertex_buffer, "vertex buffer")?,
            index_buffer: need(self.index_buffer, "index buffer")?,
            index_format: self.index_format,
            index_count: self.index_count,
            texture: TextureSamplerBinding {
                texture: need(self.texture, "texture")?,
                sampler: need(self.sampler, "sampler")?,
            },
            color_target: need(self.color_target, "color target")?,
            depth_target: need(self.depth_target, "depth target")?,
            viewport: Viewport::from_size(self.target_size.0, self.target_size.1),
            clear_color,
            instance_count,
        })
    }

    fn is_empty(&self) -> bool {
        self.vertex_shader.is_none()
            && self.fragment_shader.is_none()
            && self.fill_pipeline.is_none()
            && self.line_pipeline.is_none()
            && self.vertex_buffer.is_none()
            && self.index_buffer.is_none()
            && self.color_target.is_none()
            && self.depth_target.is_none()
            && self.texture.is_none()
            && self.sampler.is_none()
    }

    /// Waits for the device to go idle, then releases pipelines, shaders,
    /// textures, samplers and buffers in that order. Empty slots are skipped.
    pub fn release(&mut self) {
        if self.is_empty() {
            return;
        }
        if let Err(e) = self.device.wait_idle() {
            warn!("wait_idle before release failed: {e}");
        }

        let device = &*self.device;
        release_slots(&mut [&mut self.fill_pipeline, &mut self.line_pipeline], |id| {
            device.release_pipeline(id)
        });
        release_slots(&mut [&mut self.vertex_shader, &mut self.fragment_shader], |id| {
            device.release_shader(id)
        });
        release_slots(
            &mut [&mut self.color_target, &mut self.depth_target, &mut self.texture],
            |id| device.release_texture(id),
        );
        release_slots(&mut [&mut self.sampler], |id| device.release_sampler(id));
        release_slots(&mut [&mut self.vertex_buffer, &mut self.index_buffer], |id| {
            device.release_buffer(id)
        });
        self.index_count = 0;
        debug!("Released scene resources");
    }
}

impl<D: GpuDevice + ?Sized> Drop for GpuResources<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::PosUvVertex;
    use crate::cube::{cube_indices, CUBE_VERTICES};
    use crate::gpu::recording::{Call, ResourceKind};
    use crate::gpu::RecordingDevice;

    fn shader(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("resources/shaders").join(name)
    }

    fn full_set(device: &Arc<RecordingDevice>) -> GpuResources<RecordingDevice> {
        let mut res = GpuResources::new(Arc::clone(device));
        res.load_shaders(&shader("cube.vert.wgsl"), &shader("cube.frag.wgsl")).unwrap();
        res.create_pipelines(TargetFormats::SCENE).unwrap();
        res.send_vertex_data(&CUBE_VERTICES, &cube_indices()).unwrap();
        res.create_sampler(&SamplerDesc::default()).unwrap();
        res.create_render_targets(64, 32).unwrap();
        res.load_texture(&Image::solid(2, 2, [9, 8, 7, 255])).unwrap();
        res
    }

    #[test]
    fn vertex_data_round_trips() {
        let device = Arc::new(RecordingDevice::new());
        let mut res = GpuResources::new(Arc::clone(&device));
        let indices = cube_indices();
        res.send_vertex_data(&CUBE_VERTICES, &indices).unwrap();

        let vb = res.vertex_buffer.unwrap();
        let ib = res.index_buffer.unwrap();
        assert_eq!(device.read_buffer(vb).unwrap(), bytemuck::cast_slice::<_, u8>(&CUBE_VERTICES));
        assert_eq!(device.read_buffer(ib).unwrap(), bytemuck::cast_slice::<_, u8>(&indices));
        assert_eq!(device.live_objects().transfer_buffers, 0);

        let offsets: Vec<u64> = device
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::UploadToBuffer { source, .. } => Some(source.offset),
                _ => None,
            })
            .collect();
        let expected = (std::mem::size_of::<PosUvVertex>() * CUBE_VERTICES.len()) as u64;
        assert_eq!(offsets, vec![0, expected]);
        assert_eq!(res.index_format, wgpu::IndexFormat::Uint32);
    }

    #[test]
    fn upload_submit_failure_leaks_nothing() {
        let device = Arc::new(RecordingDevice::new());
        device.fail_submits(true);
        let mut res = GpuResources::new(Arc::clone(&device));
        let err = res.send_vertex_data(&CUBE_VERTICES, &cube_indices()).unwrap_err();
        assert!(err.is_upload());
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn empty_mesh_is_rejected() {
        let device = RecordingDevice::new();
        let err = upload_mesh::<_, PosUvVertex, u16>(&device, "empty", &[], &[]).unwrap_err();
        assert!(err.is_upload());
    }

    #[test]
    fn texture_pixels_round_trip() {
        let device = RecordingDevice::new();
        let image = Image::rgba8(2, 1, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let texture = load_texture(&device, "t", &image).unwrap();
        assert_eq!(device.read_texture(texture).unwrap(), image.pixels);
        assert_eq!(device.live_objects().transfer_buffers, 0);
    }

    #[test]
    fn failed_targets_leave_no_texture() {
        let device = Arc::new(RecordingDevice::new());
        device.fail_textures_after(1);
        let mut res = GpuResources::new(Arc::clone(&device));
        assert!(res.create_render_targets(64, 64).unwrap_err().is_init());
        assert_eq!(device.live_objects().textures, 0);
        assert_eq!(res.color_target(), None);
    }

    #[test]
    fn failed_recreate_keeps_old_targets() {
        let device = Arc::new(RecordingDevice::new());
        let mut res = GpuResources::new(Arc::clone(&device));
        res.create_render_targets(64, 64).unwrap();
        let old = res.color_target();

        device.fail_textures_after(1);
        assert!(res.recreate_render_targets(128, 128).is_err());
        assert_eq!(res.color_target(), old);
        assert_eq!(res.target_size(), (64, 64));
        assert_eq!(device.live_objects().textures, 2);

        device.fail_textures_after(2);
        res.recreate_render_targets(128, 96).unwrap();
        assert_ne!(res.color_target(), old);
        assert_eq!(res.target_size(), (128, 96));
        assert_eq!(device.live_objects().textures, 2);
    }

    #[test]
    fn pipelines_differ_only_in_fill_mode() {
        let device = Arc::new(RecordingDevice::new());
        let res = full_set(&device);
        let mut fill = device.pipeline_desc(res.pipeline(false).unwrap()).unwrap();
        let line = device.pipeline_desc(res.pipeline(true).unwrap()).unwrap();
        assert_eq!(fill.fill_mode, FillMode::Fill);
        assert_eq!(line.fill_mode, FillMode::Line);
        fill.fill_mode = FillMode::Line;
        fill.label = line.label.clone();
        assert_eq!(fill, line);
        assert!(line.depth.is_some_and(|d| d.write));
    }

    #[test]
    fn release_waits_then_follows_order() {
        let device = Arc::new(RecordingDevice::new());
        let mut res = full_set(&device);
        device.clear_calls();
        res.release();

        let calls = device.calls();
        assert_eq!(calls.first(), Some(&Call::WaitIdle));
        let kinds: Vec<ResourceKind> = calls
            .iter()
            .filter_map(|call| match call {
                Call::Release(kind, _) => Some(*kind),
                _ => None,
            })
            .collect();
        let mut sorted = kinds.clone();
        sorted.dedup();
        assert_eq!(
            sorted,
            vec![
                ResourceKind::Pipeline,
                ResourceKind::Shader,
                ResourceKind::Texture,
                ResourceKind::Sampler,
                ResourceKind::Buffer,
            ]
        );
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let device = Arc::new(RecordingDevice::new());
        let mut res = full_set(&device);
        res.release();
        device.clear_calls();
        res.release();
        drop(res);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn drop_releases_partial_init() {
        let device = Arc::new(RecordingDevice::new());
        {
            let mut res = GpuResources::new(Arc::clone(&device));
            res.load_shaders(&shader("cube.vert.wgsl"), &shader("cube.frag.wgsl")).unwrap();
            device.fail_pipelines(true);
            assert!(res.create_pipelines(TargetFormats::SCENE).unwrap_err().is_init());
        }
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn scene_inputs_need_every_object() {
        let device = Arc::new(RecordingDevice::new());
        let res = full_set(&device);
        let inputs = res.scene_inputs(true, [0.0; 4], 8).unwrap();
        assert_eq!(Some(inputs.pipeline), res.pipeline(true));
        assert_eq!(inputs.index_count, 36);
        assert_eq!(inputs.viewport, Viewport::from_size(64, 32));

        let empty = GpuResources::new(Arc::clone(&device));
        assert!(empty.scene_inputs(false, [0.0; 4], 1).is_err());
    }
}
