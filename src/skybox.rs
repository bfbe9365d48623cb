// src/skybox.rs
// Cubemap skybox drawn into the scene pass.
//
// Usage:
// let sky = Skybox::new(device.clone(), &config, TargetFormats::SCENE, &DiskImages)?;
// // with the scene pass open and the sky view-projection pushed to slot 3:
// sky.draw(pass)?;

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::assets::{Image, ImageSource, PixelFormat, PosVertex};
use crate::config::SkyboxConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::gpu::{
    load_shader, BufferBinding, BufferId, DepthState, DrawIndexed, FillMode, GpuDevice,
    IndexElement, PipelineDesc, PipelineId, RenderPassId, SamplerDesc, SamplerId,
    ShaderResources, TextureDesc, TextureId, TextureKind, TextureSamplerBinding, TextureUsage,
    VertexLayout,
};
use crate::resources::{upload_mesh, upload_texture_layers, TargetFormats};
use crate::uniforms::SKY_UNIFORM_COUNT;

/// Face images, in cubemap layer order.
pub const FACE_FILES: [&str; 6] = [
    "left.jpg",
    "right.jpg",
    "top.jpg",
    "bottom.jpg",
    "back.jpg",
    "front.jpg",
];

const fn p(x: f32, y: f32, z: f32) -> PosVertex {
    PosVertex { position: [x, y, z] }
}

pub const SKY_VERTICES: [PosVertex; 24] = [
    // +Z
    p(-1.0, -1.0, 1.0),
    p(1.0, -1.0, 1.0),
    p(1.0, 1.0, 1.0),
    p(-1.0, 1.0, 1.0),
    // -Z
    p(1.0, -1.0, -1.0),
    p(-1.0, -1.0, -1.0),
    p(-1.0, 1.0, -1.0),
    p(1.0, 1.0, -1.0),
    // +X
    p(1.0, -1.0, 1.0),
    p(1.0, -1.0, -1.0),
    p(1.0, 1.0, -1.0),
    p(1.0, 1.0, 1.0),
    // -X
    p(-1.0, -1.0, -1.0),
    p(-1.0, -1.0, 1.0),
    p(-1.0, 1.0, 1.0),
    p(-1.0, 1.0, -1.0),
    // +Y
    p(-1.0, 1.0, 1.0),
    p(1.0, 1.0, 1.0),
    p(1.0, 1.0, -1.0),
    p(-1.0, 1.0, -1.0),
    // -Y
    p(-1.0, -1.0, -1.0),
    p(1.0, -1.0, -1.0),
    p(1.0, -1.0, 1.0),
    p(-1.0, -1.0, 1.0),
];

pub const SKY_INDICES: [u16; 36] = [
    0, 1, 2, 0, 2, 3, //
    4, 5, 6, 4, 6, 7, //
    8, 9, 10, 8, 10, 11, //
    12, 13, 14, 12, 14, 15, //
    16, 17, 18, 16, 18, 19, //
    20, 21, 22, 20, 22, 23,
];

/// Checks that all faces are square RGBA8 images of one size and returns
/// that size.
pub fn validate_faces(faces: &[Image]) -> Result<u32> {
    let first = faces
        .first()
        .ok_or_else(|| Error::init("skybox has no faces"))?;
    for (image, name) in faces.iter().zip(FACE_FILES) {
        let expected = image.width as usize * image.height as usize * image.format.bytes_per_pixel();
        if image.format != PixelFormat::Rgba8 || image.pixels.len() != expected {
            return Err(Error::init(format!(
                "skybox face {name} is not RGBA8 ({} bytes for {}x{})",
                image.pixels.len(),
                image.width,
                image.height
            )));
        }
        if image.width != image.height {
            return Err(Error::init(format!(
                "skybox face {name} is not square ({}x{})",
                image.width, image.height
            )));
        }
        if image.width != first.width {
            return Err(Error::init(format!(
                "skybox face {name} is {}x{}, expected {}x{}",
                image.width, image.height, first.width, first.height
            )));
        }
    }
    Ok(first.width)
}

/// Loads the six faces from `dir`. Faces loaded before a failure are dropped.
pub fn load_faces(dir: &Path, images: &dyn ImageSource) -> Result<Vec<Image>> {
    FACE_FILES
        .iter()
        .map(|name| {
            let path = dir.join(name);
            images
                .load(&path)
                .with_context(|| format!("loading skybox face {}", path.display()))
        })
        .collect()
}

/// Skybox pipeline, cube mesh, cubemap and sampler.
pub struct Skybox<D: GpuDevice + ?Sized> {
    device: Arc<D>,
    pipeline: Option<PipelineId>,
    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    cubemap: Option<TextureId>,
    sampler: Option<SamplerId>,
}

impl<D: GpuDevice + ?Sized> Skybox<D> {
    /// Builds everything at once. On failure every object created so far is
    /// released.
    pub fn new(
        device: Arc<D>,
        config: &SkyboxConfig,
        formats: TargetFormats,
        images: &dyn ImageSource,
    ) -> Result<Self> {
        let mut sky = Self {
            device,
            pipeline: None,
            vertex_buffer: None,
            index_buffer: None,
            cubemap: None,
            sampler: None,
        };

        sky.pipeline = Some(sky.create_pipeline(config, formats)?);

        let mesh = upload_mesh(&*sky.device, "skybox", &SKY_VERTICES, &SKY_INDICES)?;
        sky.vertex_buffer = Some(mesh.vertex);
        sky.index_buffer = Some(mesh.index);

        sky.sampler = Some(sky.device.create_sampler(&SamplerDesc::default())?);

        let faces = load_faces(&config.directory, images)?;
        let size = validate_faces(&faces)?;
        sky.cubemap = Some(sky.upload_cubemap(&faces, size)?);

        info!(
            "Skybox loaded from {} ({}x{} faces)",
            config.directory.display(),
            size,
            size
        );
        Ok(sky)
    }

    /// Shaders are released as soon as the pipeline exists.
    fn create_pipeline(&self, config: &SkyboxConfig, formats: TargetFormats) -> Result<PipelineId> {
        let device = &*self.device;
        let vertex_resources = ShaderResources {
            uniform_buffers: SKY_UNIFORM_COUNT,
            ..Default::default()
        };
        let fragment_resources = ShaderResources {
            samplers: 1,
            ..Default::default()
        };

        let vs = load_shader(device, &config.vertex_shader, vertex_resources, TextureKind::Cube)?;
        let fs = match load_shader(device, &config.fragment_shader, fragment_resources, TextureKind::Cube) {
            Ok(fs) => fs,
            Err(e) => {
                device.release_shader(vs);
                return Err(e);
            }
        };

        let desc = PipelineDesc {
            label: "skybox".to_owned(),
            vertex_shader: vs,
            fragment_shader: fs,
            vertex_layout: VertexLayout::Position,
            color_format: formats.color,
            depth: formats.depth.map(|format| DepthState {
                format,
                write: false,
                compare: wgpu::CompareFunction::LessEqual,
            }),
            fill_mode: FillMode::Fill,
            cull_mode: None,
        };
        let pipeline = device.create_pipeline(&desc).context("creating skybox pipeline");

        device.release_shader(vs);
        device.release_shader(fs);
        pipeline
    }

    fn upload_cubemap(&self, faces: &[Image], size: u32) -> Result<TextureId> {
        let desc = TextureDesc {
            kind: TextureKind::Cube,
            format: faces[0].format.texture_format(),
            width: size,
            height: size,
            layers: 6,
            usage: TextureUsage::SAMPLER,
        };
        let cubemap = self.device.create_texture("skybox cubemap", &desc)?;
        let layers: Vec<&[u8]> = faces.iter().map(|face| face.pixels.as_slice()).collect();
        if let Err(e) = upload_texture_layers(&*self.device, cubemap, &desc, &layers) {
            self.device.release_texture(cubemap);
            return Err(e.context("uploading skybox cubemap"));
        }
        Ok(cubemap)
    }

    /// Draws into an already begun pass. The pass is left open.
    pub fn draw(&self, pass: RenderPassId) -> Result<()> {
        let (Some(pipeline), Some(vertex), Some(index), Some(cubemap), Some(sampler)) = (
            self.pipeline,
            self.vertex_buffer,
            self.index_buffer,
            self.cubemap,
            self.sampler,
        ) else {
            return Err(Error::custom("skybox was released"));
        };

        let device = &*self.device;
        device.bind_pipeline(pass, pipeline)?;
        device.bind_vertex_buffers(pass, 0, &[BufferBinding { buffer: vertex, offset: 0 }])?;
        device.bind_index_buffer(pass, BufferBinding { buffer: index, offset: 0 }, u16::FORMAT)?;
        device.bind_fragment_samplers(pass, 0, &[TextureSamplerBinding { texture: cubemap, sampler }])?;
        device.draw_indexed(
            pass,
            DrawIndexed {
                index_count: SKY_INDICES.len() as u32,
                instance_count: 1,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            },
        )
    }

    pub fn release(&mut self) {
        let device = &*self.device;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = device.wait_idle() {
                warn!("wait_idle before skybox release failed: {e}");
            }
            device.release_pipeline(pipeline);
        }
        if let Some(cubemap) = self.cubemap.take() {
            device.release_texture(cubemap);
        }
        if let Some(sampler) = self.sampler.take() {
            device.release_sampler(sampler);
        }
        for buffer in [self.vertex_buffer.take(), self.index_buffer.take()].into_iter().flatten() {
            device.release_buffer(buffer);
        }
    }
}

impl<D: GpuDevice + ?Sized> Drop for Skybox<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::recording::Call;
    use crate::gpu::RecordingDevice;
    use crate::testing::{shader_path, MemoryImages};

    fn config() -> SkyboxConfig {
        SkyboxConfig {
            directory: "sky".into(),
            vertex_shader: shader_path("skybox.vert.wgsl"),
            fragment_shader: shader_path("skybox.frag.wgsl"),
        }
    }

    #[test]
    fn builds_cubemap_in_face_order() {
        let device = Arc::new(RecordingDevice::new());
        let sky = Skybox::new(
            Arc::clone(&device),
            &config(),
            TargetFormats::SCENE,
            &MemoryImages::skybox_faces(4),
        )
        .unwrap();

        let cubemap = sky.cubemap.unwrap();
        let desc = device.texture_desc(cubemap).unwrap();
        assert_eq!((desc.kind, desc.layers, desc.width), (TextureKind::Cube, 6, 4));

        let data = device.read_texture(cubemap).unwrap();
        let layer = desc.layer_size() as usize;
        for i in 0..6 {
            assert_eq!(data[i * layer], i as u8 * 40);
        }

        // Shaders are gone, everything else is alive; no staging left.
        let live = device.live_objects();
        assert_eq!((live.shaders, live.pipelines, live.buffers), (0, 1, 2));
        assert_eq!((live.textures, live.samplers, live.transfer_buffers), (1, 1, 0));

        let pipeline = device.pipeline_desc(sky.pipeline.unwrap()).unwrap();
        let depth = pipeline.depth.unwrap();
        assert!(!depth.write);
        assert_eq!(depth.compare, wgpu::CompareFunction::LessEqual);
    }

    #[test]
    fn size_mismatch_fails_and_leaks_nothing() {
        let device = Arc::new(RecordingDevice::new());
        let images = MemoryImages::skybox_faces(4).with("top.jpg", Image::solid(8, 8, [0; 4]));
        let err = Skybox::new(Arc::clone(&device), &config(), TargetFormats::SCENE, &images)
            .err()
            .unwrap();
        assert!(err.is_init());
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn non_square_face_is_rejected() {
        let mut faces: Vec<Image> = (0..6).map(|_| Image::solid(4, 4, [0; 4])).collect();
        faces[5] = Image::solid(4, 2, [0; 4]);
        let err = validate_faces(&faces).unwrap_err();
        assert!(err.to_string().contains("front.jpg"));
    }

    #[test]
    fn rgb_face_fails_init_without_leaks() {
        let device = Arc::new(RecordingDevice::new());
        let rgb = Image {
            width: 4,
            height: 4,
            format: PixelFormat::Rgba8,
            pixels: vec![0; 4 * 4 * 3],
        };
        let images = MemoryImages::skybox_faces(4).with("back.jpg", rgb);
        let err = Skybox::new(Arc::clone(&device), &config(), TargetFormats::SCENE, &images)
            .err()
            .unwrap();
        assert!(err.is_init());
        assert!(err.to_string().contains("back.jpg"));
        assert_eq!(device.count_calls(|c| matches!(c, Call::UploadToTexture { .. })), 0);
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn missing_face_fails_and_leaks_nothing() {
        let device = Arc::new(RecordingDevice::new());
        let images = MemoryImages::new().with("left.jpg", Image::solid(4, 4, [0; 4]));
        let err = Skybox::new(Arc::clone(&device), &config(), TargetFormats::SCENE, &images)
            .err()
            .unwrap();
        assert!(err.to_string().contains("right.jpg"));
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn draw_stays_inside_callers_pass() {
        let device = Arc::new(RecordingDevice::new());
        let sky = Skybox::new(
            Arc::clone(&device),
            &config(),
            TargetFormats::SCENE,
            &MemoryImages::skybox_faces(2),
        )
        .unwrap();

        let cmd = device.acquire_command_buffer().unwrap();
        let target = device.acquire_swapchain_texture(cmd).unwrap().unwrap();
        let color = crate::gpu::ColorTarget {
            texture: target,
            load: crate::gpu::LoadOp::Clear,
            clear_color: [0.0; 4],
            store: true,
        };
        let pass = device.begin_render_pass(cmd, &[color], None).unwrap();
        device.clear_calls();
        sky.draw(pass).unwrap();
        device.end_render_pass(pass).unwrap();
        device.submit(cmd).unwrap();

        let calls = device.calls();
        assert!(calls.contains(&Call::BindIndexBuffer(
            BufferBinding { buffer: sky.index_buffer.unwrap(), offset: 0 },
            wgpu::IndexFormat::Uint16
        )));
        let draws: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::DrawIndexed(draw) => Some(draw.index_count),
                _ => None,
            })
            .collect();
        assert_eq!(draws, vec![36]);
        assert!(!calls[..calls.len() - 2]
            .iter()
            .any(|c| matches!(c, Call::BeginRenderPass { .. } | Call::EndRenderPass)));
    }

    #[test]
    fn drop_releases_everything() {
        let device = Arc::new(RecordingDevice::new());
        let sky = Skybox::new(
            Arc::clone(&device),
            &config(),
            TargetFormats::SCENE,
            &MemoryImages::skybox_faces(2),
        )
        .unwrap();
        drop(sky);
        assert_eq!(device.live_objects().total(), 0);
    }
}
