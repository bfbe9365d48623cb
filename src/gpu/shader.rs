// src/gpu/shader.rs
//! Shader loading from disk.

use std::path::Path;

use log::debug;

use super::{GpuDevice, ShaderCode, ShaderDesc, ShaderId, ShaderResources, ShaderStage, TextureKind};
use crate::context::{Context, OptionContext};
use crate::error::{Error, Result};

/// Loads a shader file and creates a shader object from it.
///
/// The stage is inferred from the file name (`"vert"` / `"frag"`), the code
/// format from the extension (`.spv` = SPIR-V, `.wgsl` = WGSL). The resource
/// counts are declared by the caller and must match the shader.
pub fn load_shader<D: GpuDevice + ?Sized>(
    device: &D,
    path: &Path,
    resources: ShaderResources,
    sampler_kind: TextureKind,
) -> Result<ShaderId> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid shader path {}", path.display()))?;

    let stage = ShaderStage::from_file_name(file_name)
        .ok_or_else(|| Error::init(format!("cannot infer shader stage from {file_name}")))?;

    validate_resources(stage, &resources)
        .with_context(|| format!("shader {}", path.display()))?;

    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let code = match path.extension().and_then(|ext| ext.to_str()) {
        Some("spv") => ShaderCode::SpirV(bytes),
        Some("wgsl") => ShaderCode::Wgsl(
            String::from_utf8(bytes)
                .map_err(|e| Error::init(format!("{} is not UTF-8: {e}", path.display())))?,
        ),
        other => {
            return Err(Error::init(format!(
                "unsupported shader format {:?} for {}",
                other.unwrap_or(""),
                path.display()
            )))
        }
    };

    debug!("Loading {:?} shader {}", stage, path.display());

    device.create_shader(&ShaderDesc {
        label: file_name.to_owned(),
        code,
        stage,
        resources,
        sampler_kind,
    })
}

fn validate_resources(stage: ShaderStage, resources: &ShaderResources) -> Result<()> {
    if resources.storage_buffers > 0 || resources.storage_textures > 0 {
        return Err(Error::init("storage resources are not supported"));
    }
    match stage {
        ShaderStage::Vertex if resources.samplers > 0 => {
            Err(Error::init("vertex-stage samplers are not supported"))
        }
        ShaderStage::Fragment if resources.uniform_buffers > 0 => {
            Err(Error::init("fragment-stage uniform buffers are not supported"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::RecordingDevice;

    fn shader_path(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("resources/shaders").join(name)
    }

    #[test]
    fn loads_wgsl_with_inferred_stage() {
        let device = RecordingDevice::new();
        let resources = ShaderResources { uniform_buffers: 3, ..Default::default() };
        let id = load_shader(&device, &shader_path("cube.vert.wgsl"), resources, TextureKind::D2)
            .unwrap();

        let desc = device.shader_desc(id).unwrap();
        assert_eq!(desc.stage, ShaderStage::Vertex);
        assert_eq!(desc.resources.uniform_buffers, 3);
        assert!(matches!(desc.code, ShaderCode::Wgsl(ref src) if src.contains("fn main")));
    }

    #[test]
    fn rejects_storage_resources() {
        let device = RecordingDevice::new();
        let resources = ShaderResources { storage_buffers: 1, ..Default::default() };
        let err = load_shader(&device, &shader_path("cube.vert.wgsl"), resources, TextureKind::D2)
            .unwrap_err();
        assert!(err.is_init());
        assert_eq!(device.live_objects().shaders, 0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let device = RecordingDevice::new();
        let err = load_shader(
            &device,
            &shader_path("missing.frag.wgsl"),
            ShaderResources::default(),
            TextureKind::D2,
        )
        .unwrap_err();
        assert!(matches!(err.root(), Error::Io(_)));
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let device = RecordingDevice::new();
        let err = load_shader(
            &device,
            Path::new("shaders/compute.wgsl"),
            ShaderResources::default(),
            TextureKind::D2,
        )
        .unwrap_err();
        assert!(err.is_init());
    }
}
