// src/config.rs
//! Demo configuration, loaded from an optional JSON file.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```json
//! { "model": "resources/models/duck.glb", "instancing": { "dimension": 3 } }
//! ```

use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;

use crate::context::Context;
use crate::cube::default_texture_path;
use crate::error::{Error, Result};
use crate::scene::InstanceConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Some cube idk".to_owned(),
            width: 640,
            height: 480,
            resizable: true,
            vsync: true,
        }
    }
}

/// Size of the offscreen scene render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderPaths {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("resources/shaders/cube.vert.wgsl"),
            fragment: PathBuf::from("resources/shaders/cube.frag.wgsl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SkyboxConfig {
    /// Directory holding `left.jpg`, `right.jpg`, `top.jpg`, `bottom.jpg`,
    /// `back.jpg` and `front.jpg`.
    pub directory: PathBuf,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for SkyboxConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("resources/textures/skybox"),
            vertex_shader: PathBuf::from("resources/shaders/skybox.vert.wgsl"),
            fragment_shader: PathBuf::from("resources/shaders/skybox.frag.wgsl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub position: [f32; 3],
    pub target: [f32; 3],
    pub up: [f32; 3],
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [0.0, 1.0, -4.0],
            target: [0.0, 0.0, 0.0],
            up: [0.0, 1.0, 0.0],
            fov_degrees: 60.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub window: WindowConfig,
    pub viewport: ViewportConfig,
    pub shaders: ShaderPaths,
    /// Cube texture; unused when `model` is set.
    pub texture: PathBuf,
    /// GLTF file replacing the cube.
    pub model: Option<PathBuf>,
    pub skybox: Option<SkyboxConfig>,
    pub camera: CameraConfig,
    /// Spin speed in rad/s around X, Y, Z.
    pub rotation_speeds: [f32; 3],
    pub instancing: InstanceConfig,
    pub wireframe: bool,
    pub animate_camera: bool,
    pub clear_color: [f32; 4],
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            viewport: ViewportConfig::default(),
            shaders: ShaderPaths::default(),
            texture: default_texture_path(),
            model: None,
            skybox: None,
            camera: CameraConfig::default(),
            rotation_speeds: [0.0, 1.0, 0.0],
            instancing: InstanceConfig::default(),
            wireframe: false,
            animate_camera: false,
            clear_color: [0.1, 0.1, 0.1, 1.0],
        }
    }
}

impl DemoConfig {
    /// Parses and validates a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No config file given, using defaults");
            return Ok(Self::default());
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_json(&json).with_context(|| format!("in {}", path.display()))?;
        info!("Loaded config {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::ensure!(
            self.window.width > 0 && self.window.height > 0,
            Error::custom("window size must be non-zero")
        );
        crate::ensure!(
            self.viewport.width > 0 && self.viewport.height > 0,
            Error::custom("viewport size must be non-zero")
        );
        crate::ensure!(
            self.instancing.dimension >= 1,
            Error::custom("instancing dimension must be at least 1")
        );
        crate::ensure!(
            self.camera.near > 0.0 && self.camera.far > self.camera.near,
            "camera clip planes must satisfy 0 < near < far (got {} / {})",
            self.camera.near,
            self.camera.far
        );
        Ok(())
    }
}
