// src/uniforms.rs
//! Per-frame vertex uniform payloads.
//!
//! | slot | payload                                  |
//! |------|------------------------------------------|
//! | 0    | view-projection                          |
//! | 1    | model                                    |
//! | 2    | instancing `{spread, dimension}`         |
//! | 3    | skybox view-projection (no translation)  |

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::error::Result;
use crate::gpu::{CommandBufferId, GpuDevice};
use crate::scene::InstanceConfig;

pub const SLOT_VIEW_PROJ: u32 = 0;
pub const SLOT_MODEL: u32 = 1;
pub const SLOT_INSTANCING: u32 = 2;
pub const SLOT_SKY_VIEW_PROJ: u32 = 3;

/// Uniform buffer count the cube vertex shader declares.
pub const SCENE_UNIFORM_COUNT: u32 = 3;
/// Uniform buffer count the skybox vertex shader declares.
pub const SKY_UNIFORM_COUNT: u32 = 4;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MatrixUniform {
    /// Column-major 4x4 matrix
    pub matrix: [[f32; 4]; 4],
}

impl From<Mat4> for MatrixUniform {
    fn from(m: Mat4) -> Self {
        Self {
            matrix: m.to_cols_array_2d(),
        }
    }
}

/// Matches the WGSL `Instancing` struct (16-byte aligned).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceUniform {
    pub spread: f32,
    pub dimension: u32,
    pub _pad: [u32; 2],
}

impl From<InstanceConfig> for InstanceUniform {
    fn from(cfg: InstanceConfig) -> Self {
        Self {
            spread: cfg.spread,
            dimension: cfg.dimension,
            _pad: [0; 2],
        }
    }
}

/// Everything pushed before the scene pass begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameUniforms {
    pub view_proj: Mat4,
    pub model: Mat4,
    pub instancing: InstanceConfig,
    pub sky_view_proj: Mat4,
}

impl FrameUniforms {
    /// Pushes every slot into `cmd`.
    pub fn push<D: GpuDevice + ?Sized>(&self, device: &D, cmd: CommandBufferId) -> Result<()> {
        let view_proj = MatrixUniform::from(self.view_proj);
        let model = MatrixUniform::from(self.model);
        let instancing = InstanceUniform::from(self.instancing);
        let sky = MatrixUniform::from(self.sky_view_proj);

        device.push_vertex_uniform(cmd, SLOT_VIEW_PROJ, bytemuck::bytes_of(&view_proj))?;
        device.push_vertex_uniform(cmd, SLOT_MODEL, bytemuck::bytes_of(&model))?;
        device.push_vertex_uniform(cmd, SLOT_INSTANCING, bytemuck::bytes_of(&instancing))?;
        device.push_vertex_uniform(cmd, SLOT_SKY_VIEW_PROJ, bytemuck::bytes_of(&sky))?;
        Ok(())
    }
}
