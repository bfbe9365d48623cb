// src/scene.rs
//! Scene state advanced once per frame: the spinning mesh, the camera, the
//! instancing grid and the GUI-editable toggles.

use std::f32::consts::TAU;

use glam::Vec3;
use log::debug;
use serde::Deserialize;

use crate::camera::Camera;
use crate::config::DemoConfig;
use crate::transform::Transform;
use crate::uniforms::FrameUniforms;

/// Camera dolly range and speed.
const DOLLY_NEAR_Z: f32 = -1.0;
const DOLLY_FAR_Z: f32 = -10.0;
const DOLLY_SPEED: f32 = 2.5;

/// Instanced grid: `dimension³` copies of the mesh, `spread` units apart.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub spread: f32,
    pub dimension: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            spread: 1.5,
            dimension: 1,
        }
    }
}

impl InstanceConfig {
    pub fn instance_count(&self) -> u32 {
        self.dimension.saturating_pow(3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    fn component_mut(self, v: &mut Vec3) -> &mut f32 {
        match self {
            Axis::X => &mut v.x,
            Axis::Y => &mut v.y,
            Axis::Z => &mut v.z,
        }
    }
}

/// Spin speed (rad/s) around one axis of the mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation {
    pub name: &'static str,
    pub axis: Axis,
    pub speed: f32,
}

/// Wraps an angle into `[0, 2π)`.
#[inline]
pub fn wrap_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs.
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

#[derive(Debug, Clone)]
pub struct SceneState {
    pub mesh_transform: Transform,
    pub camera: Camera,
    pub rotations: [Rotation; 3],
    pub instancing: InstanceConfig,
    pub wireframe: bool,
    pub animate_camera: bool,
    /// Scene render target size in pixels.
    pub viewport: (u32, u32),
    /// Set by the GUI; applied between frames.
    pub requested_viewport: Option<(u32, u32)>,
    dolly_direction: f32,
}

impl Default for SceneState {
    fn default() -> Self {
        Self::from_config(&DemoConfig::default())
    }
}

impl SceneState {
    pub fn from_config(config: &DemoConfig) -> Self {
        let cam = &config.camera;
        let mut camera = Camera::new(Vec3::from(cam.position), Vec3::from(cam.target))
            .with_projection(cam.fov_degrees, cam.near, cam.far);
        camera.up = Vec3::from(cam.up);
        camera.set_aspect(config.viewport.width as f32 / config.viewport.height.max(1) as f32);

        let names = ["X Axis", "Y Axis", "Z Axis"];
        let rotations = std::array::from_fn(|i| Rotation {
            name: names[i],
            axis: Axis::ALL[i],
            speed: config.rotation_speeds[i],
        });

        Self {
            mesh_transform: Transform::default(),
            camera,
            rotations,
            instancing: config.instancing,
            wireframe: config.wireframe,
            animate_camera: config.animate_camera,
            viewport: (config.viewport.width, config.viewport.height),
            requested_viewport: None,
            dolly_direction: -1.0,
        }
    }

    /// Advances rotations and the camera dolly by `dt` seconds.
    pub fn update(&mut self, dt: f32) {
        for rotation in &self.rotations {
            if rotation.speed == 0.0 {
                continue;
            }
            let angle = rotation.axis.component_mut(&mut self.mesh_transform.rotation);
            *angle = wrap_angle(*angle + dt * rotation.speed);
            self.mesh_transform.touched = true;
        }

        if self.animate_camera {
            self.dolly_camera(dt);
        }
    }

    /// Ping-pongs the camera between the near and far dolly positions.
    fn dolly_camera(&mut self, dt: f32) {
        let z = self.camera.position.z;
        if z < DOLLY_FAR_Z {
            self.dolly_direction = 1.0;
        } else if z > DOLLY_NEAR_Z {
            self.dolly_direction = -1.0;
        }
        self.camera.position.z += self.dolly_direction * dt * DOLLY_SPEED;
        self.camera.touched = true;
    }

    /// Recomputes dirty matrices and returns this frame's uniform payload.
    pub fn uniforms(&mut self) -> FrameUniforms {
        FrameUniforms {
            view_proj: self.camera.view_projection(),
            model: self.mesh_transform.matrix(),
            instancing: self.instancing,
            sky_view_proj: self.camera.rotation_view_projection(),
        }
    }

    /// Applies a new render target size to the camera.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        debug!("Scene viewport {}x{}", width, height);
        self.viewport = (width, height);
        self.camera.set_aspect(width as f32 / height.max(1) as f32);
    }
}
