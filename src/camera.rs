// src/camera.rs
use glam::{Mat4, Vec3};

/// Perspective look-at camera with cached matrices.
///
/// Mutate `position` / `target` / `up` and set `touched`; the next
/// [`Camera::update`] (or any matrix read) recomputes view, projection and
/// model together.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub touched: bool,

    fov_y: f32, // radians
    aspect: f32,
    near: f32,
    far: f32,

    view: Mat4,
    projection: Mat4,
    model: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 1.0, -4.0), Vec3::ZERO)
    }
}

impl Camera {
    pub const DEFAULT_FOV_DEGREES: f32 = 60.0;
    pub const DEFAULT_ASPECT: f32 = 4.0 / 3.0;
    pub const DEFAULT_NEAR: f32 = 0.1;
    pub const DEFAULT_FAR: f32 = 100.0;

    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            up: Vec3::Y,
            touched: true,
            fov_y: Self::DEFAULT_FOV_DEGREES.to_radians(),
            aspect: Self::DEFAULT_ASPECT,
            near: Self::DEFAULT_NEAR,
            far: Self::DEFAULT_FAR,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            model: Mat4::IDENTITY,
        }
    }

    pub fn with_projection(mut self, fov_degrees: f32, near: f32, far: f32) -> Self {
        self.fov_y = fov_degrees.to_radians();
        self.near = near;
        self.far = far;
        self.touched = true;
        self
    }

    /// Update aspect ratio (call when the render target is resized).
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
        self.touched = true;
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn fov_degrees(&self) -> f32 {
        self.fov_y.to_degrees()
    }

    /// Recomputes the cached matrices if touched.
    pub fn update(&mut self) {
        if !self.touched {
            return;
        }
        self.view = Mat4::look_at_lh(self.position, self.target, self.up);
        self.projection = Mat4::perspective_lh(self.fov_y, self.aspect, self.near, self.far);
        self.model = Mat4::from_translation(self.position);
        self.touched = false;
    }

    pub fn view(&mut self) -> Mat4 {
        self.update();
        self.view
    }

    pub fn projection(&mut self) -> Mat4 {
        self.update();
        self.projection
    }

    /// World transform of the camera itself.
    pub fn model(&mut self) -> Mat4 {
        self.update();
        self.model
    }

    pub fn view_projection(&mut self) -> Mat4 {
        self.update();
        self.projection * self.view
    }

    /// View-projection without the camera translation, for skyboxes.
    pub fn rotation_view_projection(&mut self) -> Mat4 {
        self.update();
        let rotation_only = Mat4::from_mat3(glam::Mat3::from_mat4(self.view));
        self.projection * rotation_only
    }
}
