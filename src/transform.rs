// src/transform.rs
use glam::{Mat4, Vec3};

/// Translation / Euler rotation (radians) / scale with a cached matrix.
///
/// Set `touched` after mutating a field; [`Transform::matrix`] only rebuilds
/// the matrix when the flag is set.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub touched: bool,
    matrix: Mat4,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            touched: true,
            matrix: Mat4::IDENTITY,
        }
    }
}

impl Transform {
    pub fn new(translation: Vec3, rotation: Vec3, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
            ..Default::default()
        }
    }

    /// `T · Ry · Rx · Rz · S`, rebuilt only when touched.
    pub fn matrix(&mut self) -> Mat4 {
        if self.touched {
            self.matrix = Self::compose(self.translation, self.rotation, self.scale);
            self.touched = false;
        }
        self.matrix
    }

    pub fn compose(translation: Vec3, rotation: Vec3, scale: Vec3) -> Mat4 {
        Mat4::from_translation(translation)
            * Mat4::from_rotation_y(rotation.y)
            * Mat4::from_rotation_x(rotation.x)
            * Mat4::from_rotation_z(rotation.z)
            * Mat4::from_scale(scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touched_mutation_is_observed() {
        let mut t = Transform::default();
        assert_eq!(t.matrix(), Mat4::IDENTITY);

        t.translation = Vec3::new(1.0, 2.0, 3.0);
        t.rotation.y = 0.5;
        t.touched = true;

        let expected = Transform::compose(t.translation, t.rotation, t.scale);
        assert!(t.matrix().abs_diff_eq(expected, 1e-6));
        assert!(!t.touched);
    }

    #[test]
    fn untouched_mutation_is_not_observed() {
        let mut t = Transform::default();
        let cached = t.matrix();
        t.scale = Vec3::splat(4.0);
        assert_eq!(t.matrix(), cached);
    }

    #[test]
    fn rotation_order_is_y_then_x_then_z() {
        let rotation = Vec3::new(0.3, 1.1, -0.7);
        let m = Transform::compose(Vec3::ZERO, rotation, Vec3::ONE);
        let expected = Mat4::from_euler(glam::EulerRot::YXZ, rotation.y, rotation.x, rotation.z);
        assert!(m.abs_diff_eq(expected, 1e-5));
    }
}
