// src/cube.rs
//! The built-in textured cube.

use std::path::{Path, PathBuf};

use log::info;

use crate::assets::{Geometry, Image, ImageSource, MeshAsset, MeshProvider, PosUvVertex};
use crate::context::Context;
use crate::error::Result;

const fn v(position: [f32; 3], uv: [f32; 2]) -> PosUvVertex {
    PosUvVertex::new(position, uv)
}

/// Unit cube centered on the origin, four vertices per face so every face
/// gets the full texture.
pub const CUBE_VERTICES: [PosUvVertex; 24] = [
    // +Z
    v([-0.5, -0.5, 0.5], [0.0, 1.0]),
    v([0.5, -0.5, 0.5], [1.0, 1.0]),
    v([0.5, 0.5, 0.5], [1.0, 0.0]),
    v([-0.5, 0.5, 0.5], [0.0, 0.0]),
    // -Z
    v([0.5, -0.5, -0.5], [0.0, 1.0]),
    v([-0.5, -0.5, -0.5], [1.0, 1.0]),
    v([-0.5, 0.5, -0.5], [1.0, 0.0]),
    v([0.5, 0.5, -0.5], [0.0, 0.0]),
    // +X
    v([0.5, -0.5, 0.5], [0.0, 1.0]),
    v([0.5, -0.5, -0.5], [1.0, 1.0]),
    v([0.5, 0.5, -0.5], [1.0, 0.0]),
    v([0.5, 0.5, 0.5], [0.0, 0.0]),
    // -X
    v([-0.5, -0.5, -0.5], [0.0, 1.0]),
    v([-0.5, -0.5, 0.5], [1.0, 1.0]),
    v([-0.5, 0.5, 0.5], [1.0, 0.0]),
    v([-0.5, 0.5, -0.5], [0.0, 0.0]),
    // +Y
    v([-0.5, 0.5, 0.5], [0.0, 1.0]),
    v([0.5, 0.5, 0.5], [1.0, 1.0]),
    v([0.5, 0.5, -0.5], [1.0, 0.0]),
    v([-0.5, 0.5, -0.5], [0.0, 0.0]),
    // -Y
    v([-0.5, -0.5, -0.5], [0.0, 1.0]),
    v([0.5, -0.5, -0.5], [1.0, 1.0]),
    v([0.5, -0.5, 0.5], [1.0, 0.0]),
    v([-0.5, -0.5, 0.5], [0.0, 0.0]),
];

/// Two triangles per face.
pub fn cube_indices() -> Vec<u32> {
    (0..6u32)
        .flat_map(|face| {
            let base = face * 4;
            [base, base + 1, base + 2, base, base + 2, base + 3]
        })
        .collect()
}

/// The cube mesh plus the texture applied to it.
pub struct CubeAssets {
    meshes: Vec<MeshAsset>,
    surfaces: Vec<Image>,
}

impl CubeAssets {
    pub fn new(texture: Image) -> Self {
        let indices = cube_indices();
        let mesh = MeshAsset {
            name: "cube".to_owned(),
            submeshes: vec![Geometry {
                first_index: 0,
                index_count: indices.len() as u32,
            }],
            vertices: CUBE_VERTICES.to_vec(),
            indices,
        };
        Self {
            meshes: vec![mesh],
            surfaces: vec![texture],
        }
    }

    /// Builds the cube with the texture at `texture_path`.
    pub fn load(texture_path: &Path, images: &dyn ImageSource) -> Result<Self> {
        let texture = images
            .load(texture_path)
            .with_context(|| format!("loading cube texture {}", texture_path.display()))?;
        info!("Cube texture {}x{}", texture.width, texture.height);
        Ok(Self::new(texture))
    }
}

impl MeshProvider for CubeAssets {
    fn meshes(&self) -> &[MeshAsset] {
        &self.meshes
    }

    fn surfaces(&self) -> &[Image] {
        &self.surfaces
    }
}

/// Default texture location, relative to the working directory.
pub fn default_texture_path() -> PathBuf {
    PathBuf::from("resources/textures/cube.png")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_cover_every_vertex() {
        let indices = cube_indices();
        assert_eq!(indices.len(), 36);
        assert_eq!(indices.iter().max(), Some(&23));
        for vertex in 0..24u32 {
            assert!(indices.contains(&vertex));
        }
    }

    #[test]
    fn faces_are_planar() {
        for face in CUBE_VERTICES.chunks(4) {
            let shared_axis = (0..3).find(|&axis| {
                face.iter().all(|vertex| vertex.position[axis] == face[0].position[axis])
            });
            assert!(shared_axis.is_some());
        }
    }

    #[test]
    fn provides_one_mesh_and_surface() {
        let assets = CubeAssets::new(Image::solid(1, 1, [255; 4]));
        assert_eq!(assets.meshes().len(), 1);
        assert_eq!(assets.meshes()[0].submeshes[0].index_count, 36);
        assert_eq!(assets.surfaces().len(), 1);
    }
}
