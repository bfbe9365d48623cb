// src/gltf_loader.rs
// GLTF import into plain mesh + image lists.
// Requires: gltf

use std::path::Path;

use log::{info, warn};

use crate::assets::{Geometry, Image, MeshAsset, MeshProvider, PosUvVertex};
use crate::context::Context;
use crate::error::{Error, Result};

/// Meshes and decoded images of a GLTF file.
#[derive(Debug)]
pub struct GltfLoader {
    meshes: Vec<MeshAsset>,
    surfaces: Vec<Image>,
}

impl GltfLoader {
    /// Imports a `.gltf` / `.glb` file. The file must contain at least one
    /// mesh and one image.
    pub fn load(path: &Path) -> Result<Self> {
        let (document, buffers, images) =
            gltf::import(path).with_context(|| format!("importing {}", path.display()))?;

        let meshes = read_meshes(&document, &buffers)?;
        let surfaces = images
            .into_iter()
            .map(convert_image)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("converting images of {}", path.display()))?;

        if meshes.is_empty() {
            return Err(Error::custom(format!("{} contains no meshes", path.display())));
        }
        if surfaces.is_empty() {
            return Err(Error::custom(format!("{} contains no images", path.display())));
        }

        info!(
            "Loaded {}: {} meshes, {} images",
            path.display(),
            meshes.len(),
            surfaces.len()
        );
        Ok(Self { meshes, surfaces })
    }
}

impl MeshProvider for GltfLoader {
    fn meshes(&self) -> &[MeshAsset] {
        &self.meshes
    }

    fn surfaces(&self) -> &[Image] {
        &self.surfaces
    }
}

/// Flattens every mesh into one vertex/index list per mesh, one submesh per
/// primitive. Indices are rebased onto the mesh's vertex list.
fn read_meshes(document: &gltf::Document, buffers: &[gltf::buffer::Data]) -> Result<Vec<MeshAsset>> {
    let mut meshes = Vec::with_capacity(document.meshes().len());

    for mesh in document.meshes() {
        let name = mesh
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("mesh_{}", mesh.index()));
        let mut asset = MeshAsset {
            name,
            ..Default::default()
        };

        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                warn!("{}: skipping {:?} primitive", asset.name, primitive.mode());
                continue;
            }

            let reader = primitive.reader(|buffer| Some(buffers[buffer.index()].0.as_slice()));
            let positions = reader
                .read_positions()
                .ok_or_else(|| Error::custom(format!("{}: primitive without positions", asset.name)))?;

            let base_vertex = asset.vertices.len();
            asset
                .vertices
                .extend(positions.map(|position| PosUvVertex { position, uv: [0.0; 2] }));
            let vertex_count = asset.vertices.len() - base_vertex;

            if let Some(uvs) = reader.read_tex_coords(0) {
                for (vertex, uv) in asset.vertices[base_vertex..].iter_mut().zip(uvs.into_f32()) {
                    vertex.uv = uv;
                }
            }

            let first_index = asset.indices.len();
            let base = base_vertex as u32;
            match reader.read_indices() {
                Some(indices) => asset.indices.extend(indices.into_u32().map(|i| i + base)),
                None => asset.indices.extend(base..base + vertex_count as u32),
            }

            asset.submeshes.push(Geometry {
                first_index: first_index as u32,
                index_count: (asset.indices.len() - first_index) as u32,
            });
        }

        meshes.push(asset);
    }

    Ok(meshes)
}

/// Expands a decoded GLTF image to RGBA8.
fn convert_image(data: gltf::image::Data) -> Result<Image> {
    use gltf::image::Format;

    let pixels = match data.format {
        Format::R8G8B8A8 => data.pixels,
        Format::R8G8B8 => data
            .pixels
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        Format::R8G8 => data
            .pixels
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[1], 0, 255])
            .collect(),
        Format::R8 => data.pixels.iter().flat_map(|&l| [l, l, l, 255]).collect(),
        other => return Err(Error::custom(format!("unsupported image format {other:?}"))),
    };
    Image::rgba8(data.width, data.height, pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    // One triangle (positions, uvs, u16 indices) referenced by two primitives.
    const TRIANGLE_GLTF: &str = r#"{
        "asset": { "version": "2.0" },
        "buffers": [{
            "byteLength": 68,
            "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAAAAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAABAAIAAAA="
        }],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 24 },
            { "buffer": 0, "byteOffset": 60, "byteLength": 6 }
        ],
        "accessors": [
            { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
              "min": [0, 0, 0], "max": [1, 1, 0] },
            { "bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC2" },
            { "bufferView": 2, "componentType": 5123, "count": 3, "type": "SCALAR" }
        ],
        "meshes": [{
            "name": "tri",
            "primitives": [
                { "attributes": { "POSITION": 0, "TEXCOORD_0": 1 }, "indices": 2 },
                { "attributes": { "POSITION": 0 }, "indices": 2 }
            ]
        }]
    }"#;

    #[test]
    fn reads_meshes_and_rebases_indices() {
        let (document, buffers, _) = gltf::import_slice(TRIANGLE_GLTF.as_bytes()).unwrap();
        let meshes = read_meshes(&document, &buffers).unwrap();

        assert_eq!(meshes.len(), 1);
        let mesh = &meshes[0];
        assert_eq!(mesh.name, "tri");
        assert_eq!(mesh.vertices.len(), 6);
        assert_eq!(mesh.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(
            mesh.submeshes,
            vec![
                Geometry { first_index: 0, index_count: 3 },
                Geometry { first_index: 3, index_count: 3 },
            ]
        );
        assert_eq!(mesh.vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices[1].uv, [1.0, 0.0]);
        // Second primitive has no uvs.
        assert_eq!(mesh.vertices[4].uv, [0.0, 0.0]);
    }

    #[test]
    fn expands_rgb_images() {
        let data = gltf::image::Data {
            pixels: vec![1, 2, 3, 4, 5, 6],
            format: gltf::image::Format::R8G8B8,
            width: 2,
            height: 1,
        };
        let image = convert_image(data).unwrap();
        assert_eq!(image.pixels, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn rejects_float_images() {
        let data = gltf::image::Data {
            pixels: vec![0; 12],
            format: gltf::image::Format::R32G32B32FLOAT,
            width: 1,
            height: 1,
        };
        assert!(convert_image(data).is_err());
    }

    #[test]
    fn missing_file_fails() {
        let err = GltfLoader::load(Path::new("missing/model.gltf")).unwrap_err();
        assert!(matches!(err.root(), Error::Gltf(_)));
    }
}
