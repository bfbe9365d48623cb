// src/assets.rs
//! CPU-side asset types: vertex formats, decoded images and mesh lists.
//!
//! Everything here is plain data. Getting it onto the GPU is the job of
//! [`crate::resources`].

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::context::Context;
use crate::error::{Error, Result};

/// Position + texture coordinate. Matches `VertexLayout::PositionUv`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PosUvVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

impl PosUvVertex {
    pub const fn new(position: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, uv }
    }
}

/// Position only. Matches `VertexLayout::Position`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PosVertex {
    pub position: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 => 4,
        }
    }

    pub fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            Self::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// A decoded image, tightly packed rows.
#[derive(Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Image {
    /// Wraps RGBA8 pixels, checking the buffer length.
    pub fn rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected || width == 0 || height == 0 {
            return Err(Error::custom(format!(
                "{width}x{height} RGBA8 image needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format: PixelFormat::Rgba8,
            pixels,
        })
    }

    /// A single-color image.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Rgba8,
            pixels: rgba.repeat(width as usize * height as usize),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Decodes an image file and converts it to RGBA8.
pub fn load_image(path: &Path) -> Result<Image> {
    let decoded = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    debug!("Loaded {} ({}x{})", path.display(), width, height);
    Image::rgba8(width, height, rgba.into_raw())
}

/// Source of decoded images, so the decoder can be swapped out.
pub trait ImageSource {
    fn load(&self, path: &Path) -> Result<Image>;
}

/// Reads and decodes images from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskImages;

impl ImageSource for DiskImages {
    fn load(&self, path: &Path) -> Result<Image> {
        load_image(path)
    }
}

/// A contiguous index range of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub first_index: u32,
    pub index_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshAsset {
    pub name: String,
    pub submeshes: Vec<Geometry>,
    pub vertices: Vec<PosUvVertex>,
    pub indices: Vec<u32>,
}

/// Anything that yields meshes and the images they are textured with.
pub trait MeshProvider {
    fn meshes(&self) -> &[MeshAsset];
    fn surfaces(&self) -> &[Image];
}
