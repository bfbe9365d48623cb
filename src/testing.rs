// src/testing.rs
//! Test helpers shared across modules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::assets::{Image, ImageSource};
use crate::error::{Error, Result};

/// Images served from memory, keyed by file name.
#[derive(Default)]
pub struct MemoryImages {
    images: HashMap<String, Image>,
}

impl MemoryImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, file_name: &str, image: Image) -> Self {
        self.images.insert(file_name.to_owned(), image);
        self
    }

    /// The six skybox faces, all `size`×`size`.
    pub fn skybox_faces(size: u32) -> Self {
        crate::skybox::FACE_FILES
            .iter()
            .enumerate()
            .fold(Self::new(), |images, (i, name)| {
                images.with(name, Image::solid(size, size, [i as u8 * 40, 0, 0, 255]))
            })
    }
}

impl ImageSource for MemoryImages {
    fn load(&self, path: &Path) -> Result<Image> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        self.images
            .get(name)
            .cloned()
            .ok_or_else(|| Error::custom(format!("no test image {}", path.display())))
    }
}

pub fn shader_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("resources/shaders").join(name)
}
