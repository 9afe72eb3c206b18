//! Sampled textures bound into material descriptor sets.

use {
    crate::driver::{Device, DriverError, Image, Sampler},
    ash::vk,
    std::sync::Arc,
};

/// A texture: image, view and sampler. Headless engines carry textures with
/// no GPU backing (pixel data only lives in whoever created it); binding
/// such a texture substitutes the renderer's neutral default.
pub struct Texture {
    name: String,
    width: u32,
    height: u32,
    image: Option<Image>,
    sampler: Option<Sampler>,
}

impl Texture {
    /// Upload RGBA8 pixels and wrap them with a linear sampler.
    pub fn from_rgba8(
        device: &Arc<Device>,
        name: impl Into<String>,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self, DriverError> {
        let image = Image::upload_rgba8(device, width, height, pixels)?;
        let sampler = Sampler::linear(device)?;
        Ok(Self {
            name: name.into(),
            width,
            height,
            image: Some(image),
            sampler: Some(sampler),
        })
    }

    /// The 1x1 neutral texture substituted for missing material slots.
    pub fn neutral(device: &Arc<Device>) -> Result<Self, DriverError> {
        Self::from_rgba8(device, "default", 1, 1, &[255, 255, 255, 255])
    }

    /// A texture record with no GPU backing, used by headless paths and
    /// tests.
    pub fn placeholder(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            image: None,
            sampler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn has_gpu(&self) -> bool {
        self.image.is_some()
    }

    pub fn view(&self) -> Option<vk::ImageView> {
        self.image.as_ref().map(Image::view)
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler.as_ref().map(|sampler| **sampler)
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("gpu", &self.has_gpu())
            .finish()
    }
}
