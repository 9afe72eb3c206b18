//! Thin [Vulkan](https://registry.khronos.org/vulkan/) layer based on smart
//! pointers.
//!
//! Each resource owns an opaque Vulkan handle plus the information used to
//! create it. Everything here is headless-friendly: the engine runs with no
//! device at all (CPU paths only), and nothing in this module touches a
//! swapchain - the embedding viewport owns presentation.

mod buffer;
mod compute;
mod descriptor;
mod device;
mod image;
mod shader;

pub use self::{
    buffer::{Buffer, BufferInfo},
    compute::ComputePipeline,
    descriptor::{mesh_descriptor_set_layout, DescriptorPool},
    device::Device,
    image::{Image, ImageInfo, Sampler},
    shader::read_spirv_file,
};

use std::fmt::{Display, Formatter};

/// Failures at the device boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverError {
    /// The input data, or referenced data, is not valid for the current
    /// state.
    InvalidData,

    /// The requested feature, or input configuration, is not supported for
    /// the current state.
    Unsupported,

    /// The device has run out of physical memory. Many drivers return this
    /// value for generic or unhandled error conditions.
    OutOfMemory,

    /// The device was lost or a queue wait expired; the caller must
    /// re-initialize GPU state.
    DeviceLost,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for DriverError {}

pub(crate) fn from_vk(err: ash::vk::Result) -> DriverError {
    use ash::vk;

    match err {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY => DriverError::OutOfMemory,
        vk::Result::ERROR_DEVICE_LOST => DriverError::DeviceLost,
        vk::Result::ERROR_FEATURE_NOT_PRESENT
        | vk::Result::ERROR_EXTENSION_NOT_PRESENT
        | vk::Result::ERROR_INCOMPATIBLE_DRIVER => DriverError::Unsupported,
        _ => DriverError::InvalidData,
    }
}
