//! SPIR-V loading.
//!
//! Shader binaries ship next to their GLSL sources under the engine's
//! shader root and are read at run time; there is no build-time compiler
//! dependency. A missing or malformed blob surfaces as
//! [`DriverError::InvalidData`] and the caller decides whether that is fatal
//! (graphics pipelines) or a fallback trigger (compute kernels).

use {
    super::DriverError,
    ash::util::read_spv,
    log::warn,
    std::{fs::File, io::BufReader, path::Path},
};

/// Read a `.spv` file into the 32-bit words Vulkan expects.
pub fn read_spirv_file(path: impl AsRef<Path>) -> Result<Vec<u32>, DriverError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| {
        warn!("cannot open shader {}: {err}", path.display());
        DriverError::InvalidData
    })?;
    let mut reader = BufReader::new(file);
    read_spv(&mut reader).map_err(|err| {
        warn!("malformed SPIR-V {}: {err}", path.display());
        DriverError::InvalidData
    })
}
