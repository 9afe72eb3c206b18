//! Buffer resource types.

use {
    super::{from_vk, Device, DriverError},
    ash::vk,
    gpu_allocator::{
        vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
        MemoryLocation,
    },
    log::warn,
    std::{ops::Deref, sync::Arc},
};

/// Information used to create a [`Buffer`].
#[derive(Clone, Copy, Debug)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Host-visible (and host-coherent) when set; device-local otherwise.
    pub mappable: bool,
}

impl BufferInfo {
    pub fn host(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            mappable: true,
        }
    }

    pub fn device(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            mappable: false,
        }
    }
}

/// Smart pointer handle to a buffer object with bound memory.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,

    /// Information used to create this object.
    pub info: BufferInfo,
}

impl Buffer {
    #[profiling::function]
    pub fn create(device: &Arc<Device>, info: BufferInfo) -> Result<Self, DriverError> {
        let device = Arc::clone(device);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(info.size.max(4))
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(from_vk)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let location = if info.mappable {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| {
                warn!("buffer allocation failed: {err}");
                unsafe { device.destroy_buffer(buffer, None) };
                DriverError::OutOfMemory
            })?;

        unsafe {
            device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(from_vk)?;
        }

        Ok(Self {
            device,
            buffer,
            allocation: Some(allocation),
            info,
        })
    }

    /// Host-visible mapping, when the buffer was created mappable.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
    }

    /// Copy `bytes` into the mapped buffer at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), DriverError> {
        let slice = self.mapped_slice_mut().ok_or(DriverError::InvalidData)?;
        let end = offset.checked_add(bytes.len()).ok_or(DriverError::InvalidData)?;
        if end > slice.len() {
            return Err(DriverError::InvalidData);
        }
        slice[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Read back `len` bytes from the mapped buffer at `offset`.
    pub fn read(&mut self, offset: usize, len: usize) -> Result<Vec<u8>, DriverError> {
        let slice = self.mapped_slice_mut().ok_or(DriverError::InvalidData)?;
        let end = offset.checked_add(len).ok_or(DriverError::InvalidData)?;
        if end > slice.len() {
            return Err(DriverError::InvalidData);
        }
        Ok(slice[offset..end].to_vec())
    }
}

impl Deref for Buffer {
    type Target = vk::Buffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.device.allocator().lock().free(allocation) {
                warn!("buffer free failed: {err}");
            }
        }
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("info", &self.info).finish()
    }
}
