//! Logical device with a single graphics+compute queue.

use {
    super::{from_vk, DriverError},
    ash::vk,
    gpu_allocator::{
        vulkan::{Allocator, AllocatorCreateDesc},
        AllocationSizes,
    },
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::{
        mem::ManuallyDrop,
        ops::Deref,
        sync::Arc,
        time::Duration,
    },
};

/// How long a blocking queue wait may take before the device is declared
/// lost.
const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Smart pointer handle to a logical device.
///
/// Owns the instance, the allocator, one universal queue and a command pool
/// for one-shot transfers. `Deref`s to [`ash::Device`] so raw Vulkan calls
/// remain available to the render and compute layers.
pub struct Device {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    queue_family_index: u32,
    command_pool: Mutex<vk::CommandPool>,
    allocator: ManuallyDrop<Mutex<Allocator>>,
}

impl Device {
    /// Create a device without any surface, suitable for compute dispatch
    /// and offscreen resource creation. Fails with
    /// [`DriverError::Unsupported`] when no Vulkan runtime or no
    /// graphics+compute queue is present.
    pub fn create_headless() -> Result<Arc<Self>, DriverError> {
        let entry = unsafe {
            ash::Entry::load().map_err(|err| {
                warn!("vulkan runtime unavailable: {err}");
                DriverError::Unsupported
            })?
        };

        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe {
            entry
                .create_instance(&instance_info, None)
                .map_err(from_vk)?
        };

        let result = Self::create_with_instance(entry, instance);
        if result.is_err() {
            // Instance was consumed on success; nothing to clean here beyond
            // reporting.
            warn!("headless device creation failed");
        }
        result
    }

    fn create_with_instance(
        entry: ash::Entry,
        instance: ash::Instance,
    ) -> Result<Arc<Self>, DriverError> {
        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(from_vk)?
        };

        let mut selected = None;
        for physical_device in physical_devices {
            let families = unsafe {
                instance.get_physical_device_queue_family_properties(physical_device)
            };
            let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
            if let Some(index) = families
                .iter()
                .position(|family| family.queue_flags.contains(wanted))
            {
                selected = Some((physical_device, index as u32));
                break;
            }
        }
        let Some((physical_device, queue_family_index)) = selected else {
            unsafe { instance.destroy_instance(None) };
            return Err(DriverError::Unsupported);
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        info!(
            "using device: {:?}",
            properties
                .device_name_as_c_str()
                .unwrap_or(c"unknown")
        );

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let device_info =
            vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));
        let device = unsafe {
            instance
                .create_device(physical_device, &device_info, None)
                .map_err(from_vk)?
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(from_vk)?
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })
        .map_err(|err| {
            warn!("allocator creation failed: {err}");
            DriverError::OutOfMemory
        })?;

        debug!("device ready (queue family {queue_family_index})");

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue: Mutex::new(queue),
            queue_family_index,
            command_pool: Mutex::new(command_pool),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
        }))
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub(crate) fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Record and submit a one-shot command buffer, blocking until the
    /// submission completes or the wait times out.
    #[profiling::function]
    pub fn execute_one_shot(
        self: &Arc<Self>,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<(), DriverError> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(from_vk)?[0]
        };

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                self.device
                    .begin_command_buffer(cmd, &begin_info)
                    .map_err(from_vk)?;
            }
            record(&self.device, cmd);
            unsafe {
                self.device.end_command_buffer(cmd).map_err(from_vk)?;
            }

            let fence_info = vk::FenceCreateInfo::default();
            let fence = unsafe {
                self.device
                    .create_fence(&fence_info, None)
                    .map_err(from_vk)?
            };
            let submit =
                vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
            let wait = unsafe {
                let queue = self.queue.lock();
                self.device
                    .queue_submit(*queue, std::slice::from_ref(&submit), fence)
                    .map_err(from_vk)
                    .and_then(|_| {
                        self.device
                            .wait_for_fences(
                                std::slice::from_ref(&fence),
                                true,
                                QUEUE_WAIT_TIMEOUT.as_nanos() as u64,
                            )
                            .map_err(|err| {
                                if err == vk::Result::TIMEOUT {
                                    DriverError::DeviceLost
                                } else {
                                    from_vk(err)
                                }
                            })
                    })
            };
            unsafe { self.device.destroy_fence(fence, None) };
            wait
        })();

        unsafe {
            self.device
                .free_command_buffers(*pool, std::slice::from_ref(&cmd));
        }
        result
    }

    /// Block until every queue on the device has drained. Used before
    /// destroying or replacing GPU resources the renderer may still be
    /// reading.
    pub fn wait_idle(&self) {
        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            warn!("device_wait_idle failed: {err}");
        }
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.wait_idle();
        unsafe {
            // The allocator must go before the device it allocates from.
            ManuallyDrop::drop(&mut self.allocator);
            self.device
                .destroy_command_pool(*self.command_pool.lock(), None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}
