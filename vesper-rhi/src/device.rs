//! Vulkan Device - logical device and queue management.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use ash::{vk, Device, Instance};
use parking_lot::Mutex;
use vesper_core::collections::hashset::HashSet;
use vesper_core::log;

use crate::command::{CommandEncoder, ImmediateCommandEncoder};
use crate::core::PhysicalDevice;
use crate::error::{Result, RhiError};

/// A queue wrapper that carries its family index.
#[derive(Clone, Copy, Debug)]
pub struct Queue {
    handle: vk::Queue,
    family_index: u32,
}

impl Queue {
    pub fn new(handle: vk::Queue, family_index: u32) -> Self {
        Self { handle, family_index }
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}

/// Optional features switched on when the device has them.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnabledFeatures {
    pub sample_rate_shading: bool,
    pub fill_mode_non_solid: bool,
    pub update_after_bind: bool,
}

/// Raised when recorded command buffers no longer match the descriptors they bind.
#[derive(Debug, Default)]
pub(crate) struct RebuildRequest(AtomicBool);

impl RebuildRequest {
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the request, reporting whether it was raised.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Vulkan logical device with queues.
pub struct RenderDevice {
    parent_physical_device: PhysicalDevice,
    device: Device,
    graphics_queue: Queue,
    present_queue: Queue,
    features: EnabledFeatures,
    immediate: Mutex<Option<ImmediateCommandEncoder>>,
    rebuild: RebuildRequest,
}

impl RenderDevice {
    /// Create a new logical device from a physical device.
    #[profiling::function]
    pub fn new(instance: &Instance, physical_device: &PhysicalDevice) -> Result<Self> {
        let unique_families: HashSet<u32> = [
            physical_device.graphics_queue_family(),
            physical_device.present_queue_family(),
        ]
        .into_iter()
        .collect();

        let queue_priority = 1.0f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let supported = physical_device.features();
        let enabled = EnabledFeatures {
            sample_rate_shading: supported.sample_rate_shading == vk::TRUE,
            fill_mode_non_solid: supported.fill_mode_non_solid == vk::TRUE,
            update_after_bind: physical_device.supports_update_after_bind(),
        };

        let features = vk::PhysicalDeviceFeatures::default()
            .sample_rate_shading(enabled.sample_rate_shading)
            .fill_mode_non_solid(enabled.fill_mode_non_solid);

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_binding_sampled_image_update_after_bind(enabled.update_after_bind);

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut vulkan_13_features);

        let device = unsafe { instance.create_device(physical_device.handle(), &create_info, None) }
            .map_err(RhiError::device("create_device"))?;

        let graphics_queue = Queue::new(
            unsafe { device.get_device_queue(physical_device.graphics_queue_family(), 0) },
            physical_device.graphics_queue_family(),
        );
        let present_queue = Queue::new(
            unsafe { device.get_device_queue(physical_device.present_queue_family(), 0) },
            physical_device.present_queue_family(),
        );

        let immediate = match ImmediateCommandEncoder::new(&device, graphics_queue) {
            Ok(immediate) => immediate,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };

        log::debug!("Logical device created with {:?}", enabled);

        Ok(Self {
            parent_physical_device: physical_device.clone(),
            device,
            graphics_queue,
            present_queue,
            features: enabled,
            immediate: Mutex::new(Some(immediate)),
            rebuild: RebuildRequest::default(),
        })
    }

    /// Get a reference to the logical device.
    #[inline]
    pub fn handle(&self) -> &Device {
        &self.device
    }

    /// Get the physical device properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        self.parent_physical_device.properties()
    }

    /// Get the physical device memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        self.parent_physical_device.memory_properties()
    }

    pub fn enabled_features(&self) -> EnabledFeatures {
        self.features
    }

    pub fn graphics_queue(&self) -> Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> Queue {
        self.present_queue
    }

    pub fn parent_physical_device(&self) -> &PhysicalDevice {
        &self.parent_physical_device
    }

    pub fn wait_until_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(RhiError::device("device_wait_idle"))
    }

    /// Record one-off work on the graphics queue and block until it completes.
    pub fn submit_immediate<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&CommandEncoder),
    {
        let immediate = self.immediate.lock();
        let encoder = immediate
            .as_ref()
            .ok_or_else(|| RhiError::invalid_state("device is shutting down"))?;
        encoder.submit_and_wait(record)
    }

    /// Recorded frames bind descriptors that were rewritten in place.
    pub(crate) fn rebuild_request(&self) -> &RebuildRequest {
        &self.rebuild
    }

    /// Signal `fence` once the graphics queue drains, without submitting work.
    pub fn signal_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.queue_submit2(self.graphics_queue.handle(), &[], fence) }
            .map_err(RhiError::device("queue_submit2"))
    }

    /// Submit `cmd` waiting on `wait` at `wait_stage`, signalling `signal` and `fence`.
    pub fn submit_frame(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags2,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let command_submit_info = vk::CommandBufferSubmitInfo::default().command_buffer(cmd);
        let wait_info = vk::SemaphoreSubmitInfo::default().semaphore(wait).stage_mask(wait_stage);
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(signal)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(std::slice::from_ref(&command_submit_info))
            .wait_semaphore_infos(std::slice::from_ref(&wait_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_info));

        unsafe { self.device.queue_submit2(self.graphics_queue.handle(), &[submit_info], fence) }
            .map_err(RhiError::device("queue_submit2"))
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        if let Err(err) = self.wait_until_idle() {
            log::warn!("Waiting for the device before destruction failed: {}", err);
        }

        self.immediate.get_mut().take();

        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// Drop `resource` while its device is still alive; leak it once the device is gone.
///
/// Resources created by a renderer must not outlive it. A resource dropped
/// late cannot be destroyed through a dead device, so it is leaked instead.
pub(crate) fn release<T>(owner: &Weak<RenderDevice>, what: &str, resource: T) {
    match owner.upgrade() {
        Some(device) => {
            if let Err(err) = device.wait_until_idle() {
                log::warn!("Waiting for the device before releasing {} failed: {}", what, err);
            }
            drop(resource);
        }
        None => {
            log::warn!("{} outlived its renderer and is leaked", what);
            std::mem::forget(resource);
        }
    }
}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Crate-only trait for objects that own an `ash::Device` used for destruction and device calls.
///
/// This trait is sealed and not visible to users of `vesper-rhi`.
#[allow(dead_code)]
pub(crate) trait DeviceObject: sealed::Sealed {
    fn device(&self) -> &Device;
}
