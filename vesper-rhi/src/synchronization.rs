use ash::{vk, Device};
use vesper_rhi_derive::DeviceObject;

use crate::error::{Result, RhiError};

#[DeviceObject]
pub struct Fence {
    fence: vk::Fence,
}

impl Fence {
    pub fn new(device: &Device, signaled: bool) -> Result<Self> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(RhiError::device("create_fence"))?;

        Ok(Self { fence, device: device.clone() })
    }

    pub fn wait(&self) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[self.fence], true, u64::MAX) }
            .map_err(RhiError::device("wait_for_fences"))
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }.map_err(RhiError::device("reset_fences"))
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

#[DeviceObject]
pub struct Semaphore {
    semaphore: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: &Device) -> Result<Self> {
        let semaphore = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(RhiError::device("create_semaphore"))?;

        Ok(Self { semaphore, device: device.clone() })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
