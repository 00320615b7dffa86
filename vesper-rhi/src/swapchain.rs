//! Vulkan Swapchain - surface and presentable images.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use vesper_core::collections::SmallVec;
use vesper_core::log::info;
use vesper_rhi_derive::DeviceObject;

use crate::core::RhiCore;
use crate::device::RenderDevice;
use crate::error::{Result, RhiError};
use crate::texture::create_image_view;
use crate::MAX_SWAPCHAIN_IMAGES;

/// Images requested on top of the surface minimum.
const EXTRA_IMAGES: u32 = 2;

pub struct SwapchainWindow {
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl Drop for SwapchainWindow {
    fn drop(&mut self) {
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

impl SwapchainWindow {
    pub fn new(core: &RhiCore, display_handle: RawDisplayHandle, window_handle: RawWindowHandle) -> Result<Self> {
        let surface_loader = ash::khr::surface::Instance::new(core.entry(), core.instance());
        let surface = unsafe {
            ash_window::create_surface(core.entry(), core.instance(), display_handle, window_handle, None)
        }
        .map_err(RhiError::device("create_surface"))?;

        Ok(Self { surface_loader, surface })
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> bool {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, queue_family, self.surface)
                .unwrap_or(false)
        }
    }

    fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }
        .map_err(RhiError::device("get_physical_device_surface_capabilities"))
    }
}

/// Vulkan swapchain with one view per image.
#[DeviceObject]
pub struct Swapchain {
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,

    images: SmallVec<[vk::Image; MAX_SWAPCHAIN_IMAGES]>,
    views: SmallVec<[vk::ImageView; MAX_SWAPCHAIN_IMAGES]>,
    extent: vk::Extent2D,

    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_views();
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

impl Swapchain {
    #[profiling::function]
    pub fn new(
        core: &RhiCore,
        device: &RenderDevice,
        window: &SwapchainWindow,
        extent: vk::Extent2D,
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let physical_device = device.parent_physical_device().handle();

        let formats = unsafe {
            window
                .surface_loader
                .get_physical_device_surface_formats(physical_device, window.surface)
        }
        .map_err(RhiError::device("get_physical_device_surface_formats"))?;
        let format = choose_surface_format(&formats)
            .ok_or_else(|| RhiError::invalid_state("surface reports no formats"))?;

        let present_modes = unsafe {
            window
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, window.surface)
        }
        .map_err(RhiError::device("get_physical_device_surface_present_modes"))?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);

        let mut swapchain = Swapchain {
            swapchain_loader: ash::khr::swapchain::Device::new(core.instance(), device.handle()),
            swapchain: vk::SwapchainKHR::null(),
            images: SmallVec::new(),
            views: SmallVec::new(),
            extent,
            format,
            present_mode,
            device: device.handle().clone(),
        };
        swapchain.resize(device, window, extent)?;

        Ok(swapchain)
    }

    /// Recreate the swapchain and its views for `extent`.
    #[profiling::function]
    pub fn resize(&mut self, device: &RenderDevice, window: &SwapchainWindow, extent: vk::Extent2D) -> Result<()> {
        // re-query surface capabilities as they may have changed
        let capabilities = window.capabilities(device.parent_physical_device().handle())?;
        let extent = get_swapchain_extent(&capabilities, extent);
        let image_count = choose_image_count(&capabilities);

        info!(
            "Creating new swapchain: {:?} {:?}, {}x{}, {} images, {:?}",
            self.format.format,
            self.format.color_space,
            extent.width,
            extent.height,
            image_count,
            self.present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(window.surface)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(RhiError::device("create_swapchain"))?;

        self.destroy_views();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = swapchain;
        self.extent = extent;

        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
            .map_err(RhiError::device("get_swapchain_images"))?;
        self.images = images.into_iter().collect();

        for &image in &self.images {
            let view = create_image_view(
                &self.device,
                image,
                vk::ImageViewType::TYPE_2D,
                self.format.format,
            )?;
            self.views.push(view);
        }

        Ok(())
    }

    /// Acquire the next image, signalling `semaphore`. `None` means the swapchain is out of date.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Option<(u32, bool)>> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok(acquired) => Ok(Some(acquired)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(RhiError::device("acquire_next_image")(e)),
        }
    }

    /// Present the rendered image.
    /// Returns whether the swapchain is out of date or suboptimal.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(RhiError::device("queue_present")(e)),
        }
    }

    fn destroy_views(&mut self) {
        for view in self.views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }
}

/// Prefer RGBA8 sRGB, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::R8G8B8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// Configured mode, then IMMEDIATE, then FIFO (always available).
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    preferred
        .into_iter()
        .chain([vk::PresentModeKHR::IMMEDIATE])
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + EXTRA_IMAGES;
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count.min(MAX_SWAPCHAIN_IMAGES as u32)
}

pub fn get_swapchain_extent(capabilities: &vk::SurfaceCapabilitiesKHR, extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: extent
                .width
                .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: extent
                .height
                .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR }
    }

    #[test]
    fn srgb_rgba_is_preferred() {
        let formats = [format(vk::Format::B8G8R8A8_UNORM), format(vk::Format::R8G8B8A8_SRGB)];
        assert_eq!(choose_surface_format(&formats), Some(format(vk::Format::R8G8B8A8_SRGB)));
    }

    #[test]
    fn first_format_is_the_fallback() {
        let formats = [format(vk::Format::B8G8R8A8_UNORM), format(vk::Format::R16G16B16A16_SFLOAT)];
        assert_eq!(choose_surface_format(&formats), Some(format(vk::Format::B8G8R8A8_UNORM)));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE];

        assert_eq!(choose_present_mode(&all, Some(vk::PresentModeKHR::MAILBOX)), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&all, None), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], Some(vk::PresentModeKHR::MAILBOX)),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_is_clamped() {
        let caps = |min_image_count, max_image_count| vk::SurfaceCapabilitiesKHR {
            min_image_count,
            max_image_count,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&caps(2, 0)), 4);
        assert_eq!(choose_image_count(&caps(2, 3)), 3);
        assert_eq!(choose_image_count(&caps(7, 0)), MAX_SWAPCHAIN_IMAGES as u32);
    }

    #[test]
    fn surface_extent_wins_unless_undefined() {
        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 640, height: 480 },
            ..Default::default()
        };
        assert_eq!(
            get_swapchain_extent(&fixed, vk::Extent2D { width: 800, height: 600 }),
            vk::Extent2D { width: 640, height: 480 }
        );

        let free = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 1024, height: 1024 },
            ..Default::default()
        };
        assert_eq!(
            get_swapchain_extent(&free, vk::Extent2D { width: 4096, height: 600 }),
            vk::Extent2D { width: 1024, height: 600 }
        );
    }
}
