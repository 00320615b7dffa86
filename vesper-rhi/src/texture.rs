//! Vulkan Texture - sampled images and their uploads.

use std::sync::{Arc, Weak};

use ash::{vk, Device};
use vesper_rhi_derive::DeviceObject;

use crate::buffer::{Buffer, BufferDesc};
use crate::command::CommandEncoder;
use crate::device::{release, RenderDevice};
use crate::error::{Result, RhiError};
use crate::mapping::HostMapping;
use crate::sampler::{Sampler, SamplerConfig};
use crate::utility::find_memory_type;

/// Texel format of every user texture.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const BYTES_PER_TEXEL: u64 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

impl Filter {
    pub fn sampler_config(&self) -> SamplerConfig {
        match self {
            Filter::Nearest => SamplerConfig::nearest(),
            Filter::Linear => SamplerConfig::linear(),
        }
    }
}

/// Texture dimensions. `height == 0` makes a 1D texture, `depth == 0` a 2D one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextureExtent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl TextureExtent {
    pub fn new_1d(width: u32) -> Self {
        Self { width, height: 0, depth: 0 }
    }

    pub fn new_2d(width: u32, height: u32) -> Self {
        Self { width, height, depth: 0 }
    }

    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    pub fn image_type(&self) -> vk::ImageType {
        match (self.height, self.depth) {
            (0, _) => vk::ImageType::TYPE_1D,
            (_, 0) => vk::ImageType::TYPE_2D,
            _ => vk::ImageType::TYPE_3D,
        }
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        match self.image_type() {
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => vk::ImageViewType::TYPE_2D,
        }
    }

    pub fn to_vk(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height.max(1),
            depth: self.depth.max(1),
        }
    }

    /// Bytes of RGBA8 texel data covering the whole texture.
    pub fn byte_size(&self) -> vk::DeviceSize {
        let extent = self.to_vk();
        extent.width as u64 * extent.height as u64 * extent.depth as u64 * BYTES_PER_TEXEL
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub filter: Filter,
    pub extent: TextureExtent,
}

pub(crate) fn create_image_view(
    device: &Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(color_subresource_range());

    unsafe { device.create_image_view(&create_info, None) }.map_err(RhiError::device("create_image_view"))
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Stage and access that produce or consume an image in `layout`.
fn layout_usage(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::SHADER_SAMPLED_READ)
        }
        _ => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
    }
}

pub(crate) fn transition_layout(
    encoder: &CommandEncoder,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_stage, src_access) = layout_usage(old_layout);
    let (dst_stage, dst_access) = layout_usage(new_layout);

    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range());

    encoder.image_barriers(&[barrier]);
}

#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub image_type: vk::ImageType,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
}

/// Device-local image with its memory and a full view.
#[DeviceObject]
pub struct Image {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    info: ImageInfo,
}

impl Image {
    pub fn new(device: &RenderDevice, info: &ImageInfo) -> Result<Self> {
        let handle = device.handle();
        let create_info = vk::ImageCreateInfo::default()
            .image_type(info.image_type)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(info.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { handle.create_image(&create_info, None) }.map_err(RhiError::device("create_image"))?;

        // Members are filled in as they are created so Drop cleans up a partial image.
        let mut result = Self {
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            info: *info,
            device: handle.clone(),
        };

        let requirements = unsafe { handle.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or_else(|| RhiError::invalid_state("no device-local memory type for image"))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        result.memory =
            unsafe { handle.allocate_memory(&alloc_info, None) }.map_err(RhiError::device("allocate_memory"))?;

        unsafe { handle.bind_image_memory(image, result.memory, 0) }.map_err(RhiError::device("bind_image_memory"))?;

        result.view = create_image_view(handle, image, info.view_type, info.format)?;
        Ok(result)
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn sampled_image_info(extent: &TextureExtent) -> ImageInfo {
    ImageInfo {
        image_type: extent.image_type(),
        view_type: extent.view_type(),
        format: TEXTURE_FORMAT,
        extent: extent.to_vk(),
        usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        samples: vk::SampleCountFlags::TYPE_1,
    }
}

/// Sampled image in `SHADER_READ_ONLY_OPTIMAL`, ready to be bound before any upload.
pub(crate) fn create_sampled_image(device: &RenderDevice, extent: &TextureExtent) -> Result<Image> {
    let image = Image::new(device, &sampled_image_info(extent))?;
    let handle = image.handle();
    device.submit_immediate(|encoder| {
        transition_layout(
            encoder,
            handle,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
    })?;
    Ok(image)
}

struct TextureStorage {
    image: Image,
    sampler: Sampler,
    staging: Option<Buffer>,
}

/// A sampled RGBA8 texture created by a renderer.
///
/// Must be dropped before the renderer that created it.
pub struct Texture {
    owner: Weak<RenderDevice>,
    desc: TextureDesc,
    storage: Option<TextureStorage>,
    mapping: HostMapping,
}

impl Texture {
    #[profiling::function]
    pub(crate) fn new(device: &Arc<RenderDevice>, desc: &TextureDesc) -> Result<Self> {
        if desc.extent.width == 0 {
            return Err(RhiError::invalid_argument("texture width must be non-zero"));
        }

        let image = create_sampled_image(device, &desc.extent)?;
        let sampler = Sampler::new(device.handle(), &desc.filter.sampler_config())?;

        Ok(Self {
            owner: Arc::downgrade(device),
            desc: *desc,
            storage: Some(TextureStorage { image, sampler, staging: None }),
            mapping: HostMapping::default(),
        })
    }

    fn owner(&self) -> Result<Arc<RenderDevice>> {
        self.owner
            .upgrade()
            .ok_or_else(|| RhiError::invalid_state("texture outlived its renderer"))
    }

    fn storage(&self) -> Result<&TextureStorage> {
        self.storage
            .as_ref()
            .ok_or_else(|| RhiError::invalid_state("texture has been released"))
    }

    /// Map a staging area holding `extent.byte_size()` bytes of RGBA8 texels.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        self.mapping.check_unmapped()?;

        let device = self.owner()?;
        let size = self.desc.extent.byte_size();
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| RhiError::invalid_state("texture has been released"))?;

        let staging = Buffer::new(&device, &BufferDesc::staging(size))?;
        let ptr = staging.map()?;
        storage.staging = Some(staging);

        // Valid until `unmap` frees the staging buffer.
        unsafe { self.mapping.start(ptr, size as usize) }
    }

    /// Unmap and free the staging area.
    pub fn unmap(&mut self) -> Result<()> {
        self.mapping.finish()?;

        if let Some(staging) = self.storage.as_mut().and_then(|s| s.staging.take()) {
            staging.unmap();
        }
        Ok(())
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_mapped()
    }

    /// Upload the mapped staging data into the image.
    #[profiling::function]
    pub fn update_data(&mut self) -> Result<()> {
        self.mapping.require_mapped()?;

        let device = self.owner()?;
        let storage = self.storage()?;
        let staging = storage.staging.as_ref().ok_or(RhiError::NotMapped)?.handle();
        let image = storage.image.handle();
        let extent = self.desc.extent.to_vk();

        device.submit_immediate(|encoder| {
            transition_layout(
                encoder,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(extent);
            encoder.copy_buffer_to_image(staging, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);

            transition_layout(
                encoder,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn view(&self) -> vk::ImageView {
        self.storage.as_ref().map_or(vk::ImageView::null(), |s| s.image.view())
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.storage.as_ref().map_or(vk::Sampler::null(), |s| s.sampler.handle())
    }

    pub(crate) fn is_owned_by(&self, device: &Arc<RenderDevice>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(device))
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            if self.mapping.finish().is_ok() && self.owner.strong_count() > 0 {
                if let Some(staging) = &storage.staging {
                    staging.unmap();
                }
            }
            release(&self.owner, "texture", storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimensions_select_the_image_type() {
        assert_eq!(TextureExtent::new_1d(64).image_type(), vk::ImageType::TYPE_1D);
        assert_eq!(TextureExtent::new_2d(64, 32).image_type(), vk::ImageType::TYPE_2D);
        assert_eq!(TextureExtent::new_3d(8, 8, 8).image_type(), vk::ImageType::TYPE_3D);
        assert_eq!(TextureExtent::new_3d(8, 8, 8).view_type(), vk::ImageViewType::TYPE_3D);
    }

    #[test]
    fn byte_size_treats_missing_axes_as_one() {
        assert_eq!(TextureExtent::new_1d(64).byte_size(), 64 * 4);
        assert_eq!(TextureExtent::new_2d(2, 2).byte_size(), 16);
        assert_eq!(TextureExtent::new_3d(4, 4, 4).byte_size(), 256);
        assert_eq!(
            TextureExtent::new_1d(5).to_vk(),
            vk::Extent3D { width: 5, height: 1, depth: 1 }
        );
    }

    #[test]
    fn sampled_images_are_upload_targets() {
        let info = sampled_image_info(&TextureExtent::new_2d(16, 16));
        assert_eq!(info.format, TEXTURE_FORMAT);
        assert!(info.usage.contains(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST));
        assert_eq!(info.samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn filter_selects_sampler_filtering() {
        assert_eq!(Filter::Nearest.sampler_config().mag_filter, vk::Filter::NEAREST);
        assert_eq!(Filter::Linear.sampler_config().min_filter, vk::Filter::LINEAR);
        assert_eq!(
            Filter::Linear.sampler_config().address_mode,
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        );
    }
}
