//! Vulkan Descriptor - descriptor pool, layout, and resource writes.

use ash::{vk, Device};
use vesper_core::collections::hashmap::HashMap;
use vesper_core::collections::SmallVec;
use vesper_rhi_derive::DeviceObject;

use crate::error::{Result, RhiError};
use crate::reflection::{stages_to_vk, ShaderBinding};

/// Layout binding information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl From<&ShaderBinding> for LayoutBinding {
    fn from(binding: &ShaderBinding) -> Self {
        Self {
            binding: binding.binding,
            descriptor_type: binding.kind.descriptor_type(),
            count: binding.count,
            stage_flags: stages_to_vk(binding.stages),
        }
    }
}

/// Image descriptors may be rewritten while the set is bound when the device allows it.
fn binding_flags(bindings: &[LayoutBinding], update_after_bind: bool) -> SmallVec<[vk::DescriptorBindingFlags; 8]> {
    bindings
        .iter()
        .map(|b| {
            if update_after_bind && b.descriptor_type == vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
                vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            } else {
                vk::DescriptorBindingFlags::empty()
            }
        })
        .collect()
}

/// One pool size per descriptor type, in order of first appearance.
pub fn pool_sizes_for(bindings: &[LayoutBinding]) -> SmallVec<[vk::DescriptorPoolSize; 4]> {
    let mut sizes: SmallVec<[vk::DescriptorPoolSize; 4]> = SmallVec::new();
    for binding in bindings {
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += binding.count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: binding.count,
            }),
        }
    }
    sizes
}

/// Descriptor set layout with binding metadata for validation.
#[DeviceObject]
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    binding_map: HashMap<u32, usize>,
}

impl DescriptorSetLayout {
    pub fn new(device: &Device, bindings: &[LayoutBinding], update_after_bind: bool) -> Result<Self> {
        let vk_bindings: SmallVec<[vk::DescriptorSetLayoutBinding; 8]> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stage_flags)
            })
            .collect();

        let flags = binding_flags(bindings, update_after_bind);
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);

        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        if update_after_bind {
            create_info = create_info
                .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                .push_next(&mut flags_info);
        }

        let layout = unsafe { device.create_descriptor_set_layout(&create_info, None) }
            .map_err(RhiError::device("create_descriptor_set_layout"))?;

        let binding_map = bindings.iter().enumerate().map(|(i, b)| (b.binding, i)).collect();

        Ok(Self {
            layout,
            bindings: bindings.to_vec(),
            binding_map,
            device: device.clone(),
        })
    }

    /// Get the raw Vulkan descriptor set layout handle.
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get binding information by binding index.
    pub fn get_binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.binding_map.get(&binding).map(|&i| &self.bindings[i])
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Descriptor pool for allocating descriptor sets.
#[DeviceObject]
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    pub fn new(
        device: &Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> Result<Self> {
        let flags = if update_after_bind {
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(flags);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None) }
            .map_err(RhiError::device("create_descriptor_pool"))?;

        Ok(Self {
            pool,
            max_sets,
            device: device.clone(),
        })
    }

    /// Allocate a single descriptor set.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(RhiError::device("allocate_descriptor_sets"))?;
        sets.into_iter()
            .next()
            .ok_or_else(|| RhiError::invalid_state("descriptor pool returned no set"))
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

pub(crate) fn write_buffer(
    device: &Device,
    set: vk::DescriptorSet,
    binding: u32,
    descriptor_type: vk::DescriptorType,
    info: vk::DescriptorBufferInfo,
) {
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(descriptor_type)
        .buffer_info(std::slice::from_ref(&info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Write consecutive combined image samplers starting at `first_element`.
pub(crate) fn write_images(
    device: &Device,
    set: vk::DescriptorSet,
    binding: u32,
    first_element: u32,
    infos: &[vk::DescriptorImageInfo],
) {
    if infos.is_empty() {
        return;
    }

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(first_element)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(infos);

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}
