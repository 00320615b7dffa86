//! Vulkan Shader - SPIR-V stages, reflected descriptors, uniform storage and the graphics pipeline.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use ash::{vk, Device};
use derive_builder::Builder;
use vesper_core::collections::SmallVec;
use vesper_core::log;
use vesper_rhi_derive::DeviceObject;

use crate::descriptor::{pool_sizes_for, write_buffer, write_images, DescriptorPool, DescriptorSetLayout, LayoutBinding};
use crate::device::{release, RenderDevice};
use crate::error::{Result, RhiError};
use crate::frame::ShaderState;
use crate::pipeline::{CullMode, GraphicPipeline, GraphicPipelineInfo, PolygonMode, PrimitiveTopology, VertexAttribute};
use crate::reflection::{ResourceKind, ShaderBinding, ShaderReflection, ShaderStage};
use crate::render_pass::RenderPass;
use crate::renderer::Renderer;
use crate::spirv::words_from_bytes;
use crate::texture::Texture;
use crate::utility::{align_up, find_memory_type};
use crate::{MAX_SHADER_STAGES, MAX_UNIFORM_BUFFERS, MAX_VERTEX_ATTRIBUTES, MIN_UNIFORM_BUFFER_SIZE};

/// SPIR-V code of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageCode {
    pub stage: ShaderStage,
    pub words: Vec<u32>,
}

impl ShaderStageCode {
    pub fn new(stage: ShaderStage, words: impl Into<Vec<u32>>) -> Self {
        Self { stage, words: words.into() }
    }

    /// Little-endian SPIR-V as read from a `.spv` file.
    pub fn from_bytes(stage: ShaderStage, bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(stage, words_from_bytes(bytes)?))
    }
}

#[derive(Clone, Debug, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ShaderDesc {
    pub stages: Vec<ShaderStageCode>,
    #[builder(default)]
    pub vertex_attributes: Vec<VertexAttribute>,
    #[builder(default)]
    pub topology: PrimitiveTopology,
    #[builder(default)]
    pub polygon_mode: PolygonMode,
    #[builder(default)]
    pub cull_mode: CullMode,
    /// Clear the color target when the render pass begins.
    #[builder(default)]
    pub clear_screen: bool,
    #[builder(default)]
    pub alpha_blend: bool,
}

impl ShaderDescBuilder {
    fn validate(&self) -> Result<(), String> {
        let stages = self.stages.as_deref().unwrap_or_default();
        let attributes = self.vertex_attributes.as_ref().map_or(0, Vec::len);
        check_stages(stages, attributes).map_err(|err| err.to_string())
    }
}

fn check_stages(stages: &[ShaderStageCode], attributes: usize) -> Result<()> {
    if stages.is_empty() {
        return Err(RhiError::invalid_argument("a shader needs at least one stage"));
    }
    if stages.len() > MAX_SHADER_STAGES {
        return Err(RhiError::ResourceExhausted {
            what: "shader stages",
            max: MAX_SHADER_STAGES,
        });
    }
    if attributes > MAX_VERTEX_ATTRIBUTES {
        return Err(RhiError::ResourceExhausted {
            what: "vertex attributes",
            max: MAX_VERTEX_ATTRIBUTES,
        });
    }

    for (i, code) in stages.iter().enumerate() {
        if code.stage == ShaderStage::Compute {
            return Err(RhiError::invalid_argument("compute stages cannot be part of a graphics shader"));
        }
        if stages[..i].iter().any(|other| other.stage == code.stage) {
            return Err(RhiError::invalid_argument(format!("duplicate {:?} stage", code.stage)));
        }
    }

    if !stages.iter().any(|code| code.stage == ShaderStage::Vertex) {
        return Err(RhiError::invalid_argument("a graphics shader needs a vertex stage"));
    }

    Ok(())
}

/// Reject descriptions the pipeline cannot be built from.
pub fn validate_desc(desc: &ShaderDesc) -> Result<()> {
    check_stages(&desc.stages, desc.vertex_attributes.len())
}

/// Descriptor layout and buffer-backed bindings of a reflected shader.
#[derive(Debug, Default, PartialEq, Eq)]
struct BindingPlan {
    layout: Vec<LayoutBinding>,
    buffers: SmallVec<[BufferBinding; MAX_UNIFORM_BUFFERS]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferBinding {
    binding: u32,
    reflected_size: u32,
    descriptor_type: vk::DescriptorType,
}

impl BufferBinding {
    fn allocation_size(&self) -> vk::DeviceSize {
        (self.reflected_size as vk::DeviceSize).max(MIN_UNIFORM_BUFFER_SIZE)
    }
}

fn plan_bindings(reflection: &ShaderReflection) -> Result<BindingPlan> {
    if let Some(&set) = reflection.descriptor_sets().iter().find(|&&set| set != 0) {
        return Err(RhiError::invalid_argument(format!(
            "descriptor set {} is not supported, shaders use a single set 0",
            set
        )));
    }

    let mut plan = BindingPlan::default();
    for binding in &reflection.bindings {
        match binding.kind {
            ResourceKind::UniformBuffer | ResourceKind::StorageBuffer | ResourceKind::SampledImage => {}
            other => {
                return Err(RhiError::invalid_argument(format!(
                    "binding {} is a {:?}; only buffers and combined image samplers can be bound",
                    binding.binding, other
                )));
            }
        }
        plan.layout.push(LayoutBinding::from(binding));

        if !binding.kind.is_buffer() {
            continue;
        }
        if binding.binding as usize >= MAX_UNIFORM_BUFFERS {
            return Err(RhiError::ResourceExhausted {
                what: "uniform buffer bindings",
                max: MAX_UNIFORM_BUFFERS,
            });
        }
        plan.buffers.push(BufferBinding {
            binding: binding.binding,
            reflected_size: binding.size,
            descriptor_type: binding.kind.descriptor_type(),
        });
    }

    Ok(plan)
}

/// Offsets packing buffers with `(size, alignment)` requirements into one allocation, and its total size.
fn layout_uniform_offsets(
    requirements: &[(vk::DeviceSize, vk::DeviceSize)],
) -> (SmallVec<[vk::DeviceSize; MAX_UNIFORM_BUFFERS]>, vk::DeviceSize) {
    let mut offsets = SmallVec::new();
    let mut end = 0;
    for &(size, alignment) in requirements {
        let offset = align_up(end, alignment);
        offsets.push(offset);
        end = offset + size;
    }
    (offsets, end)
}

#[derive(Debug, Clone, Copy)]
struct UniformSlot {
    binding: BufferBinding,
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
}

/// Every buffer-backed binding of a shader, bound into one persistently mapped allocation.
#[DeviceObject]
struct UniformBlock {
    slots: SmallVec<[UniformSlot; MAX_UNIFORM_BUFFERS]>,
    memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
}

impl UniformBlock {
    fn new(device: &RenderDevice, bindings: &[BufferBinding]) -> Result<Self> {
        let handle = device.handle();
        let mut block = Self {
            slots: SmallVec::new(),
            memory: vk::DeviceMemory::null(),
            mapped: None,
            device: handle.clone(),
        };

        for binding in bindings {
            let create_info = vk::BufferCreateInfo::default()
                .size(binding.allocation_size())
                .usage(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer =
                unsafe { handle.create_buffer(&create_info, None) }.map_err(RhiError::device("create_buffer"))?;
            block.slots.push(UniformSlot {
                binding: *binding,
                buffer,
                offset: 0,
            });
        }

        let requirements: SmallVec<[vk::MemoryRequirements; MAX_UNIFORM_BUFFERS]> = block
            .slots
            .iter()
            .map(|slot| unsafe { handle.get_buffer_memory_requirements(slot.buffer) })
            .collect();
        let sizes: SmallVec<[(vk::DeviceSize, vk::DeviceSize); MAX_UNIFORM_BUFFERS]> =
            requirements.iter().map(|r| (r.size, r.alignment)).collect();
        let (offsets, total) = layout_uniform_offsets(&sizes);
        let type_bits = requirements.iter().fold(u32::MAX, |bits, r| bits & r.memory_type_bits);

        let memory_type_index = find_memory_type(
            device.memory_properties(),
            type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or_else(|| RhiError::invalid_state("no host-visible memory type for uniform buffers"))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(total)
            .memory_type_index(memory_type_index);
        block.memory =
            unsafe { handle.allocate_memory(&alloc_info, None) }.map_err(RhiError::device("allocate_memory"))?;

        for (slot, offset) in block.slots.iter_mut().zip(offsets) {
            unsafe { handle.bind_buffer_memory(slot.buffer, block.memory, offset) }
                .map_err(RhiError::device("bind_buffer_memory"))?;
            slot.offset = offset;
        }

        let ptr = unsafe { handle.map_memory(block.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .map_err(RhiError::device("map_memory"))?;
        block.mapped = NonNull::new(ptr.cast::<u8>());

        Ok(block)
    }

    fn slot(&self, binding: u32) -> Option<&UniformSlot> {
        self.slots.iter().find(|slot| slot.binding.binding == binding)
    }

    fn region(&mut self, binding: u32) -> Option<&mut [u8]> {
        let slot = self.slot(binding)?;
        let ptr = self.mapped?;
        let len = slot.binding.reflected_size as usize;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().add(slot.offset as usize), len) })
    }

    fn write_descriptors(&self, set: vk::DescriptorSet) {
        for slot in &self.slots {
            let info = vk::DescriptorBufferInfo {
                buffer: slot.buffer,
                offset: 0,
                range: slot.binding.allocation_size(),
            };
            write_buffer(&self.device, set, slot.binding.binding, slot.binding.descriptor_type, info);
        }
    }
}

impl Drop for UniformBlock {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.unmap_memory(self.memory);
            }
            for slot in &self.slots {
                self.device.destroy_buffer(slot.buffer, None);
            }
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Stage module, only alive until the pipeline is built.
#[DeviceObject]
struct ShaderModule {
    module: vk::ShaderModule,
}

impl ShaderModule {
    fn new(device: &Device, words: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(words);
        let module = unsafe { device.create_shader_module(&create_info, None) }
            .map_err(RhiError::device("create_shader_module"))?;

        Ok(Self {
            module,
            device: device.clone(),
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Where a shader's render pass draws to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RenderTarget {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

// Field order is destruction order.
struct ShaderResources {
    pipeline: GraphicPipeline,
    render_pass: RenderPass,
    uniforms: Option<UniformBlock>,
    set_layout: DescriptorSetLayout,
    pool: Option<DescriptorPool>,
    descriptor_set: vk::DescriptorSet,
}

/// A graphics pipeline with its own render pass, descriptor set and uniform storage.
///
/// Must be dropped before the renderer that created it.
pub struct Shader {
    owner: Weak<RenderDevice>,
    reflection: ShaderReflection,
    resources: Option<ShaderResources>,
}

impl Shader {
    #[profiling::function]
    pub(crate) fn new(
        device: &Arc<RenderDevice>,
        desc: &ShaderDesc,
        target: RenderTarget,
        default_image: vk::DescriptorImageInfo,
    ) -> Result<Self> {
        validate_desc(desc)?;

        let features = device.enabled_features();
        if desc.polygon_mode.requires_non_solid_fill() && !features.fill_mode_non_solid {
            return Err(RhiError::invalid_argument(format!(
                "{:?} polygon mode needs the fillModeNonSolid device feature",
                desc.polygon_mode
            )));
        }

        let reflection = ShaderReflection::from_stages(desc.stages.iter().map(|code| (code.stage, code.words.as_slice())))?;
        let plan = plan_bindings(&reflection)?;
        let handle = device.handle();

        let set_layout = DescriptorSetLayout::new(handle, &plan.layout, features.update_after_bind)?;

        let (pool, descriptor_set) = if plan.layout.is_empty() {
            (None, vk::DescriptorSet::null())
        } else {
            let pool = DescriptorPool::new(handle, 1, &pool_sizes_for(&plan.layout), features.update_after_bind)?;
            let set = pool.allocate(&set_layout)?;
            (Some(pool), set)
        };

        let uniforms = if plan.buffers.is_empty() {
            None
        } else {
            let block = UniformBlock::new(device, &plan.buffers)?;
            block.write_descriptors(descriptor_set);
            Some(block)
        };

        for image in reflection.sampled_images() {
            let infos: SmallVec<[vk::DescriptorImageInfo; 8]> = (0..image.count).map(|_| default_image).collect();
            write_images(handle, descriptor_set, image.binding, 0, &infos);
        }

        let render_pass = RenderPass::new(handle, target.format, target.samples, desc.clear_screen)?;

        let modules = desc
            .stages
            .iter()
            .map(|code| -> Result<_> { Ok((code.stage.to_vk_stage(), ShaderModule::new(handle, &code.words)?)) })
            .collect::<Result<SmallVec<[_; 4]>>>()?;
        let stages: SmallVec<[(vk::ShaderStageFlags, vk::ShaderModule); 4]> =
            modules.iter().map(|(stage, module)| (*stage, module.module)).collect();

        let pipeline = GraphicPipeline::new(
            handle,
            &GraphicPipelineInfo {
                stages: &stages,
                vertex_attributes: &desc.vertex_attributes,
                topology: desc.topology,
                polygon_mode: desc.polygon_mode,
                cull_mode: desc.cull_mode,
                alpha_blend: desc.alpha_blend,
                samples: target.samples,
                sample_shading: features.sample_rate_shading,
                render_pass: render_pass.handle(),
                set_layouts: &[set_layout.handle()],
            },
        )?;
        drop(modules);

        log::debug!(
            "Created shader: {} stages, {} bindings, {} buffers",
            desc.stages.len(),
            reflection.bindings.len(),
            plan.buffers.len()
        );

        Ok(Self {
            owner: Arc::downgrade(device),
            reflection,
            resources: Some(ShaderResources {
                pipeline,
                render_pass,
                uniforms,
                set_layout,
                pool,
                descriptor_set,
            }),
        })
    }

    fn resources(&self) -> Result<&ShaderResources> {
        if self.owner.strong_count() == 0 {
            return Err(RhiError::invalid_state("shader outlived its renderer"));
        }
        self.resources
            .as_ref()
            .ok_or_else(|| RhiError::invalid_state("shader has been released"))
    }

    /// Mapped storage of the buffer at `binding`, sized to its reflected block.
    pub fn uniform_buffer_region(&mut self, binding: u32) -> Result<&mut [u8]> {
        if binding as usize >= MAX_UNIFORM_BUFFERS {
            return Err(RhiError::invalid_argument(format!(
                "uniform binding {} is out of range (max {})",
                binding, MAX_UNIFORM_BUFFERS
            )));
        }
        if self.owner.strong_count() == 0 {
            return Err(RhiError::invalid_state("shader outlived its renderer"));
        }

        self.resources
            .as_mut()
            .and_then(|r| r.uniforms.as_mut())
            .and_then(|u| u.region(binding))
            .ok_or_else(|| RhiError::invalid_argument(format!("no uniform buffer at binding {}", binding)))
    }

    /// Copy `value` to the start of the buffer at `binding`.
    pub fn write_uniform<T: bytemuck::Pod>(&mut self, binding: u32, value: &T) -> Result<()> {
        let bytes = bytemuck::bytes_of(value);
        let region = self.uniform_buffer_region(binding)?;
        if bytes.len() > region.len() {
            return Err(RhiError::invalid_argument(format!(
                "{} bytes do not fit the {} byte block at binding {}",
                bytes.len(),
                region.len(),
                binding
            )));
        }
        region[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Point element `array_index` of the image binding at `binding` to `texture`.
    ///
    /// Waits for the device before writing. Without update-after-bind support the
    /// write invalidates recorded frames, so the renderer re-records them before
    /// its next `execute`.
    pub fn bind_texture(&self, binding: u32, array_index: u32, texture: &Texture) -> Result<()> {
        let resources = self.resources()?;
        let device = self
            .owner
            .upgrade()
            .ok_or_else(|| RhiError::invalid_state("shader outlived its renderer"))?;
        if !texture.is_owned_by(&device) {
            return Err(RhiError::invalid_argument("texture belongs to another renderer"));
        }

        let shader_binding = self
            .reflection
            .find(0, binding)
            .ok_or_else(|| RhiError::invalid_argument(format!("shader has no binding {}", binding)))?;
        check_image_binding(shader_binding, array_index)?;

        device.wait_until_idle()?;
        let info = vk::DescriptorImageInfo {
            sampler: texture.sampler(),
            image_view: texture.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        write_images(device.handle(), resources.descriptor_set, binding, array_index, &[info]);
        if !device.enabled_features().update_after_bind {
            device.rebuild_request().raise();
        }
        Ok(())
    }

    /// Record this shader as the current one.
    pub fn set(&self, renderer: &mut Renderer) -> Result<()> {
        renderer.set_shader(self)
    }

    pub fn state(&self) -> ShaderState {
        self.resources.as_ref().map_or_else(ShaderState::default, |r| ShaderState {
            pipeline: r.pipeline.pipeline(),
            layout: r.pipeline.layout(),
            render_pass: r.render_pass.handle(),
            descriptor_set: r.descriptor_set,
        })
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    pub(crate) fn is_owned_by(&self, device: &Arc<RenderDevice>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(device))
    }
}

fn check_image_binding(binding: &ShaderBinding, array_index: u32) -> Result<()> {
    if binding.kind != ResourceKind::SampledImage {
        return Err(RhiError::invalid_argument(format!(
            "binding {} is a {:?}, not a sampled image",
            binding.binding, binding.kind
        )));
    }
    if array_index >= binding.count {
        return Err(RhiError::invalid_argument(format!(
            "array index {} is out of range for binding {} with {} elements",
            array_index, binding.binding, binding.count
        )));
    }
    Ok(())
}

impl Drop for Shader {
    fn drop(&mut self) {
        if let Some(resources) = self.resources.take() {
            release(&self.owner, "shader", resources);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::VertexFormat;
    use crate::spirv::assembler::Assembler;
    use crate::spirv::{
        DECORATION_BINDING, DECORATION_DESCRIPTOR_SET, STORAGE_CLASS_STORAGE_BUFFER, STORAGE_CLASS_UNIFORM_CONSTANT,
    };
    use enumflags2::BitFlags;

    fn stage(stage: ShaderStage) -> ShaderStageCode {
        ShaderStageCode::new(stage, Assembler::new().finish())
    }

    fn attribute(location: u32) -> VertexAttribute {
        VertexAttribute {
            location,
            binding: 0,
            format: VertexFormat::Float,
            offset: location * 4,
        }
    }

    #[test]
    fn builder_applies_pipeline_defaults() {
        let desc = ShaderDescBuilder::default()
            .stages(vec![stage(ShaderStage::Vertex), stage(ShaderStage::Fragment)])
            .build()
            .unwrap();

        assert_eq!(desc.cull_mode, CullMode::Back);
        assert_eq!(desc.polygon_mode, PolygonMode::Fill);
        assert_eq!(desc.topology, PrimitiveTopology::TrianglesList);
        assert!(!desc.clear_screen);
        assert!(!desc.alpha_blend);
    }

    #[test]
    fn stage_and_attribute_limits_are_enforced() {
        assert!(ShaderDescBuilder::default().build().is_err());

        let too_many_attributes: Vec<_> = (0..=MAX_VERTEX_ATTRIBUTES as u32).map(attribute).collect();
        assert!(matches!(
            check_stages(&[stage(ShaderStage::Vertex)], too_many_attributes.len()),
            Err(RhiError::ResourceExhausted { what: "vertex attributes", .. })
        ));

        let too_many_stages = vec![stage(ShaderStage::Vertex); MAX_SHADER_STAGES + 1];
        assert!(matches!(
            check_stages(&too_many_stages, 0),
            Err(RhiError::ResourceExhausted { what: "shader stages", .. })
        ));

        assert!(matches!(
            check_stages(&[stage(ShaderStage::Fragment)], 0),
            Err(RhiError::InvalidArgument(_))
        ));
        assert!(matches!(
            check_stages(&[stage(ShaderStage::Vertex), stage(ShaderStage::Vertex)], 0),
            Err(RhiError::InvalidArgument(_))
        ));
        assert!(check_stages(&[stage(ShaderStage::Vertex), stage(ShaderStage::Fragment)], 16).is_ok());
    }

    #[test]
    fn uniform_offsets_respect_alignment() {
        let (offsets, total) = layout_uniform_offsets(&[(128, 64), (200, 256), (128, 64)]);
        assert_eq!(offsets.as_slice(), &[0, 256, 512]);
        assert_eq!(total, 640);

        let (offsets, total) = layout_uniform_offsets(&[]);
        assert!(offsets.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn small_blocks_get_the_minimum_allocation() {
        let small = BufferBinding {
            binding: 0,
            reflected_size: 32,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        };
        let large = BufferBinding { reflected_size: 512, ..small };
        assert_eq!(small.allocation_size(), MIN_UNIFORM_BUFFER_SIZE);
        assert_eq!(large.allocation_size(), 512);
    }

    #[test]
    fn plan_splits_buffers_from_images() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        let vec4 = asm.type_vector(float, 4);
        asm.uniform_block(0, 1, &[vec4, vec4]);
        let image = asm.type_image(float);
        let sampled = asm.type_sampled_image(image);
        let pointer = asm.type_pointer(STORAGE_CLASS_UNIFORM_CONSTANT, sampled);
        let texture = asm.variable(pointer, STORAGE_CLASS_UNIFORM_CONSTANT);
        asm.decorate(texture, DECORATION_DESCRIPTOR_SET, Some(0));
        asm.decorate(texture, DECORATION_BINDING, Some(2));
        let words = asm.finish();

        let reflection = ShaderReflection::from_stages([(ShaderStage::Vertex, words.as_slice())]).unwrap();
        let plan = plan_bindings(&reflection).unwrap();

        assert_eq!(plan.layout.len(), 2);
        assert_eq!(plan.buffers.len(), 1);
        assert_eq!(plan.buffers[0].binding, 1);
        assert_eq!(plan.buffers[0].reflected_size, 32);
    }

    #[test]
    fn plan_rejects_bindings_without_a_combined_sampler() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        let image = asm.type_image(float);
        let pointer = asm.type_pointer(STORAGE_CLASS_UNIFORM_CONSTANT, image);
        let texture = asm.variable(pointer, STORAGE_CLASS_UNIFORM_CONSTANT);
        asm.decorate(texture, DECORATION_BINDING, Some(0));
        let words = asm.finish();

        let reflection = ShaderReflection::from_stages([(ShaderStage::Fragment, words.as_slice())]).unwrap();
        assert_eq!(reflection.bindings[0].kind, ResourceKind::SeparateImage);
        assert!(matches!(plan_bindings(&reflection), Err(RhiError::InvalidArgument(_))));
    }

    #[test]
    fn plan_backs_runtime_sized_storage_buffers() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        let vec4 = asm.type_vector(float, 4);
        let data = asm.type_runtime_array(vec4);
        let block = asm.type_struct(&[vec4, data]);
        let pointer = asm.type_pointer(STORAGE_CLASS_STORAGE_BUFFER, block);
        let buffer = asm.variable(pointer, STORAGE_CLASS_STORAGE_BUFFER);
        asm.decorate(buffer, DECORATION_BINDING, Some(3));
        let words = asm.finish();

        let reflection = ShaderReflection::from_stages([(ShaderStage::Vertex, words.as_slice())]).unwrap();
        let plan = plan_bindings(&reflection).unwrap();

        assert_eq!(plan.buffers.len(), 1);
        assert_eq!(plan.buffers[0].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(plan.buffers[0].allocation_size(), MIN_UNIFORM_BUFFER_SIZE);
    }

    #[test]
    fn plan_rejects_sets_other_than_zero() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        asm.uniform_block(1, 0, &[float]);
        let words = asm.finish();

        let reflection = ShaderReflection::from_stages([(ShaderStage::Vertex, words.as_slice())]).unwrap();
        assert!(matches!(plan_bindings(&reflection), Err(RhiError::InvalidArgument(_))));
    }

    #[test]
    fn plan_rejects_uniform_bindings_past_the_limit() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        asm.uniform_block(0, MAX_UNIFORM_BUFFERS as u32, &[float]);
        let words = asm.finish();

        let reflection = ShaderReflection::from_stages([(ShaderStage::Fragment, words.as_slice())]).unwrap();
        assert!(matches!(
            plan_bindings(&reflection),
            Err(RhiError::ResourceExhausted { what: "uniform buffer bindings", .. })
        ));
    }

    #[test]
    fn image_binding_checks_kind_and_array_bounds() {
        let image = ShaderBinding {
            set: 0,
            binding: 2,
            size: 0,
            kind: ResourceKind::SampledImage,
            count: 4,
            stages: BitFlags::from(ShaderStage::Fragment),
        };
        assert!(check_image_binding(&image, 3).is_ok());
        assert!(matches!(check_image_binding(&image, 4), Err(RhiError::InvalidArgument(_))));

        let uniform = ShaderBinding {
            kind: ResourceKind::UniformBuffer,
            size: 16,
            count: 1,
            ..image
        };
        assert!(matches!(check_image_binding(&uniform, 0), Err(RhiError::InvalidArgument(_))));
    }
}
