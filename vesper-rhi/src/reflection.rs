//! Descriptor binding reflection over the resolved SPIR-V declarations.

use ash::vk;
use enumflags2::{bitflags, BitFlags};
use vesper_core::collections::hashmap::{Entry, HashMap};
use vesper_core::collections::SmallVec;

use crate::error::{Result, RhiError};
use crate::spirv::{DeclarationTable, Opaque, StorageClass};
use crate::MAX_DESCRIPTORS;

/// Shader stage type.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex = 0b001,
    Fragment = 0b010,
    Compute = 0b100,
}

impl ShaderStage {
    /// Convert to Vulkan shader stage flags.
    pub fn to_vk_stage(&self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

pub fn stages_to_vk(stages: BitFlags<ShaderStage>) -> vk::ShaderStageFlags {
    stages
        .iter()
        .fold(vk::ShaderStageFlags::empty(), |acc, stage| acc | stage.to_vk_stage())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    UniformBuffer,
    /// Combined image + sampler.
    SampledImage,
    StorageBuffer,
    /// Image sampled through a separate sampler binding.
    SeparateImage,
    Sampler,
    StorageImage,
}

impl ResourceKind {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            ResourceKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            ResourceKind::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            ResourceKind::SeparateImage => vk::DescriptorType::SAMPLED_IMAGE,
            ResourceKind::Sampler => vk::DescriptorType::SAMPLER,
            ResourceKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    /// Backed by a buffer rather than an image or sampler.
    pub fn is_buffer(&self) -> bool {
        matches!(self, ResourceKind::UniformBuffer | ResourceKind::StorageBuffer)
    }
}

impl From<Opaque> for ResourceKind {
    fn from(opaque: Opaque) -> Self {
        match opaque {
            Opaque::SampledImage => ResourceKind::SampledImage,
            Opaque::Image => ResourceKind::SeparateImage,
            Opaque::Sampler => ResourceKind::Sampler,
            Opaque::StorageImage => ResourceKind::StorageImage,
        }
    }
}

/// A single shader resource binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinding {
    pub set: u32,
    pub binding: u32,
    /// Byte size of the buffer contents, 0 for images.
    pub size: u32,
    pub kind: ResourceKind,
    /// Descriptor array length.
    pub count: u32,
    pub stages: BitFlags<ShaderStage>,
}

/// Append the bindings declared by one stage's bytecode to `out`.
///
/// The appended run is sorted by `(set, binding)`.
#[profiling::function]
pub fn reflect_stage(words: &[u32], stage: ShaderStage, out: &mut Vec<ShaderBinding>) -> Result<()> {
    let table = DeclarationTable::resolve(words)?;

    let mut found = table
        .public_variables()
        .map(|(_, variable)| -> Result<ShaderBinding> {
            let kind = match variable.storage_class {
                StorageClass::StorageBuffer => ResourceKind::StorageBuffer,
                StorageClass::UniformConstant => match variable.opaque {
                    Some(opaque) => ResourceKind::from(opaque),
                    None => return Err(RhiError::malformed("uniform constant variable without an opaque type")),
                },
                _ => {
                    let block = variable.pointer_target.and_then(|target| table.get(target));
                    if block.is_some_and(|decl| decl.buffer_block) {
                        ResourceKind::StorageBuffer
                    } else {
                        ResourceKind::UniformBuffer
                    }
                }
            };

            let (size, count) = if kind.is_buffer() {
                (table.pointee_size(variable)?, 1)
            } else {
                (0, variable.element_count.max(1))
            };

            Ok(ShaderBinding {
                set: variable.descriptor_set,
                binding: variable.binding,
                size,
                kind,
                count,
                stages: stage.into(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    found.sort_by_key(|b| (b.set, b.binding));

    if let Some(pair) = found.windows(2).find(|w| (w[0].set, w[0].binding) == (w[1].set, w[1].binding)) {
        return Err(RhiError::invalid_argument(format!(
            "{:?} stage declares set {} binding {} more than once",
            stage, pair[0].set, pair[0].binding
        )));
    }

    out.extend(found);
    Ok(())
}

/// Merged descriptor bindings of every stage of a shader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub bindings: Vec<ShaderBinding>,
}

impl ShaderReflection {
    pub fn from_stages<'a>(stages: impl IntoIterator<Item = (ShaderStage, &'a [u32])>) -> Result<Self> {
        let mut bindings = Vec::new();
        for (stage, words) in stages {
            reflect_stage(words, stage, &mut bindings)?;
        }
        Self::merge(bindings)
    }

    /// Combine stage flags of bindings sharing a `(set, binding)`.
    ///
    /// Stages must agree on the kind, size and array length of a shared binding.
    pub fn merge(bindings: Vec<ShaderBinding>) -> Result<Self> {
        let mut binding_map: HashMap<(u32, u32), ShaderBinding> = HashMap::default();

        for binding in bindings {
            match binding_map.entry((binding.set, binding.binding)) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    if existing.kind != binding.kind
                        || existing.size != binding.size
                        || existing.count != binding.count
                    {
                        return Err(RhiError::invalid_argument(format!(
                            "set {} binding {} is {:?} ({} bytes, {} elements) in {:?} but {:?} ({} bytes, {} elements) in {:?}",
                            binding.set,
                            binding.binding,
                            existing.kind,
                            existing.size,
                            existing.count,
                            existing.stages,
                            binding.kind,
                            binding.size,
                            binding.count,
                            binding.stages,
                        )));
                    }
                    existing.stages |= binding.stages;
                }
                Entry::Vacant(entry) => {
                    entry.insert(binding);
                }
            }
        }

        if binding_map.len() > MAX_DESCRIPTORS {
            return Err(RhiError::ResourceExhausted {
                what: "descriptor bindings",
                max: MAX_DESCRIPTORS,
            });
        }

        let mut bindings: Vec<ShaderBinding> = binding_map.into_values().collect();
        bindings.sort_by_key(|b| (b.set, b.binding));

        Ok(Self { bindings })
    }

    pub fn find(&self, set: u32, binding: u32) -> Option<&ShaderBinding> {
        self.bindings.iter().find(|b| b.set == set && b.binding == binding)
    }

    /// Distinct descriptor set indices, ascending.
    pub fn descriptor_sets(&self) -> SmallVec<[u32; 4]> {
        let mut sets: SmallVec<[u32; 4]> = self.bindings.iter().map(|b| b.set).collect();
        sets.dedup();
        sets
    }

    pub fn uniform_buffers(&self) -> impl Iterator<Item = &ShaderBinding> {
        self.bindings.iter().filter(|b| b.kind == ResourceKind::UniformBuffer)
    }

    pub fn sampled_images(&self) -> impl Iterator<Item = &ShaderBinding> {
        self.bindings.iter().filter(|b| b.kind == ResourceKind::SampledImage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::assembler::Assembler;
    use crate::spirv::{
        DECORATION_BINDING, DECORATION_BUFFER_BLOCK, DECORATION_DESCRIPTOR_SET,
        STORAGE_CLASS_STORAGE_BUFFER, STORAGE_CLASS_UNIFORM, STORAGE_CLASS_UNIFORM_CONSTANT,
    };

    /// `layout(set = 1, binding = 0) uniform U { vec4 a; vec4 b; }`
    fn two_vec4_block(set: u32, binding: u32) -> Vec<u32> {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        let vec4 = asm.type_vector(float, 4);
        asm.uniform_block(set, binding, &[vec4, vec4]);
        asm.finish()
    }

    fn sampler_array(set: u32, binding: u32, length: u32) -> Vec<u32> {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        let uint = asm.type_int(32);
        let image = asm.type_image(float);
        let sampled = asm.type_sampled_image(image);
        let len = asm.constant(uint, length);
        let array = asm.type_array(sampled, len);
        let pointer = asm.type_pointer(STORAGE_CLASS_UNIFORM_CONSTANT, array);
        let variable = asm.variable(pointer, STORAGE_CLASS_UNIFORM_CONSTANT);
        asm.decorate(variable, DECORATION_DESCRIPTOR_SET, Some(set));
        asm.decorate(variable, DECORATION_BINDING, Some(binding));
        asm.finish()
    }

    #[test]
    fn uniform_block_reports_its_size() {
        let mut out = Vec::new();
        reflect_stage(&two_vec4_block(1, 0), ShaderStage::Vertex, &mut out).unwrap();

        assert_eq!(
            out,
            vec![ShaderBinding {
                set: 1,
                binding: 0,
                size: 32,
                kind: ResourceKind::UniformBuffer,
                count: 1,
                stages: ShaderStage::Vertex.into(),
            }]
        );
    }

    #[test]
    fn reflecting_twice_gives_the_same_bindings() {
        let words = two_vec4_block(0, 3);
        let mut first = Vec::new();
        let mut second = Vec::new();
        reflect_stage(&words, ShaderStage::Fragment, &mut first).unwrap();
        reflect_stage(&words, ShaderStage::Fragment, &mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn sampler_arrays_take_their_length_from_the_constant() {
        let mut out = Vec::new();
        reflect_stage(&sampler_array(0, 2, 4), ShaderStage::Fragment, &mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ResourceKind::SampledImage);
        assert_eq!(out[0].count, 4);
        assert_eq!(out[0].kind.descriptor_type(), vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }

    #[test]
    fn separate_images_samplers_and_storage_images_keep_their_descriptor_type() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        let image = asm.type_image(float);
        let storage = asm.type_storage_image(float);
        let sampler = asm.type_sampler();
        for (binding, ty) in [(0, image), (1, sampler), (2, storage)] {
            let pointer = asm.type_pointer(STORAGE_CLASS_UNIFORM_CONSTANT, ty);
            let variable = asm.variable(pointer, STORAGE_CLASS_UNIFORM_CONSTANT);
            asm.decorate(variable, DECORATION_BINDING, Some(binding));
        }

        let mut out = Vec::new();
        reflect_stage(&asm.finish(), ShaderStage::Fragment, &mut out).unwrap();

        assert_eq!(
            out.iter().map(|b| (b.binding, b.kind.descriptor_type(), b.count)).collect::<Vec<_>>(),
            vec![
                (0, vk::DescriptorType::SAMPLED_IMAGE, 1),
                (1, vk::DescriptorType::SAMPLER, 1),
                (2, vk::DescriptorType::STORAGE_IMAGE, 1),
            ]
        );
        assert!(out.iter().all(|b| b.size == 0));
    }

    #[test]
    fn storage_buffer_with_runtime_array_reflects_its_fixed_part() {
        let mut asm = Assembler::new();
        let uint = asm.type_int(32);
        let float = asm.type_float(32);
        let data = asm.type_runtime_array(float);
        let block = asm.type_struct(&[uint, uint, data]);
        let pointer = asm.type_pointer(STORAGE_CLASS_STORAGE_BUFFER, block);
        let variable = asm.variable(pointer, STORAGE_CLASS_STORAGE_BUFFER);
        asm.decorate(variable, DECORATION_BINDING, Some(4));

        let mut out = Vec::new();
        reflect_stage(&asm.finish(), ShaderStage::Fragment, &mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!((out[0].binding, out[0].kind, out[0].size), (4, ResourceKind::StorageBuffer, 8));
    }

    #[test]
    fn storage_buffers_are_recognised_in_both_encodings() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        let vec4 = asm.type_vector(float, 4);

        let modern = asm.type_struct(&[vec4]);
        let modern_ptr = asm.type_pointer(STORAGE_CLASS_STORAGE_BUFFER, modern);
        let a = asm.variable(modern_ptr, STORAGE_CLASS_STORAGE_BUFFER);
        asm.decorate(a, DECORATION_BINDING, Some(0));

        let legacy = asm.type_struct(&[vec4, vec4]);
        asm.decorate(legacy, DECORATION_BUFFER_BLOCK, None);
        let legacy_ptr = asm.type_pointer(STORAGE_CLASS_UNIFORM, legacy);
        let b = asm.variable(legacy_ptr, STORAGE_CLASS_UNIFORM);
        asm.decorate(b, DECORATION_BINDING, Some(1));

        let mut out = Vec::new();
        reflect_stage(&asm.finish(), ShaderStage::Compute, &mut out).unwrap();

        assert_eq!(
            out.iter().map(|b| (b.binding, b.kind, b.size)).collect::<Vec<_>>(),
            vec![
                (0, ResourceKind::StorageBuffer, 16),
                (1, ResourceKind::StorageBuffer, 32),
            ]
        );
    }

    #[test]
    fn duplicate_binding_within_a_stage_is_rejected() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        asm.uniform_block(0, 0, &[float]);
        asm.uniform_block(0, 0, &[float, float]);

        let err = reflect_stage(&asm.finish(), ShaderStage::Vertex, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, RhiError::InvalidArgument(_)));
    }

    #[test]
    fn stages_sharing_a_binding_are_merged() {
        let words = two_vec4_block(0, 0);
        let reflection = ShaderReflection::from_stages([
            (ShaderStage::Vertex, words.as_slice()),
            (ShaderStage::Fragment, words.as_slice()),
        ])
        .unwrap();

        assert_eq!(reflection.bindings.len(), 1);
        assert_eq!(reflection.bindings[0].stages, ShaderStage::Vertex | ShaderStage::Fragment);
        assert_eq!(
            stages_to_vk(reflection.bindings[0].stages),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn conflicting_stage_declarations_are_rejected() {
        let vertex = two_vec4_block(0, 0);
        let fragment = sampler_array(0, 0, 1);

        let err = ShaderReflection::from_stages([
            (ShaderStage::Vertex, vertex.as_slice()),
            (ShaderStage::Fragment, fragment.as_slice()),
        ])
        .unwrap_err();
        assert!(matches!(err, RhiError::InvalidArgument(_)));
    }

    #[test]
    fn merged_bindings_are_ordered_by_set_then_binding() {
        let a = two_vec4_block(1, 0);
        let b = two_vec4_block(0, 5);
        let c = sampler_array(0, 1, 2);

        let reflection = ShaderReflection::from_stages([
            (ShaderStage::Vertex, a.as_slice()),
            (ShaderStage::Vertex, b.as_slice()),
            (ShaderStage::Fragment, c.as_slice()),
        ])
        .unwrap();

        let keys: Vec<_> = reflection.bindings.iter().map(|b| (b.set, b.binding)).collect();
        assert_eq!(keys, vec![(0, 1), (0, 5), (1, 0)]);
        assert_eq!(reflection.descriptor_sets().as_slice(), &[0, 1]);
        assert_eq!(reflection.uniform_buffers().count(), 2);
        assert_eq!(reflection.find(0, 1).map(|b| b.count), Some(2));
    }

    #[test]
    fn too_many_bindings_exhaust_the_table() {
        let mut asm = Assembler::new();
        let float = asm.type_float(32);
        for binding in 0..=MAX_DESCRIPTORS as u32 {
            asm.uniform_block(0, binding, &[float]);
        }
        let words = asm.finish();

        let err = ShaderReflection::from_stages([(ShaderStage::Vertex, words.as_slice())]).unwrap_err();
        assert_eq!(
            err,
            RhiError::ResourceExhausted { what: "descriptor bindings", max: MAX_DESCRIPTORS }
        );
    }
}
