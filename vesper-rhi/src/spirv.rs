//! Minimal SPIR-V word stream reader and type graph resolver.
//!
//! Only the declarations needed to size descriptor bindings are understood:
//! scalar/vector/matrix/array/struct types, runtime arrays, pointers, opaque
//! image and sampler types, `OpConstant` and `OpSpecConstant` (array lengths),
//! `OpVariable` and the `Binding` / `DescriptorSet` / `BufferBlock`
//! decorations. Everything else is skipped.

use vesper_core::collections::hashmap::HashMap;

use crate::error::{Result, RhiError};

/// Words reserved for the module header (magic, version, generator, bound, schema).
pub const HEADER_WORDS: usize = 5;

pub(crate) const OP_CONSTANT: u16 = 43;
pub(crate) const OP_SPEC_CONSTANT: u16 = 50;
pub(crate) const OP_DECORATE: u16 = 71;
pub(crate) const OP_TYPE_VOID: u16 = 19;
pub(crate) const OP_TYPE_BOOL: u16 = 20;
pub(crate) const OP_TYPE_INT: u16 = 21;
pub(crate) const OP_TYPE_FLOAT: u16 = 22;
pub(crate) const OP_TYPE_VECTOR: u16 = 23;
pub(crate) const OP_TYPE_MATRIX: u16 = 24;
pub(crate) const OP_TYPE_IMAGE: u16 = 25;
pub(crate) const OP_TYPE_SAMPLER: u16 = 26;
pub(crate) const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
pub(crate) const OP_TYPE_ARRAY: u16 = 28;
pub(crate) const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
pub(crate) const OP_TYPE_STRUCT: u16 = 30;
pub(crate) const OP_TYPE_POINTER: u16 = 32;
pub(crate) const OP_VARIABLE: u16 = 59;

pub(crate) const DECORATION_BUFFER_BLOCK: u32 = 3;
pub(crate) const DECORATION_BINDING: u32 = 33;
pub(crate) const DECORATION_DESCRIPTOR_SET: u32 = 34;

pub(crate) const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
pub(crate) const STORAGE_CLASS_UNIFORM: u32 = 2;
pub(crate) const STORAGE_CLASS_STORAGE_BUFFER: u32 = 12;

/// `Sampled` operand of `OpTypeImage` for images used without a sampler (storage images).
pub(crate) const IMAGE_SAMPLED_STORAGE: u32 = 2;

/// Size of a pointer or variable declaration itself.
const HANDLE_SIZE: u32 = 8;
/// Booleans occupy a full std140 slot.
const BOOL_SIZE: u32 = 16;

/// Convert little-endian bytecode into words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(RhiError::invalid_argument(format!(
            "bytecode length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// One decoded instruction. `operands` excludes the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u16,
    pub operands: &'a [u32],
}

impl Instruction<'_> {
    fn operand(&self, index: usize) -> Result<u32> {
        self.operands.get(index).copied().ok_or_else(|| {
            RhiError::malformed(format!(
                "opcode {} is missing operand {} (has {})",
                self.opcode,
                index,
                self.operands.len()
            ))
        })
    }
}

/// Forward cursor over the instruction stream following the module header.
pub struct WordReader<'a> {
    words: &'a [u32],
    cursor: usize,
    done: bool,
}

impl<'a> WordReader<'a> {
    pub fn new(words: &'a [u32]) -> Result<Self> {
        if words.len() < HEADER_WORDS {
            return Err(RhiError::malformed(format!(
                "module header needs {} words, got {}",
                HEADER_WORDS,
                words.len()
            )));
        }

        Ok(Self {
            words,
            cursor: HEADER_WORDS,
            done: false,
        })
    }
}

impl<'a> Iterator for WordReader<'a> {
    type Item = Result<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.words.len() {
            return None;
        }

        let first = self.words[self.cursor];
        let opcode = (first & 0xFFFF) as u16;
        let len = (first >> 16) as usize;

        if opcode == 0 || len == 0 {
            // A terminator is only legal once nothing but padding remains.
            self.done = true;
            let rest = &self.words[self.cursor..];
            if rest.iter().any(|&w| w != 0) {
                return Some(Err(RhiError::malformed(format!(
                    "zero-length or zero-opcode instruction at word {} before end of stream",
                    self.cursor
                ))));
            }
            return None;
        }

        if self.cursor + len > self.words.len() {
            self.done = true;
            return Some(Err(RhiError::malformed(format!(
                "instruction at word {} declares {} words but only {} remain",
                self.cursor,
                len,
                self.words.len() - self.cursor
            ))));
        }

        let operands = &self.words[self.cursor + 1..self.cursor + len];
        self.cursor += len;
        Some(Ok(Instruction { opcode, operands }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Touched by a decoration but not declared yet.
    #[default]
    Unknown,
    Void,
    Bool,
    Int,
    Float,
    Vector,
    Matrix,
    Image,
    Sampler,
    SampledImage,
    Array,
    RuntimeArray,
    Struct,
    Pointer,
    Constant,
    Variable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StorageClass {
    #[default]
    Unspecified,
    UniformConstant,
    Uniform,
    StorageBuffer,
    Other(u32),
}

impl StorageClass {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            STORAGE_CLASS_UNIFORM_CONSTANT => StorageClass::UniformConstant,
            STORAGE_CLASS_UNIFORM => StorageClass::Uniform,
            STORAGE_CLASS_STORAGE_BUFFER => StorageClass::StorageBuffer,
            other => StorageClass::Other(other),
        }
    }
}

/// Descriptor-backed opaque type behind a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opaque {
    Sampler,
    /// Image read through a separate sampler.
    Image,
    StorageImage,
    /// Image and sampler combined.
    SampledImage,
}

/// A type, constant or variable declaration keyed by its result id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declaration {
    pub kind: OpKind,
    /// Byte size, 0 when undetermined.
    pub size: u32,
    /// Pointee type for pointers and variables.
    pub pointer_target: Option<u32>,
    pub storage_class: StorageClass,
    pub binding: u32,
    pub descriptor_set: u32,
    pub is_public: bool,
    /// Number of array elements, 1 for non-arrays and 0 for runtime arrays.
    pub element_count: u32,
    /// Set for images, samplers, sampled images and arrays of those.
    pub opaque: Option<Opaque>,
    /// Struct decorated `BufferBlock` (pre-1.3 storage buffers).
    pub buffer_block: bool,
    pub constant_value: Option<u32>,
}

/// Id-indexed declarations of one bytecode module, built in a single pass.
#[derive(Debug, Default)]
pub struct DeclarationTable {
    entries: HashMap<u32, Declaration>,
}

impl DeclarationTable {
    #[profiling::function]
    pub fn resolve(words: &[u32]) -> Result<Self> {
        let mut table = Self::default();
        for instruction in WordReader::new(words)? {
            table.apply(instruction?)?;
        }
        Ok(table)
    }

    pub fn get(&self, id: u32) -> Option<&Declaration> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Declaration)> {
        self.entries.iter().map(|(&id, decl)| (id, decl))
    }

    /// Variables living in a resource storage class.
    pub fn public_variables(&self) -> impl Iterator<Item = (u32, &Declaration)> {
        self.iter().filter(|(_, decl)| decl.is_public)
    }

    /// Byte size of the data a variable points at.
    pub fn pointee_size(&self, variable: &Declaration) -> Result<u32> {
        match variable.pointer_target {
            Some(target) => Ok(self.declared(target)?.size),
            None => Ok(variable.size),
        }
    }

    fn entry(&mut self, id: u32) -> &mut Declaration {
        self.entries.entry(id).or_default()
    }

    /// Look up an id that must already be declared.
    fn declared(&self, id: u32) -> Result<&Declaration> {
        match self.entries.get(&id) {
            Some(decl) if decl.kind != OpKind::Unknown => Ok(decl),
            _ => Err(RhiError::malformed(format!("reference to undeclared id %{}", id))),
        }
    }

    fn declare(&mut self, id: u32, kind: OpKind, size: u32) -> &mut Declaration {
        let decl = self.entry(id);
        decl.kind = kind;
        decl.size = size;
        decl.element_count = 1;
        decl
    }

    fn apply(&mut self, inst: Instruction<'_>) -> Result<()> {
        match inst.opcode {
            OP_TYPE_VOID => {
                self.declare(inst.operand(0)?, OpKind::Void, 0);
            }
            OP_TYPE_BOOL => {
                self.declare(inst.operand(0)?, OpKind::Bool, BOOL_SIZE);
            }
            OP_TYPE_INT | OP_TYPE_FLOAT => {
                let id = inst.operand(0)?;
                let width = inst.operand(1)?;
                let kind = if inst.opcode == OP_TYPE_INT { OpKind::Int } else { OpKind::Float };
                self.declare(id, kind, width / 8);
            }
            OP_TYPE_VECTOR | OP_TYPE_MATRIX => {
                // Vector: component type x count. Matrix: column type x count.
                let id = inst.operand(0)?;
                let component = self.declared(inst.operand(1)?)?.size;
                let count = inst.operand(2)?;
                let kind = if inst.opcode == OP_TYPE_VECTOR { OpKind::Vector } else { OpKind::Matrix };
                self.declare(id, kind, checked_size(component.checked_mul(count), id)?);
            }
            OP_TYPE_IMAGE => {
                let id = inst.operand(0)?;
                let opaque = if inst.operand(6)? == IMAGE_SAMPLED_STORAGE {
                    Opaque::StorageImage
                } else {
                    Opaque::Image
                };
                self.declare(id, OpKind::Image, 0).opaque = Some(opaque);
            }
            OP_TYPE_SAMPLER => {
                self.declare(inst.operand(0)?, OpKind::Sampler, 0).opaque = Some(Opaque::Sampler);
            }
            OP_TYPE_SAMPLED_IMAGE => {
                let id = inst.operand(0)?;
                self.declared(inst.operand(1)?)?;
                self.declare(id, OpKind::SampledImage, 0).opaque = Some(Opaque::SampledImage);
            }
            OP_TYPE_ARRAY => {
                let id = inst.operand(0)?;
                let element = self.declared(inst.operand(1)?)?;
                let (element_size, opaque) = (element.size, element.opaque);
                let length_id = inst.operand(2)?;
                let length = self
                    .declared(length_id)?
                    .constant_value
                    .ok_or_else(|| RhiError::malformed(format!("array length %{} is not a constant", length_id)))?;

                let size = checked_size(element_size.checked_mul(length), id)?;
                let decl = self.declare(id, OpKind::Array, size);
                decl.element_count = length;
                decl.opaque = opaque;
            }
            OP_TYPE_RUNTIME_ARRAY => {
                // Unsized: contributes nothing to the size of its block.
                let id = inst.operand(0)?;
                let opaque = self.declared(inst.operand(1)?)?.opaque;
                let decl = self.declare(id, OpKind::RuntimeArray, 0);
                decl.element_count = 0;
                decl.opaque = opaque;
            }
            OP_TYPE_STRUCT => {
                let id = inst.operand(0)?;
                let mut size = 0u32;
                for &member in &inst.operands[1..] {
                    size = checked_size(size.checked_add(self.declared(member)?.size), id)?;
                }
                self.declare(id, OpKind::Struct, size);
            }
            OP_TYPE_POINTER => {
                let id = inst.operand(0)?;
                let storage_class = StorageClass::from_raw(inst.operand(1)?);
                let target = inst.operand(2)?;
                self.declared(target)?;

                let decl = self.declare(id, OpKind::Pointer, HANDLE_SIZE);
                decl.storage_class = storage_class;
                decl.pointer_target = Some(target);
            }
            // Specialization constants resolve to their default value.
            OP_CONSTANT | OP_SPEC_CONSTANT => {
                let result_type = inst.operand(0)?;
                let id = inst.operand(1)?;
                let value = inst.operand(2)?;
                let size = self.declared(result_type)?.size;
                self.declare(id, OpKind::Constant, size).constant_value = Some(value);
            }
            OP_VARIABLE => {
                let result_type = inst.operand(0)?;
                let id = inst.operand(1)?;
                let storage_class = StorageClass::from_raw(inst.operand(2)?);

                let ty = self.declared(result_type)?;
                let target = ty.pointer_target.unwrap_or(result_type);
                let pointee = self.declared(target)?;
                let (opaque, element_count) = (pointee.opaque, pointee.element_count);

                let is_public = match storage_class {
                    StorageClass::Uniform | StorageClass::StorageBuffer => true,
                    StorageClass::UniformConstant => opaque.is_some(),
                    _ => false,
                };

                let decl = self.declare(id, OpKind::Variable, HANDLE_SIZE);
                decl.pointer_target = Some(target);
                decl.storage_class = storage_class;
                decl.opaque = opaque;
                decl.element_count = element_count;
                decl.is_public |= is_public;
            }
            OP_DECORATE => {
                let target = inst.operand(0)?;
                match inst.operand(1)? {
                    DECORATION_BINDING => self.entry(target).binding = inst.operand(2)?,
                    DECORATION_DESCRIPTOR_SET => self.entry(target).descriptor_set = inst.operand(2)?,
                    DECORATION_BUFFER_BLOCK => self.entry(target).buffer_block = true,
                    _ => {}
                }
            }
            _ => {}
        }

        Ok(())
    }
}

fn checked_size(size: Option<u32>, id: u32) -> Result<u32> {
    size.ok_or_else(|| RhiError::malformed(format!("size of %{} overflows", id)))
}

/// Builds SPIR-V word streams for tests.
#[cfg(test)]
pub(crate) mod assembler {
    use super::*;

    const MAGIC: u32 = 0x0723_0203;
    const VERSION_1_0: u32 = 0x0001_0000;

    pub(crate) struct Assembler {
        words: Vec<u32>,
        next_id: u32,
    }

    impl Assembler {
        pub(crate) fn new() -> Self {
            Self {
                words: vec![MAGIC, VERSION_1_0, 0, 0, 0],
                next_id: 1,
            }
        }

        pub(crate) fn id(&mut self) -> u32 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        pub(crate) fn emit(&mut self, opcode: u16, operands: &[u32]) {
            let len = (operands.len() + 1) as u32;
            self.words.push((len << 16) | opcode as u32);
            self.words.extend_from_slice(operands);
        }

        fn declare(&mut self, opcode: u16, operands: &[u32]) -> u32 {
            let id = self.id();
            let mut all = vec![id];
            all.extend_from_slice(operands);
            self.emit(opcode, &all);
            id
        }

        pub(crate) fn type_void(&mut self) -> u32 {
            self.declare(OP_TYPE_VOID, &[])
        }

        pub(crate) fn type_bool(&mut self) -> u32 {
            self.declare(OP_TYPE_BOOL, &[])
        }

        pub(crate) fn type_int(&mut self, width: u32) -> u32 {
            self.declare(OP_TYPE_INT, &[width, 0])
        }

        pub(crate) fn type_float(&mut self, width: u32) -> u32 {
            self.declare(OP_TYPE_FLOAT, &[width])
        }

        pub(crate) fn type_vector(&mut self, component: u32, count: u32) -> u32 {
            self.declare(OP_TYPE_VECTOR, &[component, count])
        }

        pub(crate) fn type_matrix(&mut self, column: u32, count: u32) -> u32 {
            self.declare(OP_TYPE_MATRIX, &[column, count])
        }

        pub(crate) fn type_image(&mut self, sampled_type: u32) -> u32 {
            // Dim 2D, not depth, not arrayed, single-sampled, sampled, unknown format.
            self.declare(OP_TYPE_IMAGE, &[sampled_type, 1, 0, 0, 0, 1, 0])
        }

        pub(crate) fn type_storage_image(&mut self, sampled_type: u32) -> u32 {
            // Rgba8 storage image.
            self.declare(OP_TYPE_IMAGE, &[sampled_type, 1, 0, 0, 0, IMAGE_SAMPLED_STORAGE, 4])
        }

        pub(crate) fn type_sampler(&mut self) -> u32 {
            self.declare(OP_TYPE_SAMPLER, &[])
        }

        pub(crate) fn type_sampled_image(&mut self, image: u32) -> u32 {
            self.declare(OP_TYPE_SAMPLED_IMAGE, &[image])
        }

        pub(crate) fn type_array(&mut self, element: u32, length: u32) -> u32 {
            self.declare(OP_TYPE_ARRAY, &[element, length])
        }

        pub(crate) fn type_runtime_array(&mut self, element: u32) -> u32 {
            self.declare(OP_TYPE_RUNTIME_ARRAY, &[element])
        }

        pub(crate) fn type_struct(&mut self, members: &[u32]) -> u32 {
            self.declare(OP_TYPE_STRUCT, members)
        }

        pub(crate) fn type_pointer(&mut self, storage_class: u32, target: u32) -> u32 {
            self.declare(OP_TYPE_POINTER, &[storage_class, target])
        }

        pub(crate) fn constant(&mut self, ty: u32, value: u32) -> u32 {
            let id = self.id();
            self.emit(OP_CONSTANT, &[ty, id, value]);
            id
        }

        pub(crate) fn spec_constant(&mut self, ty: u32, default: u32) -> u32 {
            let id = self.id();
            self.emit(OP_SPEC_CONSTANT, &[ty, id, default]);
            id
        }

        pub(crate) fn variable(&mut self, pointer_type: u32, storage_class: u32) -> u32 {
            let id = self.id();
            self.emit(OP_VARIABLE, &[pointer_type, id, storage_class]);
            id
        }

        pub(crate) fn decorate(&mut self, target: u32, decoration: u32, value: Option<u32>) {
            match value {
                Some(value) => self.emit(OP_DECORATE, &[target, decoration, value]),
                None => self.emit(OP_DECORATE, &[target, decoration]),
            }
        }

        /// `layout(set, binding) uniform Block { members }`.
        pub(crate) fn uniform_block(&mut self, set: u32, binding: u32, members: &[u32]) -> u32 {
            let block = self.type_struct(members);
            let pointer = self.type_pointer(STORAGE_CLASS_UNIFORM, block);
            let variable = self.variable(pointer, STORAGE_CLASS_UNIFORM);
            self.decorate(variable, DECORATION_DESCRIPTOR_SET, Some(set));
            self.decorate(variable, DECORATION_BINDING, Some(binding));
            variable
        }

        pub(crate) fn finish(mut self) -> Vec<u32> {
            self.words[3] = self.next_id;
            self.words
        }
    }
}
