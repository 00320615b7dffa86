//! Vulkan Buffer - GPU buffer resource management.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use ash::vk;
use vesper_core::log;
use vesper_rhi_derive::DeviceObject;

use crate::device::{release, RenderDevice};
use crate::error::{Result, RhiError};
use crate::mapping::HostMapping;
use crate::renderer::Renderer;
use crate::utility::find_memory_type;

/// Buffer descriptor for creating GPU buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size of the buffer in bytes.
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
}

impl BufferDesc {
    /// Create a staging buffer descriptor (CPU-visible for transfers).
    pub fn staging(size: vk::DeviceSize) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    /// Create a uniform buffer descriptor.
    pub fn uniform(size: vk::DeviceSize) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }
}

/// GPU buffer with its own memory allocation.
#[DeviceObject]
pub struct Buffer {
    buffer: vk::Buffer,
    desc: BufferDesc,
    memory: vk::DeviceMemory,
}

impl Buffer {
    /// Create a new buffer from a descriptor.
    pub fn new(device: &RenderDevice, desc: &BufferDesc) -> Result<Self> {
        let handle = device.handle();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { handle.create_buffer(&buffer_info, None) }.map_err(RhiError::device("create_buffer"))?;

        let memory = match allocate_buffer_memory(device, buffer, desc.memory_flags) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { handle.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        log::trace!("Buffer created: {} bytes, {:?}", desc.size, desc.usage);

        Ok(Self {
            buffer,
            desc: *desc,
            memory,
            device: handle.clone(),
        })
    }

    pub fn map(&self) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .map_memory(self.memory, 0, self.desc.size, vk::MemoryMapFlags::empty())
        }
        .map_err(RhiError::device("map_memory"))?;

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| RhiError::invalid_state("map_memory returned null"))
    }

    pub fn unmap(&self) {
        unsafe { self.device.unmap_memory(self.memory) }
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn allocate_buffer_memory(
    device: &RenderDevice,
    buffer: vk::Buffer,
    flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let handle = device.handle();
    let requirements = unsafe { handle.get_buffer_memory_requirements(buffer) };
    let memory_type_index = find_memory_type(device.memory_properties(), requirements.memory_type_bits, flags)
        .ok_or_else(|| RhiError::invalid_state(format!("no memory type with {:?}", flags)))?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { handle.allocate_memory(&alloc_info, None) }.map_err(RhiError::device("allocate_memory"))?;

    if let Err(err) = unsafe { handle.bind_buffer_memory(buffer, memory, 0) } {
        unsafe { handle.free_memory(memory, None) };
        return Err(RhiError::device("bind_buffer_memory")(err));
    }

    Ok(memory)
}

/// Where a [`RenderBuffer`] lives and what it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Host-visible vertex data, written in place.
    CpuVertex,
    /// Device-local vertex data, uploaded through a staging buffer.
    GpuVertex,
    CpuIndex,
    GpuIndex,
}

impl BufferKind {
    pub fn is_device_local(&self) -> bool {
        matches!(self, BufferKind::GpuVertex | BufferKind::GpuIndex)
    }

    pub fn is_index(&self) -> bool {
        matches!(self, BufferKind::CpuIndex | BufferKind::GpuIndex)
    }

    pub fn desc(&self, size: vk::DeviceSize) -> BufferDesc {
        let mut usage = if self.is_index() {
            vk::BufferUsageFlags::INDEX_BUFFER
        } else {
            vk::BufferUsageFlags::VERTEX_BUFFER
        };

        let memory_flags = if self.is_device_local() {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        } else {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        };

        BufferDesc { size, usage, memory_flags }
    }
}

struct BufferStorage {
    buffer: Buffer,
    staging: Option<Buffer>,
}

/// A vertex or index buffer created by a [`Renderer`].
///
/// Must be dropped before the renderer that created it.
pub struct RenderBuffer {
    owner: Weak<RenderDevice>,
    kind: BufferKind,
    storage: Option<BufferStorage>,
    mapping: HostMapping,
}

/// Staging source `update_data` copies from, `None` for host-visible kinds.
fn staged_copy_source<T>(kind: BufferKind, staging: Option<&T>) -> Result<Option<&T>> {
    if !kind.is_device_local() {
        return Ok(None);
    }
    staging
        .map(Some)
        .ok_or_else(|| RhiError::invalid_state("update_data on a GPU buffer that was never mapped"))
}

impl RenderBuffer {
    pub(crate) fn new(device: &Arc<RenderDevice>, kind: BufferKind, size: vk::DeviceSize) -> Result<Self> {
        if size == 0 {
            return Err(RhiError::invalid_argument("buffer size must be non-zero"));
        }

        let buffer = Buffer::new(device, &kind.desc(size))?;

        Ok(Self {
            owner: Arc::downgrade(device),
            kind,
            storage: Some(BufferStorage { buffer, staging: None }),
            mapping: HostMapping::default(),
        })
    }

    fn owner(&self) -> Result<Arc<RenderDevice>> {
        self.owner
            .upgrade()
            .ok_or_else(|| RhiError::invalid_state("buffer outlived its renderer"))
    }

    fn storage(&self) -> Result<&BufferStorage> {
        self.storage
            .as_ref()
            .ok_or_else(|| RhiError::invalid_state("buffer has been released"))
    }

    /// Map the CPU-writable side: the buffer itself, or a staging buffer for GPU kinds.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        self.mapping.check_unmapped()?;

        let device = self.owner()?;
        let size = self.size();
        let device_local = self.kind.is_device_local();
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| RhiError::invalid_state("buffer has been released"))?;

        if device_local && storage.staging.is_none() {
            storage.staging = Some(Buffer::new(&device, &BufferDesc::staging(size))?);
        }

        let target = storage.staging.as_ref().unwrap_or(&storage.buffer);
        let ptr = target.map()?;

        // The whole buffer stays mapped until `unmap` or drop.
        unsafe { self.mapping.start(ptr, size as usize) }
    }

    pub fn unmap(&mut self) -> Result<()> {
        self.mapping.finish()?;

        let storage = self.storage()?;
        storage.staging.as_ref().unwrap_or(&storage.buffer).unmap();
        Ok(())
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_mapped()
    }

    /// Copy `data` into the mapped range at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.mapping.write(offset, data)
    }

    /// Make written data visible to draws. Host-visible kinds need nothing.
    #[profiling::function]
    pub fn update_data(&mut self) -> Result<()> {
        let storage = self.storage()?;
        let Some(staging) = staged_copy_source(self.kind, storage.staging.as_ref())? else {
            return Ok(());
        };
        let device = self.owner()?;

        let size = storage.buffer.size();
        let dst = storage.buffer.handle();
        let src = staging.handle();

        device.submit_immediate(|encoder| {
            encoder.copy_buffer(src, dst, &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size }]);

            let barrier = vk::BufferMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::COPY)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::VERTEX_INPUT)
                .dst_access_mask(vk::AccessFlags2::VERTEX_ATTRIBUTE_READ | vk::AccessFlags2::INDEX_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(dst)
                .offset(0)
                .size(vk::WHOLE_SIZE);
            encoder.buffer_barriers(&[barrier]);
        })
    }

    /// Record this buffer as the current vertex or index buffer of `renderer`.
    pub fn bind(&self, renderer: &mut Renderer) -> Result<()> {
        renderer.bind_buffer(self)
    }

    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.storage.as_ref().map_or(0, |s| s.buffer.size())
    }

    pub fn handle(&self) -> vk::Buffer {
        self.storage.as_ref().map_or(vk::Buffer::null(), |s| s.buffer.handle())
    }

    pub(crate) fn is_owned_by(&self, device: &Arc<RenderDevice>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(device))
    }
}

impl Drop for RenderBuffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            if self.mapping.finish().is_ok() && self.owner.strong_count() > 0 {
                storage.staging.as_ref().unwrap_or(&storage.buffer).unmap();
            }
            release(&self.owner, "buffer", storage);
        }
    }
}
