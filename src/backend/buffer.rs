// Buffer utilities for uniform and storage buffers
//
// One dedicated allocation per buffer, bound at offset 0. Host-visible
// memory is mapped once at creation and stays mapped until drop.

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Flags used for everything the CPU writes every frame
pub const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// First memory type allowed by `type_mask` whose flags contain `flags`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_mask: u32,
    flags: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    let count = memory_properties
        .memory_type_count
        .min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&i| {
            let has_type = (type_mask & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(flags);
            has_type && has_properties
        })
        .ok_or(RenderError::NoCompatibleMemoryType { type_mask, flags })
}

/// Round `value` up to a multiple of `alignment` (0 or 1 leaves it unchanged)
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Stride and total size of `count` equally sized buffers sharing one block
pub fn grouped_layout(
    requirements: &vk::MemoryRequirements,
    count: usize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let stride = align_up(requirements.size, requirements.alignment);
    (stride, stride * count as vk::DeviceSize)
}

/// A buffer with its own memory block
pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: Option<*mut u8>,
    context: Arc<GpuContext>,
}

impl Buffer {
    pub fn new(
        context: &Arc<GpuContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        let device = &context.device;
        let handle = create_buffer_handle(context, size, usage)?;

        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let memory = match allocate(context, &requirements, requirements.size, memory_flags) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        let mut buffer = Self {
            handle,
            memory,
            size,
            mapped: None,
            context: Arc::clone(context),
        };

        unsafe { device.bind_buffer_memory(handle, memory, 0) }.call("vkBindBufferMemory")?;

        if memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let ptr = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            }
            .call("vkMapMemory")?;
            buffer.mapped = Some(ptr.cast::<u8>());
        }

        Ok(buffer)
    }

    /// Host-visible buffer filled with `data`
    pub fn with_data(
        context: &Arc<GpuContext>,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> RenderResult<Self> {
        // Zero-sized buffers are invalid
        let size = (data.len() as vk::DeviceSize).max(4);
        let buffer = Self::new(context, size, usage, HOST_MEMORY)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Copy bytes into the persistent mapping
    pub fn write(&self, offset: usize, data: &[u8]) -> RenderResult<()> {
        let ptr = self.mapped.ok_or(RenderError::NotHostVisible)?;
        let capacity = self.size as usize;
        let end = offset.saturating_add(data.len());
        if end > capacity {
            return Err(RenderError::BufferOverflow {
                len: end,
                capacity,
            });
        }

        unsafe {
            ptr.add(offset)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
        Ok(())
    }

    /// View of the mapped contents
    pub fn contents(&self) -> RenderResult<&[u8]> {
        let ptr = self.mapped.ok_or(RenderError::NotHostVisible)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.size as usize) })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            if self.mapped.take().is_some() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.handle, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// One per-frame uniform buffer inside a [`UniformRing`]
#[derive(Clone, Copy, Debug)]
pub struct UniformSlot {
    pub buffer: vk::Buffer,
    /// Offset of this buffer inside the shared memory block
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    ptr: *mut u8,
}

impl UniformSlot {
    /// Overwrite the slot through the host mapping.
    ///
    /// Only valid once the fence guarding this slot has been waited on.
    pub fn write<T: Pod>(&self, value: &T) -> RenderResult<()> {
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(RenderError::BufferOverflow {
                len: bytes.len(),
                capacity: self.size as usize,
            });
        }
        unsafe {
            self.ptr
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn null(size: vk::DeviceSize) -> Self {
        Self {
            buffer: vk::Buffer::null(),
            offset: 0,
            size,
            ptr: std::ptr::null_mut(),
        }
    }
}

/// N identical uniform buffers backed by a single allocation mapped once
pub struct UniformRing {
    pub memory: vk::DeviceMemory,
    buffers: Vec<vk::Buffer>,
    slots: Vec<UniformSlot>,
    mapped: *mut u8,
    context: Arc<GpuContext>,
}

impl UniformRing {
    pub fn new(
        context: &Arc<GpuContext>,
        count: usize,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<Self> {
        let device = &context.device;

        let mut ring = Self {
            memory: vk::DeviceMemory::null(),
            buffers: Vec::with_capacity(count),
            slots: Vec::with_capacity(count),
            mapped: std::ptr::null_mut(),
            context: Arc::clone(context),
        };

        for _ in 0..count {
            ring.buffers.push(create_buffer_handle(context, size, usage)?);
        }

        let Some(&first) = ring.buffers.first() else {
            return Ok(ring);
        };

        // Identical create infos give identical requirements; the shared
        // block must satisfy every buffer's type mask.
        let mut requirements = unsafe { device.get_buffer_memory_requirements(first) };
        for &buffer in &ring.buffers[1..] {
            let other = unsafe { device.get_buffer_memory_requirements(buffer) };
            requirements.memory_type_bits &= other.memory_type_bits;
        }

        let (stride, total) = grouped_layout(&requirements, count);
        ring.memory = allocate(context, &requirements, total, HOST_MEMORY)?;

        for (i, &buffer) in ring.buffers.iter().enumerate() {
            unsafe { device.bind_buffer_memory(buffer, ring.memory, stride * i as vk::DeviceSize) }
                .call("vkBindBufferMemory")?;
        }

        ring.mapped = unsafe {
            device.map_memory(ring.memory, 0, total, vk::MemoryMapFlags::empty())
        }
        .call("vkMapMemory")?
        .cast::<u8>();

        ring.slots = ring
            .buffers
            .iter()
            .enumerate()
            .map(|(i, &buffer)| {
                let offset = stride * i as vk::DeviceSize;
                UniformSlot {
                    buffer,
                    offset,
                    size,
                    ptr: unsafe { ring.mapped.add(offset as usize) },
                }
            })
            .collect();

        log::debug!(
            "Uniform ring: {} x {} bytes (stride {}, block {})",
            count,
            size,
            stride,
            total
        );

        Ok(ring)
    }

    pub fn slots(&self) -> &[UniformSlot] {
        &self.slots
    }
}

impl Drop for UniformRing {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            if !self.mapped.is_null() {
                device.unmap_memory(self.memory);
            }
            for &buffer in &self.buffers {
                device.destroy_buffer(buffer, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
    }
}

fn create_buffer_handle(
    context: &GpuContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> RenderResult<vk::Buffer> {
    let queue_families = [context.queue_family];
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .queue_family_indices(&queue_families);

    unsafe { context.device.create_buffer(&buffer_info, None) }.call("vkCreateBuffer")
}

fn allocate(
    context: &GpuContext,
    requirements: &vk::MemoryRequirements,
    size: vk::DeviceSize,
    flags: vk::MemoryPropertyFlags,
) -> RenderResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &context.memory_properties,
        requirements.memory_type_bits,
        flags,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type_index);

    unsafe { context.device.allocate_memory(&alloc_info, None) }.call("vkAllocateMemory")
}
