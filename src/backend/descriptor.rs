// Descriptor sets - make buffers visible to shader binding slots
//
// The pool is sized exactly for the sets requested; running out is a hard
// failure rather than a reason to grow it.

use ash::vk;
use std::sync::Arc;

use super::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
    context: Arc<GpuContext>,
}

impl DescriptorSetLayout {
    pub fn new(
        context: &Arc<GpuContext>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<Self> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        let handle = unsafe { context.device.create_descriptor_set_layout(&layout_info, None) }
            .call("vkCreateDescriptorSetLayout")?;

        Ok(Self {
            handle,
            bindings: bindings.to_vec(),
            context: Arc::clone(context),
        })
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_descriptor_set_layout(self.handle, None)
        };
    }
}

/// Shorthand for a single buffer binding
pub fn buffer_binding(
    binding: u32,
    descriptor_type: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(descriptor_type)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

/// Pool sizes for `set_count` copies of a layout, one entry per descriptor type
pub fn pool_sizes(
    bindings: &[vk::DescriptorSetLayoutBinding],
    set_count: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.descriptor_count * set_count;
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

/// A buffer range to bind into one set
#[derive(Clone, Copy, Debug)]
pub struct BufferWrite {
    pub set: usize,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// Every write must land in one of the `set_count` allocated sets
pub fn check_write_targets(writes: &[BufferWrite], set_count: usize) -> RenderResult<()> {
    match writes.iter().find(|w| w.set >= set_count) {
        Some(w) => Err(RenderError::DescriptorSetOutOfRange {
            set: w.set,
            count: set_count,
        }),
        None => Ok(()),
    }
}

/// Pool plus the sets allocated from it
pub struct DescriptorAllocation {
    pub pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    context: Arc<GpuContext>,
}

impl DescriptorAllocation {
    /// Allocate `count` sets of `layout` from a pool sized for exactly that
    pub fn new(
        context: &Arc<GpuContext>,
        layout: &DescriptorSetLayout,
        count: usize,
    ) -> RenderResult<Self> {
        // A pool with maxSets = 0 is invalid
        if count == 0 {
            return Ok(Self {
                pool: vk::DescriptorPool::null(),
                sets: Vec::new(),
                context: Arc::clone(context),
            });
        }

        let set_count = count as u32;
        let sizes = pool_sizes(layout.bindings(), set_count);

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(set_count)
            .pool_sizes(&sizes);

        let pool = unsafe { context.device.create_descriptor_pool(&pool_info, None) }
            .call("vkCreateDescriptorPool")?;

        let mut allocation = Self {
            pool,
            sets: Vec::new(),
            context: Arc::clone(context),
        };

        let layouts = vec![layout.handle; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        allocation.sets = unsafe { context.device.allocate_descriptor_sets(&alloc_info) }
            .call("vkAllocateDescriptorSets")?;

        log::debug!("Allocated {} descriptor sets", allocation.sets.len());
        Ok(allocation)
    }

    /// Bind every buffer range in one batched update
    pub fn update(&self, writes: &[BufferWrite]) -> RenderResult<()> {
        check_write_targets(writes, self.sets.len())?;

        let infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
            .iter()
            .map(|w| {
                [vk::DescriptorBufferInfo {
                    buffer: w.buffer,
                    offset: w.offset,
                    range: w.range,
                }]
            })
            .collect();

        let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(&infos)
            .map(|(w, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(self.sets[w.set])
                    .dst_binding(w.binding)
                    .descriptor_type(w.descriptor_type)
                    .buffer_info(info)
                    .build()
            })
            .collect();

        unsafe {
            self.context
                .device
                .update_descriptor_sets(&descriptor_writes, &[])
        };
        Ok(())
    }
}

impl Drop for DescriptorAllocation {
    fn drop(&mut self) {
        if self.pool == vk::DescriptorPool::null() {
            return;
        }
        // Sets are freed with the pool
        unsafe {
            self.context
                .device
                .destroy_descriptor_pool(self.pool, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_sized_exactly() {
        let bindings = [buffer_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX,
        )];
        let sizes = pool_sizes(&bindings, 3);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 3);
    }

    #[test]
    fn pool_sizes_merge_by_type() {
        let bindings = [
            buffer_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            ),
            buffer_binding(
                1,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            ),
            buffer_binding(
                2,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            ),
        ];
        let sizes = pool_sizes(&bindings, 2);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].descriptor_count, 2);
        assert_eq!(sizes[1].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[1].descriptor_count, 4);
    }

    fn uniform_write(set: usize) -> BufferWrite {
        BufferWrite {
            set,
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 96,
        }
    }

    #[test]
    fn writes_inside_the_allocation_are_accepted() {
        let writes: Vec<_> = (0..3).map(uniform_write).collect();
        assert!(check_write_targets(&writes, 3).is_ok());
        assert!(check_write_targets(&[], 0).is_ok());
    }

    #[test]
    fn write_past_the_last_set_is_rejected() {
        let writes = [uniform_write(0), uniform_write(2), uniform_write(1)];
        assert!(matches!(
            check_write_targets(&writes, 2),
            Err(RenderError::DescriptorSetOutOfRange { set: 2, count: 2 })
        ));
        assert!(matches!(
            check_write_targets(&[uniform_write(0)], 0),
            Err(RenderError::DescriptorSetOutOfRange { set: 0, count: 0 })
        ));
    }

    #[test]
    fn no_sets_means_empty_pool() {
        let bindings = [buffer_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX,
        )];
        assert_eq!(pool_sizes(&bindings, 0)[0].descriptor_count, 0);
        assert!(pool_sizes(&[], 4).is_empty());
    }
}
