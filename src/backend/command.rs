// Command pool, command buffers and image layout barriers

use ash::vk;
use std::sync::Arc;

use super::sync::Fence;
use super::GpuContext;
use crate::error::{RenderResult, VkResultExt};

pub struct CommandPool {
    pub handle: vk::CommandPool,
    context: Arc<GpuContext>,
}

impl CommandPool {
    /// Pool on the render queue family whose buffers can be reset individually
    pub fn new(context: &Arc<GpuContext>) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(context.queue_family);

        let handle = unsafe { context.device.create_command_pool(&pool_info, None) }
            .call("vkCreateCommandPool")?;

        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }

    pub fn allocate(&self, count: usize) -> RenderResult<CommandBuffers> {
        let mut buffers = CommandBuffers {
            pool: self.handle,
            handles: Vec::new(),
            context: Arc::clone(&self.context),
        };
        if count == 0 {
            return Ok(buffers);
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        buffers.handles = unsafe { self.context.device.allocate_command_buffers(&alloc_info) }
            .call("vkAllocateCommandBuffers")?;
        Ok(buffers)
    }

    /// Record with `record`, submit, and block until the GPU is done
    pub fn run_one_shot<F>(&self, timeout_ns: u64, record: F) -> RenderResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let buffers = self.allocate(1)?;
        let command_buffer = buffers.handles[0];
        let device = &self.context.device;

        begin_one_time(device, command_buffer)?;
        record(device, command_buffer);
        unsafe { device.end_command_buffer(command_buffer) }.call("vkEndCommandBuffer")?;

        let fence = Fence::new(&self.context, false)?;
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        unsafe { device.queue_submit(self.context.queue, &[submit], fence.handle) }
            .call("vkQueueSubmit")?;

        if let Err(e) = fence.wait(timeout_ns) {
            // The submission still owns `buffers` and `fence` until it retires
            if let Err(idle) = self.context.wait_idle() {
                log::error!("Device did not go idle after {}: {}", e, idle);
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_command_pool(self.handle, None) };
    }
}

/// Primary command buffers returned to their pool on drop
pub struct CommandBuffers {
    pub handles: Vec<vk::CommandBuffer>,
    pool: vk::CommandPool,
    context: Arc<GpuContext>,
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            unsafe {
                self.context
                    .device
                    .free_command_buffers(self.pool, &self.handles)
            };
        }
    }
}

pub fn begin_one_time(device: &ash::Device, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
        .call("vkBeginCommandBuffer")
}

/// Access and stage masks for one layout transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_for(old: vk::ImageLayout, new: vk::ImageLayout) -> TransitionMasks {
    match (old, new) {
        // Previous contents are discarded; the acquire semaphore already
        // orders us after the presentation engine.
        (
            vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        },
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => {
            TransitionMasks {
                src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::empty(),
                src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            }
        }
        _ => TransitionMasks {
            src_access: vk::AccessFlags::MEMORY_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
        },
    }
}

pub fn image_barrier(
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    masks: &TransitionMasks,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
        .build()
}

pub fn cmd_transition_image(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let masks = transition_for(old, new);
    let barrier = image_barrier(image, old, new, &masks);
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::BY_REGION,
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_and_reuse_share_the_attachment_transition() {
        let first = transition_for(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let reuse = transition_for(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(first, reuse);
        assert!(first.src_access.is_empty());
        assert_eq!(first.dst_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(first.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn present_transition_waits_for_color_writes() {
        let masks = transition_for(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert_eq!(masks.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert!(masks.dst_access.is_empty());
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn barrier_covers_the_whole_color_image() {
        let old = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
        let new = vk::ImageLayout::PRESENT_SRC_KHR;
        let barrier = image_barrier(vk::Image::null(), old, new, &transition_for(old, new));
        assert_eq!(barrier.old_layout, old);
        assert_eq!(barrier.new_layout, new);
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }
}
