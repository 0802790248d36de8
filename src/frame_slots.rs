// Per-image resource bundles
//
// Everything indexed by swapchain image index lives in one FrameSlot, so the
// image/command buffer/fence/uniform/descriptor alignment cannot drift.
// The handles are owned elsewhere (Fence, Framebuffers, UniformRing, ...);
// a slot only groups them.

use ash::vk;

use crate::backend::buffer::UniformSlot;
use crate::error::{RenderError, RenderResult};

#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    pub image: vk::Image,
    pub framebuffer: vk::Framebuffer,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub uniform: UniformSlot,
    pub descriptor_set: vk::DescriptorSet,
    /// Layout the image was left in by the last frame that used it
    pub layout: vk::ImageLayout,
}

impl FrameSlot {
    /// Layout the image must be transitioned from for this frame. The frame
    /// being recorded leaves it ready to present.
    pub fn begin_render(&mut self) -> vk::ImageLayout {
        std::mem::replace(&mut self.layout, vk::ImageLayout::PRESENT_SRC_KHR)
    }
}

#[derive(Debug, Default)]
pub struct FrameSlots {
    slots: Vec<FrameSlot>,
}

impl FrameSlots {
    /// Zip index-aligned resources into slots; every list must have one
    /// entry per swapchain image.
    pub fn assemble(
        images: &[vk::Image],
        framebuffers: &[vk::Framebuffer],
        command_buffers: &[vk::CommandBuffer],
        fences: &[vk::Fence],
        uniforms: &[UniformSlot],
        descriptor_sets: &[vk::DescriptorSet],
    ) -> RenderResult<Self> {
        let expected = images.len();
        check_len("framebuffers", expected, framebuffers.len())?;
        check_len("command buffers", expected, command_buffers.len())?;
        check_len("fences", expected, fences.len())?;
        check_len("uniform buffers", expected, uniforms.len())?;
        check_len("descriptor sets", expected, descriptor_sets.len())?;

        let slots = (0..expected)
            .map(|i| FrameSlot {
                image: images[i],
                framebuffer: framebuffers[i],
                command_buffer: command_buffers[i],
                fence: fences[i],
                uniform: uniforms[i],
                descriptor_set: descriptor_sets[i],
                layout: vk::ImageLayout::UNDEFINED,
            })
            .collect();

        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> RenderResult<&FrameSlot> {
        let count = self.slots.len();
        self.slots.get(index).ok_or(RenderError::InvalidImageIndex {
            index: index as u32,
            count,
        })
    }

    pub fn get_mut(&mut self, index: usize) -> RenderResult<&mut FrameSlot> {
        let count = self.slots.len();
        self.slots.get_mut(index).ok_or(RenderError::InvalidImageIndex {
            index: index as u32,
            count,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot> {
        self.slots.iter()
    }
}

fn check_len(resource: &'static str, expected: usize, found: usize) -> RenderResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(RenderError::SlotCountMismatch {
            resource,
            expected,
            found,
        })
    }
}
