// Synchronization primitives
//
// Fences gate CPU reuse of per-image resources; semaphores order GPU work
// between acquire, submit and present.

use ash::vk;
use std::sync::Arc;

use super::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

/// CPU-observable completion signal
pub struct Fence {
    pub handle: vk::Fence,
    context: Arc<GpuContext>,
}

impl Fence {
    pub fn new(context: &Arc<GpuContext>, signaled: bool) -> RenderResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);

        let handle = unsafe { context.device.create_fence(&fence_info, None) }
            .call("vkCreateFence")?;

        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }

    /// Block until signaled. Does not reset, so waiting twice returns at once.
    pub fn wait(&self, timeout_ns: u64) -> RenderResult<()> {
        let fences = [self.handle];
        match unsafe { self.context.device.wait_for_fences(&fences, true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::Timeout("frame fence")),
            Err(result) => Err(RenderError::Vulkan {
                call: "vkWaitForFences",
                result,
            }),
        }
    }

    pub fn reset(&self) -> RenderResult<()> {
        unsafe { self.context.device.reset_fences(&[self.handle]) }.call("vkResetFences")
    }

    pub fn is_signaled(&self) -> RenderResult<bool> {
        unsafe { self.context.device.get_fence_status(self.handle) }.call("vkGetFenceStatus")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_fence(self.handle, None) };
    }
}

/// GPU-side ordering primitive
pub struct Semaphore {
    pub handle: vk::Semaphore,
    context: Arc<GpuContext>,
}

impl Semaphore {
    pub fn new(context: &Arc<GpuContext>) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let handle = unsafe { context.device.create_semaphore(&semaphore_info, None) }
            .call("vkCreateSemaphore")?;

        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_semaphore(self.handle, None) };
    }
}

/// The two semaphores every frame reuses.
///
/// Reuse is sound only because the per-image fence wait keeps at most one
/// acquire/release pair outstanding per semaphore.
pub struct FrameSemaphores {
    /// Signaled when rendering is done and the image may be presented
    pub release: Semaphore,
    /// Signaled when the acquired image is available for rendering
    pub acquire: Semaphore,
}

impl FrameSemaphores {
    pub fn new(context: &Arc<GpuContext>) -> RenderResult<Self> {
        Ok(Self {
            acquire: Semaphore::new(context)?,
            release: Semaphore::new(context)?,
        })
    }
}
