// Swapchain - Window presentation
//
// Owns the surface, the chain of presentable images and one view per image.
// The images themselves belong to the presentation engine.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Fallback when the surface reports UNDEFINED (any format acceptable)
pub const DEFAULT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Everything needed to create a surface and size the chain
#[derive(Clone, Copy, Debug)]
pub struct SurfaceTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
    pub width: u32,
    pub height: u32,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: SwapchainLoader,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    desired_image_count: u32,
    requested_present_mode: vk::PresentModeKHR,
    context: Arc<GpuContext>,
}

impl Swapchain {
    pub fn new(
        context: Arc<GpuContext>,
        target: &SurfaceTarget,
        desired_image_count: u32,
        present_mode: vk::PresentModeKHR,
    ) -> RenderResult<Self> {
        log::info!("Creating swapchain: {}x{}", target.width, target.height);

        let surface_loader = Surface::new(&context.entry, &context.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &context.entry,
                &context.instance,
                target.display,
                target.window,
                None,
            )
        }
        .call("vkCreateSurfaceKHR")?;

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader: context.swapchain_loader(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            surface,
            surface_loader,
            desired_image_count,
            requested_present_mode: present_mode,
            context,
        };

        // From here on Drop releases the surface if the chain build fails
        let supported = unsafe {
            swapchain.surface_loader.get_physical_device_surface_support(
                swapchain.context.physical_device,
                swapchain.context.queue_family,
                swapchain.surface,
            )
        }
        .call("vkGetPhysicalDeviceSurfaceSupportKHR")?;
        if !supported {
            return Err(RenderError::SurfaceUnsupported(
                "render queue family cannot present to this surface".to_string(),
            ));
        }

        swapchain.build(target.width, target.height)?;
        Ok(swapchain)
    }

    /// Rebuild the chain for a new window size, handing the old chain to the driver.
    ///
    /// The caller must have drained the queue and dropped every resource
    /// that references the old images.
    pub fn recreate(&mut self, width: u32, height: u32) -> RenderResult<()> {
        log::info!("Recreating swapchain: {}x{}", width, height);
        self.build(width, height)
    }

    fn build(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let physical_device = self.context.physical_device;

        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }
        .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }
        .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;

        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }
        .call("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        check_surface_capabilities(&caps)?;
        let surface_format = choose_surface_format(&formats)?;
        let extent = choose_extent(&caps, width, height);
        let image_count = choose_image_count(&caps, self.desired_image_count);
        let present_mode = choose_present_mode(&present_modes, self.requested_present_mode);

        log::info!(
            "Surface format {:?} / {:?}, present mode {:?}, {} images requested",
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        let queue_families = [self.context.queue_family];
        let old_swapchain = self.swapchain;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .call("vkCreateSwapchainKHR")?;

        // The old chain is retired either way once a new one exists
        self.destroy_chain();
        self.swapchain = swapchain;
        self.format = surface_format.format;
        self.extent = extent;

        self.images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
            .call("vkGetSwapchainImagesKHR")?;

        log::info!("Created swapchain with {} images", self.images.len());

        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { self.context.device.create_image_view(&create_info, None) }
                .call("vkCreateImageView")?;
            self.image_views.push(view);
        }

        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering; returns (index, suboptimal)
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> RenderResult<(u32, bool)> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok(acquired) => Ok(acquired),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                Err(RenderError::Timeout("swapchain image"))
            }
            Err(result) => Err(RenderError::Vulkan {
                call: "vkAcquireNextImageKHR",
                result,
            }),
        }
    }

    /// Present rendered image to screen; returns whether the chain is suboptimal
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> RenderResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
            Err(result) => Err(RenderError::Vulkan {
                call: "vkQueuePresentKHR",
                result,
            }),
        }
    }

    fn destroy_chain(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.context.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_chain();
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

/// Hard preconditions on the surface; anything else is unsupported
pub fn check_surface_capabilities(caps: &vk::SurfaceCapabilitiesKHR) -> RenderResult<()> {
    if !caps
        .supported_composite_alpha
        .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
    {
        return Err(RenderError::SurfaceUnsupported(
            "opaque composite alpha".to_string(),
        ));
    }
    if !caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        return Err(RenderError::SurfaceUnsupported(
            "identity transform".to_string(),
        ));
    }
    if !caps
        .supported_usage_flags
        .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
    {
        return Err(RenderError::SurfaceUnsupported(
            "color attachment usage".to_string(),
        ));
    }
    Ok(())
}

/// First reported format, or the default when the surface accepts anything
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> RenderResult<vk::SurfaceFormatKHR> {
    let first = *formats.first().ok_or(RenderError::NoValidFormat)?;
    if first.format == vk::Format::UNDEFINED {
        return Ok(vk::SurfaceFormatKHR {
            format: DEFAULT_FORMAT,
            color_space: first.color_space,
        });
    }
    Ok(first)
}

/// Window size clamped to the surface limits. A zero-sized window falls
/// back to the extent the surface reports.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if width == 0 || height == 0 {
        return if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            caps.min_image_extent
        };
    }

    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// At least `desired` and the surface minimum; `max_image_count == 0` means unbounded
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let count = desired.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// FIFO is the only mode every surface must offer
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        if requested != vk::PresentModeKHR::FIFO {
            log::warn!("Present mode {:?} not offered, using FIFO", requested);
        }
        vk::PresentModeKHR::FIFO
    }
}
