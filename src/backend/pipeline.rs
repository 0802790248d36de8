// Graphics pipeline creation and management
//
// One fixed pipeline: no vertex input (vertices are pulled from storage
// buffers or generated in the shader), triangle list, back-face culling,
// opaque single color attachment, no depth.

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::shader::ShaderModule;
use super::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Single-subpass pass with one color attachment.
///
/// The attachment stays in COLOR_ATTACHMENT_OPTIMAL across the pass; the
/// frame's own barriers move the image in from and out to presentation.
pub struct RenderPass {
    pub handle: vk::RenderPass,
    context: Arc<GpuContext>,
}

impl RenderPass {
    pub fn new(context: &Arc<GpuContext>, format: vk::Format) -> RenderResult<Self> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachments = &[color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .build();

        let attachments = &[color_attachment];
        let subpasses = &[subpass];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses);

        let handle = unsafe { context.device.create_render_pass(&render_pass_info, None) }
            .call("vkCreateRenderPass")?;

        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_render_pass(self.handle, None) };
    }
}

/// One framebuffer per swapchain image view
pub struct Framebuffers {
    pub handles: Vec<vk::Framebuffer>,
    context: Arc<GpuContext>,
}

impl Framebuffers {
    pub fn new(
        context: &Arc<GpuContext>,
        render_pass: &RenderPass,
        image_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let mut framebuffers = Self {
            handles: Vec::with_capacity(image_views.len()),
            context: Arc::clone(context),
        };

        for &image_view in image_views {
            let attachments = &[image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.handle)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer =
                unsafe { context.device.create_framebuffer(&framebuffer_info, None) }
                    .call("vkCreateFramebuffer")?;
            framebuffers.handles.push(framebuffer);
        }

        Ok(framebuffers)
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        for &framebuffer in &self.handles {
            unsafe { self.context.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

pub struct PipelineLayout {
    pub handle: vk::PipelineLayout,
    context: Arc<GpuContext>,
}

impl PipelineLayout {
    pub fn new(
        context: &Arc<GpuContext>,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RenderResult<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);

        let handle = unsafe { context.device.create_pipeline_layout(&layout_info, None) }
            .call("vkCreatePipelineLayout")?;

        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_pipeline_layout(self.handle, None)
        };
    }
}

/// Full-target viewport with the usual 0..1 depth range
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Compiled pipeline plus the modules it was built from.
///
/// Field order is drop order: pipeline, then fragment, then vertex module.
pub struct GraphicsPipeline {
    pub handle: vk::Pipeline,
    _fragment: ShaderModule,
    _vertex: ShaderModule,
    context: Arc<GpuContext>,
}

impl GraphicsPipeline {
    pub fn new(
        context: &Arc<GpuContext>,
        render_pass: &RenderPass,
        viewport: vk::Viewport,
        layout: &PipelineLayout,
        vertex_shader: &Path,
        fragment_shader: &Path,
    ) -> RenderResult<Self> {
        let vertex = ShaderModule::load(context, vertex_shader)?;
        let fragment = ShaderModule::load(context, fragment_shader)?;

        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex.handle)
            .name(ENTRY_POINT)
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment.handle)
            .name(ENTRY_POINT)
            .build();

        let shader_stages = &[vert_stage, frag_stage];

        // Attribute-less: vertex data is fetched by index in the shader
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: viewport.width as u32,
                height: viewport.height as u32,
            },
        };

        let viewports = &[viewport];
        let scissors = &[scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(viewports)
            .scissors(scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // Opaque: every channel written, no blending
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .layout(layout.handle)
            .render_pass(render_pass.handle)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            context.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .map_err(|(_, result)| RenderError::Vulkan {
            call: "vkCreateGraphicsPipelines",
            result,
        })?;

        let handle = pipelines
            .first()
            .copied()
            .ok_or(RenderError::Vulkan {
                call: "vkCreateGraphicsPipelines",
                result: vk::Result::ERROR_UNKNOWN,
            })?;

        log::info!("Graphics pipeline created");

        Ok(Self {
            handle,
            _fragment: fragment,
            _vertex: vertex,
            context: Arc::clone(context),
        })
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_pipeline(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_matches_extent() {
        let viewport = full_viewport(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        assert_eq!(viewport.width, 1024.0);
        assert_eq!(viewport.height, 768.0);
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
    }
}
