// Renderer - owns every GPU object and implements the frame loop's device side
//
// Field order is teardown order. Per-slot resources go first (pipeline down
// to command buffers), then mesh buffers, semaphores, command pool,
// swapchain (views, chain, surface) and finally the context, which every
// wrapper keeps alive through its Arc until the last one is gone.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::ffi::c_char;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::buffer::{Buffer, UniformRing};
use crate::backend::command::{begin_one_time, cmd_transition_image, CommandBuffers, CommandPool};
use crate::backend::descriptor::{
    buffer_binding, BufferWrite, DescriptorAllocation, DescriptorSetLayout,
};
use crate::backend::pipeline::{
    full_viewport, Framebuffers, GraphicsPipeline, PipelineLayout, RenderPass,
};
use crate::backend::query::GpuTimer;
use crate::backend::swapchain::{Swapchain, SurfaceTarget};
use crate::backend::sync::{Fence, FrameSemaphores};
use crate::backend::GpuContext;
use crate::config::Config;
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::frame_loop::{AcquiredImage, ClaimedSlot, FrameDevice, FrameInput};
use crate::frame_slots::FrameSlots;
use crate::mesh::Mesh;

/// Per-frame uniform block (std140: mat4, vec4, float)
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniforms {
    pub model: Mat4,
    pub tint: Vec4,
    pub time: f32,
    pub _pad: [f32; 3],
}

impl FrameUniforms {
    /// Rotation about Z and a slowly cycling tint, both driven by `time`
    pub fn at(time: f32) -> Self {
        let phase = std::f32::consts::TAU / 3.0;
        let tint = Vec4::new(
            0.5 + 0.5 * time.sin(),
            0.5 + 0.5 * (time + phase).sin(),
            0.5 + 0.5 * (time + 2.0 * phase).sin(),
            1.0,
        );
        Self {
            model: Mat4::from_rotation_z(time),
            tint,
            time,
            _pad: [0.0; 3],
        }
    }
}

/// Renderer knobs taken from the config file
#[derive(Clone, Debug)]
pub struct RendererSettings {
    pub app_name: String,
    pub validation: bool,
    pub abort_on_validation_error: bool,
    pub gpu_timing: bool,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub wait_timeout_ns: u64,
    pub vertex_shader: PathBuf,
    pub mesh_vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub mesh: Option<PathBuf>,
}

impl RendererSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            validation: config.debug.validation_layers,
            abort_on_validation_error: config.debug.abort_on_validation_error,
            gpu_timing: config.debug.gpu_timing,
            image_count: config.graphics.image_count.max(2),
            present_mode: config.present_mode(),
            clear_color: config.graphics.clear_color,
            wait_timeout_ns: config.wait_timeout_ns(),
            vertex_shader: config.assets.vertex_shader.clone(),
            mesh_vertex_shader: config.assets.mesh_vertex_shader.clone(),
            fragment_shader: config.assets.fragment_shader.clone(),
            mesh: config.assets.mesh.clone(),
        }
    }
}

/// Mesh data pulled by the vertex shader from storage buffers
struct MeshBuffers {
    vertices: Buffer,
    indices: Buffer,
    index_count: u32,
}

impl MeshBuffers {
    fn upload(context: &Arc<GpuContext>, mesh: &Mesh) -> RenderResult<Self> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        Ok(Self {
            vertices: Buffer::with_data(context, usage, mesh.vertex_bytes())?,
            indices: Buffer::with_data(context, usage, mesh.index_bytes())?,
            index_count: mesh.index_count(),
        })
    }
}

/// Everything sized by the swapchain, rebuilt on recreation
struct FrameResources {
    pipeline: GraphicsPipeline,
    pipeline_layout: PipelineLayout,
    _uniforms: UniformRing,
    _descriptors: DescriptorAllocation,
    _set_layout: DescriptorSetLayout,
    _framebuffers: Framebuffers,
    render_pass: RenderPass,
    fences: Vec<Fence>,
    timer: Option<GpuTimer>,
    _command_buffers: CommandBuffers,
    slots: FrameSlots,
    extent: vk::Extent2D,
}

impl FrameResources {
    fn new(
        context: &Arc<GpuContext>,
        swapchain: &Swapchain,
        command_pool: &CommandPool,
        mesh: Option<&MeshBuffers>,
        settings: &RendererSettings,
    ) -> RenderResult<Self> {
        let count = swapchain.image_count();

        let command_buffers = command_pool.allocate(count)?;
        let timer = if settings.gpu_timing {
            GpuTimer::new(context, count)?
        } else {
            None
        };
        let fences = (0..count)
            .map(|_| Fence::new(context, true))
            .collect::<RenderResult<Vec<_>>>()?;

        let render_pass = RenderPass::new(context, swapchain.format)?;
        let framebuffers = Framebuffers::new(
            context,
            &render_pass,
            &swapchain.image_views,
            swapchain.extent,
        )?;

        let mut bindings = vec![buffer_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )];
        if mesh.is_some() {
            bindings.push(buffer_binding(
                1,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            ));
            bindings.push(buffer_binding(
                2,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            ));
        }
        let set_layout = DescriptorSetLayout::new(context, &bindings)?;
        let descriptors = DescriptorAllocation::new(context, &set_layout, count)?;

        let uniforms = UniformRing::new(
            context,
            count,
            std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;

        let mut writes = Vec::with_capacity(count * bindings.len());
        for (set, uniform) in uniforms.slots().iter().enumerate() {
            writes.push(BufferWrite {
                set,
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                buffer: uniform.buffer,
                offset: 0,
                range: uniform.size,
            });
            if let Some(mesh) = mesh {
                for (binding, buffer) in [(1, &mesh.vertices), (2, &mesh.indices)] {
                    writes.push(BufferWrite {
                        set,
                        binding,
                        descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                        buffer: buffer.handle,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    });
                }
            }
        }
        descriptors.update(&writes)?;

        let pipeline_layout = PipelineLayout::new(context, &[set_layout.handle])?;
        let vertex_shader = if mesh.is_some() {
            &settings.mesh_vertex_shader
        } else {
            &settings.vertex_shader
        };
        let pipeline = GraphicsPipeline::new(
            context,
            &render_pass,
            full_viewport(swapchain.extent),
            &pipeline_layout,
            vertex_shader,
            &settings.fragment_shader,
        )?;

        let fence_handles: Vec<vk::Fence> = fences.iter().map(|f| f.handle).collect();
        let slots = FrameSlots::assemble(
            &swapchain.images,
            &framebuffers.handles,
            &command_buffers.handles,
            &fence_handles,
            uniforms.slots(),
            &descriptors.sets,
        )?;

        log::info!(
            "Built {} frame slots at {}x{}",
            slots.len(),
            swapchain.extent.width,
            swapchain.extent.height
        );

        Ok(Self {
            pipeline,
            pipeline_layout,
            _uniforms: uniforms,
            _descriptors: descriptors,
            _set_layout: set_layout,
            _framebuffers: framebuffers,
            render_pass,
            fences,
            timer,
            _command_buffers: command_buffers,
            slots,
            extent: swapchain.extent,
        })
    }
}

pub struct Renderer {
    frame: Option<FrameResources>,
    mesh: Option<MeshBuffers>,
    semaphores: FrameSemaphores,
    command_pool: CommandPool,
    swapchain: Swapchain,
    context: Arc<GpuContext>,
    settings: RendererSettings,
}

impl Renderer {
    pub fn new(
        settings: RendererSettings,
        surface_extensions: &[*const c_char],
        target: &SurfaceTarget,
    ) -> RenderResult<Self> {
        let context = GpuContext::new(&settings.app_name, surface_extensions, settings.validation)?;
        Self::with_context(context, settings, target)
    }

    pub fn with_context(
        context: Arc<GpuContext>,
        settings: RendererSettings,
        target: &SurfaceTarget,
    ) -> RenderResult<Self> {
        let swapchain = Swapchain::new(
            Arc::clone(&context),
            target,
            settings.image_count,
            settings.present_mode,
        )?;
        let command_pool = CommandPool::new(&context)?;
        let semaphores = FrameSemaphores::new(&context)?;

        let mesh = match &settings.mesh {
            Some(path) => Some(MeshBuffers::upload(&context, &Mesh::load(path)?)?),
            None => None,
        };

        let frame = FrameResources::new(
            &context,
            &swapchain,
            &command_pool,
            mesh.as_ref(),
            &settings,
        )?;

        Ok(Self {
            frame: Some(frame),
            mesh,
            semaphores,
            command_pool,
            swapchain,
            context,
            settings,
        })
    }

    fn frame(&self) -> RenderResult<&FrameResources> {
        self.frame.as_ref().ok_or(RenderError::SwapchainOutOfDate)
    }
}

impl FrameDevice for Renderer {
    fn image_count(&self) -> usize {
        self.frame.as_ref().map_or(0, |frame| frame.slots.len())
    }

    fn acquire_next_image(&mut self) -> RenderResult<AcquiredImage> {
        let (index, suboptimal) = self
            .swapchain
            .acquire_next_image(self.settings.wait_timeout_ns, self.semaphores.acquire.handle)?;
        Ok(AcquiredImage { index, suboptimal })
    }

    fn wait_for_slot(&mut self, index: u32) -> RenderResult<Option<f32>> {
        let timeout = self.settings.wait_timeout_ns;
        let frame = self.frame()?;
        let count = frame.fences.len();
        let fence = frame
            .fences
            .get(index as usize)
            .ok_or(RenderError::InvalidImageIndex { index, count })?;

        fence.wait(timeout)?;
        fence.reset()?;

        match &frame.timer {
            Some(timer) => timer.read(index as usize),
            None => Ok(None),
        }
    }

    fn record(&mut self, slot: &ClaimedSlot, input: &FrameInput) -> RenderResult<()> {
        let draw_count = self.mesh.as_ref().map_or(3, |mesh| mesh.index_count);
        let clear_color = self.settings.clear_color;
        let device = &self.context.device;

        let frame = self.frame.as_mut().ok_or(RenderError::SwapchainOutOfDate)?;
        let index = slot.slot();
        let bundle = frame.slots.get_mut(index)?;
        let previous_layout = bundle.begin_render();
        let target = *bundle;
        let command_buffer = target.command_buffer;

        // Safe to overwrite: this slot's fence was waited on before we got here
        target.uniform.write(&FrameUniforms::at(input.time))?;

        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .call("vkResetCommandBuffer")?;
        begin_one_time(device, command_buffer)?;

        if let Some(timer) = &frame.timer {
            timer.cmd_begin(command_buffer, index);
        }

        cmd_transition_image(
            device,
            command_buffer,
            target.image,
            previous_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(frame.render_pass.handle)
            .framebuffer(target.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: frame.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                frame.pipeline.handle,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                frame.pipeline_layout.handle,
                0,
                &[target.descriptor_set],
                &[],
            );
            device.cmd_draw(command_buffer, draw_count, 1, 0, 0);
            device.cmd_end_render_pass(command_buffer);
        }

        cmd_transition_image(
            device,
            command_buffer,
            target.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        if let Some(timer) = &mut frame.timer {
            timer.cmd_end(command_buffer, index);
        }

        unsafe { device.end_command_buffer(command_buffer) }.call("vkEndCommandBuffer")
    }

    fn submit(&mut self, slot: &ClaimedSlot) -> RenderResult<()> {
        let frame = self.frame()?;
        let target = frame.slots.get(slot.slot())?;

        let wait_semaphores = [self.semaphores.acquire.handle];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.semaphores.release.handle];
        let command_buffers = [target.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.context
                .device
                .queue_submit(self.context.queue, &[submit_info], target.fence)
        }
        .call("vkQueueSubmit")
    }

    fn present(&mut self, slot: ClaimedSlot) -> RenderResult<bool> {
        let suboptimal = self.swapchain.present(
            self.context.queue,
            slot.index(),
            self.semaphores.release.handle,
        )?;

        if self.settings.abort_on_validation_error {
            self.context.validation().check()?;
        }
        Ok(suboptimal)
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.context.wait_idle()?;

        // Nothing may reference the old images when the chain is replaced
        self.frame = None;
        self.swapchain.recreate(width, height)?;

        // A failed acquire/present can leave a semaphore with a pending signal
        self.semaphores = FrameSemaphores::new(&self.context)?;

        self.frame = Some(FrameResources::new(
            &self.context,
            &self.swapchain,
            &self.command_pool,
            self.mesh.as_ref(),
            &self.settings,
        )?);
        Ok(())
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.context.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        if let Err(e) = self.context.wait_idle() {
            log::error!("Device did not go idle before teardown: {}", e);
        }
    }
}
