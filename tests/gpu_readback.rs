// Headless checks against a real Vulkan device.
//
// Each test prints a notice and returns early when no device (or, for the
// render test, no compiled shader) is available.

use ash::vk;
use glam::{Mat4, Vec4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use render_box::backend::buffer::{find_memory_type, Buffer, UniformRing, HOST_MEMORY};
use render_box::backend::command::{cmd_transition_image, CommandPool};
use render_box::backend::descriptor::{
    buffer_binding, BufferWrite, DescriptorAllocation, DescriptorSetLayout,
};
use render_box::backend::pipeline::{
    full_viewport, Framebuffers, GraphicsPipeline, PipelineLayout, RenderPass,
};
use render_box::backend::swapchain::DEFAULT_FORMAT;
use render_box::backend::sync::Fence;
use render_box::backend::GpuContext;
use render_box::error::RenderError;
use render_box::renderer::FrameUniforms;

const TIMEOUT_NS: u64 = 5_000_000_000;
const TARGET_SIZE: u32 = 4;

fn context() -> Option<Arc<GpuContext>> {
    match GpuContext::new("render-box-tests", &[], false) {
        Ok(context) => Some(context),
        Err(e) => {
            println!("skipping: no usable Vulkan device ({})", e);
            None
        }
    }
}

fn compiled_shader(name: &str) -> Option<PathBuf> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("shaders")
        .join(format!("{}.spv", name));
    if path.exists() {
        Some(path)
    } else {
        println!("skipping: {:?} was not compiled", path);
        None
    }
}

/// Device-local color image that can be rendered to and copied out
struct OffscreenImage {
    image: vk::Image,
    view: vk::ImageView,
    memory: vk::DeviceMemory,
    context: Arc<GpuContext>,
}

impl OffscreenImage {
    fn new(context: &Arc<GpuContext>, extent: vk::Extent2D) -> Self {
        let device = &context.device;
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEFAULT_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&image_info, None) }.unwrap();

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            &context.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { device.allocate_memory(&alloc_info, None) }.unwrap();
        unsafe { device.bind_image_memory(image, memory, 0) }.unwrap();

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEFAULT_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { device.create_image_view(&view_info, None) }.unwrap();

        Self {
            image,
            view,
            memory,
            context: Arc::clone(context),
        }
    }
}

impl Drop for OffscreenImage {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

#[test]
fn fragment_shader_sees_the_uniform_written_by_the_host() {
    let Some(context) = context() else { return };
    let (Some(vertex_shader), Some(fragment_shader)) =
        (compiled_shader("triangle.vert"), compiled_shader("triangle.frag"))
    else {
        return;
    };

    let extent = vk::Extent2D {
        width: TARGET_SIZE,
        height: TARGET_SIZE,
    };
    let target = OffscreenImage::new(&context, extent);
    let render_pass = RenderPass::new(&context, DEFAULT_FORMAT).unwrap();
    let framebuffers = Framebuffers::new(&context, &render_pass, &[target.view], extent).unwrap();

    let set_layout = DescriptorSetLayout::new(
        &context,
        &[buffer_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )],
    )
    .unwrap();
    let descriptors = DescriptorAllocation::new(&context, &set_layout, 2).unwrap();
    let size = std::mem::size_of::<FrameUniforms>() as vk::DeviceSize;
    let ring = UniformRing::new(&context, 2, size, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
    let writes: Vec<BufferWrite> = ring
        .slots()
        .iter()
        .enumerate()
        .map(|(set, slot)| BufferWrite {
            set,
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            buffer: slot.buffer,
            offset: 0,
            range: slot.size,
        })
        .collect();
    descriptors.update(&writes).unwrap();

    let pipeline_layout = PipelineLayout::new(&context, &[set_layout.handle]).unwrap();
    let pipeline = GraphicsPipeline::new(
        &context,
        &render_pass,
        full_viewport(extent),
        &pipeline_layout,
        &vertex_shader,
        &fragment_shader,
    )
    .unwrap();

    // Exact in UNORM8: 51, 102, 204, 255
    let tint = Vec4::new(0.2, 0.4, 0.8, 1.0);
    let uniforms = FrameUniforms {
        model: Mat4::IDENTITY,
        tint,
        time: 0.0,
        _pad: [0.0; 3],
    };
    // Slot 1 carries the tint; slot 0 holds something else to catch a wrong binding
    ring.slots()[0].write(&FrameUniforms::at(1.0)).unwrap();
    ring.slots()[1].write(&uniforms).unwrap();

    let pixel_bytes = (TARGET_SIZE * TARGET_SIZE * 4) as vk::DeviceSize;
    let readback = Buffer::new(
        &context,
        pixel_bytes,
        vk::BufferUsageFlags::TRANSFER_DST,
        HOST_MEMORY,
    )
    .unwrap();

    let pool = CommandPool::new(&context).unwrap();
    pool.run_one_shot(TIMEOUT_NS, |device, command_buffer| {
        cmd_transition_image(
            device,
            command_buffer,
            target.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 0.0],
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass.handle)
            .framebuffer(framebuffers.handles[0])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.handle,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout.handle,
                0,
                &[descriptors.sets[1]],
                &[],
            );
            device.cmd_draw(command_buffer, 3, 1, 0, 0);
            device.cmd_end_render_pass(command_buffer);
        }

        cmd_transition_image(
            device,
            command_buffer,
            target.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        let to_host = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .build();
        unsafe {
            device.cmd_copy_image_to_buffer(
                command_buffer,
                target.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback.handle,
                &[region],
            );
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[to_host],
                &[],
                &[],
            );
        }
    })
    .unwrap();

    let pixels = readback.contents().unwrap();
    let pixel = |x: u32, y: u32| {
        let at = ((y * TARGET_SIZE + x) * 4) as usize;
        [pixels[at], pixels[at + 1], pixels[at + 2], pixels[at + 3]]
    };

    // The centre is covered by the triangle, the top-left corner is not
    let expected = [51u8, 102, 204, 255];
    let centre = pixel(TARGET_SIZE / 2, TARGET_SIZE / 2);
    for (got, want) in centre.iter().zip(expected) {
        assert!(
            got.abs_diff(want) <= 1,
            "centre pixel {:?}, expected {:?}",
            centre,
            expected
        );
    }
    assert_eq!(pixel(0, 0), [0, 0, 0, 0]);
}

#[test]
fn uniform_writes_are_visible_to_the_gpu() {
    let Some(context) = context() else { return };

    let size = std::mem::size_of::<FrameUniforms>() as vk::DeviceSize;
    let ring = UniformRing::new(
        &context,
        3,
        size,
        vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
    )
    .unwrap();
    assert_eq!(ring.slots().len(), 3);

    let readback = Buffer::new(
        &context,
        size * 3,
        vk::BufferUsageFlags::TRANSFER_DST,
        HOST_MEMORY,
    )
    .unwrap();

    for (i, slot) in ring.slots().iter().enumerate() {
        slot.write(&FrameUniforms::at(0.25 * (i + 1) as f32)).unwrap();
    }

    let pool = CommandPool::new(&context).unwrap();
    pool.run_one_shot(TIMEOUT_NS, |device, command_buffer| {
        for (i, slot) in ring.slots().iter().enumerate() {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: size * i as vk::DeviceSize,
                size,
            };
            unsafe { device.cmd_copy_buffer(command_buffer, slot.buffer, readback.handle, &[region]) };
        }
    })
    .unwrap();

    let bytes = readback.contents().unwrap();
    for i in 0..3 {
        let start = i * size as usize;
        let uniforms: FrameUniforms =
            bytemuck::pod_read_unaligned(&bytes[start..start + size as usize]);
        assert_eq!(uniforms.time, 0.25 * (i + 1) as f32);
    }
}

#[test]
fn signaled_fence_can_be_waited_twice() {
    let Some(context) = context() else { return };

    let fence = Fence::new(&context, true).unwrap();
    fence.wait(TIMEOUT_NS).unwrap();
    fence.wait(TIMEOUT_NS).unwrap();
    assert!(fence.is_signaled().unwrap());

    fence.reset().unwrap();
    assert!(!fence.is_signaled().unwrap());
    assert!(matches!(
        fence.wait(1_000_000),
        Err(RenderError::Timeout(_))
    ));
}

#[test]
fn memory_type_lookup_is_stable_on_a_real_device() {
    let Some(context) = context() else { return };

    let first = find_memory_type(&context.memory_properties, u32::MAX, HOST_MEMORY).unwrap();
    let again = find_memory_type(&context.memory_properties, u32::MAX, HOST_MEMORY).unwrap();
    assert_eq!(first, again);
    assert!(first < context.memory_properties.memory_type_count);
}

#[test]
fn writes_past_the_end_are_rejected() {
    let Some(context) = context() else { return };

    let buffer = Buffer::with_data(&context, vk::BufferUsageFlags::STORAGE_BUFFER, &[1, 2, 3, 4])
        .unwrap();
    assert_eq!(&buffer.contents().unwrap()[..4], &[1, 2, 3, 4]);
    assert!(matches!(
        buffer.write(2, &[0; 4]),
        Err(RenderError::BufferOverflow { len: 6, capacity: 4 })
    ));
}

#[test]
fn empty_descriptor_allocation_creates_no_pool() {
    let Some(context) = context() else { return };

    let layout = DescriptorSetLayout::new(
        &context,
        &[buffer_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX,
        )],
    )
    .unwrap();
    let allocation = DescriptorAllocation::new(&context, &layout, 0).unwrap();
    assert_eq!(allocation.pool, vk::DescriptorPool::null());
    assert!(allocation.sets.is_empty());
    allocation.update(&[]).unwrap();
}

#[test]
fn timed_out_one_shot_leaves_the_pool_usable() {
    let Some(context) = context() else { return };

    let size: vk::DeviceSize = 64 << 20;
    let target = Buffer::new(
        &context,
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .unwrap();
    let pool = CommandPool::new(&context).unwrap();

    // A zero timeout either finds the work done or gives up on it
    let result = pool.run_one_shot(0, |device, command_buffer| {
        for pass in 0..16u32 {
            unsafe { device.cmd_fill_buffer(command_buffer, target.handle, 0, vk::WHOLE_SIZE, pass) };
        }
    });
    assert!(matches!(result, Ok(()) | Err(RenderError::Timeout(_))));

    pool.run_one_shot(TIMEOUT_NS, |device, command_buffer| unsafe {
        device.cmd_fill_buffer(command_buffer, target.handle, 0, vk::WHOLE_SIZE, 0)
    })
    .unwrap();
}
