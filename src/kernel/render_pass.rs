use ash::prelude::VkResult;
use ash::vk;

use crate::device::device::DeviceContext;
use crate::objects::multisample::MultisampleTarget;
use crate::objects::swapchain::Swapchain;

/// Builds the main render pass for the swapchain color format and the depth
/// format.
///
/// With multisampling the pass renders into the multisampled color target and
/// resolves into the presentable image; without it the presentable image is
/// the color attachment itself.
pub fn create_render_pass(device: &DeviceContext, color_format: vk::Format, depth_format: vk::Format) -> VkResult<vk::RenderPass> {
    let samples = device.get_sample_count();
    let multisampled = device.is_multisampling_enabled();

    let mut attachments = Vec::new();
    attachments.push(vk::AttachmentDescription {
        format: color_format,
        samples,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: if multisampled { vk::AttachmentStoreOp::DONT_CARE } else { vk::AttachmentStoreOp::STORE },
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        },
        ..Default::default()
    });

    if multisampled {
        // Resolve target, the presentable image
        attachments.push(vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        });
    }

    attachments.push(vk::AttachmentDescription {
        format: depth_format,
        samples,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
    });

    let color_reference = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let resolve_reference = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_reference = vk::AttachmentReference {
        attachment: if multisampled { 2 } else { 1 },
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_reference))
        .depth_stencil_attachment(&depth_reference);
    if multisampled {
        subpass = subpass.resolve_attachments(std::slice::from_ref(&resolve_reference));
    }
    // The attachment references stay alive for the whole function
    let subpass = subpass.build();

    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    };

    let info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments.as_slice())
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(std::slice::from_ref(&dependency));

    unsafe {
        device.vk().create_render_pass(&info, None)
    }
}

/// Creates one framebuffer per swapchain image, sized to the current surface
/// extent. The attachment order must match [`create_render_pass`].
pub fn create_framebuffers(
    device: &DeviceContext,
    render_pass: vk::RenderPass,
    swapchain: &Swapchain,
    multisample: &MultisampleTarget,
) -> VkResult<Vec<vk::Framebuffer>> {
    let extent = swapchain.get_surface_extent();
    let depth_view = multisample.get_depth_view();

    let mut framebuffers = Vec::with_capacity(swapchain.get_buffers().len());
    for buffer in swapchain.get_buffers() {
        let attachments: Vec<vk::ImageView> = match multisample.get_color_view() {
            Some(color_view) => vec![color_view, buffer.view, depth_view],
            None => vec![buffer.view, depth_view],
        };

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments.as_slice())
            .width(extent.x)
            .height(extent.y)
            .layers(1);

        let framebuffer = match unsafe { device.vk().create_framebuffer(&info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                for framebuffer in framebuffers {
                    unsafe { device.vk().destroy_framebuffer(framebuffer, None) };
                }
                return Err(err);
            }
        };
        framebuffers.push(framebuffer);
    }

    Ok(framebuffers)
}

pub fn destroy_framebuffers(device: &DeviceContext, framebuffers: &mut Vec<vk::Framebuffer>) {
    for framebuffer in framebuffers.drain(..) {
        unsafe {
            device.vk().destroy_framebuffer(framebuffer, None);
        }
    }
}
