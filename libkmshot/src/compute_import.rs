//! External-import compute path (§4.E): bring a tiled scanout buffer into a
//! general-purpose GPU compute context via external-memory/dmabuf with an
//! explicit format-modifier plane layout, blit tiled -> linear, optionally
//! invoke the HDR tone-mapping kernel, then map the result for CPU readback.
//!
//! Layered instance -> physical device -> logical device -> queue the way
//! the retrieved `wgpu-hal/vulkan/mod.rs` reference file structures its own
//! Vulkan backend, scaled down to the single compute queue this tool needs.

use std::ffi::CStr;
use std::os::fd::{IntoRawFd, OwnedFd};

use ash::vk;
use tracing::debug;

use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::kms::FramebufferDescriptor;
use crate::shim::{self, ErrorKind};
use crate::tonemap::{ToneMapParams, ToneMapPipeline};

const INSTANCE_EXTENSIONS: [&CStr; 2] = [
    ash::khr::get_physical_device_properties2::NAME,
    ash::khr::external_memory_capabilities::NAME,
];

/// The "three" device extensions the discovery step in §4.E requires: FD
/// import implies `VK_KHR_external_memory`, so it is enabled alongside
/// rather than counted separately.
const DEVICE_EXTENSIONS: [&CStr; 3] = [
    ash::khr::external_memory_fd::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::ext::image_drm_format_modifier::NAME,
];

fn vk_err(what: &'static str, result: vk::Result) -> Error {
    shim::build_error(what, result.as_raw(), ErrorKind::GpuExecution)
}

fn import_err(what: &'static str, result: vk::Result) -> Error {
    shim::build_error(what, result.as_raw(), ErrorKind::Import)
}

/// Instance + physical device + logical device + single queue + command
/// pool, matching the "Compute-API device context" in the data model.
pub struct ComputeContext {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
}

impl ComputeContext {
    pub fn new() -> Result<ComputeContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|_| Error::CapabilityUnavailable("vulkan loader"))?;

        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_1);
        let instance_ext_ptrs: Vec<*const i8> =
            INSTANCE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&instance_ext_ptrs);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| vk_err("vkCreateInstance", e))?;

        let physical_devices =
            unsafe { instance.enumerate_physical_devices() }.map_err(|e| vk_err("vkEnumeratePhysicalDevices", e))?;

        let physical_device = physical_devices
            .into_iter()
            .find(|pd| supports_required_extensions(&instance, *pd))
            .ok_or(Error::CapabilityUnavailable("external-memory/dmabuf/modifier Vulkan device"))?;

        let queue_family_index = pick_queue_family(&instance, physical_device)
            .ok_or(Error::CapabilityUnavailable("graphics+transfer+compute queue family"))?;

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        let device_ext_ptrs: Vec<*const i8> = DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&device_ext_ptrs);
        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| vk_err("vkCreateDevice", e))?;

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| vk_err("vkCreateCommandPool", e))?;

        Ok(ComputeContext {
            entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            command_pool,
        })
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers =
            unsafe { self.device.allocate_command_buffers(&alloc_info) }.map_err(|e| vk_err("vkAllocateCommandBuffers", e))?;
        Ok(buffers[0])
    }

    fn submit_and_wait_idle(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let submit_info = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&command_buffer));
        unsafe {
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit_info), vk::Fence::null())
                .map_err(|e| vk_err("vkQueueSubmit", e))?;
            self.device
                .queue_wait_idle(self.queue)
                .map_err(|e| vk_err("vkQueueWaitIdle", e))?;
        }
        Ok(())
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        let _ = &self.entry;
        let _ = self.physical_device;
        let _ = self.queue_family_index;
    }
}

fn supports_required_extensions(instance: &ash::Instance, pd: vk::PhysicalDevice) -> bool {
    let Ok(props) = (unsafe { instance.enumerate_device_extension_properties(pd) }) else {
        return false;
    };
    let names: Vec<&CStr> = props
        .iter()
        .map(|p| p.extension_name_as_c_str().unwrap_or_default())
        .collect();
    DEVICE_EXTENSIONS
        .iter()
        .all(|required| names.iter().any(|n| n == required))
}

fn pick_queue_family(instance: &ash::Instance, pd: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
    families
        .iter()
        .position(|f| {
            f.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
}

/// One imported external image plus its backing device memory, released
/// together on `Drop` so a failure anywhere after construction (e.g. the
/// next stage's image create, or command buffer submission) still frees
/// both rather than leaking the Vulkan handles.
struct ExternalImage {
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
}

impl Drop for ExternalImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

struct LinearImage {
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
}

impl Drop for LinearImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// A `vk::ImageView` released on `Drop`, for the same reason as
/// [`ExternalImage`]/[`LinearImage`].
struct ImageViewGuard {
    device: ash::Device,
    view: vk::ImageView,
}

impl ImageViewGuard {
    fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageViewGuard {
    fn drop(&mut self) {
        unsafe { self.device.destroy_image_view(self.view, None) };
    }
}

/// Run the external-import compute path for `fb`, using `export_fd` to get
/// a dmabuf FD for the framebuffer's plane-0 handle (supplied by the
/// caller so this module does not need a direct DRM dependency), and
/// `params` for the HDR tone-map pass when `fb.format` is ABGR16161616.
///
/// Returns the final linear raster in `fb.format`'s 8-bit-per-channel
/// equivalent, row pitch included (the caller converts to RGB24 via
/// `format::convert_to_rgb24`).
pub fn acquire<F>(fb: &FramebufferDescriptor, export_fd: F, params: ToneMapParams) -> Result<(Vec<u8>, u32)>
where
    F: FnOnce(u32) -> Result<OwnedFd>,
{
    let ctx = ComputeContext::new()?;
    let dmabuf_fd = export_fd(fb.plane0().handle)?;

    let hdr = fb.format.is_hdr();
    let src_extent = vk::Extent3D {
        width: fb.width,
        height: fb.height,
        depth: 1,
    };

    let external_format = if hdr { vk::Format::R16G16B16A16_UNORM } else { vk::Format::R8G8B8A8_UNORM };
    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC;
    if hdr {
        usage |= vk::ImageUsageFlags::STORAGE;
    }

    let external_image = import_external_image(&ctx, fb, dmabuf_fd, external_format, src_extent, usage)?;

    let (linear_format, linear_usage) = if hdr {
        (vk::Format::R16G16B16A16_UNORM, vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::STORAGE)
    } else {
        (vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::TRANSFER_DST)
    };
    let linear_image = create_linear_image(&ctx, linear_format, src_extent, linear_usage)?;

    blit_tiled_to_linear(&ctx, external_image.image, linear_image.image, src_extent)?;

    // `external_image`/`linear_image` release their Vulkan handles via
    // `Drop` once they go out of scope below, on every return path.
    if hdr {
        tonemap_to_8bit(&ctx, &linear_image, src_extent, params)
    } else {
        readback(&ctx, linear_image.image, linear_image.memory)
    }
}

fn import_external_image(
    ctx: &ComputeContext,
    fb: &FramebufferDescriptor,
    dmabuf_fd: OwnedFd,
    format: vk::Format,
    extent: vk::Extent3D,
    usage: vk::ImageUsageFlags,
) -> Result<ExternalImage> {
    let plane0 = fb.plane0();
    let plane_layout = vk::SubresourceLayout {
        offset: plane0.offset as u64,
        size: (plane0.pitch as u64) * (fb.height as u64),
        row_pitch: plane0.pitch as u64,
        array_pitch: 0,
        depth_pitch: 0,
    };

    let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
        .drm_format_modifier(fb.modifier)
        .plane_layouts(std::slice::from_ref(&plane_layout));

    let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(extent)
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .push_next(&mut external_info)
        .push_next(&mut modifier_info);

    let image = unsafe { ctx.device.create_image(&image_info, None) }.map_err(|e| import_err("vkCreateImage", e))?;

    let mem_requirements = unsafe { ctx.device.get_image_memory_requirements(image) };
    let memory_type_index = mem_requirements.memory_type_bits.trailing_zeros();

    let mut import_fd_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(dmabuf_fd.into_raw_fd());

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(mem_requirements.size)
        .memory_type_index(memory_type_index)
        .push_next(&mut import_fd_info);

    let memory = match unsafe { ctx.device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { ctx.device.destroy_image(image, None) };
            return Err(import_err("vkAllocateMemory", e));
        }
    };
    if let Err(e) = unsafe { ctx.device.bind_image_memory(image, memory, 0) } {
        unsafe {
            ctx.device.destroy_image(image, None);
            ctx.device.free_memory(memory, None);
        }
        return Err(import_err("vkBindImageMemory", e));
    }

    debug!(
        "\timported dmabuf as external image: {}x{} modifier={:#x}",
        extent.width, extent.height, fb.modifier
    );

    Ok(ExternalImage { device: ctx.device.clone(), image, memory })
}

fn create_linear_image(
    ctx: &ComputeContext,
    format: vk::Format,
    extent: vk::Extent3D,
    usage: vk::ImageUsageFlags,
) -> Result<LinearImage> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(extent)
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::LINEAR)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { ctx.device.create_image(&image_info, None) }.map_err(|e| vk_err("vkCreateImage", e))?;

    let mem_requirements = unsafe { ctx.device.get_image_memory_requirements(image) };
    let memory_properties = unsafe { ctx.instance.get_physical_device_memory_properties(ctx.physical_device) };
    // HOST_COHERENT (not just HOST_VISIBLE) so the CPU readback in
    // `readback()` is guaranteed to see the TRANSFER-stage writes after
    // `queue_wait_idle` without an explicit memory-domain flush.
    let memory_type_index = (0..memory_properties.memory_type_count)
        .find(|&i| {
            mem_requirements.memory_type_bits & (1 << i) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT)
        })
        .ok_or_else(|| {
            unsafe { ctx.device.destroy_image(image, None) };
            Error::CapabilityUnavailable("host-visible, host-coherent memory type")
        })?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(mem_requirements.size)
        .memory_type_index(memory_type_index);
    let memory = match unsafe { ctx.device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { ctx.device.destroy_image(image, None) };
            return Err(vk_err("vkAllocateMemory", e));
        }
    };
    if let Err(e) = unsafe { ctx.device.bind_image_memory(image, memory, 0) } {
        unsafe {
            ctx.device.destroy_image(image, None);
            ctx.device.free_memory(memory, None);
        }
        return Err(vk_err("vkBindImageMemory", e));
    }

    Ok(LinearImage { device: ctx.device.clone(), image, memory })
}

fn blit_tiled_to_linear(ctx: &ComputeContext, src: vk::Image, dst: vk::Image, extent: vk::Extent3D) -> Result<()> {
    let command_buffer = ctx.allocate_command_buffer()?;
    let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        ctx.device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(|e| vk_err("vkBeginCommandBuffer", e))?;

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);

        let barriers = [
            vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .image(src)
                .subresource_range(subresource_range),
            vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .image(dst)
                .subresource_range(subresource_range),
        ];
        ctx.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &barriers,
        );

        let subresource_layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .layer_count(1);
        let region = vk::ImageCopy::default()
            .src_subresource(subresource_layers)
            .dst_subresource(subresource_layers)
            .extent(extent);
        ctx.device.cmd_copy_image(
            command_buffer,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );

        ctx.device
            .end_command_buffer(command_buffer)
            .map_err(|e| vk_err("vkEndCommandBuffer", e))?;
    }

    ctx.submit_and_wait_idle(command_buffer)?;
    unsafe {
        ctx.device
            .free_command_buffers(ctx.command_pool, std::slice::from_ref(&command_buffer));
    }
    Ok(())
}

fn create_image_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> Result<ImageViewGuard> {
    let subresource_range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(subresource_range);
    let view = unsafe { device.create_image_view(&info, None) }.map_err(|e| vk_err("vkCreateImageView", e))?;
    Ok(ImageViewGuard { device: device.clone(), view })
}

fn tonemap_to_8bit(
    ctx: &ComputeContext,
    linear_hdr: &LinearImage,
    extent: vk::Extent3D,
    params: ToneMapParams,
) -> Result<(Vec<u8>, u32)> {
    let dst = create_linear_image(
        ctx,
        vk::Format::R8G8B8A8_UNORM,
        extent,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
    )?;

    let pipeline = ToneMapPipeline::new(&ctx.device)?;
    let input_view = create_image_view(&ctx.device, linear_hdr.image, vk::Format::R16G16B16A16_UNORM)?;
    let output_view = create_image_view(&ctx.device, dst.image, vk::Format::R8G8B8A8_UNORM)?;

    let command_buffer = ctx.allocate_command_buffer()?;
    let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe {
        ctx.device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(|e| vk_err("vkBeginCommandBuffer", e))?;

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        let barriers = [
            vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .image(linear_hdr.image)
                .subresource_range(subresource_range),
            vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::SHADER_WRITE)
                .image(dst.image)
                .subresource_range(subresource_range),
        ];
        ctx.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &barriers,
        );
    }

    pipeline.dispatch(command_buffer, input_view.handle(), output_view.handle(), extent.width, extent.height, params)?;

    unsafe {
        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        let to_host = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .image(dst.image)
            .subresource_range(subresource_range);
        ctx.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_host],
        );
        ctx.device
            .end_command_buffer(command_buffer)
            .map_err(|e| vk_err("vkEndCommandBuffer", e))?;
    }

    ctx.submit_and_wait_idle(command_buffer)?;

    unsafe {
        ctx.device
            .free_command_buffers(ctx.command_pool, std::slice::from_ref(&command_buffer));
    }
    drop(input_view);
    drop(output_view);

    // `dst` releases its image/memory via `Drop` once it goes out of
    // scope below, on every return path including `readback`'s `?`.
    readback(ctx, dst.image, dst.memory)
}

fn readback(ctx: &ComputeContext, image: vk::Image, memory: vk::DeviceMemory) -> Result<(Vec<u8>, u32)> {
    let subresource = vk::ImageSubresource::default().aspect_mask(vk::ImageAspectFlags::COLOR);
    let layout = unsafe { ctx.device.get_image_subresource_layout(image, subresource) };

    let size = layout.size as usize;
    let ptr = unsafe {
        ctx.device
            .map_memory(memory, layout.offset, size as u64, vk::MemoryMapFlags::empty())
            .map_err(|e| vk_err("vkMapMemory", e))?
    };
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, size).to_vec() };
    unsafe { ctx.device.unmap_memory(memory) };

    Ok((bytes, layout.row_pitch as u32))
}

/// Confirm the source format is one this path can readback without
/// `convert_to_rgb24` seeing garbage (8bpp RGBA or the HDR 16bpp format).
pub fn format_is_supported(format: PixelFormat) -> bool {
    matches!(
        format,
        PixelFormat::Xrgb8888
            | PixelFormat::Argb8888
            | PixelFormat::Xbgr8888
            | PixelFormat::Abgr8888
            | PixelFormat::Abgr16161616
    )
}
