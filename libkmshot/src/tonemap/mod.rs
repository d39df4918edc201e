//! HDR tone-mapping compute kernel: pipeline setup and dispatch.
//!
//! The per-pixel color math lives in [`colorimetry`] (mirrored into
//! `shaders/tonemap.comp`, compiled to SPIR-V at build time by
//! `build.rs`); this module owns the Vulkan-side pipeline object the
//! external-import compute path (`compute_import`) invokes once per HDR
//! capture.

pub mod colorimetry;

use ash::vk;

use crate::error::{Error, Result};
use crate::shim::{self, ErrorKind};

pub use colorimetry::{ToneCurve, ToneMapParams};

/// Validate CLI/config-supplied exposure and tonemap-mode values and turn
/// them into [`ToneMapParams`], so both come through the same `Error`
/// variants the rest of the library uses rather than a CLI-only check.
pub fn validated_params(exposure: f32, mode: u32) -> Result<ToneMapParams> {
    if !(exposure > 0.0) {
        return Err(Error::InvalidExposure(exposure));
    }
    let mode = ToneCurve::from_mode(mode).ok_or(Error::InvalidTonemapMode(mode))?;
    Ok(ToneMapParams { exposure, mode })
}

static TONEMAP_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/tonemap.spv"));

/// Push-constant block the shader reads, `{exposure: f32, mode: u32}`.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PushConstants {
    pub exposure: f32,
    pub mode: u32,
}

impl PushConstants {
    pub fn from_params(params: ToneMapParams) -> PushConstants {
        PushConstants {
            exposure: params.exposure,
            mode: params.mode as u32,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                (self as *const Self) as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }
}

/// Two storage-image bindings (rgba16 read-only input, rgba8 write-only
/// output), a push-constant block, a compute pipeline, and a
/// descriptor pool sized for exactly one descriptor set — the capture
/// design's whole tone-mapping pipeline object.
pub struct ToneMapPipeline {
    device: ash::Device,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    shader_module: vk::ShaderModule,
}

impl ToneMapPipeline {
    pub fn new(device: &ash::Device) -> Result<ToneMapPipeline> {
        unsafe {
            let shader_module = create_shader_module(device)?;

            let bindings = [
                vk::DescriptorSetLayoutBinding::default()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE),
                vk::DescriptorSetLayoutBinding::default()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE),
            ];
            let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            let descriptor_set_layout = device
                .create_descriptor_set_layout(&set_layout_info, None)
                .map_err(|e| vk_err("vkCreateDescriptorSetLayout", e))?;

            let push_constant_range = vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .offset(0)
                .size(std::mem::size_of::<PushConstants>() as u32);
            let set_layouts = [descriptor_set_layout];
            let layout_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&set_layouts)
                .push_constant_ranges(std::slice::from_ref(&push_constant_range));
            let pipeline_layout = device
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| vk_err("vkCreatePipelineLayout", e))?;

            let entry_point = std::ffi::CString::new("main").expect("no interior nul");
            let stage_info = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(shader_module)
                .name(&entry_point);
            let pipeline_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage_info)
                .layout(pipeline_layout);
            let pipeline = device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| vk_err("vkCreateComputePipelines", e))?[0];

            let pool_sizes = [vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(2)];
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            let descriptor_pool = device
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| vk_err("vkCreateDescriptorPool", e))?;

            Ok(ToneMapPipeline {
                device: device.clone(),
                descriptor_set_layout,
                pipeline_layout,
                pipeline,
                descriptor_pool,
                shader_module,
            })
        }
    }

    /// Record, submit and wait for a single tone-map dispatch from
    /// `input_view` (rgba16, GENERAL layout) to `output_view` (rgba8,
    /// GENERAL layout), covering `width x height` pixels in 16x16
    /// workgroups.
    pub fn dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        input_view: vk::ImageView,
        output_view: vk::ImageView,
        width: u32,
        height: u32,
        params: ToneMapParams,
    ) -> Result<()> {
        unsafe {
            let set_layouts = [self.descriptor_set_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.descriptor_pool)
                .set_layouts(&set_layouts);
            let descriptor_set = self
                .device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| vk_err("vkAllocateDescriptorSets", e))?[0];

            let input_info = vk::DescriptorImageInfo::default()
                .image_view(input_view)
                .image_layout(vk::ImageLayout::GENERAL);
            let output_info = vk::DescriptorImageInfo::default()
                .image_view(output_view)
                .image_layout(vk::ImageLayout::GENERAL);
            let writes = [
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&input_info)),
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&output_info)),
            ];
            self.device.update_descriptor_sets(&writes, &[]);

            self.device
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[descriptor_set],
                &[],
            );
            let push_constants = PushConstants::from_params(params);
            self.device.cmd_push_constants(
                command_buffer,
                self.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constants.as_bytes(),
            );

            let groups_x = width.div_ceil(16);
            let groups_y = height.div_ceil(16);
            self.device.cmd_dispatch(command_buffer, groups_x, groups_y, 1);

            self.device
                .free_descriptor_sets(self.descriptor_pool, &[descriptor_set])
                .map_err(|e| vk_err("vkFreeDescriptorSets", e))?;
            Ok(())
        }
    }
}

impl Drop for ToneMapPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            self.device.destroy_shader_module(self.shader_module, None);
        }
    }
}

unsafe fn create_shader_module(device: &ash::Device) -> Result<vk::ShaderModule> {
    // SPIR-V is opaque binary data, not source; `TONEMAP_SPV` is a
    // precompiled artifact baked in by `build.rs`, loaded once here.
    let words = ash::util::read_spv(&mut std::io::Cursor::new(TONEMAP_SPV))
        .map_err(|e| shim::build_error("read_spv", e.raw_os_error().unwrap_or(-1), ErrorKind::GpuExecution))?;
    let info = vk::ShaderModuleCreateInfo::default().code(&words);
    device
        .create_shader_module(&info, None)
        .map_err(|e| vk_err("vkCreateShaderModule", e))
}

fn vk_err(what: &'static str, result: vk::Result) -> Error {
    shim::build_error(what, result.as_raw(), ErrorKind::GpuExecution)
}
