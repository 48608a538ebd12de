use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use ash::vk;

use crate::device::device::DeviceContext;
use crate::objects::descriptor::TypeSignature;

#[derive(Debug)]
pub enum ShaderError {
    Vulkan(vk::Result),
    Io(std::io::Error),
    /// The external compiler exited with a failure status.
    CompilerFailed(String),
    /// The bytecode file is not a SPIR-V word stream.
    InvalidBytecode,
    /// [`Shader::compile_pipeline`] was called before [`Shader::load`].
    NotLoaded,
}

impl From<vk::Result> for ShaderError {
    fn from(result: vk::Result) -> Self {
        ShaderError::Vulkan(result)
    }
}

impl From<std::io::Error> for ShaderError {
    fn from(err: std::io::Error) -> Self {
        ShaderError::Io(err)
    }
}

/// A shader source file and the pipeline stage it belongs to.
#[derive(Clone, Debug)]
pub struct SourceShader {
    pub name: String,
    pub path: PathBuf,
    pub stage: vk::ShaderStageFlags,
}

impl SourceShader {
    pub fn new(name: &str, path: impl Into<PathBuf>, stage: vk::ShaderStageFlags) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            stage,
        }
    }
}

/// Invokes the external bytecode compiler.
///
/// Bytecode production is an external concern; this context only holds the
/// compiler path and shells out. The path is passed in explicitly by the
/// application.
pub struct ShaderCompiler {
    compiler_path: PathBuf,
}

impl ShaderCompiler {
    pub fn new(compiler_path: impl Into<PathBuf>) -> Self {
        Self {
            compiler_path: compiler_path.into(),
        }
    }

    pub fn get_path(&self) -> &Path {
        &self.compiler_path
    }

    /// Compiles `source` into `output`. The compiler's own diagnostics are
    /// reported verbatim on failure.
    pub fn compile(&self, source: &SourceShader, output: &Path) -> Result<(), ShaderError> {
        log::debug!("Compiling shader {} from {:?}", source.name, source.path);

        let result = Command::new(&self.compiler_path)
            .arg(&source.path)
            .arg("-o")
            .arg(output)
            .output()?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
            log::error!("Shader compiler failed for {}: {}", source.name, stderr);
            return Err(ShaderError::CompilerFailed(stderr));
        }

        Ok(())
    }
}

/// Loads a SPIR-V word stream from disk.
pub fn read_bytecode(path: &Path) -> Result<Vec<u32>, ShaderError> {
    let bytes = std::fs::read(path)?;
    bytes_to_words(&bytes)
}

fn bytes_to_words(bytes: &[u8]) -> Result<Vec<u32>, ShaderError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(ShaderError::InvalidBytecode);
    }

    Ok(bytes.chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Caller supplied binding metadata for a shader.
///
/// Descriptor layouts are not reflected from bytecode; the application knows
/// its own bindings and uniform sizes and hands them over.
#[derive(Clone, Debug, Default)]
pub struct ShaderBindings {
    pub layout_bindings: Vec<vk::DescriptorSetLayoutBinding>,
    pub uniform_sizes: Vec<vk::DeviceSize>,
}

impl ShaderBindings {
    /// The resource type signature of these bindings, used to route
    /// descriptor set allocations.
    pub fn type_signature(&self) -> TypeSignature {
        self.layout_bindings.iter().map(|binding| binding.descriptor_type).collect()
    }
}

/// Fixed function state for [`Shader::compile_pipeline`].
#[derive(Copy, Clone, Debug)]
pub struct PipelineState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub depth_compare: vk::CompareOp,
    pub blend_enable: bool,
    pub depth_write: bool,
    pub depth_test: bool,
    pub topology: vk::PrimitiveTopology,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blend_enable: false,
            depth_write: true,
            depth_test: true,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        }
    }
}

struct StageModule {
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
}

/// A pipeline built from precompiled bytecode and caller supplied binding
/// metadata.
pub struct Shader {
    device: Arc<DeviceContext>,
    render_pass: vk::RenderPass,
    pipeline_cache: vk::PipelineCache,

    entry_point: CString,
    modules: Vec<StageModule>,
    layout_bindings: Vec<vk::DescriptorSetLayoutBinding>,
    uniform_sizes: Vec<vk::DeviceSize>,

    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    state: PipelineState,
}

impl Shader {
    pub fn new(device: Arc<DeviceContext>, render_pass: vk::RenderPass, pipeline_cache: vk::PipelineCache) -> Self {
        Self {
            device,
            render_pass,
            pipeline_cache,
            entry_point: CString::new("main").unwrap(),
            modules: Vec::new(),
            layout_bindings: Vec::new(),
            uniform_sizes: Vec::new(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            state: PipelineState::default(),
        }
    }

    /// Creates the shader modules and builds the descriptor set and pipeline
    /// layouts from the caller supplied bindings.
    pub fn load(&mut self, stages: Vec<(vk::ShaderStageFlags, Vec<u32>)>, bindings: ShaderBindings) -> Result<(), ShaderError> {
        for (stage, bytecode) in stages {
            let info = vk::ShaderModuleCreateInfo::builder()
                .code(bytecode.as_slice());

            let module = unsafe {
                self.device.vk().create_shader_module(&info, None)
            }?;

            self.modules.push(StageModule { stage, module });
        }

        self.layout_bindings = bindings.layout_bindings;
        self.uniform_sizes = bindings.uniform_sizes;

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(self.layout_bindings.as_slice());

        self.descriptor_set_layout = unsafe {
            self.device.vk().create_descriptor_set_layout(&layout_info, None)
        }?;

        let set_layouts = [self.descriptor_set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts);

        self.pipeline_layout = unsafe {
            self.device.vk().create_pipeline_layout(&pipeline_layout_info, None)
        }?;

        Ok(())
    }

    pub fn set_vertex_descriptions(
        &mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
    }

    /// Builds the graphics pipeline. Viewport and scissor are dynamic so a
    /// resize does not require a pipeline rebuild.
    pub fn compile_pipeline(&mut self, state: PipelineState) -> Result<(), ShaderError> {
        if self.modules.is_empty() || self.pipeline_layout == vk::PipelineLayout::null() {
            return Err(ShaderError::NotLoaded);
        }

        self.state = state;

        let stages: Vec<_> = self.modules.iter().map(|module| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(module.stage)
                .module(module.module)
                .name(self.entry_point.as_c_str())
                .build()
        }).collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(self.vertex_bindings.as_slice())
            .vertex_attribute_descriptions(self.vertex_attributes.as_slice());

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(state.topology);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(state.polygon_mode)
            .cull_mode(state.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(self.device.get_sample_count())
            .sample_shading_enable(self.device.is_sample_shading_enabled());

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(state.depth_test)
            .depth_write_enable(state.depth_write)
            .depth_compare_op(state.depth_compare);

        let blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(state.blend_enable)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build();

        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(std::slice::from_ref(&blend_attachment));

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(stages.as_slice())
            .base_pipeline_index(-1)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.pipeline_layout)
            .render_pass(self.render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            self.device.vk().create_graphics_pipelines(
                self.pipeline_cache,
                std::slice::from_ref(&info),
                None,
            )
        }.map_err(|(_, err)| ShaderError::Vulkan(err))?;

        self.pipeline = pipelines[0];
        Ok(())
    }

    /// Rebuilds the pipeline against a recreated render pass.
    pub fn recreate_pipeline(&mut self, render_pass: vk::RenderPass) -> Result<(), ShaderError> {
        if self.pipeline != vk::Pipeline::null() {
            unsafe {
                self.device.vk().destroy_pipeline(self.pipeline, None);
            }
            self.pipeline = vk::Pipeline::null();
        }

        self.render_pass = render_pass;
        self.compile_pipeline(self.state)
    }

    pub fn get_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout
    }

    /// The type signature of this shader's bindings, for descriptor routing.
    pub fn type_signature(&self) -> TypeSignature {
        self.layout_bindings.iter().map(|binding| binding.descriptor_type).collect()
    }

    pub fn get_uniform_sizes(&self) -> &[vk::DeviceSize] {
        self.uniform_sizes.as_slice()
    }

    pub fn get_pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn get_pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.vk().cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
        }
    }

    pub fn destroy(&mut self) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                self.device.vk().destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                self.device.vk().destroy_pipeline_layout(self.pipeline_layout, None);
                self.pipeline_layout = vk::PipelineLayout::null();
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                self.device.vk().destroy_descriptor_set_layout(self.descriptor_set_layout, None);
                self.descriptor_set_layout = vk::DescriptorSetLayout::null();
            }
            for module in self.modules.drain(..) {
                self.device.vk().destroy_shader_module(module.module, None);
            }
        }
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytecode_conversion_round_trips() {
        let words = [0x0723_0203u32, 0xdead_beef];
        let mut bytes = Vec::new();
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }

        assert_eq!(bytes_to_words(&bytes).unwrap(), words);
    }

    #[test]
    fn truncated_bytecode_is_rejected() {
        assert!(matches!(bytes_to_words(&[1, 2, 3]), Err(ShaderError::InvalidBytecode)));
        assert!(matches!(bytes_to_words(&[]), Err(ShaderError::InvalidBytecode)));
    }

    #[test]
    fn bindings_expose_their_type_signature() {
        let bindings = ShaderBindings {
            layout_bindings: vec![
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build(),
            ],
            uniform_sizes: vec![64],
        };

        let signature = bindings.type_signature();
        assert_eq!(signature.len(), 2);
        assert!(signature.contains(&vk::DescriptorType::UNIFORM_BUFFER));
        assert!(signature.contains(&vk::DescriptorType::COMBINED_IMAGE_SAMPLER));
    }
}
