//! Vulkan Pipeline - vertex input, fixed-function state and graphics pipeline creation.

use ash::{vk, Device};
use vesper_core::collections::SmallVec;
use vesper_core::log;
use vesper_rhi_derive::DeviceObject;

use crate::error::{Result, RhiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float,
    Vec2,
    Vec3,
    Vec4,
}

impl VertexFormat {
    /// Size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            VertexFormat::Float => 4,
            VertexFormat::Vec2 => 8,
            VertexFormat::Vec3 => 12,
            VertexFormat::Vec4 => 16,
        }
    }

    pub fn to_vk(&self) -> vk::Format {
        match self {
            VertexFormat::Float => vk::Format::R32_SFLOAT,
            VertexFormat::Vec2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Vec3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
        }
    }
}

/// Vertex attribute description for pipeline creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

impl VertexAttribute {
    fn to_vk(self) -> vk::VertexInputAttributeDescription {
        vk::VertexInputAttributeDescription {
            location: self.location,
            binding: self.binding,
            format: self.format.to_vk(),
            offset: self.offset,
        }
    }
}

/// Vertex structs usable as binding 0 input. Usually derived with `#[derive(VertexLayout)]`.
pub trait VertexLayout {
    fn vertex_attributes() -> Vec<VertexAttribute>;

    fn vertex_stride() -> u32 {
        vertex_stride(&Self::vertex_attributes())
    }
}

/// Tightly packed stride of `attributes`.
pub fn vertex_stride(attributes: &[VertexAttribute]) -> u32 {
    attributes.iter().map(|a| a.format.size()).sum()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    #[default]
    TrianglesList,
    TrianglesFan,
    Points,
    Lines,
}

impl PrimitiveTopology {
    pub fn to_vk(&self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::TrianglesList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TrianglesFan => vk::PrimitiveTopology::TRIANGLE_FAN,
            PrimitiveTopology::Points => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::Lines => vk::PrimitiveTopology::LINE_LIST,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

impl PolygonMode {
    pub fn to_vk(&self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
            PolygonMode::Point => vk::PolygonMode::POINT,
        }
    }

    /// Line and point rasterization need the `fillModeNonSolid` feature.
    pub fn requires_non_solid_fill(&self) -> bool {
        !matches!(self, PolygonMode::Fill)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
    All,
}

impl CullMode {
    pub fn to_vk(&self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::All => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

fn color_blend_attachment(alpha_blend: bool) -> vk::PipelineColorBlendAttachmentState {
    let attachment = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);

    if !alpha_blend {
        return attachment.blend_enable(false);
    }

    attachment
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
}

/// Graphics pipeline configuration.
pub struct GraphicPipelineInfo<'a> {
    pub stages: &'a [(vk::ShaderStageFlags, vk::ShaderModule)],
    pub vertex_attributes: &'a [VertexAttribute],
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub alpha_blend: bool,
    pub samples: vk::SampleCountFlags,
    /// Per-sample shading; only honoured with more than one sample.
    pub sample_shading: bool,
    pub render_pass: vk::RenderPass,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
}

/// Graphics pipeline and its layout, built against a render pass.
#[DeviceObject]
pub struct GraphicPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicPipeline {
    #[profiling::function]
    pub fn new(device: &Device, info: &GraphicPipelineInfo) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(info.set_layouts);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(RhiError::device("create_pipeline_layout"))?;

        // Drop releases the layout if pipeline creation fails below.
        let mut result = Self {
            pipeline: vk::Pipeline::null(),
            layout,
            device: device.clone(),
        };

        let entry_point = c"main";
        let shader_stages: SmallVec<[vk::PipelineShaderStageCreateInfo; 4]> = info
            .stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(entry_point)
            })
            .collect();

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: vertex_stride(info.vertex_attributes),
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes: SmallVec<[vk::VertexInputAttributeDescription; 16]> =
            info.vertex_attributes.iter().map(|a| a.to_vk()).collect();

        let mut vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
        if !attributes.is_empty() {
            vertex_input_state = vertex_input_state
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes);
        }

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(info.topology.to_vk())
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(info.polygon_mode.to_vk())
            .cull_mode(info.cull_mode.to_vk())
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisampled = info.samples != vk::SampleCountFlags::TYPE_1;
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(info.samples)
            .sample_shading_enable(multisampled && info.sample_shading)
            .min_sample_shading(0.2);

        let blend_attachments = [color_blend_attachment(info.alpha_blend)];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(info.render_pass)
            .subpass(0);

        let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) }
            .map_err(|(_, err)| RhiError::device("create_graphics_pipelines")(err))?;
        result.pipeline = pipelines.into_iter().next().unwrap_or_default();

        log::info!(
            "Created graphics pipeline: {} stages, {} attributes, {:?}",
            info.stages.len(),
            info.vertex_attributes.len(),
            info.samples
        );

        Ok(result)
    }

    #[inline]
    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
