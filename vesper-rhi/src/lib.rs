//! Vesper RHI - a Vulkan renderer driven by recorded command frames.
//!
//! Shaders are plain SPIR-V; their descriptor bindings are recovered by
//! reflection. Drawing is recorded once into a [`CommandFrame`] and replayed
//! into one command buffer per swapchain image.

pub mod buffer;
pub mod command;
pub mod config;
pub mod core;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod reflection;
pub mod render_pass;
pub mod renderer;
pub mod replay;
pub mod sampler;
pub mod shader;
pub mod spirv;
pub mod swapchain;
pub mod texture;
mod mapping;
mod synchronization;
mod utility;

pub const MAX_SHADER_STAGES: usize = 16;
pub const MAX_UNIFORM_BUFFERS: usize = 16;
pub const MAX_VERTEX_ATTRIBUTES: usize = 16;
/// Distinct bindings a shader may declare across all of its stages.
pub const MAX_DESCRIPTORS: usize = 32;
pub const MAX_SWAPCHAIN_IMAGES: usize = 8;
/// Smallest allocation backing a uniform block, in bytes.
pub const MIN_UNIFORM_BUFFER_SIZE: u64 = 128;

pub use memoffset;
pub use vesper_rhi_derive::VertexLayout;

pub use ash::vk;
pub use buffer::{BufferKind, RenderBuffer};
pub use config::{RendererConfig, RendererConfigBuilder, RendererConfigBuilderError};
pub use error::{Result, RhiError};
pub use frame::{CommandFrame, CommandRecord, ShaderState};
pub use pipeline::{CullMode, PolygonMode, PrimitiveTopology, VertexAttribute, VertexFormat, VertexLayout};
pub use reflection::{ResourceKind, ShaderBinding, ShaderReflection, ShaderStage};
pub use renderer::Renderer;
pub use replay::{CommandSink, RecordState, Replayer};
pub use shader::{Shader, ShaderDesc, ShaderDescBuilder, ShaderDescBuilderError, ShaderStageCode};
pub use texture::{Filter, Texture, TextureDesc, TextureExtent};
