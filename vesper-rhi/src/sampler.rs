//! Vulkan Sampler - texture sampling configuration.

use ash::{vk, Device};
use vesper_rhi_derive::DeviceObject;

use crate::error::{Result, RhiError};

/// Sampler configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            min_lod: 0.0,
            max_lod: 1.0,
        }
    }
}

impl SamplerConfig {
    /// Create a linear filtering sampler config.
    pub fn linear() -> Self {
        Self::default()
    }

    /// Create a nearest (point) filtering sampler config.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Default::default()
        }
    }
}

/// Vulkan sampler for texture sampling.
#[DeviceObject]
pub struct Sampler {
    sampler: vk::Sampler,
    config: SamplerConfig,
}

impl Sampler {
    /// Create a new sampler with the given configuration.
    pub fn new(device: &Device, config: &SamplerConfig) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(config.mag_filter)
            .min_filter(config.min_filter)
            .mipmap_mode(config.mipmap_mode)
            .address_mode_u(config.address_mode)
            .address_mode_v(config.address_mode)
            .address_mode_w(config.address_mode)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(config.min_lod)
            .max_lod(config.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        let sampler = unsafe { device.create_sampler(&create_info, None) }.map_err(RhiError::device("create_sampler"))?;

        Ok(Self {
            sampler,
            config: *config,
            device: device.clone(),
        })
    }

    /// Get the raw Vulkan sampler handle.
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}
