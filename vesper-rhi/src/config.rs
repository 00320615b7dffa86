//! Renderer construction options.

use ash::vk;
use derive_builder::Builder;

/// Highest sample count any Vulkan implementation exposes.
pub const MAX_MSAA_SAMPLES: u32 = 64;

#[derive(Clone, Debug, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct RendererConfig {
    #[builder(default = "String::from(\"vesper\")")]
    pub application_name: String,
    /// Requested MSAA sample count; the device maximum is used when lower.
    #[builder(default = "4")]
    pub msaa_samples: u32,
    /// Falls back to IMMEDIATE, then FIFO, when unset or unsupported.
    #[builder(default)]
    pub present_mode: Option<vk::PresentModeKHR>,
    #[builder(default = "cfg!(feature = \"validation\")")]
    pub validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: String::from("vesper"),
            msaa_samples: 4,
            present_mode: None,
            validation: cfg!(feature = "validation"),
        }
    }
}

impl RendererConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.msaa_samples {
            Some(samples) if !valid_sample_count(samples) => Err(format!(
                "msaa_samples must be a power of two no greater than {}, got {}",
                MAX_MSAA_SAMPLES, samples
            )),
            _ => Ok(()),
        }
    }
}

pub(crate) fn valid_sample_count(samples: u32) -> bool {
    samples.is_power_of_two() && samples <= MAX_MSAA_SAMPLES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_default() {
        let built = RendererConfigBuilder::default().build().unwrap();
        let default = RendererConfig::default();
        assert_eq!(built.application_name, default.application_name);
        assert_eq!(built.msaa_samples, 4);
        assert_eq!(built.present_mode, None);
        assert_eq!(built.validation, default.validation);
    }

    #[test]
    fn msaa_samples_must_be_a_power_of_two() {
        assert!(RendererConfigBuilder::default().msaa_samples(3u32).build().is_err());
        assert!(RendererConfigBuilder::default().msaa_samples(0u32).build().is_err());
        assert!(RendererConfigBuilder::default().msaa_samples(128u32).build().is_err());

        let config = RendererConfigBuilder::default()
            .msaa_samples(8u32)
            .present_mode(Some(vk::PresentModeKHR::FIFO))
            .application_name("demo")
            .build()
            .unwrap();
        assert_eq!(config.msaa_samples, 8);
        assert_eq!(config.present_mode, Some(vk::PresentModeKHR::FIFO));
        assert_eq!(config.application_name, "demo");
    }
}
