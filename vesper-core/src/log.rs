pub use log::{trace, debug, info, warn, error, LevelFilter};

/// Install the global logger.
///
/// `RUST_LOG` still wins over `level` for any module it names.
pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        .filter_module("winit", log::LevelFilter::Warn)
        .filter_module("vesper_rhi::replay", log::LevelFilter::Info)
        .parse_default_env()
        .try_init()?;

    Ok(())
}
