//! Subcommands.

use std::path::Path;

use anyhow::{Context, Result};
use scan_fusion::FusionConfig;

pub mod align;
pub mod config;
#[cfg(feature = "gpu")]
pub mod gpu_info;
pub mod quality;
pub mod run;

/// The file's configuration, or the defaults.
pub fn load_config(path: Option<&Path>) -> Result<FusionConfig> {
    let config = match path {
        Some(path) => FusionConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => FusionConfig::default(),
    };
    config.validate()?;
    Ok(config)
}
