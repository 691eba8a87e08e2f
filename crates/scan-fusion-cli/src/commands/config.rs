//! scanfuse config command - print or validate a configuration.

use std::path::Path;

use anyhow::{Context, Result};
use scan_fusion::FusionConfig;
use serde::Serialize;

use crate::commands::load_config;
use crate::{Cli, OutputFormat, Preset, output};

#[derive(Serialize)]
struct ValidationResult {
    path: String,
    valid: bool,
}

pub fn run(
    validate: Option<&Path>,
    preset: Option<Preset>,
    output_path: Option<&Path>,
    cli: &Cli,
) -> Result<()> {
    if let Some(path) = validate {
        load_config(Some(path))?;
        let result = ValidationResult {
            path: path.display().to_string(),
            valid: true,
        };
        match cli.format {
            OutputFormat::Json => output::print(&result, cli.format, cli.quiet),
            OutputFormat::Text => output::success(
                &format!("{} is a valid configuration", path.display()),
                cli.format,
                cli.quiet,
            ),
        }
        return Ok(());
    }

    let config = preset.map_or_else(FusionConfig::default, Preset::config);
    if let Some(path) = output_path {
        config
            .save_toml(path)
            .with_context(|| format!("Failed to write configuration to {:?}", path))?;
        output::success(
            &format!("Configuration written to {}", path.display()),
            cli.format,
            cli.quiet,
        );
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => output::print(&config, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                print!("{}", config.to_toml()?);
            }
        }
    }
    Ok(())
}
