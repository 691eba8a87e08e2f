//! scanfuse gpu-info command - show the adapter behind the gpu backend.

use anyhow::Result;
use colored::Colorize;
use scan_fusion_gpu::GpuContext;
use serde::Serialize;

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct GpuInfo {
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_storage_buffer_bytes: Option<u32>,
}

pub fn run(cli: &Cli) -> Result<()> {
    let ctx = GpuContext::get();
    let info = GpuInfo {
        available: ctx.is_some(),
        name: ctx.map(|c| c.adapter_info.name.clone()),
        vendor: ctx.map(|c| c.adapter_info.vendor.clone()),
        device_type: ctx.map(|c| c.adapter_info.device_type.clone()),
        backend: ctx.map(|c| c.adapter_info.backend.clone()),
        max_storage_buffer_bytes: ctx.map(|c| c.max_storage_buffer_size()),
    };

    match cli.format {
        OutputFormat::Json => output::print(&info, cli.format, cli.quiet),
        OutputFormat::Text => {
            if cli.quiet {
                return Ok(());
            }
            match ctx {
                Some(c) => {
                    println!("{}", "GPU Adapter".bold().underline());
                    println!("  {}: {}", "Name".cyan(), c.adapter_info.name);
                    println!("  {}: {}", "Vendor".cyan(), c.adapter_info.vendor);
                    println!("  {}: {}", "Type".cyan(), c.adapter_info.device_type);
                    println!("  {}: {}", "Backend".cyan(), c.adapter_info.backend);
                    println!(
                        "  {}: {} MiB",
                        "Max storage buffer".cyan(),
                        c.max_storage_buffer_size() / (1024 * 1024)
                    );
                }
                None => output::warning(
                    "No GPU adapter available; the CPU backend will be used",
                    cli.format,
                    cli.quiet,
                ),
            }
        }
    }
    Ok(())
}
