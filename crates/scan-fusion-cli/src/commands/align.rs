//! scanfuse align command - register one cloud onto another.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use scan_fusion::alignment::align;
use scan_fusion::{CancellationToken, Termination};
use serde::Serialize;

use crate::commands::load_config;
use crate::{Cli, OutputFormat, output, pointfile};

#[derive(Serialize)]
struct AlignReport {
    source: String,
    target: String,
    /// Row-major 4x4 matrix mapping source into target.
    matrix: [[f64; 4]; 4],
    rotation_degrees: f64,
    translation: [f64; 3],
    residual: f64,
    iterations: usize,
    correspondences: usize,
    converged: bool,
    termination: Termination,
}

pub fn run(source: &Path, target: &Path, config: Option<&Path>, cli: &Cli) -> Result<()> {
    let config = load_config(config)?;
    let source_cloud = pointfile::load_cloud(source)?;
    let target_cloud = pointfile::load_cloud(target)?;
    source_cloud.validate()?;
    target_cloud.validate()?;

    output::info(
        &format!(
            "Aligning {} points onto {} points...",
            source_cloud.len(),
            target_cloud.len()
        ),
        cli.format,
        cli.quiet,
    );
    let result = align(
        &source_cloud,
        &target_cloud,
        &config.alignment,
        &CancellationToken::new(),
    );

    let m = result.transform.to_matrix4();
    let t = result.transform.translation;
    let report = AlignReport {
        source: source.display().to_string(),
        target: target.display().to_string(),
        matrix: std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)])),
        rotation_degrees: result.transform.rotation_angle().to_degrees(),
        translation: [t.x, t.y, t.z],
        residual: result.residual,
        iterations: result.iterations,
        correspondences: result.correspondences,
        converged: result.converged,
        termination: result.termination,
    };

    if result.is_failed() {
        output::print(&report, cli.format, cli.quiet);
        result.into_result()?;
    }

    match cli.format {
        OutputFormat::Json => output::print(&report, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                output::success("Registration complete", cli.format, cli.quiet);
                println!(
                    "  {}: ({:.5}, {:.5}, {:.5})",
                    "Translation".cyan(),
                    t.x,
                    t.y,
                    t.z
                );
                println!("  {}: {:.3}°", "Rotation".cyan(), report.rotation_degrees);
                println!("  {}: {:.6}", "Residual".cyan(), report.residual);
                println!(
                    "  {}: {} ({:?})",
                    "Iterations".cyan(),
                    report.iterations,
                    report.termination
                );
                println!("  {}: {}", "Correspondences".cyan(), report.correspondences);
            }
        }
    }

    Ok(())
}
