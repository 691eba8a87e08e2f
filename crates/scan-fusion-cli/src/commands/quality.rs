//! scanfuse quality command - score one point cloud.

use std::path::Path;

use anyhow::{Result, bail};
use colored::Colorize;
use scan_fusion::{QualityEstimator, QualityReport};
use serde::Serialize;

use crate::commands::load_config;
use crate::{Cli, OutputFormat, output, pointfile};

#[derive(Serialize)]
struct CloudQuality {
    path: String,
    points: usize,
    has_normals: bool,
    report: QualityReport,
}

pub fn run(input: &Path, config: Option<&Path>, cli: &Cli) -> Result<()> {
    let config = load_config(config)?;
    let cloud = pointfile::load_cloud(input)?;
    cloud.validate()?;
    let Some(bounds) = cloud.bounds() else {
        bail!("{:?} contains no points", input);
    };

    let estimator = QualityEstimator::new(config.quality);
    let report = estimator.report(estimator.estimate(&cloud, &bounds));
    let result = CloudQuality {
        path: input.display().to_string(),
        points: cloud.len(),
        has_normals: cloud.has_normals(),
        report,
    };

    match cli.format {
        OutputFormat::Json => output::print(&result, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                let m = &result.report.metrics;
                println!("{}", "Cloud Quality".bold().underline());
                println!("  {}: {}", "File".cyan(), result.path);
                println!("  {}: {}", "Points".cyan(), result.points);
                println!("  {}: {}", "Density".cyan(), output::score(m.density));
                println!(
                    "  {}: {}",
                    "Normal consistency".cyan(),
                    output::score(m.normal_consistency)
                );
                println!("  {}: {}", "Completeness".cyan(), output::score(m.completeness));
                println!("  {}: {:.3}", "Noise level".cyan(), m.noise_level);
                println!(
                    "  {}: {}",
                    "Confidence".cyan(),
                    output::score(result.report.confidence)
                );
                if result.report.passed {
                    output::success("All thresholds met", cli.format, cli.quiet);
                } else {
                    for f in &result.report.failures {
                        output::warning(
                            &format!("{} {:.3} below {:.3}", f.metric, f.value, f.threshold),
                            cli.format,
                            cli.quiet,
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
