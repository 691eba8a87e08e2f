//! scanfuse run command - one full fusion pass.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use scan_fusion::{
    AlignmentResult, FusionStats, MeshMetadata, PassInput, PassQuality, ProgressCallback,
    RefineMetrics, ScanSession, ScanningStrategy, TransitionEvent, ValidationReport,
};
use serde::Serialize;
use tracing::info;

use crate::commands::load_config;
use crate::{Cli, OutputFormat, Preset, output, pointfile};

pub struct RunArgs<'a> {
    pub depth: &'a Path,
    pub image: &'a Path,
    pub config: Option<&'a Path>,
    pub preset: Option<Preset>,
    pub features: Option<&'a Path>,
    pub output: Option<&'a Path>,
    pub gpu: bool,
}

#[derive(Serialize)]
struct MeshSummary {
    vertices: usize,
    triangles: usize,
    surface_area: f64,
    mean_confidence: f64,
}

#[derive(Serialize)]
struct RunReport<'a> {
    depth_points: usize,
    image_points: usize,
    backend: String,
    strategy: ScanningStrategy,
    partial: bool,
    mesh: MeshSummary,
    quality: &'a PassQuality,
    #[serde(skip_serializing_if = "Option::is_none")]
    alignment: Option<&'a AlignmentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fusion: Option<&'a FusionStats>,
    transitions: &'a [TransitionEvent],
    #[serde(skip_serializing_if = "Option::is_none")]
    refinement: Option<&'a RefineMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<&'a ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refine_rejection: Option<String>,
    history: &'a MeshMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

fn progress_logger() -> ProgressCallback {
    Box::new(|p| {
        info!(
            stage = %p.stage,
            step = p.current,
            of = p.total,
            "{}",
            p.message
        );
        true
    })
}

#[cfg(feature = "gpu")]
fn with_gpu(session: ScanSession, gpu: bool, cli: &Cli) -> ScanSession {
    if !gpu {
        return session;
    }
    match scan_fusion_gpu::GpuBackend::try_new() {
        Some(backend) => session.with_backend(std::sync::Arc::new(backend)),
        None => {
            output::warning("No GPU available, using the CPU backend", cli.format, cli.quiet);
            session
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn with_gpu(session: ScanSession, _gpu: bool, _cli: &Cli) -> ScanSession {
    session
}

pub fn run(args: RunArgs<'_>, cli: &Cli) -> Result<()> {
    let config = match args.preset {
        Some(preset) => preset.config(),
        None => load_config(args.config)?,
    };
    let depth = pointfile::load_cloud(args.depth)?;
    let image = pointfile::load_cloud(args.image)?;
    let features = match args.features {
        Some(path) => pointfile::load_features(path)?,
        None => Vec::new(),
    };
    let (depth_points, image_points) = (depth.len(), image.len());

    let session = ScanSession::new(config)?.with_progress(progress_logger());
    let session = with_gpu(session, args.gpu, cli);

    output::info(
        &format!(
            "Fusing {} depth and {} image points on {}...",
            depth_points,
            image_points,
            session.backend_name()
        ),
        cli.format,
        cli.quiet,
    );
    let pass = session.process(PassInput::new(depth, image).with_features(features))?;

    if let Some(path) = args.output {
        let json = serde_json::to_string(&pass.mesh).context("Failed to serialize mesh")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write mesh to {:?}", path))?;
    }

    let report = RunReport {
        depth_points,
        image_points,
        backend: session.backend_name().to_string(),
        strategy: pass.strategy,
        partial: pass.partial,
        mesh: MeshSummary {
            vertices: pass.mesh.vertex_count(),
            triangles: pass.mesh.triangle_count(),
            surface_area: pass.mesh.surface_area(),
            mean_confidence: pass.mesh.mean_confidence(),
        },
        quality: &pass.quality,
        alignment: pass.alignment.as_ref(),
        fusion: pass.fusion_stats.as_ref(),
        transitions: &pass.events,
        refinement: pass.refinement.as_ref(),
        validation: pass.validation.as_ref(),
        refine_rejection: pass.refine_rejection.as_ref().map(|e| e.to_string()),
        history: pass.mesh.metadata(),
        output: args.output.map(|p| p.display().to_string()),
    };

    match cli.format {
        OutputFormat::Json => output::print(&report, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                print_text(&report, cli);
            }
        }
    }
    Ok(())
}

fn print_text(report: &RunReport<'_>, cli: &Cli) {
    if report.partial {
        output::warning("Time budget exceeded; mesh is best-effort", cli.format, cli.quiet);
    } else {
        output::success("Pass complete", cli.format, cli.quiet);
    }
    println!("  {}: {}", "Strategy".cyan(), report.strategy);
    for event in report.transitions {
        println!(
            "  {}: {} → {} at {:.0} ms",
            "Transition".cyan(),
            event.from,
            event.to,
            event.session_ms
        );
    }
    if let Some(depth) = &report.quality.depth {
        println!("  {}: {}", "Depth confidence".cyan(), output::score(depth.confidence));
    }
    if let Some(image) = &report.quality.image {
        println!("  {}: {}", "Image confidence".cyan(), output::score(image.confidence));
    }
    if let Some(alignment) = report.alignment {
        println!(
            "  {}: residual {:.6} after {} iterations ({})",
            "Alignment".cyan(),
            alignment.residual,
            alignment.iterations,
            output::score(report.quality.alignment_confidence)
        );
    }
    if let Some(fusion) = report.fusion {
        println!(
            "  {}: {} matched, {} + {} unmatched → {} points",
            "Fusion".cyan(),
            fusion.matched,
            fusion.unmatched_a,
            fusion.unmatched_b,
            fusion.output_points
        );
    }
    println!(
        "  {}: {} vertices, {} triangles, {:.5} m²",
        "Mesh".cyan(),
        report.mesh.vertices,
        report.mesh.triangles,
        report.mesh.surface_area
    );
    if let Some(refinement) = report.refinement {
        println!(
            "  {}: {} → {} triangles",
            "Refinement".cyan(),
            refinement.original_triangles,
            refinement.final_triangles
        );
    }
    if let Some(reason) = &report.refine_rejection {
        output::warning(&format!("Refined mesh discarded: {}", reason), cli.format, cli.quiet);
    }
    if let Some(validation) = report.validation {
        println!(
            "  {}: {}, {}",
            "Topology".cyan(),
            if validation.is_manifold() { "manifold" } else { "non-manifold" },
            if validation.is_watertight() {
                "watertight".to_string()
            } else {
                format!("{} boundary edges", validation.boundary_edge_count)
            }
        );
    }
    let m = &report.quality.mesh;
    println!(
        "  {}: density {}, normals {}, smoothness {}",
        "Mesh quality".cyan(),
        output::score(m.vertex_density),
        output::score(m.normal_consistency),
        output::score(m.smoothness)
    );
    if let Some(path) = &report.output {
        println!("  {}: {}", "Written".cyan(), path);
    }
}
