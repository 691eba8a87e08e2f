//! Tracing helpers for pipeline stages.
//!
//! Enable output by installing a subscriber in the application:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//!
//! // RUST_LOG=scan_fusion=debug for stage details,
//! // RUST_LOG=scan_fusion::timing=info for per-stage timing
//! ```
//!
//! # Log Levels
//!
//! - **WARN**: Recoverable failures (alignment fallback, rollback, GPU fallback)
//! - **INFO**: Stage summaries and timing
//! - **DEBUG**: Intermediate sizes, iteration residuals
//! - **TRACE**: Per-point detail

use std::time::Instant;

use tracing::{Span, debug, info};

use crate::types::{MeshData, PointCloud, Stage};

/// Logs a stage's duration when dropped.
///
/// ```rust,ignore
/// let _timer = OperationTimer::new(Stage::Fusion);
/// // ... work ...
/// // timer logs elapsed_ms here
/// ```
pub struct OperationTimer {
    stage: Stage,
    start: Instant,
    span: Span,
}

impl OperationTimer {
    pub fn new(stage: Stage) -> Self {
        let span = tracing::info_span!("fusion_operation", stage = stage.as_str());
        debug!(target: "scan_fusion::timing", stage = stage.as_str(), "Starting stage");
        Self {
            stage,
            start: Instant::now(),
            span,
        }
    }

    /// Timer whose span records the input size.
    pub fn with_size(stage: Stage, elements: usize) -> Self {
        let span = tracing::info_span!(
            "fusion_operation",
            stage = stage.as_str(),
            elements = elements
        );
        debug!(
            target: "scan_fusion::timing",
            stage = stage.as_str(),
            elements,
            "Starting stage"
        );
        Self {
            stage,
            start: Instant::now(),
            span,
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        info!(
            target: "scan_fusion::timing",
            stage = self.stage.as_str(),
            elapsed_ms = format!("{:.2}", self.elapsed_ms()),
            "Stage completed"
        );
    }
}

/// Log cloud size, bounds and mean confidence at debug level.
pub fn log_cloud_stats(cloud: &PointCloud, context: &str) {
    match cloud.bounds() {
        Some(b) => debug!(
            context,
            points = cloud.len(),
            min = ?[b.min.x, b.min.y, b.min.z],
            max = ?[b.max.x, b.max.y, b.max.z],
            mean_confidence = format!("{:.3}", cloud.mean_confidence()),
            "Point cloud stats"
        ),
        None => debug!(context, points = 0, "Point cloud is empty"),
    }
}

/// Log mesh size and area at debug level.
pub fn log_mesh_stats(mesh: &MeshData, context: &str) {
    debug!(
        context,
        vertices = mesh.vertex_count(),
        triangles = mesh.triangle_count(),
        area = format!("{:.4}", mesh.surface_area()),
        mean_confidence = format!("{:.3}", mesh.mean_confidence()),
        "Mesh stats"
    );
}
