//! Multi-sensor point cloud fusion and surface reconstruction.
//!
//! This crate turns two streams of 3D samples from a handheld scanner into a
//! triangle mesh: points from a depth sensor and points triangulated from
//! camera images. Each pass scores both sources, registers the image points
//! onto the depth points, picks a scanning strategy, merges or selects the
//! points, and reconstructs and refines a surface.
//!
//! # Pipeline
//!
//! | Stage | Module | Result |
//! |-------|--------|--------|
//! | Indexing | [`spatial`] | k-d tree or octree over each source |
//! | Quality | [`quality`] | per-source metrics and confidence |
//! | Alignment | [`alignment`] | rigid transform from point-to-point ICP |
//! | Strategy | [`strategy`] | depth-only, image-only, fused or recalibrate |
//! | Fusion | [`fusion`] | confidence-weighted merge of matched points |
//! | Smoothing | [`smoothing`] | feature-preserving bilateral filter |
//! | Reconstruction | [`reconstruct`] | implicit field and marching cubes |
//! | Refinement | [`refine`] | quadric decimation, Laplacian smoothing, validation |
//!
//! [`ScanSession`] runs all stages in order and owns the state that outlives a
//! pass. Each stage is also usable on its own.
//!
//! # Units and Frames
//!
//! Coordinates are in **meters**, in the camera frame: x right, y down,
//! z forward. Confidences and quality scores lie in [0, 1].
//!
//! # Quick Start
//!
//! ```no_run
//! use scan_fusion::{FusionConfig, PassInput, PointCloud, ScanSession};
//!
//! # fn depth_frame() -> PointCloud { PointCloud::default() }
//! # fn image_frame() -> PointCloud { PointCloud::default() }
//! let session = ScanSession::new(FusionConfig::default())?;
//! let output = session.process(PassInput::new(depth_frame(), image_frame()))?;
//!
//! println!("strategy: {}", output.strategy);
//! println!("mesh: {} triangles", output.mesh.triangle_count());
//! if output.partial {
//!     println!("pass ran out of time, mesh is unrefined");
//! }
//! # Ok::<(), scan_fusion::FusionError>(())
//! ```
//!
//! # Individual Stages
//!
//! ```no_run
//! use scan_fusion::alignment::{AlignmentParams, align};
//! use scan_fusion::fusion::{FusionParams, SourceWeights, fuse};
//! use scan_fusion::{CancellationToken, PointCloud};
//!
//! # let (depth, image) = (PointCloud::default(), PointCloud::default());
//! let token = CancellationToken::new();
//! let alignment = align(&image, &depth, &AlignmentParams::default(), &token).into_result()?;
//! let image = image.transformed(&alignment.transform);
//!
//! let fused = fuse(&depth, &image, SourceWeights::new(0.9, 0.6), &FusionParams::default(), &token)?;
//! println!("{:.0}% of points merged", fused.merged_fraction() * 100.0);
//! # Ok::<(), scan_fusion::FusionError>(())
//! ```
//!
//! # Features
//!
//! - `config-files` (default): TOML and JSON loading for [`FusionConfig`]

mod error;
mod types;

pub mod alignment;
pub mod backend;
pub mod camera;
pub mod config;
pub mod fusion;
pub mod progress;
pub mod quality;
pub mod reconstruct;
pub mod refine;
pub mod session;
pub mod smoothing;
pub mod spatial;
pub mod strategy;
pub mod tracing_ext;

pub use error::{
    ErrorCode, FusionError, FusionResult, IssueSeverity, RecoverySuggestion, ValidationIssue,
};
pub use types::{
    AREA_EPSILON, BoundingBox, Feature, MeshData, MeshMetadata, Point, PointCloud, ProcessingStep,
    Stage,
};

pub use alignment::{AlignmentParams, AlignmentResult, RigidTransform, Termination};
pub use backend::{ComputeBackend, CpuBackend};
pub use camera::CameraIntrinsics;
pub use config::{ConfigError, FusionConfig, SourceLimits};
pub use fusion::{ConfidencePolicy, FusionOutput, FusionParams, FusionStats, SourceWeights};
pub use progress::{Budget, CancellationToken, Progress, ProgressCallback};
pub use quality::{MeshQualityMetrics, QualityConfig, QualityEstimator, QualityMetrics, QualityReport};
pub use reconstruct::{ReconstructionParams, ReconstructionResult};
pub use refine::{RefineMetrics, RefineOutcome, RefineParams, ValidationLimits, ValidationReport};
pub use session::{PassInput, PassOutput, PassQuality, ScanSession};
pub use smoothing::SmoothingParams;
pub use spatial::{IndexKind, SpatialIndex, SpatialIndexHandle};
pub use strategy::{
    QualityUpdate, ScanningStrategy, StrategyConfig, StrategyController, StrategyDecision,
    TransitionEvent,
};
