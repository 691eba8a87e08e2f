//! Per-session pipeline context.
//!
//! A [`ScanSession`] owns everything that outlives a single pass: the
//! validated configuration, the strategy controller and its history, the
//! compute backend and the cancellation token. [`ScanSession::process`] runs
//! one pass through ten stages:
//!
//! 1. validate inputs
//! 2. build spatial indices
//! 3. estimate per-source quality
//! 4. align the image source onto the depth source
//! 5. update the scanning strategy
//! 6. select or fuse the sources
//! 7. bilateral smoothing
//! 8. surface reconstruction
//! 9. refinement
//! 10. mesh quality floor
//!
//! Stage boundaries are synchronization points: each one polls the token and
//! the pass time budget. Running out of time after reconstruction yields the
//! unrefined mesh flagged as partial; earlier it is a `Timeout` error.
//!
//! # Example
//!
//! ```no_run
//! use scan_fusion::{FusionConfig, PassInput, PointCloud, ScanSession};
//!
//! # fn load(_: &str) -> PointCloud { PointCloud::default() }
//! let session = ScanSession::new(FusionConfig::preset_realtime())?;
//! let events = session.subscribe();
//!
//! let output = session.process(PassInput::new(load("depth.xyz"), load("image.xyz")))?;
//! println!("{} triangles via {}", output.mesh.triangle_count(), output.strategy);
//! for event in events.try_iter() {
//!     println!("{} -> {}", event.from, event.to);
//! }
//! # Ok::<(), scan_fusion::FusionError>(())
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::alignment::{AlignmentResult, align_with_index};
use crate::backend::{ComputeBackend, CpuBackend};
use crate::camera::CameraIntrinsics;
use crate::config::FusionConfig;
use crate::error::{FusionError, FusionResult};
use crate::fusion::{FusionStats, SourceWeights, fuse};
use crate::progress::{Budget, CancellationToken, ProgressCallback, ProgressTracker};
use crate::quality::{MeshQualityMetrics, QualityEstimator, QualityReport};
use crate::reconstruct::reconstruct_with_backend;
use crate::refine::{RefineMetrics, ValidationReport, refine_with_backend};
use crate::smoothing::smooth_cloud;
use crate::spatial::SpatialIndexHandle;
use crate::strategy::{QualityUpdate, ScanningStrategy, StrategyController, TransitionEvent};
use crate::tracing_ext::log_cloud_stats;
use crate::types::{BoundingBox, Feature, MeshData, PointCloud, Stage};

const PASS_STAGES: u64 = 10;

/// Inputs of one pass.
#[derive(Debug, Clone, Default)]
pub struct PassInput {
    /// Depth-sensor points, in the camera frame.
    pub depth: PointCloud,
    /// Image-derived points, registered onto `depth` during the pass.
    pub image: PointCloud,
    /// Scan volume; defaults to the bounds of both sources.
    pub bounds: Option<BoundingBox>,
    pub features: Vec<Feature>,
}

impl PassInput {
    pub fn new(depth: PointCloud, image: PointCloud) -> Self {
        Self {
            depth,
            image,
            ..Default::default()
        }
    }

    pub fn with_bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_features(mut self, features: Vec<Feature>) -> Self {
        self.features = features;
        self
    }
}

/// Quality gathered during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassQuality {
    /// `None` when the source was below its minimum size.
    pub depth: Option<QualityReport>,
    pub image: Option<QualityReport>,
    pub alignment_confidence: f64,
    /// Metrics of the returned mesh; default when the pass ended early.
    pub mesh: MeshQualityMetrics,
}

/// Result of one pass.
#[derive(Debug)]
pub struct PassOutput {
    pub mesh: MeshData,
    pub quality: PassQuality,
    pub strategy: ScanningStrategy,
    pub alignment: Option<AlignmentResult>,
    pub fusion_stats: Option<FusionStats>,
    /// Strategy transitions accepted during this pass.
    pub events: Vec<TransitionEvent>,
    pub refinement: Option<RefineMetrics>,
    pub validation: Option<ValidationReport>,
    /// Why the refined mesh was discarded in favor of the reconstruction.
    pub refine_rejection: Option<FusionError>,
    /// Set when some stage returned best-effort output.
    pub partial: bool,
}

/// Long-lived context for a scanning session.
pub struct ScanSession {
    config: FusionConfig,
    backend: Arc<dyn ComputeBackend>,
    camera: Option<CameraIntrinsics>,
    controller: StrategyController,
    token: Mutex<CancellationToken>,
    progress: Option<Arc<ProgressCallback>>,
    passes: AtomicU64,
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("backend", &self.backend.name())
            .field("camera", &self.camera)
            .field("strategy", &self.controller.current())
            .field("passes", &self.passes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Stage gate shared by the steps of one pass.
struct PassGate<'a> {
    tracker: ProgressTracker,
    budget: Budget,
    token: &'a CancellationToken,
}

impl PassGate<'_> {
    fn enter(&self, stage: Stage, message: &str) -> FusionResult<()> {
        if !self.tracker.begin(stage, message) {
            return Err(FusionError::cancelled(stage));
        }
        self.budget.check(stage, self.token)
    }

    fn leave(&self) {
        self.tracker.finish_stage();
    }
}

impl ScanSession {
    /// Start a session, validating the whole configuration.
    pub fn new(config: FusionConfig) -> FusionResult<Self> {
        config.validate()?;
        let controller = StrategyController::new(config.strategy.clone());
        Ok(Self {
            config,
            backend: Arc::new(CpuBackend),
            camera: None,
            controller,
            token: Mutex::new(CancellationToken::new()),
            progress: None,
            passes: AtomicU64::new(0),
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_camera(mut self, camera: CameraIntrinsics) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Called at every stage boundary; returning `false` cancels the pass.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn controller(&self) -> &StrategyController {
        &self.controller
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Token observed by the current and following passes until [`restart`](Self::restart).
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// Abort any in-flight pass.
    pub fn cancel(&self) {
        self.token.lock().cancel();
    }

    pub fn subscribe(&self) -> Receiver<TransitionEvent> {
        self.controller.subscribe()
    }

    /// Begin a fresh scan: clear strategy history and issue a new token.
    ///
    /// Passes still holding the old token are cancelled.
    pub fn restart(&self) {
        let mut token = self.token.lock();
        token.cancel();
        *token = CancellationToken::new();
        self.controller.reset();
        self.passes.store(0, Ordering::Relaxed);
        info!("Scan session restarted");
    }

    /// Run one pass over a pair of point sets.
    pub fn process(&self, input: PassInput) -> FusionResult<PassOutput> {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("scan_pass", pass);
        let _enter = span.enter();

        let token = self.cancel_token();
        let gate = PassGate {
            tracker: ProgressTracker::new(PASS_STAGES, token.clone())
                .with_callback(self.progress.clone()),
            budget: Budget::new(self.config.pass_time_budget()),
            token: &token,
        };
        let backend = self.backend.as_ref();
        let features = input.features.as_slice();

        // 1. Inputs
        gate.enter(Stage::Validation, "Validating inputs")?;
        input.depth.validate()?;
        input.image.validate()?;
        if let Some(camera) = &self.camera {
            camera.validate()?;
        }
        let limits = &self.config.sources;
        let depth_usable = input.depth.len() >= limits.min_depth_points;
        let image_usable = input.image.len() >= limits.min_image_points;
        if !depth_usable && !image_usable {
            return Err(FusionError::insufficient_data(
                Stage::Validation,
                limits.min_depth_points,
                input.depth.len(),
            ));
        }
        let bounds = match input.bounds {
            Some(b) => b,
            None => BoundingBox::from_points(
                input.depth.iter().chain(input.image.iter()).map(|p| &p.position),
            )
            .ok_or_else(|| FusionError::insufficient_data(Stage::Validation, 1, 0))?,
        };
        log_cloud_stats(&input.depth, "depth");
        log_cloud_stats(&input.image, "image");
        gate.leave();

        // 2. Indices
        gate.enter(Stage::Indexing, "Building spatial indices")?;
        let kind = self.config.alignment.index_kind;
        let (depth_index, image_index) = rayon::join(
            || depth_usable.then(|| SpatialIndexHandle::build(kind, &input.depth)),
            || image_usable.then(|| SpatialIndexHandle::build(kind, &input.image)),
        );
        gate.leave();

        // 3. Quality
        gate.enter(Stage::Quality, "Estimating source quality")?;
        let estimator = QualityEstimator::new(self.config.quality.clone())
            .with_camera(self.camera)
            .with_backend(Arc::clone(&self.backend));
        let report_for = |cloud: &PointCloud, index: &Option<SpatialIndexHandle>| {
            index
                .as_ref()
                .map(|idx| estimator.report(estimator.estimate_with_index(cloud, idx, &bounds, features)))
        };
        let (depth_report, mut image_report) = rayon::join(
            || report_for(&input.depth, &depth_index),
            || report_for(&input.image, &image_index),
        );
        gate.leave();

        // 4. Alignment
        gate.enter(Stage::Alignment, "Aligning image points onto depth")?;
        let mut partial = false;
        let (alignment, aligned_image) = match (&depth_index, image_usable) {
            (Some(depth_index), true) => {
                let result = align_with_index(&input.image, depth_index, &self.config.alignment, &token);
                if result.is_failed() {
                    warn!(termination = ?result.termination, "Alignment failed, fused strategy unavailable");
                    (Some(result), input.image.clone())
                } else {
                    partial |= result.is_partial();
                    let aligned = input.image.transformed(&result.transform);
                    (Some(result), aligned)
                }
            }
            _ => (None, input.image.clone()),
        };
        let alignment_confidence = alignment
            .as_ref()
            .map_or(0.0, |r| estimator.alignment_confidence(r));
        if let (Some(report), Some(result)) = (image_report.as_mut(), alignment.as_ref()) {
            if result.residual.is_finite() {
                report.metrics = report.metrics.with_alignment_residual(result.residual);
            }
        }
        token.check(Stage::Alignment)?;
        gate.leave();

        // 5. Strategy
        gate.enter(Stage::Strategy, "Updating scanning strategy")?;
        let update = QualityUpdate::new(
            depth_report.as_ref().map_or(0.0, |r| r.confidence),
            image_report.as_ref().map_or(0.0, |r| r.confidence),
            alignment_confidence,
        );
        let decision = self.controller.update(update);
        let events: Vec<TransitionEvent> = decision.transition().cloned().into_iter().collect();
        let strategy = decision.into_result()?;
        debug!(%strategy, ?update, "Strategy decided");
        gate.leave();

        // 6. Selection or fusion
        gate.enter(Stage::Fusion, "Selecting source points")?;
        let mut fusion_stats = None;
        let cloud = match strategy {
            ScanningStrategy::DepthOnly if depth_usable => input.depth.clone(),
            ScanningStrategy::ImageOnly if image_usable => aligned_image,
            ScanningStrategy::Fused if depth_usable && image_usable => {
                let weights = SourceWeights::new(update.depth, update.image);
                let output = fuse(&input.depth, &aligned_image, weights, &self.config.fusion, &token)?;
                fusion_stats = Some(output.stats());
                output.cloud
            }
            other => {
                let (required, actual) = match other {
                    ScanningStrategy::ImageOnly => (limits.min_image_points, input.image.len()),
                    _ => (limits.min_depth_points, input.depth.len()),
                };
                return Err(FusionError::insufficient_data(Stage::Fusion, required, actual));
            }
        };
        gate.leave();

        // 7. Point smoothing
        gate.enter(Stage::Smoothing, "Smoothing points")?;
        let cloud = smooth_cloud(&cloud, features, backend, &self.config.smoothing, &token)?;
        gate.leave();

        // 8. Reconstruction
        gate.enter(Stage::Reconstruction, "Reconstructing surface")?;
        let reconstruction =
            reconstruct_with_backend(&cloud, backend, &self.config.reconstruction, &token)?;
        let mut mesh = reconstruction.mesh;
        gate.leave();

        let mut output = PassOutput {
            mesh: MeshData::empty(),
            quality: PassQuality {
                depth: depth_report,
                image: image_report,
                alignment_confidence,
                mesh: MeshQualityMetrics::default(),
            },
            strategy,
            alignment,
            fusion_stats,
            events,
            refinement: None,
            validation: None,
            refine_rejection: None,
            partial,
        };

        // From here on, running out of time returns what we have.
        if let Err(e) = gate.enter(Stage::Refinement, "Refining mesh") {
            return Self::finish_partial(output, mesh, e);
        }
        match refine_with_backend(&mesh, features, backend, &self.config.refine, &token) {
            Ok(outcome) => {
                if let Some(rejection) = &outcome.rejection {
                    warn!(error = %rejection, "Refinement rejected");
                }
                mesh = outcome.mesh;
                output.refinement = Some(outcome.metrics);
                output.validation = Some(outcome.report);
                output.refine_rejection = outcome.rejection;
            }
            Err(e @ FusionError::Cancelled { .. }) => return Err(e),
            Err(e) => return Self::finish_partial(output, mesh, e),
        }
        gate.leave();

        if let Err(e) = gate.enter(Stage::Validation, "Checking mesh quality floor") {
            return Self::finish_partial(output, mesh, e);
        }
        let mesh_quality = estimator.estimate_mesh(&mesh, features);
        self.config.quality.mesh_floor.check(&mesh_quality)?;
        let score = mesh_quality.score(&self.config.quality.mesh_floor.weights);
        mesh = mesh.with_step(
            Stage::Validation,
            format!("mesh quality {:.3}", score),
            gate.tracker.elapsed().as_secs_f64() * 1000.0,
        );
        if output.partial {
            mesh = mesh.into_partial();
        }
        gate.leave();

        info!(
            %strategy,
            triangles = mesh.triangle_count(),
            score,
            elapsed_ms = gate.tracker.elapsed().as_secs_f64() * 1000.0,
            "Pass complete"
        );
        output.quality.mesh = mesh_quality;
        output.mesh = mesh;
        Ok(output)
    }

    /// Return the mesh built so far when a late stage ran out of time.
    fn finish_partial(
        mut output: PassOutput,
        mesh: MeshData,
        error: FusionError,
    ) -> FusionResult<PassOutput> {
        if !matches!(error, FusionError::Timeout { .. }) {
            return Err(error);
        }
        warn!(error = %error, "Pass budget exhausted, returning partial mesh");
        output.partial = true;
        output.mesh = mesh.into_partial();
        Ok(output)
    }
}
