//! [`ComputeBackend`] on the GPU.

use std::sync::OnceLock;

use nalgebra::{Point3, Vector3};
use tracing::{debug, warn};

use scan_fusion::quality::PointQuality;
use scan_fusion::reconstruct::normals::LocalFrame;
use scan_fusion::refine::decimate::{CollapseCandidate, CollapseCost};
use scan_fusion::smoothing::{SmoothInput, SmoothingParams};
use scan_fusion::{ComputeBackend, CpuBackend};

use crate::context::GpuContext;
use crate::error::{GpuError, GpuResult};
use crate::quality::QualityPipeline;
use crate::smoothing::SmoothingPipeline;

/// Batches smaller than this stay on the CPU; upload and readback dominate.
pub const DEFAULT_MIN_GPU_POINTS: usize = 4096;

/// Runs the smoothing and quality kernels on the GPU.
///
/// Any device error falls back to [`CpuBackend`] for that call, so a pass
/// never fails because of the GPU. Normals and collapse costs always run on
/// the CPU: normals are needed in double precision for orientation, and
/// collapse candidates arrive in batches too small to pay for a dispatch.
pub struct GpuBackend {
    ctx: &'static GpuContext,
    cpu: CpuBackend,
    min_gpu_points: usize,
    smoothing: OnceLock<Option<SmoothingPipeline>>,
    quality: OnceLock<Option<QualityPipeline>>,
}

impl GpuBackend {
    /// Backend on the shared context.
    pub fn new() -> GpuResult<Self> {
        let ctx = GpuContext::try_get()?;
        Ok(Self {
            ctx,
            cpu: CpuBackend,
            min_gpu_points: DEFAULT_MIN_GPU_POINTS,
            smoothing: OnceLock::new(),
            quality: OnceLock::new(),
        })
    }

    /// `None` when no adapter is available.
    pub fn try_new() -> Option<Self> {
        Self::new().ok()
    }

    /// Smallest batch sent to the device.
    pub fn with_min_gpu_points(mut self, min_gpu_points: usize) -> Self {
        self.min_gpu_points = min_gpu_points;
        self
    }

    pub fn context(&self) -> &'static GpuContext {
        self.ctx
    }

    fn smoothing_pipeline(&self) -> GpuResult<&SmoothingPipeline> {
        self.smoothing
            .get_or_init(|| match SmoothingPipeline::new(self.ctx) {
                Ok(pipeline) => Some(pipeline),
                Err(e) => {
                    warn!("Bilateral kernel unavailable: {}", e);
                    None
                }
            })
            .as_ref()
            .ok_or(GpuError::NotAvailable)
    }

    fn quality_pipeline(&self) -> GpuResult<&QualityPipeline> {
        self.quality
            .get_or_init(|| match QualityPipeline::new(self.ctx) {
                Ok(pipeline) => Some(pipeline),
                Err(e) => {
                    warn!("Quality kernel unavailable: {}", e);
                    None
                }
            })
            .as_ref()
            .ok_or(GpuError::NotAvailable)
    }
}

impl std::fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackend")
            .field("adapter", &self.ctx.adapter_info.name)
            .field("min_gpu_points", &self.min_gpu_points)
            .finish_non_exhaustive()
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &str {
        "gpu"
    }

    fn covariance_normals(
        &self,
        positions: &[Point3<f64>],
        neighborhoods: &[Vec<usize>],
    ) -> Vec<Option<LocalFrame>> {
        self.cpu.covariance_normals(positions, neighborhoods)
    }

    fn bilateral_smooth(
        &self,
        points: &[SmoothInput],
        neighborhoods: &[Vec<usize>],
        params: &SmoothingParams,
    ) -> Vec<Point3<f64>> {
        if points.len() < self.min_gpu_points {
            return self.cpu.bilateral_smooth(points, neighborhoods, params);
        }
        let result = self
            .smoothing_pipeline()
            .and_then(|pipeline| pipeline.smooth(self.ctx, points, neighborhoods, params));
        match result {
            Ok(positions) => positions,
            Err(e) => {
                warn!("GPU smoothing failed, using CPU: {}", e);
                self.cpu.bilateral_smooth(points, neighborhoods, params)
            }
        }
    }

    fn collapse_costs(&self, candidates: &[CollapseCandidate]) -> Vec<CollapseCost> {
        self.cpu.collapse_costs(candidates)
    }

    fn quality_scores(
        &self,
        positions: &[Point3<f64>],
        normals: &[Option<Vector3<f64>>],
        neighborhoods: &[Vec<usize>],
    ) -> Vec<PointQuality> {
        if positions.len() < self.min_gpu_points {
            return self.cpu.quality_scores(positions, normals, neighborhoods);
        }
        let result = self
            .quality_pipeline()
            .and_then(|pipeline| pipeline.scores(self.ctx, positions, normals, neighborhoods));
        match result {
            Ok(scores) => scores,
            Err(e) => {
                warn!("GPU quality scoring failed, using CPU: {}", e);
                self.cpu.quality_scores(positions, normals, neighborhoods)
            }
        }
    }
}

/// The GPU backend when one is usable, otherwise the CPU backend.
pub fn best_available() -> Box<dyn ComputeBackend> {
    match GpuBackend::new() {
        Ok(backend) => {
            debug!(adapter = %backend.ctx.adapter_info.name, "Using GPU backend");
            Box::new(backend)
        }
        Err(e) => {
            debug!("Using CPU backend: {}", e);
            Box::new(CpuBackend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_fusion::spatial::{KdTree, SpatialIndex};

    fn wavy_sheet(n: usize) -> (Vec<Point3<f64>>, Vec<Vector3<f64>>) {
        let side = (n as f64).sqrt().ceil() as usize;
        let mut positions = Vec::with_capacity(n);
        let mut normals = Vec::with_capacity(n);
        for i in 0..n {
            let (x, y) = ((i % side) as f64 * 0.001, (i / side) as f64 * 0.001);
            let z = 0.5 + 0.0005 * (x * 200.0).sin();
            positions.push(Point3::new(x, y, z));
            let dzdx = 0.0005 * 200.0 * (x * 200.0).cos();
            normals.push(Vector3::new(-dzdx, 0.0, 1.0).normalize());
        }
        (positions, normals)
    }

    fn hoods(positions: &[Point3<f64>], k: usize) -> Vec<Vec<usize>> {
        let index = KdTree::build(positions.to_vec());
        positions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                index
                    .k_nearest(p, k + 1)
                    .into_iter()
                    .map(|n| n.index)
                    .filter(|&j| j != i)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_smoothing_matches_cpu() {
        let Some(gpu) = GpuBackend::try_new() else {
            eprintln!("Skipping: no GPU available");
            return;
        };
        let gpu = gpu.with_min_gpu_points(0);
        let (positions, normals) = wavy_sheet(2500);
        let neighborhoods = hoods(&positions, 12);
        let inputs: Vec<SmoothInput> = positions
            .iter()
            .zip(&normals)
            .enumerate()
            .map(|(i, (p, n))| SmoothInput {
                position: *p,
                normal: Some(*n),
                confidence: (i % 10) as f64 / 10.0,
                feature: i % 7 == 0,
            })
            .collect();
        let params = SmoothingParams::default();

        let expected = CpuBackend.bilateral_smooth(&inputs, &neighborhoods, &params);
        let got = gpu.bilateral_smooth(&inputs, &neighborhoods, &params);
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).norm() < 1e-6, "gpu {:?} cpu {:?}", g, e);
        }
    }

    #[test]
    fn test_quality_matches_cpu() {
        let Some(gpu) = GpuBackend::try_new() else {
            eprintln!("Skipping: no GPU available");
            return;
        };
        let gpu = gpu.with_min_gpu_points(0);
        let (positions, normals) = wavy_sheet(2500);
        let normals: Vec<Option<Vector3<f64>>> = normals
            .into_iter()
            .enumerate()
            .map(|(i, n)| (i % 5 != 0).then_some(n))
            .collect();
        let neighborhoods = hoods(&positions, 12);

        let expected = CpuBackend.quality_scores(&positions, &normals, &neighborhoods);
        let got = gpu.quality_scores(&positions, &normals, &neighborhoods);
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(&expected) {
            assert_eq!(g.normal_agreement.is_some(), e.normal_agreement.is_some());
            if let (Some(g), Some(e)) = (g.normal_agreement, e.normal_agreement) {
                assert!((g - e).abs() < 1e-4);
            }
            if let (Some(g), Some(e)) = (g.plane_deviation, e.plane_deviation) {
                assert!((g - e).abs() < 0.05, "gpu {} cpu {}", g, e);
            }
        }
    }

    #[test]
    fn test_small_batches_stay_on_cpu() {
        let Some(gpu) = GpuBackend::try_new() else {
            return;
        };
        let (positions, normals) = wavy_sheet(100);
        let normals: Vec<_> = normals.into_iter().map(Some).collect();
        let neighborhoods = hoods(&positions, 8);
        assert_eq!(
            gpu.quality_scores(&positions, &normals, &neighborhoods),
            CpuBackend.quality_scores(&positions, &normals, &neighborhoods)
        );
    }

    #[test]
    fn test_best_available_always_returns_a_backend() {
        let backend = best_available();
        assert!(matches!(backend.name(), "gpu" | "cpu"));
    }
}
