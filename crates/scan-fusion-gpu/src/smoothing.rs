//! GPU bilateral smoothing step.

use std::time::Instant;

use nalgebra::{Point3, Vector3};
use tracing::debug;

use scan_fusion::smoothing::{SmoothInput, SmoothingParams};

use crate::buffers::{
    FLAG_FEATURE, FLAG_HAS_NORMAL, GpuSmoothParams, GpuSmoothPoint, NeighborBuffers,
    batch_origin, check_fits, download, output_buffer, relative, storage_buffer, uniform_buffer,
};
use crate::context::GpuContext;
use crate::error::GpuResult;
use crate::kernel::PointKernel;

const BILATERAL_SHADER: &str = include_str!("shaders/bilateral.wgsl");

/// Compiled bilateral kernel; build once and reuse across calls.
pub struct SmoothingPipeline {
    kernel: PointKernel,
}

impl SmoothingPipeline {
    pub fn new(ctx: &GpuContext) -> GpuResult<Self> {
        Ok(Self {
            kernel: PointKernel::new(ctx, "bilateral_smooth", BILATERAL_SHADER, "bilateral_step")?,
        })
    }

    /// One smoothing step: the new position of every point.
    ///
    /// Displacements are computed on the device in `f32` and added to the
    /// `f64` positions on the host.
    pub fn smooth(
        &self,
        ctx: &GpuContext,
        points: &[SmoothInput],
        neighborhoods: &[Vec<usize>],
        params: &SmoothingParams,
    ) -> GpuResult<Vec<Point3<f64>>> {
        let start = Instant::now();
        check_fits(ctx, "points", points.len(), std::mem::size_of::<GpuSmoothPoint>())?;

        let origin = batch_origin(points.iter().map(|p| &p.position));
        let gpu_points: Vec<GpuSmoothPoint> = points
            .iter()
            .map(|p| {
                let mut flags = 0;
                let mut normal = [0.0f32; 4];
                if let Some(n) = p.normal {
                    flags |= FLAG_HAS_NORMAL;
                    normal = [n.x as f32, n.y as f32, n.z as f32, 0.0];
                }
                if p.feature {
                    flags |= FLAG_FEATURE;
                }
                GpuSmoothPoint {
                    position: relative(&p.position, &origin),
                    normal,
                    confidence: p.confidence as f32,
                    flags,
                    _padding: [0; 2],
                }
            })
            .collect();

        let uniforms = GpuSmoothParams {
            inv_spatial: (1.0 / (2.0 * params.spatial_sigma * params.spatial_sigma)) as f32,
            inv_range: (1.0 / (2.0 * params.range_sigma * params.range_sigma)) as f32,
            confidence_threshold: params.confidence_threshold as f32,
            feature_weight: params.feature_weight as f32,
            count: points.len() as u32,
            _padding: [0; 3],
        };

        let neighbors = NeighborBuffers::upload(ctx, neighborhoods)?;
        let params_buffer = uniform_buffer(ctx, "smooth_params", &uniforms);
        let points_buffer = storage_buffer(ctx, "smooth_points", &gpu_points);
        let output = output_buffer::<[f32; 4]>(ctx, "smooth_displacements", points.len());

        self.kernel.dispatch(
            ctx,
            &params_buffer,
            &points_buffer,
            &neighbors,
            &output,
            points.len(),
        )?;
        let displacements: Vec<[f32; 4]> = download(ctx, &output, points.len())?;

        debug!(
            points = points.len(),
            neighbor_entries = neighbors.total,
            time_ms = start.elapsed().as_secs_f64() * 1000.0,
            "GPU bilateral step"
        );

        Ok(points
            .iter()
            .zip(displacements)
            .map(|(p, d)| p.position + Vector3::new(d[0] as f64, d[1] as f64, d[2] as f64))
            .collect())
    }
}

/// One bilateral step on the shared GPU context.
pub fn bilateral_smooth_gpu(
    points: &[SmoothInput],
    neighborhoods: &[Vec<usize>],
    params: &SmoothingParams,
) -> GpuResult<Vec<Point3<f64>>> {
    let ctx = GpuContext::try_get()?;
    SmoothingPipeline::new(ctx)?.smooth(ctx, points, neighborhoods, params)
}
