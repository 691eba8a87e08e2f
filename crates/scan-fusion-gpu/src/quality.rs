//! GPU per-point quality scores.

use std::time::Instant;

use nalgebra::{Point3, Vector3};
use tracing::debug;

use scan_fusion::quality::{MIN_QUALITY_NEIGHBORS, PointQuality};

use crate::buffers::{
    GpuQualityOut, GpuQualityParams, GpuQualityPoint, NeighborBuffers, batch_origin, check_fits,
    download, output_buffer, relative, storage_buffer, uniform_buffer,
};
use crate::context::GpuContext;
use crate::error::GpuResult;
use crate::kernel::PointKernel;

const QUALITY_SHADER: &str = include_str!("shaders/point_quality.wgsl");

const HAS_AGREEMENT: u32 = 1;
const HAS_DEVIATION: u32 = 2;

pub struct QualityPipeline {
    kernel: PointKernel,
}

impl QualityPipeline {
    pub fn new(ctx: &GpuContext) -> GpuResult<Self> {
        Ok(Self {
            kernel: PointKernel::new(ctx, "point_quality", QUALITY_SHADER, "point_quality")?,
        })
    }

    /// Normal agreement and plane deviation for every point.
    pub fn scores(
        &self,
        ctx: &GpuContext,
        positions: &[Point3<f64>],
        normals: &[Option<Vector3<f64>>],
        neighborhoods: &[Vec<usize>],
    ) -> GpuResult<Vec<PointQuality>> {
        let start = Instant::now();
        check_fits(ctx, "points", positions.len(), std::mem::size_of::<GpuQualityPoint>())?;

        let origin = batch_origin(positions.iter());
        let gpu_points: Vec<GpuQualityPoint> = positions
            .iter()
            .zip(normals)
            .map(|(p, n)| GpuQualityPoint {
                position: relative(p, &origin),
                normal: n.map_or([0.0; 4], |n| [n.x as f32, n.y as f32, n.z as f32, 1.0]),
            })
            .collect();

        let uniforms = GpuQualityParams {
            count: positions.len() as u32,
            min_neighbors: MIN_QUALITY_NEIGHBORS as u32,
            _padding: [0; 2],
        };

        let neighbors = NeighborBuffers::upload(ctx, neighborhoods)?;
        let params_buffer = uniform_buffer(ctx, "quality_params", &uniforms);
        let points_buffer = storage_buffer(ctx, "quality_points", &gpu_points);
        let output = output_buffer::<GpuQualityOut>(ctx, "quality_out", positions.len());

        self.kernel.dispatch(
            ctx,
            &params_buffer,
            &points_buffer,
            &neighbors,
            &output,
            positions.len(),
        )?;
        let results: Vec<GpuQualityOut> = download(ctx, &output, positions.len())?;

        debug!(
            points = positions.len(),
            time_ms = start.elapsed().as_secs_f64() * 1000.0,
            "GPU quality scores"
        );

        Ok(results
            .into_iter()
            .map(|r| PointQuality {
                normal_agreement: (r.flags & HAS_AGREEMENT != 0).then_some(r.normal_agreement as f64),
                plane_deviation: (r.flags & HAS_DEVIATION != 0).then_some(r.plane_deviation as f64),
            })
            .collect())
    }
}

/// Quality scores on the shared GPU context.
pub fn quality_scores_gpu(
    positions: &[Point3<f64>],
    normals: &[Option<Vector3<f64>>],
    neighborhoods: &[Vec<usize>],
) -> GpuResult<Vec<PointQuality>> {
    let ctx = GpuContext::try_get()?;
    QualityPipeline::new(ctx)?.scores(ctx, positions, normals, neighborhoods)
}
