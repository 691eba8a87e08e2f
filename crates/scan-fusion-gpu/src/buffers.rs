//! Buffer layouts shared with the WGSL kernels, and upload/readback helpers.
//!
//! Positions are uploaded in `f32` relative to a per-call origin (the mean
//! of the batch), so that small neighborhood offsets keep their precision
//! when the scan sits far from the camera.

use bytemuck::{Pod, Zeroable};
use nalgebra::{Point3, Vector3};
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages};

use crate::context::GpuContext;
use crate::error::{GpuError, GpuResult};

/// Threads per workgroup in every kernel.
pub const WORKGROUP_SIZE: u32 = 256;

pub const FLAG_HAS_NORMAL: u32 = 1;
pub const FLAG_FEATURE: u32 = 2;

/// One point of the bilateral kernel. 48 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuSmoothPoint {
    /// Position relative to the batch origin (xyz) + padding.
    pub position: [f32; 4],
    /// Unit normal (xyz) + padding.
    pub normal: [f32; 4],
    pub confidence: f32,
    pub flags: u32,
    pub _padding: [u32; 2],
}

/// Uniforms of the bilateral kernel. 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuSmoothParams {
    /// `1 / (2 σs²)`.
    pub inv_spatial: f32,
    /// `1 / (2 σr²)`.
    pub inv_range: f32,
    pub confidence_threshold: f32,
    pub feature_weight: f32,
    pub count: u32,
    pub _padding: [u32; 3],
}

/// One point of the quality kernel. 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuQualityPoint {
    pub position: [f32; 4],
    /// Unit normal (xyz); w is 1 when the normal exists.
    pub normal: [f32; 4],
}

/// Uniforms of the quality kernel. 16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuQualityParams {
    pub count: u32,
    pub min_neighbors: u32,
    pub _padding: [u32; 2],
}

/// Output of the quality kernel. 16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuQualityOut {
    pub normal_agreement: f32,
    pub plane_deviation: f32,
    /// Bit 0: agreement is set. Bit 1: deviation is set.
    pub flags: u32,
    pub _padding: u32,
}

/// Mean of a batch of positions.
pub fn batch_origin<'a>(positions: impl ExactSizeIterator<Item = &'a Point3<f64>>) -> Point3<f64> {
    let n = positions.len();
    if n == 0 {
        return Point3::origin();
    }
    Point3::from(positions.fold(Vector3::zeros(), |acc, p| acc + p.coords) / n as f64)
}

/// `[x, y, z, 0]` relative to `origin`.
pub fn relative(p: &Point3<f64>, origin: &Point3<f64>) -> [f32; 4] {
    let d = p - origin;
    [d.x as f32, d.y as f32, d.z as f32, 0.0]
}

/// Neighbor lists in compressed-row form: the neighbors of point `i` are
/// `indices[offsets[i]..offsets[i + 1]]`.
pub struct NeighborBuffers {
    pub offsets: Buffer,
    pub indices: Buffer,
    pub total: usize,
}

impl NeighborBuffers {
    pub fn upload(ctx: &GpuContext, neighborhoods: &[Vec<usize>]) -> GpuResult<Self> {
        let mut offsets = Vec::with_capacity(neighborhoods.len() + 1);
        let mut indices = Vec::new();
        offsets.push(0u32);
        for hood in neighborhoods {
            indices.extend(hood.iter().map(|&j| j as u32));
            offsets.push(indices.len() as u32);
        }
        let total = indices.len();
        check_fits(ctx, "neighbor entries", total, std::mem::size_of::<u32>())?;
        // Zero-sized storage bindings are invalid.
        if indices.is_empty() {
            indices.push(0);
        }
        Ok(Self {
            offsets: storage_buffer(ctx, "neighbor_offsets", &offsets),
            indices: storage_buffer(ctx, "neighbor_indices", &indices),
            total,
        })
    }
}

/// Fail early when `count` elements of `size` bytes exceed one storage binding.
pub fn check_fits(ctx: &GpuContext, what: &'static str, count: usize, size: usize) -> GpuResult<()> {
    let max = ctx.max_storage_buffer_size() as usize / size;
    if count > max {
        return Err(GpuError::InputTooLarge {
            what,
            elements: count,
            max,
        });
    }
    Ok(())
}

pub fn storage_buffer<T: Pod>(ctx: &GpuContext, label: &str, data: &[T]) -> Buffer {
    ctx.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: BufferUsages::STORAGE,
        })
}

pub fn uniform_buffer<T: Pod>(ctx: &GpuContext, label: &str, value: &T) -> Buffer {
    ctx.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(value),
            usage: BufferUsages::UNIFORM,
        })
}

/// Writable storage for `count` outputs of `T`.
pub fn output_buffer<T: Pod>(ctx: &GpuContext, label: &str, count: usize) -> Buffer {
    ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (count.max(1) * std::mem::size_of::<T>()) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

/// Copy a storage buffer back to the CPU.
pub fn download<T: Pod>(ctx: &GpuContext, buffer: &Buffer, count: usize) -> GpuResult<Vec<T>> {
    let size = (count * std::mem::size_of::<T>()) as u64;
    if size == 0 {
        return Ok(Vec::new());
    }
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback_staging"),
        size,
        usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    ctx.queue.submit([encoder.finish()]);

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        // The receiver outlives the poll below.
        let _ = tx.send(result);
    });
    ctx.device.poll(wgpu::Maintain::Wait);

    rx.recv()
        .map_err(|_| GpuError::BufferMapping("channel closed".into()))?
        .map_err(|e| GpuError::BufferMapping(format!("{:?}", e)))?;

    let data = slice.get_mapped_range();
    let values: Vec<T> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();
    Ok(values)
}

/// Workgroups needed to cover `count` invocations.
pub fn workgroups_for(ctx: &GpuContext, count: usize) -> GpuResult<u32> {
    let groups = (count as u64).div_ceil(WORKGROUP_SIZE as u64);
    if groups > ctx.max_workgroups() as u64 {
        return Err(GpuError::InputTooLarge {
            what: "points",
            elements: count,
            max: ctx.max_workgroups() as usize * WORKGROUP_SIZE as usize,
        });
    }
    Ok(groups as u32)
}
