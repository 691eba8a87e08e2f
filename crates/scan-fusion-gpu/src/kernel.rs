//! Compiled compute kernels.
//!
//! Both kernels share one binding layout:
//!
//! | Binding | Kind | Contents |
//! |---------|------|----------|
//! | 0 | uniform | kernel parameters |
//! | 1 | storage, read | per-point input |
//! | 2 | storage, read | neighbor offsets |
//! | 3 | storage, read | neighbor indices |
//! | 4 | storage, read_write | per-point output |

use tracing::debug;
use wgpu::{BindGroupLayout, Buffer, ComputePipeline};

use crate::buffers::{NeighborBuffers, workgroups_for};
use crate::context::GpuContext;
use crate::error::{GpuError, GpuResult};

fn layout_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// A compute pipeline over the per-point binding layout.
pub struct PointKernel {
    label: &'static str,
    pipeline: ComputePipeline,
    bind_group_layout: BindGroupLayout,
}

impl PointKernel {
    /// Compile `source` and build a pipeline for `entry_point`.
    ///
    /// Validation errors are captured and returned as
    /// [`GpuError::ShaderCompilation`] instead of panicking the device.
    pub fn new(
        ctx: &GpuContext,
        label: &'static str,
        source: &str,
        entry_point: &str,
    ) -> GpuResult<Self> {
        debug!(kernel = label, "Creating compute pipeline");
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let read_only = wgpu::BufferBindingType::Storage { read_only: true };
        let bind_group_layout =
            ctx.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(label),
                    entries: &[
                        layout_entry(0, wgpu::BufferBindingType::Uniform),
                        layout_entry(1, read_only),
                        layout_entry(2, read_only),
                        layout_entry(3, read_only),
                        layout_entry(4, wgpu::BufferBindingType::Storage { read_only: false }),
                    ],
                });

        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        if let Some(error) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(GpuError::ShaderCompilation(format!("{}: {}", label, error)));
        }

        Ok(Self {
            label,
            pipeline,
            bind_group_layout,
        })
    }

    /// Run one invocation per point and wait for the queue to drain.
    pub fn dispatch(
        &self,
        ctx: &GpuContext,
        params: &Buffer,
        points: &Buffer,
        neighbors: &NeighborBuffers,
        output: &Buffer,
        count: usize,
    ) -> GpuResult<()> {
        let workgroups = workgroups_for(ctx, count)?;
        if workgroups == 0 {
            return Ok(());
        }

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: points.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: neighbors.offsets.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: neighbors.indices.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: output.as_entire_binding(),
                },
            ],
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(self.label),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        ctx.queue.submit([encoder.finish()]);
        Ok(())
    }
}
