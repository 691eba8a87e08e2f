//! The process-wide wgpu device used by the point kernels.
//!
//! Opening an adapter is slow and can fail on headless machines, so it is
//! attempted once; every backend instance shares the result.

use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::error::{GpuError, GpuResult};

static SHARED: OnceLock<Option<GpuContext>> = OnceLock::new();

/// Adapter description for logs and `scanfuse gpu-info`.
#[derive(Debug, Clone)]
pub struct GpuAdapterInfo {
    pub name: String,
    pub vendor: String,
    pub device_type: String,
    pub backend: String,
}

impl From<wgpu::AdapterInfo> for GpuAdapterInfo {
    fn from(info: wgpu::AdapterInfo) -> Self {
        Self {
            name: info.name,
            vendor: format!("{:#06x}", info.vendor),
            device_type: format!("{:?}", info.device_type),
            backend: format!("{:?}", info.backend),
        }
    }
}

/// Device and queue of the high-performance adapter, with the limits that
/// bound how many points one dispatch can take.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: GpuAdapterInfo,
    pub limits: wgpu::Limits,
}

impl GpuContext {
    /// The shared context, or `None` when no adapter could be opened.
    ///
    /// ```no_run
    /// use scan_fusion_gpu::GpuContext;
    ///
    /// if let Some(ctx) = GpuContext::get() {
    ///     println!("kernels run on {}", ctx.adapter_info.name);
    /// }
    /// ```
    pub fn get() -> Option<&'static GpuContext> {
        SHARED
            .get_or_init(|| match pollster::block_on(Self::open()) {
                Ok(ctx) => {
                    info!(
                        adapter = %ctx.adapter_info.name,
                        backend = %ctx.adapter_info.backend,
                        max_points = ctx.max_workgroups() as u64 * crate::buffers::WORKGROUP_SIZE as u64,
                        "GPU point kernels available"
                    );
                    Some(ctx)
                }
                Err(e) => {
                    warn!(error = %e, "No GPU for point kernels, staying on the CPU");
                    None
                }
            })
            .as_ref()
    }

    pub fn try_get() -> GpuResult<&'static GpuContext> {
        Self::get().ok_or(GpuError::NotAvailable)
    }

    async fn open() -> GpuResult<GpuContext> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .ok_or(GpuError::NotAvailable)?;
        let adapter_info: GpuAdapterInfo = adapter.get_info().into();
        debug!(?adapter_info, "Adapter selected");

        // The kernels only need storage buffers and compute, so default
        // limits are enough.
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("scan-fusion-gpu"),
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| GpuError::Execution(format!("device request failed: {}", e)))?;

        let limits = device.limits();
        Ok(GpuContext {
            device,
            queue,
            adapter_info,
            limits,
        })
    }

    pub fn max_storage_buffer_size(&self) -> u32 {
        self.limits.max_storage_buffer_binding_size
    }

    /// Largest 1D dispatch, in workgroups.
    pub fn max_workgroups(&self) -> u32 {
        self.limits.max_compute_workgroups_per_dimension
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter_info", &self.adapter_info)
            .finish_non_exhaustive()
    }
}
