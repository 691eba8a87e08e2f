//! wgpu compute backend for scan-fusion.
//!
//! Implements [`scan_fusion::ComputeBackend`] with WGSL kernels for the two
//! per-point stages that dominate a pass on large clouds:
//!
//! | Kernel | Device | Notes |
//! |--------|--------|-------|
//! | Bilateral smoothing | GPU | displacement in `f32`, applied in `f64` |
//! | Point quality | GPU | normal agreement, PCA plane deviation |
//! | Covariance normals | CPU | orientation needs double precision |
//! | Collapse costs | CPU | batches too small for a dispatch |
//!
//! Batches under [`backend::DEFAULT_MIN_GPU_POINTS`] stay on the CPU, and
//! any device error falls back to [`scan_fusion::CpuBackend`] for that call
//! with a warning in the log.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scan_fusion::{FusionConfig, ScanSession};
//! use scan_fusion_gpu::GpuBackend;
//!
//! let mut session = ScanSession::new(FusionConfig::default()).unwrap();
//! if let Some(gpu) = GpuBackend::try_new() {
//!     session = session.with_backend(Arc::new(gpu));
//! }
//! println!("backend: {}", session.backend_name());
//! ```
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench -p scan-fusion-gpu
//! ```

pub mod backend;
pub mod buffers;
pub mod context;
pub mod error;
pub mod kernel;
pub mod quality;
pub mod smoothing;

pub use backend::{GpuBackend, best_available};
pub use context::{GpuAdapterInfo, GpuContext};
pub use error::{GpuError, GpuResult};
pub use quality::{QualityPipeline, quality_scores_gpu};
pub use smoothing::{SmoothingPipeline, bilateral_smooth_gpu};
