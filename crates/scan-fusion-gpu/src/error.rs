//! GPU error types.

use thiserror::Error;

/// Errors that can occur during GPU operations.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No compatible adapter on this system.
    #[error("GPU not available: no compatible device found")]
    NotAvailable,

    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("GPU execution failed: {0}")]
    Execution(String),

    #[error("buffer mapping failed: {0}")]
    BufferMapping(String),

    /// Input does not fit in one storage binding.
    #[error("input too large for GPU: {elements} {what}, max supported: {max}")]
    InputTooLarge {
        what: &'static str,
        elements: usize,
        max: usize,
    },
}

/// Result type for GPU operations.
pub type GpuResult<T> = Result<T, GpuError>;
