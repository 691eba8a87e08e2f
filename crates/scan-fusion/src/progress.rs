//! Progress reporting, cooperative cancellation and time budgets.
//!
//! Every bounded loop in the crate (ICP iterations, grid slices, edge
//! collapses) polls a [`CancellationToken`] between iterations, so a new
//! scanning session can abort in-flight work without hanging.
//!
//! # Example
//!
//! ```
//! use scan_fusion::progress::{Budget, CancellationToken};
//! use scan_fusion::Stage;
//! use std::time::Duration;
//!
//! let token = CancellationToken::new();
//! let budget = Budget::new(Some(Duration::from_secs(2)));
//! assert!(budget.check(Stage::Alignment, &token).is_ok());
//!
//! token.cancel();
//! assert!(budget.check(Stage::Alignment, &token).is_err());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{FusionError, FusionResult};
use crate::types::Stage;

/// Shared cancellation flag.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    #[inline]
    pub fn check(&self, stage: Stage) -> FusionResult<()> {
        if self.is_cancelled() {
            Err(FusionError::cancelled(stage))
        } else {
            Ok(())
        }
    }
}

/// Wall-clock budget for a bounded operation.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    start: Instant,
    limit: Option<Duration>,
}

impl Budget {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[inline]
    pub fn is_exceeded(&self) -> bool {
        self.limit.is_some_and(|limit| self.elapsed() > limit)
    }

    /// Poll both cancellation and the time limit.
    pub fn check(&self, stage: Stage, token: &CancellationToken) -> FusionResult<()> {
        token.check(stage)?;
        if self.is_exceeded() {
            return Err(FusionError::timeout(stage, self.elapsed()));
        }
        Ok(())
    }
}

/// Progress information passed to callbacks.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Stages completed so far.
    pub current: u64,
    /// Total number of stages.
    pub total: u64,
    /// Stage currently running.
    pub stage: Stage,
    /// Human-readable message describing the current step.
    pub message: String,
    /// Elapsed time since the pass started.
    pub elapsed: Duration,
}

impl Progress {
    /// Get progress as a fraction (0.0 to 1.0).
    #[inline]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64) / (self.total as f64)
        }
    }

    /// Get progress as a percentage (0 to 100).
    #[inline]
    pub fn percent(&self) -> u32 {
        (self.fraction() * 100.0).round() as u32
    }
}

/// Callback for progress reporting.
///
/// Returns `true` to continue, `false` to request cancellation.
pub type ProgressCallback = Box<dyn Fn(&Progress) -> bool + Send + Sync>;

/// Counts completed stages of a pass and forwards snapshots to a callback.
///
/// A callback returning `false` cancels the attached token.
pub struct ProgressTracker {
    current: AtomicU64,
    total: u64,
    start_time: Instant,
    token: CancellationToken,
    callback: Option<Arc<ProgressCallback>>,
    last_message: Mutex<String>,
}

impl ProgressTracker {
    pub fn new(total: u64, token: CancellationToken) -> Self {
        Self {
            current: AtomicU64::new(0),
            total,
            start_time: Instant::now(),
            token,
            callback: None,
            last_message: Mutex::new(String::new()),
        }
    }

    pub fn with_callback(mut self, callback: Option<Arc<ProgressCallback>>) -> Self {
        self.callback = callback;
        self
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn last_message(&self) -> String {
        self.last_message.lock().clone()
    }

    /// Report that `stage` is starting. Returns `false` if the pass was cancelled.
    pub fn begin(&self, stage: Stage, message: impl Into<String>) -> bool {
        let message = message.into();
        *self.last_message.lock() = message.clone();
        if self.token.is_cancelled() {
            return false;
        }
        let Some(callback) = &self.callback else {
            return true;
        };
        let progress = Progress {
            current: self.current(),
            total: self.total,
            stage,
            message,
            elapsed: self.elapsed(),
        };
        let keep_going = callback(&progress);
        if !keep_going {
            self.token.cancel();
        }
        keep_going
    }

    /// Mark one stage as finished.
    pub fn finish_stage(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("current", &self.current())
            .field("total", &self.total)
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}
