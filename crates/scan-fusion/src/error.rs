//! Error types for fusion passes with rich diagnostics.
//!
//! Every error carries:
//! - A machine-readable code (`FUSE-XXXX`)
//! - The pipeline [`Stage`] it was raised in, when known
//! - A recovery suggestion the caller (or the strategy controller) can act on
//! - miette diagnostics for terminal display
//!
//! # Error Codes
//!
//! - `FUSE-1xxx`: Input data errors (too few points, malformed input)
//! - `FUSE-2xxx`: Alignment errors
//! - `FUSE-3xxx`: Quality gate failures
//! - `FUSE-4xxx`: Mesh topology errors
//! - `FUSE-5xxx`: Runtime budget errors (timeouts, cancellation)
//! - `FUSE-6xxx`: Configuration errors
//!
//! # Example
//!
//! ```
//! use scan_fusion::{FusionError, ErrorCode, Stage};
//!
//! let err = FusionError::insufficient_data(Stage::Alignment, 3, 1);
//! assert_eq!(err.code(), ErrorCode::InsufficientData);
//! assert_eq!(err.code().as_str(), "FUSE-1001");
//! ```

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::strategy::StrategyScores;
use crate::types::Stage;

/// Result type alias for fusion operations.
pub type FusionResult<T> = Result<T, FusionError>;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Data errors (1xxx)
    /// FUSE-1001: Too few points or features to proceed
    InsufficientData = 1001,
    /// FUSE-1002: Malformed input (non-finite coordinates, bad indices)
    InvalidInput = 1002,

    // Alignment errors (2xxx)
    /// FUSE-2001: ICP could not find enough correspondences
    AlignmentFailed = 2001,

    // Quality errors (3xxx)
    /// FUSE-3001: A stage output failed its quality gate
    QualityBelowThreshold = 3001,
    /// FUSE-3002: No scanning strategy is currently viable
    RecalibrationRequired = 3002,

    // Topology errors (4xxx)
    /// FUSE-4001: Mesh failed manifold/degeneracy validation
    InvalidTopology = 4001,

    // Runtime errors (5xxx)
    /// FUSE-5001: A bounded operation exceeded its time budget
    Timeout = 5001,
    /// FUSE-5002: The pass was cancelled cooperatively
    Cancelled = 5002,

    // Configuration errors (6xxx)
    /// FUSE-6001: Configuration failed validation
    InvalidConfig = 6001,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `FUSE-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InsufficientData => "FUSE-1001",
            ErrorCode::InvalidInput => "FUSE-1002",
            ErrorCode::AlignmentFailed => "FUSE-2001",
            ErrorCode::QualityBelowThreshold => "FUSE-3001",
            ErrorCode::RecalibrationRequired => "FUSE-3002",
            ErrorCode::InvalidTopology => "FUSE-4001",
            ErrorCode::Timeout => "FUSE-5001",
            ErrorCode::Cancelled => "FUSE-5002",
            ErrorCode::InvalidConfig => "FUSE-6001",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery suggestions for fusion errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoverySuggestion {
    /// Capture more data before retrying.
    AcquireMoreData { minimum_points: usize },
    /// Retry with relaxed thresholds.
    RelaxThresholds { parameters: Vec<(String, String)> },
    /// Fall back to a single-source strategy.
    FallBackToSingleSource,
    /// Accept the result of the previous stage.
    AcceptPreviousStage,
    /// Ask the user to recalibrate sensors.
    Recalibrate,
    /// Increase the time budget or reduce resolution.
    IncreaseBudget { stage: Stage },
    /// Restart the scanning session.
    RestartSession,
    /// Fix the configuration value.
    FixConfiguration { field: String },
    /// Check the input data.
    CheckInput { checks: Vec<String> },
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::AcquireMoreData { minimum_points } => {
                write!(f, "Capture more data (at least {} points)", minimum_points)
            }
            RecoverySuggestion::RelaxThresholds { parameters } => {
                let params: Vec<String> = parameters
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                write!(f, "Retry with relaxed thresholds: {}", params.join(", "))
            }
            RecoverySuggestion::FallBackToSingleSource => {
                write!(f, "Fall back to a single-source scanning strategy")
            }
            RecoverySuggestion::AcceptPreviousStage => {
                write!(f, "Accept the previous stage's result or retry with a lower quality preset")
            }
            RecoverySuggestion::Recalibrate => {
                write!(f, "Recalibrate the sensors and restart the scan")
            }
            RecoverySuggestion::IncreaseBudget { stage } => {
                write!(f, "Increase the time budget or lower the resolution for {}", stage)
            }
            RecoverySuggestion::RestartSession => write!(f, "Restart the scanning session"),
            RecoverySuggestion::FixConfiguration { field } => {
                write!(f, "Fix configuration value `{}`", field)
            }
            RecoverySuggestion::CheckInput { checks } => {
                write!(f, "Check the input data for: {}", checks.join(", "))
            }
        }
    }
}

/// Errors that can occur during a fusion pass.
#[derive(Debug, Error, Diagnostic)]
pub enum FusionError {
    /// Too few points or features to proceed.
    #[error("insufficient data for {stage}: need {required}, have {actual}")]
    #[diagnostic(
        code(fusion::data::insufficient),
        help("Keep scanning until more points are captured.")
    )]
    InsufficientData {
        stage: Stage,
        required: usize,
        actual: usize,
    },

    /// Malformed input data.
    #[error("invalid input: {details}")]
    #[diagnostic(
        code(fusion::data::invalid),
        help("Check for NaN coordinates or mismatched array lengths in the source data.")
    )]
    InvalidInput { details: String },

    /// ICP could not register the sources.
    #[error("alignment failed with {correspondences} correspondences: {details}")]
    #[diagnostic(
        code(fusion::alignment::failed),
        help(
            "Retry with a larger correspondence distance, or fall back to a single-source strategy."
        )
    )]
    AlignmentFailed {
        correspondences: usize,
        details: String,
    },

    /// A stage output failed its quality gate.
    #[error("{metric} is {value:.3}, below the threshold of {threshold:.3}")]
    #[diagnostic(
        code(fusion::quality::below_threshold),
        help("Retry with a lower quality preset or accept the previous stage's result.")
    )]
    QualityBelowThreshold {
        metric: String,
        value: f64,
        threshold: f64,
    },

    /// No strategy clears its validity threshold.
    #[error(
        "no scanning strategy is viable (depth {:.2}, image {:.2}, fused {:.2})",
        .scores.depth_only,
        .scores.image_only,
        .scores.fused
    )]
    #[diagnostic(
        code(fusion::strategy::recalibrate),
        help("Sensor or user intervention is needed before scanning can continue.")
    )]
    RecalibrationRequired { scores: StrategyScores },

    /// The mesh failed topology validation.
    #[error("invalid mesh topology: {reason}")]
    #[diagnostic(
        code(fusion::topology::invalid),
        help("The previous-stage mesh is kept; try a less aggressive decimation target.")
    )]
    InvalidTopology { reason: String },

    /// A bounded operation exceeded its time budget.
    #[error("{stage} timed out after {:.1} ms", .elapsed.as_secs_f64() * 1000.0)]
    #[diagnostic(
        code(fusion::runtime::timeout),
        help("Increase the pass time budget or lower the grid resolution.")
    )]
    Timeout { stage: Stage, elapsed: Duration },

    /// The pass was cancelled.
    #[error("{stage} was cancelled")]
    #[diagnostic(code(fusion::runtime::cancelled))]
    Cancelled { stage: Stage },

    /// Configuration failed validation.
    #[error("invalid configuration `{field}`: {details}")]
    #[diagnostic(
        code(fusion::config::invalid),
        help("See `scanfuse config` for the default configuration.")
    )]
    InvalidConfig { field: String, details: String },
}

impl FusionError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            FusionError::InsufficientData { .. } => ErrorCode::InsufficientData,
            FusionError::InvalidInput { .. } => ErrorCode::InvalidInput,
            FusionError::AlignmentFailed { .. } => ErrorCode::AlignmentFailed,
            FusionError::QualityBelowThreshold { .. } => ErrorCode::QualityBelowThreshold,
            FusionError::RecalibrationRequired { .. } => ErrorCode::RecalibrationRequired,
            FusionError::InvalidTopology { .. } => ErrorCode::InvalidTopology,
            FusionError::Timeout { .. } => ErrorCode::Timeout,
            FusionError::Cancelled { .. } => ErrorCode::Cancelled,
            FusionError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            FusionError::InsufficientData { required, .. } => {
                RecoverySuggestion::AcquireMoreData {
                    minimum_points: *required,
                }
            }
            FusionError::InvalidInput { .. } => RecoverySuggestion::CheckInput {
                checks: vec!["finite coordinates".into(), "array lengths".into()],
            },
            FusionError::AlignmentFailed { .. } => RecoverySuggestion::FallBackToSingleSource,
            FusionError::QualityBelowThreshold { .. } => RecoverySuggestion::AcceptPreviousStage,
            FusionError::RecalibrationRequired { .. } => RecoverySuggestion::Recalibrate,
            FusionError::InvalidTopology { .. } => RecoverySuggestion::RelaxThresholds {
                parameters: vec![("target_triangles".into(), "try a higher value".into())],
            },
            FusionError::Timeout { stage, .. } => {
                RecoverySuggestion::IncreaseBudget { stage: *stage }
            }
            FusionError::Cancelled { .. } => RecoverySuggestion::RestartSession,
            FusionError::InvalidConfig { field, .. } => RecoverySuggestion::FixConfiguration {
                field: field.clone(),
            },
        }
    }

    /// Returns the stage the error was raised in, if known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            FusionError::InsufficientData { stage, .. }
            | FusionError::Timeout { stage, .. }
            | FusionError::Cancelled { stage } => Some(*stage),
            FusionError::AlignmentFailed { .. } => Some(Stage::Alignment),
            FusionError::RecalibrationRequired { .. } => Some(Stage::Strategy),
            FusionError::InvalidTopology { .. } => Some(Stage::Validation),
            _ => None,
        }
    }

    /// Whether the error still leaves a usable best-effort result behind.
    pub fn is_partial(&self) -> bool {
        matches!(self, FusionError::Timeout { .. })
    }

    // Constructor helpers

    /// Create an InsufficientData error.
    pub fn insufficient_data(stage: Stage, required: usize, actual: usize) -> Self {
        FusionError::InsufficientData {
            stage,
            required,
            actual,
        }
    }

    /// Create an InvalidInput error.
    pub fn invalid_input(details: impl Into<String>) -> Self {
        FusionError::InvalidInput {
            details: details.into(),
        }
    }

    /// Create an AlignmentFailed error.
    pub fn alignment_failed(correspondences: usize, details: impl Into<String>) -> Self {
        FusionError::AlignmentFailed {
            correspondences,
            details: details.into(),
        }
    }

    /// Create a QualityBelowThreshold error.
    pub fn quality_below_threshold(metric: impl Into<String>, value: f64, threshold: f64) -> Self {
        FusionError::QualityBelowThreshold {
            metric: metric.into(),
            value,
            threshold,
        }
    }

    /// Create an InvalidTopology error.
    pub fn invalid_topology(reason: impl Into<String>) -> Self {
        FusionError::InvalidTopology {
            reason: reason.into(),
        }
    }

    /// Create a Timeout error.
    pub fn timeout(stage: Stage, elapsed: Duration) -> Self {
        FusionError::Timeout { stage, elapsed }
    }

    /// Create a Cancelled error.
    pub fn cancelled(stage: Stage) -> Self {
        FusionError::Cancelled { stage }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(field: impl Into<String>, details: impl Into<String>) -> Self {
        FusionError::InvalidConfig {
            field: field.into(),
            details: details.into(),
        }
    }
}

/// Issues collected while validating a mesh.
///
/// Unlike [`FusionError`], several issues can be gathered in one pass and
/// some are only warnings.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// Triangle references a vertex slot that doesn't exist.
    InvalidIndex {
        triangle: usize,
        index: u32,
        vertex_count: usize,
    },
    /// Triangle area is below epsilon.
    DegenerateTriangle { triangle: usize, area: f64 },
    /// Edge shared by more than two triangles.
    NonManifoldEdge { a: u32, b: u32, triangles: usize },
    /// Same directed edge used twice (inconsistent winding).
    InconsistentWinding { a: u32, b: u32 },
    /// Normal is not unit length within tolerance.
    NonUnitNormal { vertex: usize, length: f64 },
    /// Hole larger than the configured edge bound.
    OversizedHole { edges: usize, max_edges: usize },
    /// More holes than the configured bound.
    TooManyHoles { count: usize, max: usize },
}

impl ValidationIssue {
    /// Returns a severity level for the issue.
    pub fn severity(&self) -> IssueSeverity {
        match self {
            ValidationIssue::InvalidIndex { .. }
            | ValidationIssue::DegenerateTriangle { .. }
            | ValidationIssue::NonManifoldEdge { .. }
            | ValidationIssue::InconsistentWinding { .. }
            | ValidationIssue::NonUnitNormal { .. } => IssueSeverity::Error,
            ValidationIssue::OversizedHole { .. } | ValidationIssue::TooManyHoles { .. } => {
                IssueSeverity::Warning
            }
        }
    }

    /// Returns an error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationIssue::InvalidIndex { .. } => "FUSE-4002",
            ValidationIssue::DegenerateTriangle { .. } => "FUSE-4003",
            ValidationIssue::NonManifoldEdge { .. } => "FUSE-4004",
            ValidationIssue::InconsistentWinding { .. } => "FUSE-4005",
            ValidationIssue::NonUnitNormal { .. } => "FUSE-4006",
            ValidationIssue::OversizedHole { .. } => "FUSE-4007",
            ValidationIssue::TooManyHoles { .. } => "FUSE-4008",
        }
    }

    /// Returns a recovery suggestion.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ValidationIssue::InvalidIndex { .. } => "Rebuild the mesh from the fused point set",
            ValidationIssue::DegenerateTriangle { .. } => {
                "Lower the decimation ratio or raise the grid resolution"
            }
            ValidationIssue::NonManifoldEdge { .. } | ValidationIssue::InconsistentWinding { .. } => {
                "Use the previous-stage mesh and retry refinement with a higher target"
            }
            ValidationIssue::NonUnitNormal { .. } => "Recompute vertex normals",
            ValidationIssue::OversizedHole { .. } | ValidationIssue::TooManyHoles { .. } => {
                "Scan the uncovered regions again"
            }
        }
    }
}

/// Severity levels for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Informational, no action needed.
    Info,
    /// Mesh is usable but below a configured bound.
    Warning,
    /// Mesh is invalid.
    Error,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::InvalidIndex {
                triangle,
                index,
                vertex_count,
            } => write!(
                f,
                "triangle {} references vertex {}, but mesh only has {} vertices",
                triangle, index, vertex_count
            ),
            ValidationIssue::DegenerateTriangle { triangle, area } => {
                write!(f, "triangle {} is degenerate (area: {:.2e})", triangle, area)
            }
            ValidationIssue::NonManifoldEdge { a, b, triangles } => write!(
                f,
                "edge ({}, {}) is non-manifold (shared by {} triangles)",
                a, b, triangles
            ),
            ValidationIssue::InconsistentWinding { a, b } => {
                write!(f, "directed edge ({}, {}) is used twice", a, b)
            }
            ValidationIssue::NonUnitNormal { vertex, length } => {
                write!(f, "vertex {} normal has length {:.4}", vertex, length)
            }
            ValidationIssue::OversizedHole { edges, max_edges } => {
                write!(f, "hole with {} edges exceeds {} edges", edges, max_edges)
            }
            ValidationIssue::TooManyHoles { count, max } => {
                write!(f, "{} holes exceed the limit of {}", count, max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = FusionError::alignment_failed(2, "too few matches");
        assert_eq!(err.code(), ErrorCode::AlignmentFailed);
        assert_eq!(err.code().as_str(), "FUSE-2001");
        assert_eq!(err.stage(), Some(Stage::Alignment));
    }

    #[test]
    fn test_recovery_suggestions() {
        let err = FusionError::insufficient_data(Stage::Fusion, 100, 4);
        match err.recovery_suggestion() {
            RecoverySuggestion::AcquireMoreData { minimum_points } => {
                assert_eq!(minimum_points, 100);
            }
            other => panic!("Expected AcquireMoreData, got {:?}", other),
        }

        let err = FusionError::alignment_failed(1, "no overlap");
        assert_eq!(
            err.recovery_suggestion(),
            RecoverySuggestion::FallBackToSingleSource
        );
    }

    #[test]
    fn test_error_display() {
        let err = FusionError::quality_below_threshold("density", 0.12, 0.3);
        let display = format!("{}", err);
        assert!(display.contains("density"));
        assert!(display.contains("0.120"));
        assert!(display.contains("0.300"));

        let err = FusionError::timeout(Stage::Reconstruction, Duration::from_millis(1500));
        assert!(format!("{}", err).contains("1500.0 ms"));
        assert!(err.is_partial());
    }

    #[test]
    fn test_recalibration_display() {
        let err = FusionError::RecalibrationRequired {
            scores: StrategyScores {
                depth_only: 0.1,
                image_only: 0.05,
                fused: 0.0,
            },
        };
        assert_eq!(err.code().as_str(), "FUSE-3002");
        assert!(format!("{}", err).contains("depth 0.10"));
    }

    #[test]
    fn test_validation_issue_severity() {
        let issue = ValidationIssue::DegenerateTriangle {
            triangle: 0,
            area: 0.0,
        };
        assert_eq!(issue.severity(), IssueSeverity::Error);

        let issue = ValidationIssue::TooManyHoles { count: 9, max: 4 };
        assert_eq!(issue.severity(), IssueSeverity::Warning);
        assert!(issue.to_string().contains("9 holes"));
    }
}
