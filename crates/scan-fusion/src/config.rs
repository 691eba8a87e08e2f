//! Session configuration.
//!
//! [`FusionConfig`] gathers every externally supplied threshold of a scan
//! session. Each section derives serde with `#[serde(default)]`, so a file
//! only needs the keys it changes.
//!
//! # Example
//!
//! ```toml
//! [sources]
//! min_depth_points = 500
//!
//! [fusion]
//! max_fusion_distance = 0.005
//! confidence_policy = "max"
//!
//! [strategy]
//! improvement_margin = 0.25
//! oscillation_window = 4
//!
//! [refine]
//! target_triangles = 50000
//! max_error = 1e-6
//! ```
//!
//! ```no_run
//! use scan_fusion::FusionConfig;
//!
//! let config = FusionConfig::from_toml_file("session.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alignment::AlignmentParams;
use crate::error::{FusionError, FusionResult};
use crate::fusion::FusionParams;
use crate::quality::QualityConfig;
use crate::reconstruct::ReconstructionParams;
use crate::refine::RefineParams;
use crate::smoothing::SmoothingParams;
use crate::strategy::StrategyConfig;

/// Per-source minimum sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLimits {
    pub min_depth_points: usize,
    pub min_image_points: usize,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            min_depth_points: 100,
            min_image_points: 50,
        }
    }
}

/// Complete configuration of a scan session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Wall-clock budget for one pass.
    pub pass_time_budget_ms: Option<u64>,
    pub sources: SourceLimits,
    pub quality: QualityConfig,
    pub alignment: AlignmentParams,
    pub fusion: FusionParams,
    pub strategy: StrategyConfig,
    pub smoothing: SmoothingParams,
    pub reconstruction: ReconstructionParams,
    pub refine: RefineParams,
}

impl FusionConfig {
    /// Low latency: coarse grid, short ICP, small meshes.
    pub fn preset_realtime() -> Self {
        let mut config = Self {
            pass_time_budget_ms: Some(250),
            ..Default::default()
        };
        config.alignment.max_iterations = 20;
        config.alignment.convergence_threshold = 1e-5;
        config.smoothing.iterations = 1;
        config.reconstruction.resolution = 32;
        config.refine.target_triangles = 5_000;
        config.refine.smoothing_iterations = 0;
        config
    }

    /// Fine grid and gentle decimation for final captures.
    pub fn preset_high_detail() -> Self {
        let mut config = Self::default();
        config.alignment.max_iterations = 100;
        config.alignment.convergence_threshold = 1e-7;
        config.smoothing.iterations = 3;
        config.reconstruction.resolution = 128;
        config.refine.target_triangles = 100_000;
        config.refine.max_error = 1e-7;
        config.refine.smoothing_iterations = 2;
        config
    }

    pub fn pass_time_budget(&self) -> Option<Duration> {
        self.pass_time_budget_ms.map(Duration::from_millis)
    }

    /// Check every section; the first problem wins.
    pub fn validate(&self) -> FusionResult<()> {
        if self.sources.min_depth_points == 0 || self.sources.min_image_points == 0 {
            return Err(FusionError::invalid_config(
                "sources.min_depth_points",
                "minimum point counts must be at least 1",
            ));
        }
        if self.pass_time_budget_ms == Some(0) {
            return Err(FusionError::invalid_config(
                "pass_time_budget_ms",
                "must be positive when set",
            ));
        }
        self.quality.validate()?;
        self.alignment.validate()?;
        self.fusion.validate()?;
        self.strategy.validate()?;
        self.smoothing.validate()?;
        self.reconstruction.validate()?;
        self.refine.validate()
    }
}

#[cfg(feature = "config-files")]
impl FusionConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load and validate a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_toml(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json_str)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Errors from loading or saving a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "config-files")]
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[cfg(feature = "config-files")]
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[cfg(feature = "config-files")]
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] FusionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::ConfidencePolicy;

    #[test]
    fn test_defaults_and_presets_validate() {
        FusionConfig::default().validate().unwrap();
        FusionConfig::preset_realtime().validate().unwrap();
        FusionConfig::preset_high_detail().validate().unwrap();
        assert_eq!(
            FusionConfig::preset_realtime().pass_time_budget(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut config = FusionConfig::default();
        config.quality.weights.density = 0.9;
        assert!(matches!(
            config.validate(),
            Err(FusionError::InvalidConfig { .. })
        ));

        let mut config = FusionConfig::default();
        config.strategy.history_capacity = 2;
        config.strategy.oscillation_window = 4;
        assert!(config.validate().is_err());

        let mut config = FusionConfig::default();
        config.sources.min_image_points = 0;
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_partial_toml() {
        let config = FusionConfig::from_toml(
            r#"
            pass_time_budget_ms = 500

            [fusion]
            max_fusion_distance = 0.005
            confidence_policy = "max"

            [refine]
            target_triangles = 1234
            "#,
        )
        .unwrap();
        assert_eq!(config.fusion.max_fusion_distance, 0.005);
        assert_eq!(config.fusion.confidence_policy, ConfidencePolicy::Max);
        assert_eq!(config.refine.target_triangles, 1234);
        assert_eq!(config.alignment, AlignmentParams::default());
        assert_eq!(config.pass_time_budget_ms, Some(500));
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_toml_and_json_roundtrip() {
        let config = FusionConfig::preset_high_detail();
        let toml_str = config.to_toml().unwrap();
        assert_eq!(FusionConfig::from_toml(&toml_str).unwrap(), config);

        let json = config.to_json().unwrap();
        assert_eq!(FusionConfig::from_json(&json).unwrap(), config);
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_file_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("session.toml");
        let config = FusionConfig::preset_realtime();
        config.save_toml(&path).unwrap();
        assert_eq!(FusionConfig::from_toml_file(&path).unwrap(), config);

        std::fs::write(&path, "[strategy]\noscillation_window = 1\n").unwrap();
        assert!(matches!(
            FusionConfig::from_toml_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
