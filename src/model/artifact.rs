//! Model Artifact Metadata
//!
//! Side-channel document written by the offline training job: the feature
//! column order the classifier expects, its stored decision threshold and
//! the post-filter flags. Loaded read-only at startup; a missing or
//! malformed file is fatal, and unknown or absent fields are rejected
//! eagerly instead of defaulting silently.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::strategy::features::KNOWN_FEATURES;

/// Deterministic post-filters applied in strict mode
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterFlags {
    /// Drop setups whose sweep and entry both sit in the late NY session
    pub block_ny_ny: bool,
    /// Drop setups with a clipped reward/risk below this floor
    pub min_rr_clip: f64,
}

/// Metadata for one trained classifier version
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelArtifact {
    pub version: String,
    /// Ordered feature columns; every setup's feature vector matches this
    pub feature_cols: Vec<String>,
    /// Stored decision threshold, overridable per run
    pub thr_default: f64,
    pub filters: FilterFlags,
}

impl ModelArtifact {
    /// Load and validate the metadata file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model metadata {}", path.display()))?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)
            .with_context(|| format!("malformed model metadata {}", path.display()))?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Reject configurations the pipeline cannot serve
    pub fn validate(&self) -> Result<()> {
        if self.feature_cols.is_empty() {
            bail!("model metadata declares no feature columns");
        }
        for col in &self.feature_cols {
            if !KNOWN_FEATURES.contains(&col.as_str()) {
                bail!("model metadata requires unknown feature column '{col}'");
            }
        }
        if !(0.0..=1.0).contains(&self.thr_default) {
            bail!("thr_default {} outside [0, 1]", self.thr_default);
        }
        if !(0.0..=1.0).contains(&self.filters.min_rr_clip) {
            bail!("min_rr_clip {} outside [0, 1]", self.filters.min_rr_clip);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{
        "version": "2025-03-01",
        "feature_cols": ["rr_clip", "sweep_side", "hour_of_entry"],
        "thr_default": 0.62,
        "filters": { "block_ny_ny": true, "min_rr_clip": 0.2 }
    }"#;

    #[test]
    fn test_parse_and_validate() {
        let artifact: ModelArtifact = serde_json::from_str(GOOD).unwrap();
        artifact.validate().unwrap();
        assert_eq!(artifact.feature_cols.len(), 3);
        assert_eq!(artifact.thr_default, 0.62);
        assert!(artifact.filters.block_ny_ny);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = GOOD.replace("\"version\"", "\"extra\": 1, \"version\"");
        assert!(serde_json::from_str::<ModelArtifact>(&raw).is_err());
    }

    #[test]
    fn test_missing_filters_rejected() {
        let raw = r#"{
            "version": "x",
            "feature_cols": ["rr_clip"],
            "thr_default": 0.5
        }"#;
        assert!(serde_json::from_str::<ModelArtifact>(raw).is_err());
    }

    #[test]
    fn test_unknown_feature_column_rejected() {
        let raw = GOOD.replace("rr_clip\", \"sweep_side", "rr_clip\", \"mystery_col");
        let artifact: ModelArtifact = serde_json::from_str(&raw).unwrap();
        assert!(artifact.validate().is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let raw = GOOD.replace("0.62", "1.62");
        let artifact: ModelArtifact = serde_json::from_str(&raw).unwrap();
        assert!(artifact.validate().is_err());
    }
}
