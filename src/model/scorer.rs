//! Signal Scorer
//!
//! Wraps the trained classifier behind a probability interface, applies the
//! decision threshold and, in strict mode, the deterministic post-filters
//! declared by the model artifact. Output order always matches input order.

use anyhow::{anyhow, bail, Result};
use gbdt::decision_tree::{Data, DataVec};
use gbdt::gradient_boost::GBDT;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use super::artifact::ModelArtifact;
use crate::strategy::{Setup, SessionLabel};

/// Gating severity selected per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMode {
    /// Threshold only
    Lenient,
    /// Threshold plus artifact post-filters
    Strict,
}

impl std::fmt::Display for ScoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreMode::Lenient => write!(f, "lenient"),
            ScoreMode::Strict => write!(f, "strict"),
        }
    }
}

/// A scored setup. Derived, read-only.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub setup: Setup,
    pub probability: f64,
    pub passes_threshold: bool,
    pub mode: ScoreMode,
    /// Survived threshold and (in strict mode) post-filters
    pub retained: bool,
}

/// Inference interface over the opaque trained classifier: probability of
/// class 1 per row, rows given in the artifact's feature order.
pub trait ProbabilityModel: Send + Sync {
    fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>>;
}

/// Production classifier: an XGBoost dump evaluated with the gbdt crate
pub struct GbdtModel {
    booster: GBDT,
}

impl GbdtModel {
    /// Load a `binary:logistic` XGBoost dump from disk
    pub fn load(path: &Path) -> Result<Self> {
        let booster = GBDT::from_xgboost_dump(
            path.to_str()
                .ok_or_else(|| anyhow!("non-UTF8 model path {}", path.display()))?,
            "binary:logistic",
        )
        .map_err(|e| anyhow!("failed to load classifier {}: {e}", path.display()))?;
        Ok(Self { booster })
    }
}

impl ProbabilityModel for GbdtModel {
    fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        let dv: DataVec = rows
            .iter()
            .map(|row| Data::new_test_data(row.iter().map(|&v| v as f32).collect(), None))
            .collect();
        let preds = self.booster.predict(&dv);
        if preds.len() != rows.len() {
            bail!(
                "classifier returned {} probabilities for {} rows",
                preds.len(),
                rows.len()
            );
        }
        Ok(preds.into_iter().map(|p| p as f64).collect())
    }
}

/// Scores batches of setups against one loaded model + metadata pair
pub struct SignalScorer {
    artifact: ModelArtifact,
    model: Box<dyn ProbabilityModel>,
}

impl SignalScorer {
    pub fn new(artifact: ModelArtifact, model: Box<dyn ProbabilityModel>) -> Result<Self> {
        artifact.validate()?;
        Ok(Self { artifact, model })
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    /// Feature columns the detector must populate, in order
    pub fn feature_cols(&self) -> &[String] {
        &self.artifact.feature_cols
    }

    /// Score a batch of setups. Input order is preserved.
    ///
    /// `threshold_override` replaces the artifact's stored threshold for
    /// this call only.
    pub fn score(
        &self,
        setups: &[Setup],
        mode: ScoreMode,
        threshold_override: Option<f64>,
    ) -> Result<Vec<Signal>> {
        if setups.is_empty() {
            return Ok(Vec::new());
        }

        let threshold = threshold_override.unwrap_or(self.artifact.thr_default);

        let mut rows = Vec::with_capacity(setups.len());
        for setup in setups {
            if setup.feature_vector.len() != self.artifact.feature_cols.len() {
                bail!(
                    "setup {} {} carries {} features, model expects {}",
                    setup.instrument,
                    setup.trade_day,
                    setup.feature_vector.len(),
                    self.artifact.feature_cols.len()
                );
            }
            rows.push(setup.feature_vector.clone());
        }

        let probs = self.model.predict_proba(&rows)?;

        let mut signals = Vec::with_capacity(setups.len());
        for (setup, probability) in setups.iter().cloned().zip(probs) {
            let passes_threshold = probability >= threshold;
            let retained = passes_threshold
                && (mode == ScoreMode::Lenient || self.passes_filters(&setup));

            debug!(
                instrument = %setup.instrument,
                day = %setup.trade_day,
                probability,
                passes_threshold,
                retained,
                "scored setup"
            );

            signals.push(Signal {
                setup,
                probability,
                passes_threshold,
                mode,
                retained,
            });
        }

        Ok(signals)
    }

    /// Strict-mode post-filters from the artifact
    fn passes_filters(&self, setup: &Setup) -> bool {
        let f = &self.artifact.filters;
        if f.block_ny_ny
            && setup.session_label_at_sweep == SessionLabel::Ny
            && setup.session_label_at_entry == SessionLabel::Ny
        {
            return false;
        }
        if setup.rr_clip < f.min_rr_clip {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::artifact::FilterFlags;
    use chrono::{NaiveDate, TimeZone, Utc};

    /// Stub classifier returning canned probabilities in row order
    struct StubModel(Vec<f64>);

    impl ProbabilityModel for StubModel {
        fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
            Ok(self.0.iter().cloned().take(rows.len()).collect())
        }
    }

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            version: "test".to_string(),
            feature_cols: vec!["rr_clip".to_string(), "sweep_side".to_string()],
            thr_default: 0.6,
            filters: FilterFlags {
                block_ny_ny: true,
                min_rr_clip: 0.2,
            },
        }
    }

    fn setup(rr_clip: f64, sweep: SessionLabel, entry: SessionLabel) -> Setup {
        let ts = Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap();
        Setup {
            instrument: "GER40".to_string(),
            trade_day: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            sweep_time: ts,
            sweep_side: 1,
            sweep_price: 105.0,
            break_time: ts,
            entry_time: ts,
            entry_side: -1,
            entry_price: 101.0,
            sl: 105.0,
            tp: 98.0,
            rr: rr_clip,
            rr_clip,
            session_high: 102.0,
            session_low: 98.0,
            session_atr: 4.0,
            atr_at_sweep: 4.0,
            atr_at_entry: 4.0,
            session_label_at_sweep: sweep,
            session_label_at_entry: entry,
            minutes_sweep_to_break: 5,
            minutes_break_to_entry: 0,
            hour_of_entry: 8,
            day_of_week: 0,
            feature_vector: vec![rr_clip, 1.0],
        }
    }

    #[test]
    fn test_scenario_c_below_threshold_excluded_in_both_modes() {
        let s = setup(0.9, SessionLabel::London, SessionLabel::London);
        for mode in [ScoreMode::Lenient, ScoreMode::Strict] {
            let scorer =
                SignalScorer::new(artifact(), Box::new(StubModel(vec![0.4]))).unwrap();
            let signals = scorer.score(&[s.clone()], mode, None).unwrap();
            assert!(!signals[0].passes_threshold);
            assert!(!signals[0].retained);
        }
    }

    #[test]
    fn test_scenario_d_ny_ny_kept_lenient_dropped_strict() {
        let s = setup(0.9, SessionLabel::Ny, SessionLabel::Ny);
        let scorer = SignalScorer::new(artifact(), Box::new(StubModel(vec![0.8]))).unwrap();

        let lenient = scorer.score(&[s.clone()], ScoreMode::Lenient, None).unwrap();
        assert!(lenient[0].retained);

        let strict = scorer.score(&[s], ScoreMode::Strict, None).unwrap();
        assert!(strict[0].passes_threshold);
        assert!(!strict[0].retained);
    }

    #[test]
    fn test_min_rr_clip_filter_strict_only() {
        let s = setup(0.1, SessionLabel::London, SessionLabel::London);
        let scorer = SignalScorer::new(artifact(), Box::new(StubModel(vec![0.8]))).unwrap();

        assert!(scorer.score(&[s.clone()], ScoreMode::Lenient, None).unwrap()[0].retained);
        assert!(!scorer.score(&[s], ScoreMode::Strict, None).unwrap()[0].retained);
    }

    #[test]
    fn test_threshold_override_beats_stored_default() {
        let s = setup(0.9, SessionLabel::London, SessionLabel::London);
        let scorer = SignalScorer::new(artifact(), Box::new(StubModel(vec![0.5]))).unwrap();

        assert!(!scorer.score(&[s.clone()], ScoreMode::Lenient, None).unwrap()[0]
            .passes_threshold);
        assert!(
            scorer.score(&[s], ScoreMode::Lenient, Some(0.4)).unwrap()[0].passes_threshold
        );
    }

    #[test]
    fn test_output_order_matches_input_order() {
        let a = setup(0.9, SessionLabel::London, SessionLabel::London);
        let mut b = setup(0.8, SessionLabel::London, SessionLabel::Ny);
        b.instrument = "US500".to_string();
        let scorer =
            SignalScorer::new(artifact(), Box::new(StubModel(vec![0.1, 0.9]))).unwrap();

        let signals = scorer
            .score(&[a.clone(), b.clone()], ScoreMode::Lenient, None)
            .unwrap();
        assert_eq!(signals[0].setup.instrument, "GER40");
        assert_eq!(signals[1].setup.instrument, "US500");
        assert_eq!(signals[0].probability, 0.1);
        assert_eq!(signals[1].probability, 0.9);
    }

    #[test]
    fn test_feature_width_mismatch_is_error() {
        let mut s = setup(0.9, SessionLabel::London, SessionLabel::London);
        s.feature_vector = vec![0.9];
        let scorer = SignalScorer::new(artifact(), Box::new(StubModel(vec![0.8]))).unwrap();
        assert!(scorer.score(&[s], ScoreMode::Lenient, None).is_err());
    }
}
