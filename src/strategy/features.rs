//! Feature Extraction
//!
//! Names and values for the fixed-order feature vector the gating model was
//! trained on. The model artifact declares which columns it wants and in
//! what order; this module is the only place that maps a name to a value,
//! so training-time and live feature computation cannot drift apart.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::detector::Setup;

/// Intraday session buckets, UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLabel {
    Asia,
    London,
    Ny,
}

impl SessionLabel {
    /// Stable integer encoding used in the feature matrix
    pub fn id(self) -> f64 {
        match self {
            SessionLabel::Asia => 0.0,
            SessionLabel::London => 1.0,
            SessionLabel::Ny => 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionLabel::Asia => "asia",
            SessionLabel::London => "london",
            SessionLabel::Ny => "ny",
        }
    }
}

impl std::fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session bucket for a UTC timestamp: Asia 21:00-07:00, London 07:00-12:00,
/// New York from 12:00 until the Asia open.
pub fn session_label(ts: DateTime<Utc>) -> SessionLabel {
    match ts.hour() {
        21..=23 | 0..=6 => SessionLabel::Asia,
        7..=11 => SessionLabel::London,
        _ => SessionLabel::Ny,
    }
}

/// Every feature column the detector can produce
pub const KNOWN_FEATURES: &[&str] = &[
    "sweep_side",
    "rr",
    "rr_clip",
    "minutes_sweep_to_break",
    "minutes_break_to_entry",
    "hour_of_entry",
    "day_of_week",
    "session_range_atr",
    "atr_at_sweep",
    "atr_at_entry",
    "session_sweep",
    "session_entry",
];

/// Value of a single named feature for a setup, `None` for unknown names
pub fn feature_value(setup: &Setup, name: &str) -> Option<f64> {
    let v = match name {
        "sweep_side" => setup.sweep_side as f64,
        "rr" => setup.rr,
        "rr_clip" => setup.rr_clip,
        "minutes_sweep_to_break" => setup.minutes_sweep_to_break as f64,
        "minutes_break_to_entry" => setup.minutes_break_to_entry as f64,
        "hour_of_entry" => setup.hour_of_entry as f64,
        "day_of_week" => setup.day_of_week as f64,
        "session_range_atr" => {
            if setup.session_atr > 0.0 {
                (setup.session_high - setup.session_low) / setup.session_atr
            } else {
                0.0
            }
        }
        "atr_at_sweep" => setup.atr_at_sweep,
        "atr_at_entry" => setup.atr_at_entry,
        "session_sweep" => setup.session_label_at_sweep.id(),
        "session_entry" => setup.session_label_at_entry.id(),
        _ => return None,
    };
    Some(v)
}

/// Build the feature vector in the exact column order the model declares.
///
/// An unknown column name is a configuration error: the artifact asks for a
/// feature this build cannot compute, so scoring would be garbage.
pub fn build_vector(setup: &Setup, feature_cols: &[String]) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(feature_cols.len());
    for col in feature_cols {
        match feature_value(setup, col) {
            Some(v) => out.push(v),
            None => bail!("model requires unknown feature column '{col}'"),
        }
    }
    Ok(out)
}

/// Day-of-week encoding used at training time: Monday = 0
pub fn day_of_week(ts: DateTime<Utc>) -> u8 {
    ts.weekday().num_days_from_monday() as u8
}
