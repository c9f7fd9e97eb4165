//! Risk Contract
//!
//! The single source of stop-loss, take-profit and reward/risk numbers for
//! the whole system. The detector, the scorer and the execution loop all
//! call through here; nothing else is allowed to derive SL/TP/RR from setup
//! geometry.

use serde::{Deserialize, Serialize};

/// Guard against a zero-width stop when entry and sweep coincide
const RISK_EPSILON: f64 = 1e-9;

/// SL/TP/RR bundle for one setup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskNumbers {
    pub sl: f64,
    pub tp: f64,
    pub rr: f64,
    pub rr_clip: f64,
}

/// Compute the risk contract for a setup.
///
/// `entry_side` is +1 for a long entry, -1 for a short entry (the fade of
/// the sweep). SL is always the sweep extreme; TP is always the opposite
/// session bound: session_low for a short against a high-sweep,
/// session_high for a long against a low-sweep.
pub fn compute_risk(
    entry_side: i8,
    entry_price: f64,
    session_high: f64,
    session_low: f64,
    sweep_price: f64,
) -> RiskNumbers {
    let sl = sweep_price;
    let tp = if entry_side > 0 { session_high } else { session_low };

    let risk = (entry_price - sl).abs().max(RISK_EPSILON);
    let reward = (tp - entry_price).abs();
    let rr = reward / risk;
    let rr_clip = rr.clamp(0.0, 1.0);

    RiskNumbers { sl, tp, rr, rr_clip }
}
